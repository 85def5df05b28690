// crates/evs-server/src/transcript/codex.rs
// Grammar for rollout-style transcripts. Wrapped format only: every line is
// `{ timestamp, type, payload }`. Legacy flat files are migrated to wrapped
// before any rewrite.

use crate::jsonl::Record;
use serde_json::{Value, json};

pub fn is_rollout_line_type(t: &str) -> bool {
    matches!(
        t,
        "session_meta" | "turn_context" | "event_msg" | "response_item" | "compacted"
    )
}

/// Kind of a `response_item` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Message,
    Reasoning,
    FunctionCall,
    CustomToolCall,
    LocalShellCall,
    FunctionCallOutput,
    CustomToolCallOutput,
    Other(String),
}

impl ItemKind {
    pub fn from_type(t: &str) -> Self {
        match t {
            "message" => Self::Message,
            "reasoning" => Self::Reasoning,
            "function_call" => Self::FunctionCall,
            "custom_tool_call" => Self::CustomToolCall,
            "local_shell_call" => Self::LocalShellCall,
            "function_call_output" => Self::FunctionCallOutput,
            "custom_tool_call_output" => Self::CustomToolCallOutput,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Self::FunctionCall | Self::CustomToolCall | Self::LocalShellCall
        )
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Self::FunctionCallOutput | Self::CustomToolCallOutput)
    }

    /// Output kind that closes this call kind.
    pub fn matching_output(&self) -> Option<ItemKind> {
        match self {
            Self::FunctionCall | Self::LocalShellCall => Some(Self::FunctionCallOutput),
            Self::CustomToolCall => Some(Self::CustomToolCallOutput),
            _ => None,
        }
    }
}

/// Typed view of one rollout line. `index` points into the record sequence.
#[derive(Debug, Clone)]
pub enum Line {
    SessionMeta {
        index: usize,
        line_number: usize,
        id: Option<String>,
        cwd: Option<String>,
        timestamp: Option<String>,
        payload_is_object: bool,
    },
    TurnContext {
        index: usize,
        line_number: usize,
    },
    EventMsg {
        index: usize,
        line_number: usize,
        /// `total_token_usage.total_tokens` from `token_count` events.
        total_tokens: Option<u64>,
    },
    ResponseItem {
        index: usize,
        line_number: usize,
        kind: ItemKind,
        call_id: Option<String>,
        role: Option<String>,
    },
    Compacted {
        index: usize,
        line_number: usize,
    },
    UnknownJson {
        index: usize,
        line_number: usize,
    },
    InvalidJson {
        index: usize,
        line_number: usize,
    },
}

impl Line {
    pub fn index(&self) -> usize {
        match self {
            Self::SessionMeta { index, .. }
            | Self::TurnContext { index, .. }
            | Self::EventMsg { index, .. }
            | Self::ResponseItem { index, .. }
            | Self::Compacted { index, .. }
            | Self::UnknownJson { index, .. }
            | Self::InvalidJson { index, .. } => *index,
        }
    }

    pub fn line_number(&self) -> usize {
        match self {
            Self::SessionMeta { line_number, .. }
            | Self::TurnContext { line_number, .. }
            | Self::EventMsg { line_number, .. }
            | Self::ResponseItem { line_number, .. }
            | Self::Compacted { line_number, .. }
            | Self::UnknownJson { line_number, .. }
            | Self::InvalidJson { line_number, .. } => *line_number,
        }
    }
}

/// Parsed rollout transcript: record storage plus the typed view.
#[derive(Debug)]
pub struct Session {
    pub records: Vec<Record>,
    pub lines: Vec<Line>,
}

impl Session {
    pub fn parse(records: Vec<Record>) -> Self {
        let lines = records
            .iter()
            .enumerate()
            .map(|(index, record)| classify(index, record))
            .collect();
        Self { records, lines }
    }

    pub fn reparse(self) -> Self {
        Self::parse(self.records)
    }

    /// First `session_meta` line, the authoritative head.
    pub fn session_meta(&self) -> Option<&Line> {
        self.lines
            .iter()
            .find(|l| matches!(l, Line::SessionMeta { .. }))
    }

    pub fn session_id(&self) -> Option<&str> {
        match self.session_meta() {
            Some(Line::SessionMeta { id, .. }) => id.as_deref(),
            _ => None,
        }
    }

    /// Index of the last `compacted` checkpoint, if any.
    pub fn last_compacted_index(&self) -> Option<usize> {
        self.lines
            .iter()
            .rev()
            .find(|l| matches!(l, Line::Compacted { .. }))
            .map(|l| l.index())
    }

    /// Response items a compactor may remove: everything after the last
    /// `compacted` checkpoint (or all of them when none exists).
    pub fn visible_response_items(&self) -> Vec<usize> {
        let floor = self.last_compacted_index();
        self.lines
            .iter()
            .filter(|l| matches!(l, Line::ResponseItem { .. }))
            .map(|l| l.index())
            .filter(|&i| floor.is_none_or(|f| i > f))
            .collect()
    }

    /// Latest token-count signal in file order.
    pub fn last_token_count(&self) -> Option<u64> {
        self.lines.iter().rev().find_map(|l| match l {
            Line::EventMsg {
                total_tokens: Some(n),
                ..
            } => Some(*n),
            _ => None,
        })
    }
}

fn classify(index: usize, record: &Record) -> Line {
    let line_number = record.line_number();
    let Some(value) = record.value() else {
        return Line::InvalidJson { index, line_number };
    };
    let Some(obj) = value.as_object() else {
        return Line::UnknownJson { index, line_number };
    };
    let line_type = obj.get("type").and_then(|t| t.as_str());
    let payload = obj.get("payload");
    let Some(line_type) = line_type else {
        return Line::UnknownJson { index, line_number };
    };
    if !is_rollout_line_type(line_type) {
        return Line::UnknownJson { index, line_number };
    }

    match line_type {
        "session_meta" => {
            let payload_is_object = payload.is_some_and(Value::is_object);
            Line::SessionMeta {
                index,
                line_number,
                id: payload
                    .and_then(|p| p.get("id"))
                    .and_then(|s| s.as_str())
                    .map(String::from),
                cwd: payload
                    .and_then(|p| p.get("cwd"))
                    .and_then(|s| s.as_str())
                    .map(String::from),
                timestamp: payload
                    .and_then(|p| p.get("timestamp"))
                    .and_then(|s| s.as_str())
                    .map(String::from)
                    .or_else(|| {
                        obj.get("timestamp")
                            .and_then(|s| s.as_str())
                            .map(String::from)
                    }),
                payload_is_object,
            }
        }
        "turn_context" => Line::TurnContext { index, line_number },
        "event_msg" => Line::EventMsg {
            index,
            line_number,
            total_tokens: token_count_total(payload),
        },
        "response_item" => {
            let Some(payload) = payload.filter(|p| p.is_object()) else {
                return Line::UnknownJson { index, line_number };
            };
            let kind = payload
                .get("type")
                .and_then(|t| t.as_str())
                .map(ItemKind::from_type)
                .unwrap_or(ItemKind::Other("missing".to_string()));
            Line::ResponseItem {
                index,
                line_number,
                kind,
                call_id: payload
                    .get("call_id")
                    .and_then(|s| s.as_str())
                    .map(String::from),
                role: payload
                    .get("role")
                    .and_then(|s| s.as_str())
                    .map(String::from),
            }
        }
        "compacted" => Line::Compacted { index, line_number },
        _ => Line::UnknownJson { index, line_number },
    }
}

fn token_count_total(payload: Option<&Value>) -> Option<u64> {
    let payload = payload?;
    if payload.get("type").and_then(|t| t.as_str()) != Some("token_count") {
        return None;
    }
    let usage = payload
        .get("info")
        .and_then(|i| i.get("total_token_usage"))
        .or_else(|| payload.get("total_token_usage"))?;
    usage.get("total_tokens").and_then(|n| n.as_u64())
}

// ---------------------------------------------------------------------------
// Legacy migration
// ---------------------------------------------------------------------------

/// A legacy (flat) rollout has no `{type, payload}` envelope: the head line
/// carries `id` + `timestamp`, the rest are flat response items.
pub fn is_legacy(records: &[Record]) -> bool {
    for record in records {
        let Some(obj) = record.value().and_then(|v| v.as_object()) else {
            continue;
        };
        if obj.contains_key("payload")
            && obj
                .get("type")
                .and_then(|t| t.as_str())
                .is_some_and(is_rollout_line_type)
        {
            return false;
        }
        if obj.contains_key("id") && obj.contains_key("timestamp") && !obj.contains_key("uuid") {
            return true;
        }
        // A flat response item up front also marks a legacy file.
        if obj
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| !matches!(ItemKind::from_type(t), ItemKind::Other(_)))
        {
            return true;
        }
        break;
    }
    false
}

/// Wrap a legacy file: the head line becomes `session_meta`, everything else
/// becomes a `response_item`. Invalid lines ride along untouched.
pub fn migrate_legacy(records: &[Record]) -> Vec<Record> {
    let mut out = Vec::with_capacity(records.len());
    let mut head_done = false;
    for record in records {
        let Some(value) = record.value() else {
            out.push(record.clone());
            continue;
        };
        let timestamp = value
            .get("timestamp")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string();
        let wrapped = if !head_done
            && value.get("id").is_some()
            && value.as_object().is_some_and(|o| !o.contains_key("call_id"))
        {
            head_done = true;
            json!({
                "timestamp": timestamp,
                "type": "session_meta",
                "payload": value.clone(),
            })
        } else {
            json!({
                "timestamp": timestamp,
                "type": "response_item",
                "payload": value.clone(),
            })
        };
        out.push(Record::Valid {
            line_number: record.line_number(),
            value: wrapped,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Value-level accessors shared by the fixer and compactor
// ---------------------------------------------------------------------------

pub fn payload(value: &Value) -> Option<&Value> {
    value.get("payload")
}

pub fn payload_mut(value: &mut Value) -> Option<&mut Value> {
    value.get_mut("payload")
}

/// Flattened text of a response item for token estimation and prompts.
pub fn item_text(value: &Value) -> String {
    let Some(payload) = payload(value) else {
        return String::new();
    };
    match payload.get("type").and_then(|t| t.as_str()) {
        Some("message") => content_text(payload.get("content")),
        Some("reasoning") => payload
            .get("summary")
            .map(content_text_owned)
            .unwrap_or_default(),
        Some("function_call") | Some("custom_tool_call") | Some("local_shell_call") => {
            let name = payload.get("name").and_then(|s| s.as_str()).unwrap_or("tool");
            let args = payload
                .get("arguments")
                .or_else(|| payload.get("input"))
                .map(|a| a.to_string())
                .unwrap_or_default();
            format!("[call {name} {args}]")
        }
        Some("function_call_output") | Some("custom_tool_call_output") => payload
            .get("output")
            .map(|o| match o {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn content_text_owned(content: &Value) -> String {
    content_text(Some(content))
}
