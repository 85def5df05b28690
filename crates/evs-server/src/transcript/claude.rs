// crates/evs-server/src/transcript/claude.rs
// Grammar for chat-style transcripts: one entry per line, entries linked
// into a tree by uuid/parentUuid, content as a string or typed blocks.

use crate::jsonl::Record;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Bound on parent-chain traversal. Malformed files can contain cycles;
/// the walk keeps a visited set and gives up after this many hops.
pub const MAX_CHAIN_HOPS: usize = 50_000;

pub fn is_chat_entry_type(t: &str) -> bool {
    matches!(
        t,
        "user"
            | "assistant"
            | "system"
            | "summary"
            | "progress"
            | "queue-operation"
            | "file-history-snapshot"
            | "saved_hook_context"
    )
}

/// Role of a conversational entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Typed summary of one content block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String },
    ToolResult { tool_use_id: String },
    Other(String),
}

/// Typed view of one conversational entry. `index` points into the record
/// sequence; all mutation happens there.
#[derive(Debug, Clone)]
pub struct Entry {
    pub index: usize,
    pub line_number: usize,
    pub role: Role,
    pub subtype: Option<String>,
    pub uuid: Option<String>,
    pub parent_uuid: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: Option<String>,
    /// `message.id` — shared across fragments of one streamed response.
    pub message_id: Option<String>,
    /// Injected context rather than something the human typed.
    pub is_meta: bool,
    pub blocks: Vec<BlockKind>,
    pub content_is_string: bool,
}

impl Entry {
    pub fn is_compact_boundary(&self) -> bool {
        self.role == Role::System && self.subtype.as_deref() == Some("compact_boundary")
    }

    pub fn has_thinking(&self) -> bool {
        self.blocks.iter().any(|b| matches!(b, BlockKind::Thinking))
    }

    pub fn starts_with_thinking(&self) -> bool {
        matches!(self.blocks.first(), Some(BlockKind::Thinking))
    }
}

/// One line of the typed view.
#[derive(Debug, Clone)]
pub enum Line {
    Entry(Entry),
    /// Auxiliary records outside the chain (`file-history-snapshot` etc).
    Auxiliary { index: usize, line_number: usize },
    /// Valid JSON that violates the entry envelope.
    UnknownJson { index: usize, line_number: usize },
    InvalidJson { index: usize, line_number: usize },
}

impl Line {
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Self::Entry(e) => Some(e),
            _ => None,
        }
    }
}

/// A streamed assistant response viewed as one logical turn: the indices of
/// the entries that share a `message.id`, in file order. Single-entry turns
/// are the common case.
#[derive(Debug, Clone)]
pub struct MergedTurn {
    pub entry_indices: Vec<usize>,
}

/// Parsed transcript: record storage plus the typed view over it.
#[derive(Debug)]
pub struct Session {
    pub records: Vec<Record>,
    pub lines: Vec<Line>,
}

impl Session {
    /// Build the typed view. Cheap enough to re-run after every mutation.
    pub fn parse(records: Vec<Record>) -> Self {
        let lines = records
            .iter()
            .enumerate()
            .map(|(index, record)| classify(index, record))
            .collect();
        Self { records, lines }
    }

    /// Re-derive the view from the (mutated) records.
    pub fn reparse(self) -> Self {
        Self::parse(self.records)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.lines.iter().filter_map(Line::entry)
    }

    pub fn entry_at(&self, index: usize) -> Option<&Entry> {
        self.lines.get(index).and_then(Line::entry)
    }

    /// Map uuid -> record index for all entries carrying a uuid.
    pub fn uuid_index(&self) -> HashMap<&str, usize> {
        let mut map = HashMap::new();
        for entry in self.entries() {
            if let Some(uuid) = entry.uuid.as_deref() {
                // First occurrence wins; duplicates are a validator error.
                map.entry(uuid).or_insert(entry.index);
            }
        }
        map
    }

    /// The unique root-to-leaf path through the parentUuid tree, as record
    /// indices in root-first order. Leaves are uuids never referenced as a
    /// parent; among several the latest timestamp wins, ties broken by file
    /// order (later line wins). Traversal is bounded and cycle-safe.
    pub fn active_chain(&self) -> Vec<usize> {
        let by_uuid = self.uuid_index();
        let mut referenced: HashSet<&str> = HashSet::new();
        for entry in self.entries() {
            if let Some(parent) = entry.parent_uuid.as_deref() {
                referenced.insert(parent);
            }
        }

        let leaf = self
            .entries()
            .filter(|e| {
                e.uuid
                    .as_deref()
                    .is_some_and(|uuid| !referenced.contains(uuid))
            })
            .max_by(|a, b| {
                match (a.timestamp.as_deref(), b.timestamp.as_deref()) {
                    (Some(ta), Some(tb)) if ta != tb => ta.cmp(tb),
                    _ => a.index.cmp(&b.index),
                }
            });
        let Some(leaf) = leaf else { return Vec::new() };

        let mut chain = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut cursor = Some(leaf.index);
        let mut hops = 0;
        while let Some(index) = cursor {
            if hops >= MAX_CHAIN_HOPS || !visited.insert(index) {
                break;
            }
            hops += 1;
            chain.push(index);
            cursor = self
                .entry_at(index)
                .and_then(|e| e.parent_uuid.as_deref())
                .and_then(|parent| by_uuid.get(parent).copied());
        }
        chain.reverse();
        chain
    }

    /// Chain indices after the last compact boundary (exclusive), or the
    /// whole chain when no boundary exists. The boundary index itself is
    /// returned separately so compaction can parent a summary at it.
    pub fn chain_after_boundary(&self) -> (Option<usize>, Vec<usize>) {
        let chain = self.active_chain();
        let boundary = chain
            .iter()
            .rev()
            .find(|&&i| self.entry_at(i).is_some_and(|e| e.is_compact_boundary()))
            .copied();
        match boundary {
            Some(b) => {
                let after = chain.iter().copied().skip_while(|&i| i != b).skip(1).collect();
                (Some(b), after)
            }
            None => (None, chain),
        }
    }

    /// Streamed turns: runs of assistant entries sharing a `message.id`.
    /// Assistant entries without a message id are their own turn.
    pub fn merged_turns(&self) -> Vec<MergedTurn> {
        let mut turns: Vec<MergedTurn> = Vec::new();
        let mut by_message_id: HashMap<&str, usize> = HashMap::new();
        for entry in self.entries() {
            if entry.role != Role::Assistant {
                continue;
            }
            match entry.message_id.as_deref() {
                Some(id) => {
                    if let Some(&turn_idx) = by_message_id.get(id) {
                        turns[turn_idx].entry_indices.push(entry.index);
                    } else {
                        by_message_id.insert(id, turns.len());
                        turns.push(MergedTurn {
                            entry_indices: vec![entry.index],
                        });
                    }
                }
                None => turns.push(MergedTurn {
                    entry_indices: vec![entry.index],
                }),
            }
        }
        turns
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
    let entry_type = obj.get("type").and_then(|t| t.as_str());
    let role = match entry_type {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("system") => Role::System,
        Some(t) if is_chat_entry_type(t) => {
            return Line::Auxiliary { index, line_number };
        }
        _ => return Line::UnknownJson { index, line_number },
    };

    let message = obj.get("message");
    let content = message.and_then(|m| m.get("content"));
    let mut blocks = Vec::new();
    let mut content_is_string = false;
    match content {
        Some(Value::String(_)) => content_is_string = true,
        Some(Value::Array(items)) => {
            for item in items {
                blocks.push(block_kind(item));
            }
        }
        _ => {}
    }

    Line::Entry(Entry {
        index,
        line_number,
        role,
        subtype: obj.get("subtype").and_then(|s| s.as_str()).map(String::from),
        uuid: obj.get("uuid").and_then(|s| s.as_str()).map(String::from),
        parent_uuid: obj
            .get("parentUuid")
            .and_then(|s| s.as_str())
            .map(String::from),
        session_id: obj
            .get("sessionId")
            .and_then(|s| s.as_str())
            .map(String::from),
        timestamp: obj
            .get("timestamp")
            .and_then(|s| s.as_str())
            .map(String::from),
        message_id: message
            .and_then(|m| m.get("id"))
            .and_then(|s| s.as_str())
            .map(String::from),
        is_meta: obj
            .get("isMeta")
            .and_then(|b| b.as_bool())
            .unwrap_or(false),
        blocks,
        content_is_string,
    })
}

fn block_kind(item: &Value) -> BlockKind {
    match item.get("type").and_then(|t| t.as_str()) {
        Some("text") => BlockKind::Text,
        Some("thinking") | Some("redacted_thinking") => BlockKind::Thinking,
        Some("tool_use") => BlockKind::ToolUse {
            id: item
                .get("id")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
        },
        Some("tool_result") => BlockKind::ToolResult {
            tool_use_id: item
                .get("tool_use_id")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
        },
        Some(other) => BlockKind::Other(other.to_string()),
        None => BlockKind::Other("missing".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Value-level accessors shared by the fixer and compactor
// ---------------------------------------------------------------------------

/// Content blocks of an entry's message, when array-shaped.
pub fn content_blocks(value: &Value) -> Option<&Vec<Value>> {
    value.get("message")?.get("content")?.as_array()
}

pub fn content_blocks_mut(value: &mut Value) -> Option<&mut Vec<Value>> {
    value.get_mut("message")?.get_mut("content")?.as_array_mut()
}

/// Replace an entry's message content with a plain string.
pub fn set_content_string(value: &mut Value, text: &str) {
    if let Some(message) = value.get_mut("message") {
        if let Some(obj) = message.as_object_mut() {
            obj.insert("content".to_string(), Value::String(text.to_string()));
        }
    }
}

/// Flattened text of an entry for token estimation and prompts.
pub fn entry_text(value: &Value) -> String {
    let Some(content) = value.get("message").and_then(|m| m.get("content")) else {
        return String::new();
    };
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = item.get("text").and_then(|t| t.as_str()) {
                            push_line(&mut out, t);
                        }
                    }
                    Some("thinking") => {
                        if let Some(t) = item.get("thinking").and_then(|t| t.as_str()) {
                            push_line(&mut out, t);
                        }
                    }
                    Some("tool_use") => {
                        let name = item.get("name").and_then(|t| t.as_str()).unwrap_or("tool");
                        let input = item
                            .get("input")
                            .map(|i| i.to_string())
                            .unwrap_or_default();
                        push_line(&mut out, &format!("[tool_use {name} {input}]"));
                    }
                    Some("tool_result") => {
                        let body = item
                            .get("content")
                            .map(flatten_tool_result)
                            .unwrap_or_default();
                        push_line(&mut out, &body);
                    }
                    _ => {}
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn flatten_tool_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn push_line(out: &mut String, text: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(text);
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::jsonl::parse_str;

    fn session(lines: &[String]) -> Session {
        Session::parse(parse_str(&(lines.join("\n") + "\n")))
    }

    #[test]
    fn test_parse_roles_and_blocks() {
        let s = session(&[
            user("u1", "", "2026-01-01T00:00:00Z", "hello"),
            assistant(
                "a1",
                "u1",
                "2026-01-01T00:00:01Z",
                r#"[{"type":"thinking","thinking":"hm"},{"type":"text","text":"hi"}]"#,
            ),
            snapshot("2026-01-01T00:00:02Z"),
        ]);
        let entries: Vec<_> = s.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, Role::User);
        assert!(entries[0].content_is_string);
        assert!(entries[1].starts_with_thinking());
        assert!(matches!(s.lines[2], Line::Auxiliary { .. }));
    }

    #[test]
    fn test_unknown_json_classified() {
        let s = session(&[r#"{"foo":"bar"}"#.to_string()]);
        assert!(matches!(s.lines[0], Line::UnknownJson { .. }));
    }

    #[test]
    fn test_active_chain_linear() {
        let s = session(&[
            user("u1", "", "2026-01-01T00:00:00Z", "one"),
            assistant("a1", "u1", "2026-01-01T00:00:01Z", r#"[{"type":"text","text":"r1"}]"#),
            user("u2", "a1", "2026-01-01T00:00:02Z", "two"),
        ]);
        let chain = s.active_chain();
        let uuids: Vec<_> = chain
            .iter()
            .map(|&i| s.entry_at(i).unwrap().uuid.clone().unwrap())
            .collect();
        assert_eq!(uuids, vec!["u1", "a1", "u2"]);
    }

    #[test]
    fn test_active_chain_prefers_latest_leaf() {
        // Two leaves: a2 (older) and a3 (newer branch from u1).
        let s = session(&[
            user("u1", "", "2026-01-01T00:00:00Z", "one"),
            assistant("a2", "u1", "2026-01-01T00:00:01Z", r#"[{"type":"text","text":"old"}]"#),
            assistant("a3", "u1", "2026-01-01T00:00:05Z", r#"[{"type":"text","text":"new"}]"#),
        ]);
        let chain = s.active_chain();
        let leaf = s.entry_at(*chain.last().unwrap()).unwrap();
        assert_eq!(leaf.uuid.as_deref(), Some("a3"));
    }

    #[test]
    fn test_active_chain_cycle_bounded() {
        // u1 and u2 reference each other.
        let lines = [
            user("u1", "u2", "2026-01-01T00:00:00Z", "a"),
            user("u2", "u1", "2026-01-01T00:00:01Z", "b"),
            user("u3", "u2", "2026-01-01T00:00:02Z", "c"),
        ];
        let s = session(&lines);
        let chain = s.active_chain();
        // Terminates, visits each node at most once.
        assert!(chain.len() <= 3);
    }

    #[test]
    fn test_chain_after_boundary() {
        let s = session(&[
            user("u1", "", "2026-01-01T00:00:00Z", "one"),
            compact_boundary("cb1", "u1", "2026-01-01T00:00:01Z"),
            user("u2", "cb1", "2026-01-01T00:00:02Z", "two"),
            assistant("a2", "u2", "2026-01-01T00:00:03Z", r#"[{"type":"text","text":"r"}]"#),
        ]);
        let (boundary, after) = s.chain_after_boundary();
        assert!(boundary.is_some());
        let uuids: Vec<_> = after
            .iter()
            .map(|&i| s.entry_at(i).unwrap().uuid.clone().unwrap())
            .collect();
        assert_eq!(uuids, vec!["u2", "a2"]);
    }

    #[test]
    fn test_merged_turns_group_by_message_id() {
        let s = session(&[
            user("u1", "", "2026-01-01T00:00:00Z", "q"),
            assistant_fragment("a1", "u1", "2026-01-01T00:00:01Z", "msg_1", r#"[{"type":"text","text":"part1"}]"#),
            assistant_fragment("a2", "a1", "2026-01-01T00:00:02Z", "msg_1", r#"[{"type":"text","text":"part2"}]"#),
            assistant("a3", "a2", "2026-01-01T00:00:03Z", r#"[{"type":"text","text":"solo"}]"#),
        ]);
        let turns = s.merged_turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].entry_indices.len(), 2);
        assert_eq!(turns[1].entry_indices.len(), 1);
    }

    #[test]
    fn test_entry_text_flattens_blocks() {
        let s = session(&[assistant(
            "a1",
            "u0",
            "2026-01-01T00:00:00Z",
            r#"[{"type":"thinking","thinking":"think"},{"type":"text","text":"answer"},{"type":"tool_use","id":"t1","name":"Read","input":{"p":1}}]"#,
        )]);
        let text = entry_text(s.records[0].value().unwrap());
        assert!(text.contains("think"));
        assert!(text.contains("answer"));
        assert!(text.contains("[tool_use Read"));
    }
}
