// crates/evs-server/src/fix/codex.rs
// Repairs for rollout-style transcripts: sandbox_policy field spelling,
// output ordering, orphan outputs, and optional stub outputs.

use super::{Change, ChangeKind, FixOptions, FixOutcome};
use crate::jsonl::Record;
use crate::transcript::codex::{ItemKind, Line, Session, payload_mut};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};

pub fn fix_codex(session: &Session, opts: &FixOptions) -> FixOutcome {
    let mut changes = Vec::new();

    let records = normalize_sandbox_policy(session.records.clone(), &mut changes);
    let records = reorder_early_outputs(records, &mut changes);
    let records = remove_orphan_outputs(records, &mut changes);
    let records = if opts.insert_aborted_outputs {
        insert_aborted_outputs(records, &mut changes)
    } else {
        records
    };

    FixOutcome { records, changes }
}

/// `sandbox_policy.mode` is the legacy spelling of `sandbox_policy.type`.
fn normalize_sandbox_policy(records: Vec<Record>, changes: &mut Vec<Change>) -> Vec<Record> {
    let view = Session::parse(records);
    let mut records = view.records;
    let targets: Vec<usize> = view
        .lines
        .iter()
        .filter_map(|l| match l {
            Line::TurnContext { index, .. } => Some(*index),
            _ => None,
        })
        .collect();

    for index in targets {
        let line_number = records[index].line_number();
        let Some(policy) = records[index]
            .value_mut()
            .and_then(payload_mut)
            .and_then(|p| p.get_mut("sandbox_policy"))
            .and_then(|p| p.as_object_mut())
        else {
            continue;
        };
        if let Some(mode) = policy.remove("mode") {
            if !policy.contains_key("type") {
                policy.insert("type".to_string(), mode);
            }
            changes.push(Change::new(
                ChangeKind::NormalizedSandboxPolicy,
                line_number,
                "renamed sandbox_policy.mode to type",
            ));
        }
    }
    records
}

/// Move any output that appears before its call to the line just after it.
/// One move per pass; reparse between moves keeps the index math trivial.
fn reorder_early_outputs(records: Vec<Record>, changes: &mut Vec<Change>) -> Vec<Record> {
    let mut records = records;
    loop {
        let view = Session::parse(records);
        let Some((output_index, call_index, call_id)) = first_early_output(&view) else {
            return view.records;
        };
        records = view.records;
        let line_number = records[output_index].line_number();
        let moved = records.remove(output_index);
        // The call shifted left by one if it came after the output.
        let insert_at = if call_index > output_index {
            call_index
        } else {
            call_index + 1
        };
        records.insert(insert_at, moved);
        changes.push(Change::new(
            ChangeKind::ReorderedOutput,
            line_number,
            format!("moved output for {call_id} after its call"),
        ));
    }
}

fn first_early_output(view: &Session) -> Option<(usize, usize, String)> {
    let mut call_index: HashMap<&str, usize> = HashMap::new();
    for line in &view.lines {
        if let Line::ResponseItem {
            index,
            kind,
            call_id: Some(call_id),
            ..
        } = line
        {
            if kind.is_call() {
                call_index.entry(call_id.as_str()).or_insert(*index);
            }
        }
    }
    for line in &view.lines {
        if let Line::ResponseItem {
            index,
            kind,
            call_id: Some(call_id),
            ..
        } = line
        {
            if kind.is_output() {
                if let Some(&call) = call_index.get(call_id.as_str()) {
                    if call > *index {
                        return Some((*index, call, call_id.clone()));
                    }
                }
            }
        }
    }
    None
}

/// Delete outputs whose call_id has no call anywhere in the file.
fn remove_orphan_outputs(records: Vec<Record>, changes: &mut Vec<Change>) -> Vec<Record> {
    let view = Session::parse(records);
    let calls: HashSet<&str> = view
        .lines
        .iter()
        .filter_map(|l| match l {
            Line::ResponseItem {
                kind,
                call_id: Some(call_id),
                ..
            } if kind.is_call() => Some(call_id.as_str()),
            _ => None,
        })
        .collect();

    let orphan_indices: HashSet<usize> = view
        .lines
        .iter()
        .filter_map(|l| match l {
            Line::ResponseItem {
                index,
                kind,
                call_id: Some(call_id),
                ..
            } if kind.is_output() && !calls.contains(call_id.as_str()) => Some(*index),
            _ => None,
        })
        .collect();

    if orphan_indices.is_empty() {
        return view.records;
    }
    let mut out = Vec::with_capacity(view.records.len());
    for (index, record) in view.records.into_iter().enumerate() {
        if orphan_indices.contains(&index) {
            changes.push(Change::new(
                ChangeKind::RemovedResponseItem,
                record.line_number(),
                "removed orphan output",
            ));
        } else {
            out.push(record);
        }
    }
    out
}

/// Insert a matching stub output right after every unanswered call.
fn insert_aborted_outputs(records: Vec<Record>, changes: &mut Vec<Change>) -> Vec<Record> {
    let view = Session::parse(records);
    let answered: HashSet<String> = view
        .lines
        .iter()
        .filter_map(|l| match l {
            Line::ResponseItem {
                kind,
                call_id: Some(call_id),
                ..
            } if kind.is_output() => Some(call_id.clone()),
            _ => None,
        })
        .collect();

    let mut inserts: Vec<(usize, ItemKind, String)> = Vec::new();
    for line in &view.lines {
        if let Line::ResponseItem {
            index,
            kind,
            call_id: Some(call_id),
            ..
        } = line
        {
            if kind.is_call() && !answered.contains(call_id) {
                if let Some(output_kind) = kind.matching_output() {
                    inserts.push((*index, output_kind, call_id.clone()));
                }
            }
        }
    }
    if inserts.is_empty() {
        return view.records;
    }

    let mut records = view.records;
    for (call_index, output_kind, call_id) in inserts.into_iter().rev() {
        let line_number = records[call_index].line_number();
        let timestamp = records[call_index]
            .value()
            .and_then(|v| v.get("timestamp"))
            .cloned()
            .unwrap_or(Value::Null);
        let payload_type = match output_kind {
            ItemKind::CustomToolCallOutput => "custom_tool_call_output",
            _ => "function_call_output",
        };
        let stub = json!({
            "timestamp": timestamp,
            "type": "response_item",
            "payload": {
                "type": payload_type,
                "call_id": call_id,
                "output": "aborted",
            },
        });
        records.insert(
            call_index + 1,
            Record::Valid {
                line_number,
                value: stub,
            },
        );
        changes.push(Change::new(
            ChangeKind::InsertedAbortedOutput,
            line_number,
            format!("inserted aborted output for {call_id}"),
        ));
    }
    records
}
