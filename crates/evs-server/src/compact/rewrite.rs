// crates/evs-server/src/compact/rewrite.rs
// The rewrite itself: apply a planned compaction to the record sequence.
// Pure value surgery; callers own locking, backups, and the atomic write.

use crate::compact::plan::{ClaudePlan, CodexPlan, SummaryCarrier};
use crate::fix::{Change, ChangeKind, FixOutcome, RemovalMode, remove_claude_entries};
use crate::jsonl::Record;
use crate::transcript::{claude, codex};
use serde_json::{Value, json};
use std::collections::BTreeSet;

/// Rewrite a chat transcript: the summary lands in the region root (or a
/// synthesized child of the meta root / compact boundary), the removed
/// range goes away, and the anchor is reparented onto the summary node.
pub fn apply_claude(
    session: &claude::Session,
    plan: &ClaudePlan,
    summary: &str,
    mode: RemovalMode,
) -> FixOutcome {
    let mut changes = Vec::new();
    let mut records = session.records.clone();

    // Where the summary text lives, and the uuid the anchor reparents to.
    let (summary_uuid, synthesized) = match plan.carrier {
        SummaryCarrier::RewriteRoot(root) => {
            let line_number = records[root].line_number();
            if let Some(value) = records[root].value_mut() {
                claude::set_content_string(value, summary);
            }
            changes.push(Change::new(
                ChangeKind::RewroteSummaryRoot,
                line_number,
                "root user content replaced with summary",
            ));
            let uuid = session
                .entry_at(root)
                .and_then(|e| e.uuid.clone())
                .unwrap_or_default();
            (uuid, None)
        }
        SummaryCarrier::SynthesizeChildOf(parent) => {
            let parent_entry = session.entry_at(parent);
            let new_uuid = uuid::Uuid::new_v4().to_string();
            let timestamp = plan
                .remove
                .first()
                .and_then(|&i| session.entry_at(i))
                .and_then(|e| e.timestamp.clone())
                .or_else(|| parent_entry.and_then(|e| e.timestamp.clone()));
            let entry = json!({
                "type": "user",
                "uuid": new_uuid,
                "parentUuid": parent_entry.and_then(|e| e.uuid.clone()),
                "sessionId": parent_entry.and_then(|e| e.session_id.clone()),
                "timestamp": timestamp,
                "message": {"role": "user", "content": summary},
            });
            (new_uuid, Some((parent, entry)))
        }
    };

    // Reparent the first kept message onto the summary node before the
    // removal pass, so relinking leaves it alone.
    if let Some(anchor) = plan.anchor {
        let line_number = records[anchor].line_number();
        if let Some(obj) = records[anchor].value_mut().and_then(|v| v.as_object_mut()) {
            obj.insert(
                "parentUuid".to_string(),
                Value::String(summary_uuid.clone()),
            );
        }
        changes.push(Change::new(
            ChangeKind::RelinkedParent,
            line_number,
            "anchor reparented onto summary",
        ));
    }

    let remove: BTreeSet<usize> = plan.remove.iter().copied().collect();
    let view = claude::Session::parse(records);
    let mut records = remove_claude_entries(&view, &remove, mode, &mut changes);

    if let Some((parent, entry)) = synthesized {
        // Everything removed sits after the parent, so its index held.
        let line_number = records[parent].line_number();
        records.insert(
            parent + 1,
            Record::Valid {
                line_number,
                value: entry,
            },
        );
        changes.push(Change::new(
            ChangeKind::InsertedSummary,
            line_number,
            "synthesized summary entry",
        ));
    }

    FixOutcome { records, changes }
}

/// Rewrite a rollout transcript: drop the removed response items and any
/// stale checkpoints, and insert a single `compacted` line at the first
/// kept response-item position.
pub fn apply_codex(session: &codex::Session, plan: &CodexPlan, summary: &str) -> FixOutcome {
    let mut changes = Vec::new();

    let replacement_history: Vec<Value> = plan
        .pinned
        .iter()
        .filter_map(|&i| session.records[i].value())
        .filter_map(|v| codex::payload(v))
        .cloned()
        .chain(std::iter::once(json!({
            "type": "message",
            "role": "user",
            "content": [{"type": "input_text", "text": summary}],
        })))
        .collect();

    let timestamp = plan
        .anchor
        .or(plan.remove.last().copied())
        .and_then(|i| session.records[i].value())
        .and_then(|v| v.get("timestamp"))
        .cloned()
        .unwrap_or(Value::Null);
    let compacted = json!({
        "timestamp": timestamp,
        "type": "compacted",
        "payload": {
            "message": summary,
            "replacement_history": replacement_history,
        },
    });

    let remove: BTreeSet<usize> = plan
        .remove
        .iter()
        .chain(plan.drop_compacted.iter())
        .copied()
        .collect();

    let mut records = Vec::with_capacity(session.records.len());
    let mut inserted = false;
    for (index, record) in session.records.iter().enumerate() {
        if Some(index) == plan.anchor {
            records.push(Record::Valid {
                line_number: record.line_number(),
                value: compacted.clone(),
            });
            changes.push(Change::new(
                ChangeKind::InsertedCompacted,
                record.line_number(),
                "inserted compacted checkpoint",
            ));
            inserted = true;
        }
        if remove.contains(&index) {
            let kind = if plan.drop_compacted.contains(&index) {
                "stale checkpoint"
            } else {
                "response item"
            };
            changes.push(Change::new(
                ChangeKind::RemovedResponseItem,
                record.line_number(),
                format!("removed {kind}"),
            ));
            continue;
        }
        records.push(record.clone());
    }
    if !inserted {
        records.push(Record::Valid {
            line_number: session.records.len() + 1,
            value: compacted,
        });
        changes.push(Change::new(
            ChangeKind::InsertedCompacted,
            session.records.len() + 1,
            "inserted compacted checkpoint at end",
        ));
    }

    FixOutcome { records, changes }
}
