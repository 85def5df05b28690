// crates/evs-server/src/fix/claude.rs
// Repairs for chat-style transcripts: thinking-block order across streamed
// fragments, parent relinking over removals, orphan tool_result blocks,
// and optional stub outputs for abandoned tool calls.

use super::{Change, ChangeKind, FixOptions, FixOutcome, RemovalMode};
use crate::jsonl::Record;
use crate::transcript::claude::{
    BlockKind, Entry, Role, Session, content_blocks_mut,
};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, HashSet};

pub fn fix_claude(session: &Session, opts: &FixOptions) -> FixOutcome {
    let mut changes = Vec::new();

    let records = fix_thinking_order(session.records.clone(), opts.removal_mode, &mut changes);
    let records = remove_orphan_tool_results(records, &mut changes);
    let records = if opts.insert_aborted_outputs {
        insert_aborted_outputs(records, &mut changes)
    } else {
        records
    };

    FixOutcome { records, changes }
}

// ---------------------------------------------------------------------------
// Thinking-block order
// ---------------------------------------------------------------------------

fn fix_thinking_order(
    records: Vec<Record>,
    mode: RemovalMode,
    changes: &mut Vec<Change>,
) -> Vec<Record> {
    let view = Session::parse(records);
    let mut to_remove: BTreeSet<usize> = BTreeSet::new();
    let mut reorder_targets: Vec<Vec<usize>> = Vec::new();

    for turn in view.merged_turns() {
        let entries: Vec<&Entry> = turn
            .entry_indices
            .iter()
            .filter_map(|&i| view.entry_at(i))
            .collect();
        let has_thinking = entries.iter().any(|e| e.has_thinking());
        let first_block = entries.iter().flat_map(|e| e.blocks.iter()).next();
        if !has_thinking || matches!(first_block, Some(BlockKind::Thinking)) {
            continue;
        }

        // A later fragment opening with thinking becomes the new head;
        // everything streamed before it is dropped.
        let head = entries
            .iter()
            .position(|e| e.starts_with_thinking())
            .filter(|&k| k > 0);
        if let Some(k) = head {
            for dropped in &entries[..k] {
                to_remove.insert(dropped.index);
            }
            changes.push(Change::new(
                ChangeKind::BrokeStreamedTurn,
                entries[k].line_number,
                format!("fragment promoted to turn head, {k} earlier fragment(s) removed"),
            ));
        } else {
            reorder_targets.push(entries.iter().map(|e| e.index).collect());
        }
    }

    let mut records = view.records;

    for turn_indices in reorder_targets {
        hoist_thinking_blocks(&mut records, &turn_indices, changes);
    }

    if to_remove.is_empty() {
        return records;
    }
    let view = Session::parse(records);
    remove_claude_entries(&view, &to_remove, mode, changes)
}

/// Move every thinking block of the turn to the front of its first
/// fragment, preserving their relative order.
fn hoist_thinking_blocks(records: &mut [Record], turn_indices: &[usize], changes: &mut Vec<Change>) {
    let mut thinking: Vec<Value> = Vec::new();
    for &index in turn_indices {
        if let Some(blocks) = records[index].value_mut().and_then(content_blocks_mut) {
            let mut kept = Vec::with_capacity(blocks.len());
            for block in blocks.drain(..) {
                if is_thinking_block(&block) {
                    thinking.push(block);
                } else {
                    kept.push(block);
                }
            }
            *blocks = kept;
        }
    }
    if thinking.is_empty() {
        return;
    }
    let first = turn_indices[0];
    let line_number = records[first].line_number();
    if let Some(blocks) = records[first].value_mut().and_then(content_blocks_mut) {
        for block in thinking.into_iter().rev() {
            blocks.insert(0, block);
        }
        changes.push(Change::new(
            ChangeKind::ReorderedThinking,
            line_number,
            "moved thinking blocks to the front of the turn",
        ));
    }
}

fn is_thinking_block(block: &Value) -> bool {
    matches!(
        block.get("type").and_then(|t| t.as_str()),
        Some("thinking") | Some("redacted_thinking")
    )
}

// ---------------------------------------------------------------------------
// Orphan tool_result blocks
// ---------------------------------------------------------------------------

fn remove_orphan_tool_results(records: Vec<Record>, changes: &mut Vec<Change>) -> Vec<Record> {
    let view = Session::parse(records);
    let mut seen_calls: HashSet<String> = HashSet::new();
    let mut orphans: Vec<(usize, String)> = Vec::new();
    for &index in &view.active_chain() {
        let Some(entry) = view.entry_at(index) else {
            continue;
        };
        for block in &entry.blocks {
            match block {
                BlockKind::ToolUse { id } => {
                    seen_calls.insert(id.clone());
                }
                BlockKind::ToolResult { tool_use_id } => {
                    if !seen_calls.contains(tool_use_id) {
                        orphans.push((index, tool_use_id.clone()));
                    }
                }
                _ => {}
            }
        }
    }

    let mut records = view.records;
    for (index, tool_use_id) in orphans {
        let line_number = records[index].line_number();
        if let Some(blocks) = records[index].value_mut().and_then(content_blocks_mut) {
            blocks.retain(|b| {
                !(b.get("type").and_then(|t| t.as_str()) == Some("tool_result")
                    && b.get("tool_use_id").and_then(|t| t.as_str()) == Some(tool_use_id.as_str()))
            });
            changes.push(Change::new(
                ChangeKind::RemovedOrphanToolResult,
                line_number,
                format!("removed orphan tool_result {tool_use_id}"),
            ));
        }
    }
    records
}

// ---------------------------------------------------------------------------
// Aborted-output stubs
// ---------------------------------------------------------------------------

fn insert_aborted_outputs(records: Vec<Record>, changes: &mut Vec<Change>) -> Vec<Record> {
    let view = Session::parse(records);
    let chain = view.active_chain();

    // Which calls on the chain are answered anywhere later on it?
    let mut answered: HashSet<String> = HashSet::new();
    for &index in &chain {
        if let Some(entry) = view.entry_at(index) {
            for block in &entry.blocks {
                if let BlockKind::ToolResult { tool_use_id } = block {
                    answered.insert(tool_use_id.clone());
                }
            }
        }
    }

    // Everything needed after the records move out of the view.
    struct InsertPlan {
        assistant_index: usize,
        ids: Vec<String>,
        child: Option<usize>,
        child_foldable: bool,
    }

    let child_of: HashMap<usize, usize> = chain.windows(2).map(|w| (w[0], w[1])).collect();
    let mut plans: Vec<InsertPlan> = Vec::new();
    for &index in &chain {
        let Some(entry) = view.entry_at(index) else {
            continue;
        };
        if entry.role != Role::Assistant {
            continue;
        }
        let ids: Vec<String> = entry
            .blocks
            .iter()
            .filter_map(|b| match b {
                BlockKind::ToolUse { id } if !answered.contains(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        if ids.is_empty() {
            continue;
        }
        let child = child_of.get(&index).copied();
        let child_foldable = child
            .and_then(|c| view.entry_at(c))
            .is_some_and(|e| e.role == Role::User && !e.content_is_string);
        plans.push(InsertPlan {
            assistant_index: index,
            ids,
            child,
            child_foldable,
        });
    }
    if plans.is_empty() {
        return view.records;
    }

    let mut records = view.records;
    // Process in reverse file order so earlier insertions don't shift
    // later indices.
    for plan in plans.into_iter().rev() {
        let InsertPlan {
            assistant_index,
            ids,
            child,
            child_foldable,
        } = plan;
        let line_number = records[assistant_index].line_number();
        let stubs: Vec<Value> = ids.iter().map(|id| aborted_result_block(id)).collect();

        // Prefer folding stubs into the chain child when it is a user entry
        // with block content.
        let folded = child_foldable
            && child.is_some_and(|c| {
                records[c]
                    .value_mut()
                    .and_then(content_blocks_mut)
                    .map(|blocks| {
                        for stub in &stubs {
                            blocks.push(stub.clone());
                        }
                        true
                    })
                    .unwrap_or(false)
            });

        if !folded {
            let assistant = records[assistant_index]
                .value()
                .cloned()
                .unwrap_or(Value::Null);
            let assistant_uuid = assistant
                .get("uuid")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            let new_uuid = uuid::Uuid::new_v4().to_string();
            let stub_entry = json!({
                "type": "user",
                "uuid": new_uuid,
                "parentUuid": assistant_uuid,
                "sessionId": assistant.get("sessionId").cloned().unwrap_or(Value::Null),
                "timestamp": assistant.get("timestamp").cloned().unwrap_or(Value::Null),
                "message": {"role": "user", "content": stubs},
            });
            // Splice the stub entry into the chain below the assistant.
            if let Some(c) = child {
                if let Some(obj) = records[c].value_mut().and_then(|v| v.as_object_mut()) {
                    obj.insert("parentUuid".to_string(), Value::String(new_uuid.clone()));
                }
            }
            records.insert(
                assistant_index + 1,
                Record::Valid {
                    line_number,
                    value: stub_entry,
                },
            );
        }

        for id in ids {
            changes.push(Change::new(
                ChangeKind::InsertedAbortedOutput,
                line_number,
                format!("inserted aborted tool_result for {id}"),
            ));
        }
    }
    records
}

fn aborted_result_block(tool_use_id: &str) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": tool_use_id,
        "content": [{"type": "text", "text": "Tool execution aborted"}],
        "is_error": true,
    })
}

// ---------------------------------------------------------------------------
// Entry removal with relinking
// ---------------------------------------------------------------------------

/// Nearest ancestor of `start_uuid` that is not in `removed`, by walking
/// parentUuid links. `None` means the survivor is the (null) root.
pub fn nearest_surviving_ancestor(
    session: &Session,
    start_uuid: &str,
    removed: &HashSet<String>,
) -> Option<String> {
    let by_uuid = session.uuid_index();
    let mut cursor = Some(start_uuid.to_string());
    let mut hops = 0;
    while let Some(uuid) = cursor {
        if hops >= crate::transcript::claude::MAX_CHAIN_HOPS {
            return None;
        }
        hops += 1;
        if !removed.contains(&uuid) {
            return Some(uuid);
        }
        cursor = by_uuid
            .get(uuid.as_str())
            .and_then(|&i| session.entry_at(i))
            .and_then(|e| e.parent_uuid.clone());
    }
    None
}

/// Remove the entries at `remove` (record indices). Delete mode drops the
/// records and relinks children to the nearest surviving ancestor;
/// tombstone mode swaps in uuid-preserving sentinels so no relink is
/// needed.
pub fn remove_claude_entries(
    session: &Session,
    remove: &BTreeSet<usize>,
    mode: RemovalMode,
    changes: &mut Vec<Change>,
) -> Vec<Record> {
    let removed_uuids: HashSet<String> = remove
        .iter()
        .filter_map(|&i| session.entry_at(i))
        .filter_map(|e| e.uuid.clone())
        .collect();

    match mode {
        RemovalMode::Tombstone => {
            let mut records = session.records.clone();
            for &index in remove {
                let line_number = records[index].line_number();
                if let Some(value) = records[index].value_mut() {
                    *value = tombstone_of(value);
                    changes.push(Change::new(
                        ChangeKind::TombstonedEntry,
                        line_number,
                        "entry tombstoned",
                    ));
                }
            }
            records
        }
        RemovalMode::Delete => {
            // Replacement parent for every removed uuid, resolved before
            // any mutation.
            let by_uuid = session.uuid_index();
            let mut replacement: HashMap<String, Option<String>> = HashMap::new();
            for uuid in &removed_uuids {
                let parent = by_uuid
                    .get(uuid.as_str())
                    .and_then(|&i| session.entry_at(i))
                    .and_then(|e| e.parent_uuid.clone());
                let survivor = parent
                    .and_then(|p| nearest_surviving_ancestor(session, &p, &removed_uuids));
                replacement.insert(uuid.clone(), survivor);
            }

            let mut records = Vec::with_capacity(session.records.len());
            for (index, record) in session.records.iter().enumerate() {
                if remove.contains(&index) {
                    changes.push(Change::new(
                        ChangeKind::RemovedEntry,
                        record.line_number(),
                        "entry removed",
                    ));
                    continue;
                }
                let mut record = record.clone();
                let parent = record
                    .value()
                    .and_then(|v| v.get("parentUuid"))
                    .and_then(|p| p.as_str())
                    .map(String::from);
                if let Some(parent) = parent {
                    if removed_uuids.contains(&parent) {
                        let survivor = replacement
                            .get(&parent)
                            .cloned()
                            .flatten();
                        let line_number = record.line_number();
                        if let Some(obj) = record.value_mut().and_then(|v| v.as_object_mut()) {
                            obj.insert(
                                "parentUuid".to_string(),
                                survivor
                                    .clone()
                                    .map(Value::String)
                                    .unwrap_or(Value::Null),
                            );
                        }
                        changes.push(Change::new(
                            ChangeKind::RelinkedParent,
                            line_number,
                            format!(
                                "relinked parent {parent} -> {}",
                                survivor.as_deref().unwrap_or("null")
                            ),
                        ));
                    }
                }
                records.push(record);
            }
            records
        }
    }
}

/// Sentinel for a tombstoned entry: uuid and parent preserved, content gone.
fn tombstone_of(value: &Value) -> Value {
    json!({
        "type": "system",
        "subtype": "tombstone",
        "uuid": value.get("uuid").cloned().unwrap_or(Value::Null),
        "parentUuid": value.get("parentUuid").cloned().unwrap_or(Value::Null),
        "sessionId": value.get("sessionId").cloned().unwrap_or(Value::Null),
        "timestamp": value.get("timestamp").cloned().unwrap_or(Value::Null),
        "content": "",
    })
}
