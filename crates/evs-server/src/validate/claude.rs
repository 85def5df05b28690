// crates/evs-server/src/validate/claude.rs
// Rules for chat-style transcripts. The agent re-checks all of these on
// resume; a file that fails the error-severity rules will not load.

use super::{Issue, IssueCode, Location};
use crate::transcript::claude::{BlockKind, Line, Role, Session, entry_text};
use std::collections::{HashMap, HashSet};

pub fn validate_claude(session: &Session) -> Vec<Issue> {
    let mut issues = Vec::new();

    for line in &session.lines {
        match line {
            Line::InvalidJson { line_number, .. } => issues.push(Issue::error(
                IssueCode::InvalidJsonLine,
                Location::Line(*line_number),
                "line is not valid JSON",
            )),
            Line::UnknownJson { line_number, .. } => issues.push(Issue::warning(
                IssueCode::UnknownJsonLine,
                Location::Line(*line_number),
                "valid JSON but not a recognized entry",
            )),
            _ => {}
        }
    }

    check_duplicate_uuids(session, &mut issues);
    check_parent_chain(session, &mut issues);
    check_thinking_order(session, &mut issues);
    check_tool_pairing(session, &mut issues);
    check_api_errors(session, &mut issues);

    issues
}

fn check_duplicate_uuids(session: &Session, issues: &mut Vec<Issue>) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for entry in session.entries() {
        let Some(uuid) = entry.uuid.as_deref() else {
            continue;
        };
        if let Some(first_line) = seen.get(uuid) {
            issues.push(Issue::error(
                IssueCode::DuplicateUuid,
                Location::Line(entry.line_number),
                format!("uuid {uuid} already used on line {first_line}"),
            ));
        } else {
            seen.insert(uuid, entry.line_number);
        }
    }
}

fn check_parent_chain(session: &Session, issues: &mut Vec<Issue>) {
    let uuids: HashSet<&str> = session.entries().filter_map(|e| e.uuid.as_deref()).collect();
    for entry in session.entries() {
        if let Some(parent) = entry.parent_uuid.as_deref() {
            if !uuids.contains(parent) {
                issues.push(Issue::error(
                    IssueCode::BrokenParentChain,
                    Location::Line(entry.line_number),
                    format!("parentUuid {parent} does not exist in this file"),
                ));
            }
        }
    }

    // A chain whose root still has a resolvable parent was cut short by the
    // visited-set (a parentUuid cycle) or the hop bound.
    let chain = session.active_chain();
    if let Some(&root) = chain.first() {
        if let Some(entry) = session.entry_at(root) {
            let cyclic = entry
                .parent_uuid
                .as_deref()
                .is_some_and(|p| uuids.contains(p));
            if cyclic {
                issues.push(Issue::error(
                    IssueCode::BrokenParentChain,
                    Location::Line(entry.line_number),
                    "parentUuid chain does not terminate at a root",
                ));
            }
        }
    }
}

fn check_thinking_order(session: &Session, issues: &mut Vec<Issue>) {
    for turn in session.merged_turns() {
        let entries: Vec<_> = turn
            .entry_indices
            .iter()
            .filter_map(|&i| session.entry_at(i))
            .collect();
        let has_thinking = entries.iter().any(|e| e.has_thinking());
        if !has_thinking {
            continue;
        }
        let first_block = entries.iter().flat_map(|e| e.blocks.iter()).next();
        if matches!(first_block, Some(BlockKind::Thinking)) {
            continue;
        }
        let line_number = entries.first().map(|e| e.line_number).unwrap_or(0);
        if entries.len() == 1 {
            issues.push(Issue::error(
                IssueCode::ThinkingBlockOrder,
                Location::Line(line_number),
                "assistant turn has a thinking block that is not first",
            ));
        } else {
            issues.push(Issue::error(
                IssueCode::ThinkingBlockOrderMerged,
                Location::Line(line_number),
                "streamed assistant turn has a thinking block that is not first when merged",
            ));
        }
    }
}

fn check_tool_pairing(session: &Session, issues: &mut Vec<Issue>) {
    let mut seen_calls: HashSet<&str> = HashSet::new();
    for &index in &session.active_chain() {
        let Some(entry) = session.entry_at(index) else {
            continue;
        };
        for block in &entry.blocks {
            match block {
                BlockKind::ToolUse { id } => {
                    seen_calls.insert(id.as_str());
                }
                BlockKind::ToolResult { tool_use_id } => {
                    if !seen_calls.contains(tool_use_id.as_str()) {
                        issues.push(Issue::error(
                            IssueCode::OrphanToolResult,
                            Location::Line(entry.line_number),
                            format!("tool_result {tool_use_id} has no preceding tool_use"),
                        ));
                    }
                }
                _ => {}
            }
        }
    }
}

fn check_api_errors(session: &Session, issues: &mut Vec<Issue>) {
    for entry in session.entries() {
        if entry.role != Role::Assistant {
            continue;
        }
        let Some(value) = session.records[entry.index].value() else {
            continue;
        };
        if entry_text(value).trim_start().starts_with("API Error") {
            issues.push(Issue::warning(
                IssueCode::ApiErrorMessage,
                Location::Line(entry.line_number),
                "assistant turn records an API error",
            ));
        }
    }
}
