// crates/evs-server/src/compact/plan.rs
// Removal planning: turn an amount into a concrete, invariant-safe removal
// prefix over the visible messages, plus the fingerprint that identifies
// that selection at apply time.

use crate::compact::tokens::{claude_entry_tokens, codex_item_tokens};
use crate::error::{EvsError, Result};
use crate::transcript::{claude, codex};
use evs_types::{AmountMode, Selection};
use std::collections::HashSet;

/// Substrings that mark an early user message as initial context worth
/// pinning into a compaction's replacement history. Compatibility
/// heuristic, pinned by tests.
pub const PINNED_CONTEXT_MARKERS: [&str; 4] =
    ["<environment_context>", "AGENTS.md", "<INSTRUCTIONS>", "# Tools"];

/// How much to remove.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Amount {
    Messages(CountOrPercent),
    Tokens(TokensOrPercent),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CountOrPercent {
    Count(usize),
    Percent(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokensOrPercent {
    Budget(u64),
    Percent(f64),
}

impl Amount {
    /// Parse `"50%"` or `"20"` under the given mode. Percent is a fraction
    /// of the visible length (messages) or of the estimated total (tokens).
    pub fn parse(raw: &str, mode: AmountMode) -> Result<Self> {
        let raw = raw.trim();
        if let Some(pct) = raw.strip_suffix('%') {
            let pct: f64 = pct
                .trim()
                .parse()
                .map_err(|_| EvsError::InvalidInput(format!("bad percent amount {raw:?}")))?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(EvsError::InvalidInput(format!(
                    "percent amount out of range: {raw:?}"
                )));
            }
            let fraction = pct / 100.0;
            return Ok(match mode {
                AmountMode::Messages => Amount::Messages(CountOrPercent::Percent(fraction)),
                AmountMode::Tokens => Amount::Tokens(TokensOrPercent::Percent(fraction)),
            });
        }
        let n: u64 = raw
            .parse()
            .map_err(|_| EvsError::InvalidInput(format!("bad amount {raw:?}")))?;
        Ok(match mode {
            AmountMode::Messages => Amount::Messages(CountOrPercent::Count(n as usize)),
            AmountMode::Tokens => Amount::Tokens(TokensOrPercent::Budget(n)),
        })
    }

    pub fn mode(&self) -> AmountMode {
        match self {
            Amount::Messages(_) => AmountMode::Messages,
            Amount::Tokens(_) => AmountMode::Tokens,
        }
    }

    /// Raw value recorded in the pending record: counts and budgets as-is,
    /// percents as a fraction.
    pub fn raw_value(&self) -> f64 {
        match self {
            Amount::Messages(CountOrPercent::Count(n)) => *n as f64,
            Amount::Messages(CountOrPercent::Percent(p))
            | Amount::Tokens(TokensOrPercent::Percent(p)) => *p,
            Amount::Tokens(TokensOrPercent::Budget(n)) => *n as f64,
        }
    }
}

/// Where the summary string lands in a chat transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryCarrier {
    /// The root user message is rewritten in place.
    RewriteRoot(usize),
    /// A fresh summary user entry is synthesized as a child of this record
    /// (a meta root, a non-user root, or a compact boundary).
    SynthesizeChildOf(usize),
}

/// A planned compaction for either agent.
#[derive(Debug, Clone)]
pub enum Plan {
    Claude(ClaudePlan),
    Codex(CodexPlan),
}

impl Plan {
    pub fn selection(&self) -> &Selection {
        match self {
            Plan::Claude(p) => &p.selection,
            Plan::Codex(p) => &p.selection,
        }
    }

    pub fn remove_count(&self) -> usize {
        self.selection().remove_count()
    }
}

#[derive(Debug, Clone)]
pub struct ClaudePlan {
    /// Record indices of removed chain messages, oldest first.
    pub remove: Vec<usize>,
    pub selection: Selection,
    pub carrier: SummaryCarrier,
    /// Record index of the first kept visible message.
    pub anchor: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CodexPlan {
    /// Record indices of removed response items, oldest first.
    pub remove: Vec<usize>,
    pub selection: Selection,
    /// Subset of `remove` whose payloads move into replacement_history.
    pub pinned: Vec<usize>,
    /// Earlier `compacted` checkpoints to drop at rewrite.
    pub drop_compacted: Vec<usize>,
    /// Record index of the first kept response item.
    pub anchor: Option<usize>,
}

// ---------------------------------------------------------------------------
// Chat transcripts
// ---------------------------------------------------------------------------

/// The compactable region of a chat transcript: how the summary will be
/// carried, and the visible (selectable) chain messages oldest-first.
pub fn claude_visible(session: &claude::Session) -> Option<(SummaryCarrier, Vec<usize>)> {
    let (boundary, after) = session.chain_after_boundary();
    if let Some(boundary) = boundary {
        return Some((SummaryCarrier::SynthesizeChildOf(boundary), after));
    }
    let chain = after;
    let (&root, rest) = chain.split_first()?;
    let root_entry = session.entry_at(root)?;
    let carrier = if root_entry.role == claude::Role::User && !root_entry.is_meta {
        SummaryCarrier::RewriteRoot(root)
    } else {
        SummaryCarrier::SynthesizeChildOf(root)
    };
    Some((carrier, rest.to_vec()))
}

/// Plan a chat compaction. `Ok(None)` means there is nothing worth
/// removing (or no way to remove anything safely).
pub fn plan_claude(
    session: &claude::Session,
    amount: &Amount,
    keep_last: bool,
) -> Result<Option<Plan>> {
    let Some((carrier, visible)) = claude_visible(session) else {
        return Ok(None);
    };
    if visible.len() < 2 {
        return Ok(None);
    }

    let costs = |i: usize| claude_entry_tokens(session, visible[i]);
    let Some(raw) = raw_remove_count(amount, keep_last, visible.len(), costs)? else {
        return Ok(None);
    };

    let mut k = raw.min(visible.len() - 1);
    // Expansion: grow the prefix until no invariant straddles the cut.
    loop {
        if k >= visible.len() - 1 {
            k = visible.len() - 1;
            if claude_cut_is_dirty(session, &visible, k) {
                return Ok(None);
            }
            break;
        }
        if claude_cut_is_dirty(session, &visible, k) {
            k += 1;
            continue;
        }
        break;
    }
    if k == 0 {
        return Ok(None);
    }

    let remove: Vec<usize> = visible[..k].to_vec();
    let anchor = visible.get(k).copied();
    let uuid_of = |i: usize| {
        session
            .entry_at(i)
            .and_then(|e| e.uuid.clone())
            .unwrap_or_default()
    };
    let selection = Selection::Claude {
        remove_count: k,
        first_removed_uuid: uuid_of(remove[0]),
        last_removed_uuid: uuid_of(remove[k - 1]),
        anchor_uuid: anchor.map(uuid_of),
    };
    Ok(Some(Plan::Claude(ClaudePlan {
        remove,
        selection,
        carrier,
        anchor,
    })))
}

/// True when cutting after `visible[..k]` would split a streamed turn,
/// strand a tool pair, or leave a removed message's direct assistant
/// continuation behind.
fn claude_cut_is_dirty(session: &claude::Session, visible: &[usize], k: usize) -> bool {
    if k == 0 || k >= visible.len() {
        return false;
    }
    let removed = &visible[..k];
    let kept = &visible[k..];
    let next = session.entry_at(kept[0]);

    // Streamed turn split across the cut.
    let removed_message_ids: HashSet<&str> = removed
        .iter()
        .filter_map(|&i| session.entry_at(i))
        .filter(|e| e.role == claude::Role::Assistant)
        .filter_map(|e| e.message_id.as_deref())
        .collect();
    if next.is_some_and(|e| {
        e.role == claude::Role::Assistant
            && e.message_id
                .as_deref()
                .is_some_and(|id| removed_message_ids.contains(id))
    }) {
        return true;
    }

    // A kept tool_result pointing into the removed range.
    let removed_tool_ids: HashSet<&str> = removed
        .iter()
        .filter_map(|&i| session.entry_at(i))
        .flat_map(|e| e.blocks.iter())
        .filter_map(|b| match b {
            claude::BlockKind::ToolUse { id } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    if !removed_tool_ids.is_empty() {
        for &i in kept {
            let Some(entry) = session.entry_at(i) else { continue };
            for block in &entry.blocks {
                if let claude::BlockKind::ToolResult { tool_use_id } = block {
                    if removed_tool_ids.contains(tool_use_id.as_str()) {
                        return true;
                    }
                }
            }
        }
    }

    // An assistant message that directly continues the removed range: an
    // answer whose question is gone is removed with it.
    next.is_some_and(|e| e.role == claude::Role::Assistant)
}

/// Rebuild a full plan from a previously computed remove_count, for the
/// apply pipeline after the fingerprint has been revalidated.
pub fn plan_claude_with_count(
    session: &claude::Session,
    remove_count: usize,
) -> Option<ClaudePlan> {
    let (carrier, visible) = claude_visible(session)?;
    if remove_count == 0 || remove_count >= visible.len() {
        return None;
    }
    let selection = fingerprint_claude(session, remove_count)?;
    Some(ClaudePlan {
        remove: visible[..remove_count].to_vec(),
        selection,
        carrier,
        anchor: visible.get(remove_count).copied(),
    })
}

/// Recompute the selection identity for a previously planned remove_count.
/// `None` when the transcript no longer has that many removable messages.
pub fn fingerprint_claude(session: &claude::Session, remove_count: usize) -> Option<Selection> {
    let (_, visible) = claude_visible(session)?;
    if remove_count == 0 || remove_count >= visible.len() {
        return None;
    }
    let uuid_of = |i: usize| {
        session
            .entry_at(i)
            .and_then(|e| e.uuid.clone())
            .unwrap_or_default()
    };
    Some(Selection::Claude {
        remove_count,
        first_removed_uuid: uuid_of(visible[0]),
        last_removed_uuid: uuid_of(visible[remove_count - 1]),
        anchor_uuid: visible.get(remove_count).copied().map(uuid_of),
    })
}

// ---------------------------------------------------------------------------
// Rollout transcripts
// ---------------------------------------------------------------------------

pub fn plan_codex(
    session: &codex::Session,
    amount: &Amount,
    keep_last: bool,
) -> Result<Option<Plan>> {
    let visible = session.visible_response_items();
    if visible.len() < 2 {
        return Ok(None);
    }

    let costs = |i: usize| codex_item_tokens(session, visible[i]);
    let Some(raw) = raw_remove_count(amount, keep_last, visible.len(), costs)? else {
        return Ok(None);
    };

    let mut k = raw.min(visible.len() - 1);
    loop {
        if k >= visible.len() - 1 {
            k = visible.len() - 1;
            if codex_cut_is_dirty(session, &visible, k) {
                return Ok(None);
            }
            break;
        }
        if codex_cut_is_dirty(session, &visible, k) {
            k += 1;
            continue;
        }
        break;
    }
    if k == 0 {
        return Ok(None);
    }

    let remove: Vec<usize> = visible[..k].to_vec();
    let anchor = visible.get(k).copied();
    let pinned: Vec<usize> = remove
        .iter()
        .copied()
        .filter(|&i| is_pinned_context(session, i))
        .collect();
    let drop_compacted: Vec<usize> = session
        .lines
        .iter()
        .filter_map(|l| match l {
            codex::Line::Compacted { index, .. } => Some(*index),
            _ => None,
        })
        .collect();

    let line_of = |i: usize| session.records[i].line_number() as u64;
    let selection = Selection::Codex {
        remove_count: k,
        anchor_line: anchor.map(line_of),
        first_removed_line: Some(line_of(remove[0])),
        last_removed_line: Some(line_of(remove[k - 1])),
    };
    Ok(Some(Plan::Codex(CodexPlan {
        remove,
        selection,
        pinned,
        drop_compacted,
        anchor,
    })))
}

/// True when the cut would orphan a call/output pair: a kept output whose
/// call was removed.
fn codex_cut_is_dirty(session: &codex::Session, visible: &[usize], k: usize) -> bool {
    if k == 0 || k >= visible.len() {
        return false;
    }
    let removed: HashSet<usize> = visible[..k].iter().copied().collect();
    let mut removed_calls: HashSet<&str> = HashSet::new();
    for line in &session.lines {
        if let codex::Line::ResponseItem {
            index,
            kind,
            call_id: Some(call_id),
            ..
        } = line
        {
            if kind.is_call() && removed.contains(index) {
                removed_calls.insert(call_id.as_str());
            }
        }
    }
    if removed_calls.is_empty() {
        return false;
    }
    for &i in &visible[k..] {
        if let Some(codex::Line::ResponseItem {
            kind,
            call_id: Some(call_id),
            ..
        }) = session.lines.get(i)
        {
            if kind.is_output() && removed_calls.contains(call_id.as_str()) {
                return true;
            }
        }
    }
    false
}

/// System/developer messages and context-bearing early user messages are
/// moved into the compaction's replacement history rather than discarded.
fn is_pinned_context(session: &codex::Session, index: usize) -> bool {
    let Some(codex::Line::ResponseItem { kind, role, .. }) = session.lines.get(index) else {
        return false;
    };
    if *kind != codex::ItemKind::Message {
        return false;
    }
    match role.as_deref() {
        Some("system") | Some("developer") => true,
        Some("user") => {
            let text = session.records[index]
                .value()
                .map(codex::item_text)
                .unwrap_or_default();
            PINNED_CONTEXT_MARKERS.iter().any(|m| text.contains(m))
        }
        _ => false,
    }
}

/// Rebuild a full plan from a previously computed remove_count.
pub fn plan_codex_with_count(session: &codex::Session, remove_count: usize) -> Option<CodexPlan> {
    let visible = session.visible_response_items();
    if remove_count == 0 || remove_count >= visible.len() {
        return None;
    }
    let selection = fingerprint_codex(session, remove_count)?;
    let remove: Vec<usize> = visible[..remove_count].to_vec();
    let pinned: Vec<usize> = remove
        .iter()
        .copied()
        .filter(|&i| is_pinned_context(session, i))
        .collect();
    let drop_compacted: Vec<usize> = session
        .lines
        .iter()
        .filter_map(|l| match l {
            codex::Line::Compacted { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    Some(CodexPlan {
        remove,
        selection,
        pinned,
        drop_compacted,
        anchor: visible.get(remove_count).copied(),
    })
}

pub fn fingerprint_codex(session: &codex::Session, remove_count: usize) -> Option<Selection> {
    let visible = session.visible_response_items();
    if remove_count == 0 || remove_count >= visible.len() {
        return None;
    }
    let line_of = |i: usize| session.records[i].line_number() as u64;
    Some(Selection::Codex {
        remove_count,
        anchor_line: visible.get(remove_count).copied().map(line_of),
        first_removed_line: Some(line_of(visible[0])),
        last_removed_line: Some(line_of(visible[remove_count - 1])),
    })
}

// ---------------------------------------------------------------------------
// Raw selection
// ---------------------------------------------------------------------------

/// Amount -> raw prefix length over `len` visible messages, before
/// expansion. `cost(i)` prices message `i` for token budgets.
fn raw_remove_count(
    amount: &Amount,
    keep_last: bool,
    len: usize,
    cost: impl Fn(usize) -> u64,
) -> Result<Option<usize>> {
    if keep_last {
        let Amount::Messages(CountOrPercent::Count(n)) = amount else {
            return Err(EvsError::InvalidInput(
                "keep-last requires a message count amount".to_string(),
            ));
        };
        return Ok(Some(len.saturating_sub(*n)));
    }
    let count = match amount {
        Amount::Messages(CountOrPercent::Count(n)) => (*n).min(len),
        Amount::Messages(CountOrPercent::Percent(p)) => ((len as f64) * p).floor() as usize,
        Amount::Tokens(budget) => {
            let total: u64 = (0..len).map(&cost).sum();
            let target = match budget {
                TokensOrPercent::Budget(n) => *n,
                TokensOrPercent::Percent(p) => ((total as f64) * p).floor() as u64,
            };
            // Walk oldest-first; stop just before the sum would exceed the
            // target.
            let mut sum = 0u64;
            let mut k = 0usize;
            for i in 0..len {
                let c = cost(i);
                if sum + c > target {
                    break;
                }
                sum += c;
                k += 1;
            }
            k
        }
    };
    Ok(if count == 0 { None } else { Some(count) })
}
