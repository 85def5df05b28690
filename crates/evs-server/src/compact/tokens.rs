// crates/evs-server/src/compact/tokens.rs
// BPE token estimation. The counts drive thresholds and budgets only, so a
// close estimate is enough; exactness is not a goal.

use crate::transcript::{claude, codex};
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

#[allow(clippy::expect_used)]
fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("embedded cl100k vocabulary loads"))
}

/// Token count of a text fragment.
pub fn count_text(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    bpe().encode_with_special_tokens(text).len() as u64
}

/// Estimate for a chat transcript: the concatenated text of every message
/// on the active chain.
pub fn claude_chain_tokens(session: &claude::Session) -> u64 {
    session
        .active_chain()
        .iter()
        .map(|&i| claude_entry_tokens(session, i))
        .sum()
}

/// Per-entry cost, used by the budgeted selection walk.
pub fn claude_entry_tokens(session: &claude::Session, index: usize) -> u64 {
    session.records[index]
        .value()
        .map(|v| count_text(&claude::entry_text(v)))
        .unwrap_or(0)
}

/// Estimate for a rollout transcript. The last `token_count` event is
/// authoritative, but once a later `compacted` checkpoint exists that
/// stored count describes history that is gone, so re-estimate from the
/// visible response items instead.
pub fn codex_estimate(session: &codex::Session) -> u64 {
    let stored = last_token_count_index(session);
    let compacted = session.last_compacted_index();
    match (stored, compacted) {
        (Some((_, total)), None) => total,
        (Some((event_index, total)), Some(compacted_index)) if compacted_index < event_index => {
            total
        }
        _ => session
            .visible_response_items()
            .iter()
            .map(|&i| codex_item_tokens(session, i))
            .sum(),
    }
}

pub fn codex_item_tokens(session: &codex::Session, index: usize) -> u64 {
    session.records[index]
        .value()
        .map(|v| count_text(&codex::item_text(v)))
        .unwrap_or(0)
}

fn last_token_count_index(session: &codex::Session) -> Option<(usize, u64)> {
    session.lines.iter().rev().find_map(|l| match l {
        codex::Line::EventMsg {
            index,
            total_tokens: Some(n),
            ..
        } => Some((*index, *n)),
        _ => None,
    })
}
