// crates/evs-server/src/transcript/mod.rs
// Typed transcript grammars over the JSONL record stream, one per agent.
// The grammar is a view: storage stays in the record sequence, and every
// rewrite mutates record values in place, then re-parses the view.

pub mod claude;
pub mod codex;

use crate::jsonl::Record;
use evs_types::Agent;

/// Detect which agent wrote a transcript by sniffing its first few valid
/// records. Chat-style entries carry `type` + `uuid`; rollout lines carry a
/// `type`/`payload` envelope.
pub fn detect_agent(records: &[Record]) -> Option<Agent> {
    for record in records.iter().take(25) {
        let Some(value) = record.value() else { continue };
        let obj = value.as_object()?;
        if obj.contains_key("payload")
            && obj
                .get("type")
                .and_then(|t| t.as_str())
                .is_some_and(codex::is_rollout_line_type)
        {
            return Some(Agent::Codex);
        }
        if obj.contains_key("uuid")
            && obj
                .get("type")
                .and_then(|t| t.as_str())
                .is_some_and(claude::is_chat_entry_type)
        {
            return Some(Agent::Claude);
        }
        // Legacy rollout heads are flat: an id + timestamp, no uuid.
        if obj.contains_key("id") && obj.contains_key("timestamp") && !obj.contains_key("uuid") {
            return Some(Agent::Codex);
        }
    }
    None
}
