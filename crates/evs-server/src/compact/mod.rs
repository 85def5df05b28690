// crates/evs-server/src/compact/mod.rs
// Auto-compaction: token estimation, removal planning, the rewrite itself,
// and the pipelines that drive them against live files.

pub mod pipeline;
pub mod plan;
pub mod rewrite;
pub mod tokens;

pub use pipeline::{
    ApplyOptions, ApplyOutcome, AutoCompactOptions, AutoCompactOutcome, apply_pending,
    last_chance_fix, run_auto_compact,
};
pub use plan::{
    Amount, Plan, fingerprint_claude, fingerprint_codex, plan_claude, plan_claude_with_count,
    plan_codex, plan_codex_with_count,
};
pub use tokens::{claude_chain_tokens, codex_estimate, count_text};
