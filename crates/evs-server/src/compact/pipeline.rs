// crates/evs-server/src/compact/pipeline.rs
// The auto-compact and apply pipelines: lock, stabilize, parse, fix,
// count, plan, summarize, then either rewrite in place (unsupervised) or
// persist a pending record for the supervisor's reload boundary.

use crate::compact::plan::{
    Amount, Plan, fingerprint_claude, fingerprint_codex, plan_claude, plan_claude_with_count,
    plan_codex, plan_codex_with_count,
};
use crate::compact::rewrite::{apply_claude, apply_codex};
use crate::compact::tokens::{claude_chain_tokens, codex_estimate};
use crate::config::EvsConfig;
use crate::context::Context;
use crate::discover::{self, Query, ResolvedSession};
use crate::error::{EvsError, IoResultExt, Result};
use crate::fix::{FixOptions, RemovalMode, fix_claude, fix_codex};
use crate::fsio::{self, atomic_write};
use crate::jsonl::{self, Record};
use crate::paths;
use crate::pending;
use crate::store;
use crate::summarize::{ModelTier, Summarizer, build_prompt_claude, build_prompt_codex, summarize_with_fallback};
use crate::supervise::control;
use crate::transcript::{claude, codex};
use crate::validate::{Issue, error_count, validate_claude, validate_codex};
use evs_types::{
    Agent, PENDING_SCHEMA_VERSION, PendingCompact, PendingReload, PendingStatus, ReloadMode,
    Selection, SourceStat,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AutoCompactOptions {
    pub agent: Option<Agent>,
    pub transcript: Option<PathBuf>,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub amount: Amount,
    pub keep_last: bool,
    pub removal_mode: RemovalMode,
    pub model: ModelTier,
    /// Compact even below the threshold.
    pub force: bool,
    /// Override the configured trigger threshold.
    pub threshold_tokens: Option<u64>,
}

#[derive(Debug)]
pub enum AutoCompactOutcome {
    NoSession,
    LockTimeout,
    BusyTimeout,
    NotTriggered {
        tokens: u64,
        threshold: u64,
    },
    PendingReady {
        session_id: String,
        tokens: u64,
    },
    Success {
        session_id: String,
        tokens_before: u64,
        tokens_after: u64,
        backup: PathBuf,
    },
    AbortedGuard,
    AbortedValidation {
        detail: String,
    },
    Failed {
        detail: String,
    },
}

impl AutoCompactOutcome {
    /// Process exit code contract: 0 for anything that is not a failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoSession
            | Self::NotTriggered { .. }
            | Self::PendingReady { .. }
            | Self::Success { .. } => 0,
            _ => 1,
        }
    }
}

/// A parsed-and-fixed transcript of either dialect.
pub(crate) enum FixedSession {
    Claude(claude::Session),
    Codex(codex::Session),
}

impl FixedSession {
    fn validate(&self) -> Vec<Issue> {
        match self {
            Self::Claude(s) => validate_claude(s),
            Self::Codex(s) => validate_codex(s),
        }
    }

    fn records(&self) -> &[Record] {
        match self {
            Self::Claude(s) => &s.records,
            Self::Codex(s) => &s.records,
        }
    }

    fn estimate_tokens(&self) -> u64 {
        match self {
            Self::Claude(s) => claude_chain_tokens(s),
            Self::Codex(s) => codex_estimate(s),
        }
    }

    fn plan(&self, amount: &Amount, keep_last: bool) -> Result<Option<Plan>> {
        match self {
            Self::Claude(s) => plan_claude(s, amount, keep_last),
            Self::Codex(s) => plan_codex(s, amount, keep_last),
        }
    }

    fn plan_with_count(&self, remove_count: usize) -> Option<Plan> {
        match self {
            Self::Claude(s) => plan_claude_with_count(s, remove_count).map(Plan::Claude),
            Self::Codex(s) => plan_codex_with_count(s, remove_count).map(Plan::Codex),
        }
    }

    fn fingerprint(&self, remove_count: usize) -> Option<Selection> {
        match self {
            Self::Claude(s) => fingerprint_claude(s, remove_count),
            Self::Codex(s) => fingerprint_codex(s, remove_count),
        }
    }

    fn prompt(&self, plan: &Plan) -> String {
        match (self, plan) {
            (Self::Claude(s), Plan::Claude(p)) => build_prompt_claude(s, &p.remove),
            (Self::Codex(s), Plan::Codex(p)) => build_prompt_codex(s, &p.remove),
            _ => String::new(),
        }
    }

    fn apply(&self, plan: &Plan, summary: &str, mode: RemovalMode) -> Option<FixedSession> {
        match (self, plan) {
            (Self::Claude(s), Plan::Claude(p)) => {
                let out = apply_claude(s, p, summary, mode);
                Some(Self::Claude(claude::Session::parse(out.records)))
            }
            (Self::Codex(s), Plan::Codex(p)) => {
                let out = apply_codex(s, p, summary);
                Some(Self::Codex(codex::Session::parse(out.records)))
            }
            _ => None,
        }
    }

    fn refix(&self, mode: RemovalMode) -> FixedSession {
        let opts = FixOptions {
            removal_mode: mode,
            insert_aborted_outputs: false,
        };
        match self {
            Self::Claude(s) => Self::Claude(claude::Session::parse(fix_claude(s, &opts).records)),
            Self::Codex(s) => Self::Codex(codex::Session::parse(fix_codex(s, &opts).records)),
        }
    }
}

/// Parse raw transcript text, run the fixer, and return the pre-fix issue
/// list with the fixed session and its issues. Legacy rollouts are
/// migrated to the wrapped format first.
pub(crate) fn prepare(
    agent: Agent,
    raw: &str,
    mode: RemovalMode,
) -> (FixedSession, Vec<Issue>, Vec<Issue>) {
    let mut records = jsonl::parse_str(raw);
    let opts = FixOptions {
        removal_mode: mode,
        insert_aborted_outputs: false,
    };
    match agent {
        Agent::Claude => {
            let session = claude::Session::parse(records);
            let pre = validate_claude(&session);
            let fixed = claude::Session::parse(fix_claude(&session, &opts).records);
            let post = validate_claude(&fixed);
            (FixedSession::Claude(fixed), pre, post)
        }
        Agent::Codex => {
            if codex::is_legacy(&records) {
                debug!("Migrating legacy rollout to wrapped format");
                records = codex::migrate_legacy(&records);
            }
            let session = codex::Session::parse(records);
            let pre = validate_codex(&session);
            let fixed = codex::Session::parse(fix_codex(&session, &opts).records);
            let post = validate_codex(&fixed);
            (FixedSession::Codex(fixed), pre, post)
        }
    }
}

/// One auto-compact invocation against the resolved live session.
pub async fn run_auto_compact(
    ctx: &Context,
    config: &EvsConfig,
    summarizer: &dyn Summarizer,
    options: &AutoCompactOptions,
) -> Result<AutoCompactOutcome> {
    let query = Query {
        cwd: options.cwd.clone(),
        session_id: options.session_id.clone(),
        ..Query::default()
    };
    let Some(resolved) =
        discover::resolve_session(ctx, options.agent, options.transcript.as_deref(), &query)?
    else {
        return Ok(AutoCompactOutcome::NoSession);
    };
    let ResolvedSession {
        agent,
        transcript,
        session_id,
    } = resolved;
    debug!(agent = %agent, path = %transcript.display(), "Auto-compact target");

    let _lock = match fsio::acquire_with_wait(
        &transcript,
        Duration::from_millis(config.io.lock_timeout_ms),
    )
    .await
    {
        Ok(guard) => guard,
        Err(EvsError::LockTimeout { .. }) => return Ok(AutoCompactOutcome::LockTimeout),
        Err(e) => return Err(e),
    };
    let guard_token = match fsio::wait_stable(
        &transcript,
        Duration::from_millis(config.io.stability_window_ms),
        Duration::from_millis(config.io.busy_timeout_ms),
    )
    .await
    {
        Ok(token) => token,
        Err(EvsError::BusyTimeout { .. }) => return Ok(AutoCompactOutcome::BusyTimeout),
        Err(e) => return Err(e),
    };

    let raw = std::fs::read_to_string(&transcript).at(&transcript)?;
    let (fixed, pre_issues, post_issues) = prepare(agent, &raw, options.removal_mode);
    if error_count(&post_issues) > error_count(&pre_issues) {
        return Ok(AutoCompactOutcome::AbortedValidation {
            detail: format!(
                "fixer worsened errors: {} -> {}",
                error_count(&pre_issues),
                error_count(&post_issues)
            ),
        });
    }

    let tokens = fixed.estimate_tokens();
    let threshold = options
        .threshold_tokens
        .unwrap_or(config.compact.threshold_tokens);
    if !options.force && tokens < threshold {
        return Ok(AutoCompactOutcome::NotTriggered { tokens, threshold });
    }

    let Some(plan) = fixed.plan(&options.amount, options.keep_last)? else {
        return Ok(AutoCompactOutcome::NotTriggered { tokens, threshold });
    };

    let supervised = ctx.supervisor_env(agent);
    if supervised.is_some() {
        // Leave evidence before the long summarizer call.
        let running = build_pending(
            ctx,
            &session_id,
            PendingStatus::Running,
            None,
            plan.selection().clone(),
            guard_token,
            tokens,
            threshold,
            options,
        );
        pending::save(ctx, &running)?;
    }

    let prompt = fixed.prompt(&plan);
    let (summary, tier) = match summarize_with_fallback(summarizer, &prompt, options.model).await {
        Ok(done) => done,
        Err(e) => {
            let detail = e.to_string();
            if supervised.is_some() {
                let _ = pending::mark_failed(ctx, &session_id, &detail);
            }
            let _ = store::append_log(ctx, &session_id, "compact_failed", json!({"error": detail}));
            return Ok(AutoCompactOutcome::Failed { detail });
        }
    };

    // Rehearse the rewrite and re-validate before touching anything.
    let Some(applied) = fixed.apply(&plan, &summary, options.removal_mode) else {
        return Ok(AutoCompactOutcome::Failed {
            detail: "plan/agent mismatch".to_string(),
        });
    };
    let applied = match check_applied(applied, &post_issues, options.removal_mode) {
        Ok(applied) => applied,
        Err(detail) => {
            if supervised.is_some() {
                let _ = pending::mark_stale(ctx, &session_id, &detail);
            }
            return Ok(AutoCompactOutcome::AbortedValidation { detail });
        }
    };

    if let Some(sup) = supervised {
        let mut record = build_pending(
            ctx,
            &session_id,
            PendingStatus::Ready,
            Some(summary),
            plan.selection().clone(),
            guard_token,
            tokens,
            threshold,
            options,
        );
        record.model = tier.to_string();
        record.ready_at = Some(ctx.now_iso());
        pending::save(ctx, &record)?;

        match sup.reload_mode {
            ReloadMode::Auto => {
                control::append_reload(ctx, &sup.control_dir, "pending compact ready")?;
            }
            ReloadMode::Manual => {
                let mut state = store::load_state(ctx, &session_id);
                state.pending_reload = Some(PendingReload {
                    ts: ctx.now_iso(),
                    reason: "pending compact ready".to_string(),
                });
                store::save_state(ctx, &session_id, &state)?;
            }
            ReloadMode::Off => {}
        }
        store::append_log(ctx, &session_id, "pending_ready", json!({"tokens": tokens}))?;
        info!(session = %session_id, tokens, "Pending compact ready");
        return Ok(AutoCompactOutcome::PendingReady { session_id, tokens });
    }

    // Unsupervised: the agent may have written while we planned.
    match fsio::check_guard(&transcript, &guard_token) {
        Ok(()) => {}
        Err(EvsError::AbortedGuard) => return Ok(AutoCompactOutcome::AbortedGuard),
        Err(e) => return Err(e),
    }

    let backup = store::write_backup(ctx, &session_id, raw.as_bytes())?;
    store::prune_backups(ctx, &session_id, config.compact.backup_cap)?;
    atomic_write(&transcript, jsonl::stringify(applied.records()).as_bytes())?;

    let tokens_after = applied.estimate_tokens();
    let mut state = store::load_state(ctx, &session_id);
    state.last_compact = Some(evs_types::LastCompact {
        ts: ctx.now_iso(),
        tokens_before: tokens,
        tokens_after,
        model: tier.to_string(),
    });
    store::save_state(ctx, &session_id, &state)?;
    store::append_log(
        ctx,
        &session_id,
        "compact",
        json!({"tokensBefore": tokens, "tokensAfter": tokens_after, "model": tier.to_string()}),
    )?;
    info!(session = %session_id, tokens_before = tokens, tokens_after, "Compacted transcript");
    Ok(AutoCompactOutcome::Success {
        session_id,
        tokens_before: tokens,
        tokens_after,
        backup,
    })
}

/// Re-validate a rehearsed rewrite; run the fixer once more if it got
/// worse, and reject if it is still worse than the pre-rewrite state.
fn check_applied(
    applied: FixedSession,
    baseline: &[Issue],
    mode: RemovalMode,
) -> std::result::Result<FixedSession, String> {
    let issues = applied.validate();
    if error_count(&issues) <= error_count(baseline) {
        return Ok(applied);
    }
    let refixed = applied.refix(mode);
    let issues = refixed.validate();
    if error_count(&issues) <= error_count(baseline) {
        return Ok(refixed);
    }
    Err(format!(
        "rewrite worsened errors: {} -> {}",
        error_count(baseline),
        error_count(&issues)
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_pending(
    ctx: &Context,
    session_id: &str,
    status: PendingStatus,
    summary: Option<String>,
    selection: Selection,
    source: SourceStat,
    tokens: u64,
    threshold: u64,
    options: &AutoCompactOptions,
) -> PendingCompact {
    PendingCompact {
        schema_version: PENDING_SCHEMA_VERSION,
        session_id: session_id.to_string(),
        status,
        created_at: ctx.now_iso(),
        ready_at: None,
        failed_at: None,
        threshold_tokens: Some(threshold),
        tokens_at_trigger: tokens,
        amount_mode: options.amount.mode(),
        amount_raw: options.amount.raw_value(),
        model: options.model.to_string(),
        summary,
        selection,
        source,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Apply pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub agent: Agent,
    pub transcript: PathBuf,
    pub session_id: String,
    pub removal_mode: RemovalMode,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    NoPending,
    NotReady(PendingStatus),
    InvalidPending,
    SelectionMismatch,
    AbortedValidation,
    Applied { tokens_before: u64, tokens_after: u64 },
}

impl ApplyOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoPending | Self::NotReady(_) | Self::Applied { .. } => 0,
            _ => 1,
        }
    }
}

/// Apply a ready pending compact against the now-idle transcript. Invoked
/// by the supervisor after it has stopped the child.
pub async fn apply_pending(
    ctx: &Context,
    config: &EvsConfig,
    options: &ApplyOptions,
) -> Result<ApplyOutcome> {
    let session_id = options.session_id.as_str();
    let record = match pending::load(ctx, session_id) {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(ApplyOutcome::NoPending),
        Err(EvsError::InvalidPending(reason)) => {
            warn!(session = session_id, "Invalid pending record: {reason}");
            force_stale_raw(ctx, session_id, &reason);
            return Ok(ApplyOutcome::InvalidPending);
        }
        Err(e) => return Err(e),
    };
    if record.status != PendingStatus::Ready {
        return Ok(ApplyOutcome::NotReady(record.status));
    }
    let Some(summary) = record.summary.clone().filter(|s| !s.trim().is_empty()) else {
        pending::mark_stale(ctx, session_id, "ready pending carries no summary")?;
        return Ok(ApplyOutcome::InvalidPending);
    };

    let _lock = fsio::acquire_with_wait(
        &options.transcript,
        Duration::from_millis(config.io.lock_timeout_ms),
    )
    .await?;
    fsio::wait_stable(
        &options.transcript,
        Duration::from_millis(config.io.stability_window_ms),
        Duration::from_millis(config.io.busy_timeout_ms),
    )
    .await?;

    // The agent wrote while the pending sat: the planned removal no longer
    // describes this file. Source stat first, then the fingerprint as the
    // content-level check for same-size overwrites.
    let current_stat = fsio::stat_token(&options.transcript)?;
    if current_stat != record.source {
        pending::mark_stale(ctx, session_id, "transcript changed since plan")?;
        store::append_log(ctx, session_id, "pending_stale", json!({"reason": "source moved"}))?;
        return Ok(ApplyOutcome::SelectionMismatch);
    }

    let raw = std::fs::read_to_string(&options.transcript).at(&options.transcript)?;
    let (fixed, _pre, post_issues) = prepare(options.agent, &raw, options.removal_mode);

    let remove_count = record.selection.remove_count();
    let current = fixed.fingerprint(remove_count);
    if current.as_ref() != Some(&record.selection) {
        pending::mark_stale(ctx, session_id, "selection fingerprint mismatch")?;
        store::append_log(ctx, session_id, "pending_stale", json!({"reason": "mismatch"}))?;
        return Ok(ApplyOutcome::SelectionMismatch);
    }

    let Some(plan) = fixed.plan_with_count(remove_count) else {
        pending::mark_stale(ctx, session_id, "selection no longer resolvable")?;
        return Ok(ApplyOutcome::SelectionMismatch);
    };

    let tokens_before = fixed.estimate_tokens();
    let Some(applied) = fixed.apply(&plan, &summary, options.removal_mode) else {
        pending::mark_stale(ctx, session_id, "plan/agent mismatch")?;
        return Ok(ApplyOutcome::InvalidPending);
    };
    let applied = match check_applied(applied, &post_issues, options.removal_mode) {
        Ok(applied) => applied,
        Err(detail) => {
            pending::mark_stale(ctx, session_id, &detail)?;
            return Ok(ApplyOutcome::AbortedValidation);
        }
    };

    store::write_backup(ctx, session_id, raw.as_bytes())?;
    store::prune_backups(ctx, session_id, config.compact.backup_cap)?;
    atomic_write(
        &options.transcript,
        jsonl::stringify(applied.records()).as_bytes(),
    )?;
    pending::delete(ctx, session_id)?;

    let tokens_after = applied.estimate_tokens();
    let mut state = store::load_state(ctx, session_id);
    state.pending_reload = None;
    state.last_compact = Some(evs_types::LastCompact {
        ts: ctx.now_iso(),
        tokens_before,
        tokens_after,
        model: record.model.clone(),
    });
    store::save_state(ctx, session_id, &state)?;
    store::append_log(
        ctx,
        session_id,
        "pending_applied",
        json!({"tokensBefore": tokens_before, "tokensAfter": tokens_after}),
    )?;
    info!(session = session_id, tokens_before, tokens_after, "Applied pending compact");
    Ok(ApplyOutcome::Applied {
        tokens_before,
        tokens_after,
    })
}

/// Best-effort stale transition for a pending file that does not parse as
/// the current schema: patch the raw JSON rather than abandoning it.
fn force_stale_raw(ctx: &Context, session_id: &str, reason: &str) {
    let path = paths::pending_path(ctx, session_id);
    let Ok(data) = std::fs::read_to_string(&path) else {
        return;
    };
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&data) else {
        return;
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("status".to_string(), json!("stale"));
        obj.insert("error".to_string(), json!(reason));
        let _ = atomic_write(&path, value.to_string().as_bytes());
    }
}

/// Best-effort last-chance repair of a transcript at a reload boundary.
/// Never fails the caller; returns whether anything changed.
pub fn last_chance_fix(path: &Path, agent: Agent) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return false;
    };
    let (fixed, pre, post) = prepare(agent, &raw, RemovalMode::Delete);
    if error_count(&post) > error_count(&pre) {
        return false;
    }
    let next = jsonl::stringify(fixed.records());
    if next == raw {
        return false;
    }
    match atomic_write(path, next.as_bytes()) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), "Last-chance fix write failed: {e}");
            false
        }
    }
}
