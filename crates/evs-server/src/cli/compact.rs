// crates/evs-server/src/cli/compact.rs
// The compact and apply subcommands.

use anyhow::Result;
use evs::compact::plan::Amount;
use evs::compact::{
    ApplyOptions, ApplyOutcome, AutoCompactOptions, AutoCompactOutcome, apply_pending,
    run_auto_compact,
};
use evs::config::EvsConfig;
use evs::context::Context;
use evs::discover::{self, Query};
use evs::fix::RemovalMode;
use evs::summarize::{HttpSummarizer, ModelTier};
use evs_types::AmountMode;
use std::path::PathBuf;

pub struct CompactArgs {
    pub path: Option<PathBuf>,
    pub session: Option<String>,
    pub cwd: Option<String>,
    pub agent: Option<String>,
    pub amount: Option<String>,
    pub tokens: bool,
    pub keep_last: bool,
    pub tombstone: bool,
    pub model: Option<String>,
    pub force: bool,
    pub threshold: Option<u64>,
}

pub async fn run_compact(ctx: &Context, config: &EvsConfig, args: CompactArgs) -> Result<i32> {
    let agent = match super::parse_agent(args.agent.as_deref()) {
        Ok(agent) => agent,
        Err(msg) => {
            eprintln!("evs: {msg}");
            return Ok(2);
        }
    };
    let mode = if args.tokens {
        AmountMode::Tokens
    } else {
        AmountMode::Messages
    };
    let raw_amount = args.amount.clone().unwrap_or_else(|| config.compact.amount.clone());
    let amount = match Amount::parse(&raw_amount, mode) {
        Ok(amount) => amount,
        Err(e) => {
            eprintln!("evs: {e}");
            return Ok(2);
        }
    };
    let model = match args.model.as_deref() {
        None => ModelTier::from_str(&config.compact.model).unwrap_or(ModelTier::Haiku),
        Some(raw) => match ModelTier::from_str(raw) {
            Some(tier) => tier,
            None => {
                eprintln!("evs: unknown model tier {raw:?} (expected haiku, sonnet or opus)");
                return Ok(2);
            }
        },
    };
    let Some(summarizer) = HttpSummarizer::from_env(ctx.env()) else {
        eprintln!("evs: ANTHROPIC_API_KEY is not set; cannot summarize");
        return Ok(2);
    };

    let cwd = args.cwd.clone().or_else(current_dir_string);
    let options = AutoCompactOptions {
        agent,
        transcript: args.path.clone(),
        session_id: args.session.clone(),
        cwd,
        amount,
        keep_last: args.keep_last,
        removal_mode: if args.tombstone {
            RemovalMode::Tombstone
        } else {
            RemovalMode::Delete
        },
        model,
        force: args.force,
        threshold_tokens: args.threshold,
    };

    let outcome = run_auto_compact(ctx, config, &summarizer, &options).await?;
    match &outcome {
        AutoCompactOutcome::NoSession => println!("no session found"),
        AutoCompactOutcome::LockTimeout => eprintln!("evs: transcript is locked by another process"),
        AutoCompactOutcome::BusyTimeout => eprintln!("evs: transcript never became stable"),
        AutoCompactOutcome::NotTriggered { tokens, threshold } => {
            println!("not triggered: {tokens} tokens (threshold {threshold})");
        }
        AutoCompactOutcome::PendingReady { session_id, tokens } => {
            println!("pending compact ready for {session_id} ({tokens} tokens)");
        }
        AutoCompactOutcome::Success {
            session_id,
            tokens_before,
            tokens_after,
            backup,
        } => {
            println!(
                "compacted {session_id}: {tokens_before} -> {tokens_after} tokens (backup {})",
                backup.display()
            );
        }
        AutoCompactOutcome::AbortedGuard => {
            eprintln!("evs: transcript changed during planning; aborted");
        }
        AutoCompactOutcome::AbortedValidation { detail } => {
            eprintln!("evs: rewrite failed validation: {detail}");
        }
        AutoCompactOutcome::Failed { detail } => eprintln!("evs: compaction failed: {detail}"),
    }
    Ok(outcome.exit_code())
}

pub struct ApplyArgs {
    pub path: Option<PathBuf>,
    pub session: String,
    pub agent: Option<String>,
}

pub async fn run_apply(ctx: &Context, config: &EvsConfig, args: ApplyArgs) -> Result<i32> {
    let agent = match super::parse_agent(args.agent.as_deref()) {
        Ok(agent) => agent,
        Err(msg) => {
            eprintln!("evs: {msg}");
            return Ok(2);
        }
    };
    let query = Query {
        session_id: Some(args.session.clone()),
        ..Query::default()
    };
    let Some(resolved) = discover::resolve_session(ctx, agent, args.path.as_deref(), &query)?
    else {
        eprintln!("evs: no transcript found for session {}", args.session);
        return Ok(2);
    };

    let outcome = apply_pending(
        ctx,
        config,
        &ApplyOptions {
            agent: resolved.agent,
            transcript: resolved.transcript,
            session_id: args.session,
            removal_mode: RemovalMode::Delete,
        },
    )
    .await?;
    match &outcome {
        ApplyOutcome::NoPending => println!("no pending compact"),
        ApplyOutcome::NotReady(status) => println!("pending is {status}, not ready"),
        ApplyOutcome::InvalidPending => eprintln!("evs: pending record is invalid; marked stale"),
        ApplyOutcome::SelectionMismatch => {
            eprintln!("evs: transcript moved under the pending; marked stale");
        }
        ApplyOutcome::AbortedValidation => {
            eprintln!("evs: apply would corrupt the transcript; marked stale");
        }
        ApplyOutcome::Applied {
            tokens_before,
            tokens_after,
        } => println!("applied: {tokens_before} -> {tokens_after} tokens"),
    }
    Ok(outcome.exit_code())
}

fn current_dir_string() -> Option<String> {
    std::env::current_dir()
        .ok()
        .map(|p| p.display().to_string())
}
