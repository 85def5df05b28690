// crates/evs-server/src/cli/inspect.rs
// Read-mostly subcommands: check, fix, sessions, status, fork.

use anyhow::Result;
use evs::config::EvsConfig;
use evs::context::Context;
use evs::discover::{self, Query};
use evs::error::IoResultExt;
use evs::fix::{FixOptions, RemovalMode, fix_claude, fix_codex};
use evs::fsio;
use evs::jsonl;
use evs::pending;
use evs::store;
use evs::transcript::{self, claude, codex};
use evs::validate::{Issue, error_count, validate_claude, validate_codex};
use evs_types::Agent;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn detect_or_flag(path: &Path, agent: Option<Agent>) -> Result<Option<Agent>> {
    if agent.is_some() {
        return Ok(agent);
    }
    let records = jsonl::parse_file(path)?;
    Ok(transcript::detect_agent(&records))
}

fn print_issues(issues: &[Issue]) {
    for issue in issues {
        println!(
            "{} {} {}: {}",
            issue.severity, issue.location, issue.code, issue.detail
        );
    }
}

pub fn run_check(path: PathBuf, agent: Option<String>) -> Result<i32> {
    let agent = match super::parse_agent(agent.as_deref()) {
        Ok(agent) => agent,
        Err(msg) => {
            eprintln!("evs: {msg}");
            return Ok(2);
        }
    };
    let Some(agent) = detect_or_flag(&path, agent)? else {
        eprintln!("evs: cannot detect agent for {}", path.display());
        return Ok(2);
    };
    let records = jsonl::parse_file(&path)?;
    let issues = match agent {
        Agent::Claude => validate_claude(&claude::Session::parse(records)),
        Agent::Codex => validate_codex(&codex::Session::parse(records)),
    };
    if issues.is_empty() {
        println!("ok: no issues");
        return Ok(0);
    }
    print_issues(&issues);
    Ok(if error_count(&issues) > 0 { 1 } else { 0 })
}

pub struct FixArgs {
    pub path: PathBuf,
    pub agent: Option<String>,
    pub write: bool,
    pub insert_aborted_outputs: bool,
    pub tombstone: bool,
}

pub async fn run_fix(ctx: &Context, config: &EvsConfig, args: FixArgs) -> Result<i32> {
    let agent = match super::parse_agent(args.agent.as_deref()) {
        Ok(agent) => agent,
        Err(msg) => {
            eprintln!("evs: {msg}");
            return Ok(2);
        }
    };
    let Some(agent) = detect_or_flag(&args.path, agent)? else {
        eprintln!("evs: cannot detect agent for {}", args.path.display());
        return Ok(2);
    };
    let opts = FixOptions {
        removal_mode: if args.tombstone {
            RemovalMode::Tombstone
        } else {
            RemovalMode::Delete
        },
        insert_aborted_outputs: args.insert_aborted_outputs,
    };

    let raw = std::fs::read_to_string(&args.path).at(&args.path)?;
    let mut records = jsonl::parse_str(&raw);
    let mut migrated = false;
    if agent == Agent::Codex && codex::is_legacy(&records) {
        records = codex::migrate_legacy(&records);
        migrated = true;
    }
    let (next, changes) = match agent {
        Agent::Claude => {
            let outcome = fix_claude(&claude::Session::parse(records), &opts);
            (outcome.records, outcome.changes)
        }
        Agent::Codex => {
            let outcome = fix_codex(&codex::Session::parse(records), &opts);
            (outcome.records, outcome.changes)
        }
    };

    if migrated {
        println!("migrated legacy rollout to wrapped format");
    }
    for change in &changes {
        println!("line {}: {}", change.line_number, change.detail);
    }
    if changes.is_empty() && !migrated {
        println!("ok: nothing to fix");
        return Ok(0);
    }
    if !args.write {
        println!("dry run; pass --write to apply");
        return Ok(0);
    }

    // Same safety envelope as the compactor: lock, backup, atomic write.
    let _lock = fsio::acquire_with_wait(
        &args.path,
        Duration::from_millis(config.io.lock_timeout_ms),
    )
    .await?;
    let session_id = discover_session_id(&args.path);
    store::write_backup(ctx, &session_id, raw.as_bytes())?;
    store::prune_backups(ctx, &session_id, config.compact.backup_cap)?;
    fsio::atomic_write(&args.path, jsonl::stringify(&next).as_bytes())?;
    println!("wrote {}", args.path.display());
    Ok(0)
}

fn discover_session_id(path: &Path) -> String {
    discover::session_id_of(path).unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    })
}

pub fn run_sessions(
    ctx: &Context,
    cwd: Option<String>,
    session: Option<String>,
    match_text: Option<String>,
    lookback: u32,
) -> Result<i32> {
    let cwd = cwd.or_else(|| {
        std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string())
    });
    let query = Query {
        cwd,
        session_id: session,
        match_text,
        lookback_days: lookback,
        ..Query::default()
    };
    let discovery = discover::discover(ctx, None, &query)?;
    let Some(principal) = &discovery.principal else {
        println!("no sessions found");
        return Ok(0);
    };
    print_candidate("*", principal);
    for candidate in &discovery.alternatives {
        print_candidate(" ", candidate);
    }
    Ok(0)
}

fn print_candidate(marker: &str, c: &discover::Candidate) {
    println!(
        "{marker} {} {} [{}] score={} method={} confidence={}",
        c.agent,
        c.session_id.as_deref().unwrap_or("?"),
        c.path.display(),
        c.score,
        c.method,
        c.confidence
    );
}

pub fn run_status(ctx: &Context, cwd: Option<String>, session: Option<String>) -> Result<i32> {
    let cwd = cwd.or_else(|| {
        std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string())
    });
    let query = Query {
        cwd,
        session_id: session,
        ..Query::default()
    };
    let Some(resolved) = discover::resolve_session(ctx, None, None, &query)? else {
        println!("evs: no session");
        return Ok(0);
    };

    let records = jsonl::parse_file(&resolved.transcript)?;
    let tokens = match resolved.agent {
        Agent::Claude => {
            evs::compact::claude_chain_tokens(&claude::Session::parse(records))
        }
        Agent::Codex => evs::compact::codex_estimate(&codex::Session::parse(records)),
    };

    let mut parts = vec![format!("{} {}", resolved.agent, resolved.session_id)];
    parts.push(format!("~{}k tokens", tokens / 1000));
    match pending::load(ctx, &resolved.session_id) {
        Ok(Some(record)) => parts.push(format!("pending: {}", record.status)),
        Ok(None) => {}
        Err(_) => parts.push("pending: invalid".to_string()),
    }
    let state = store::load_state(ctx, &resolved.session_id);
    if let Some(last) = state.last_compact {
        parts.push(format!("last compact {} ({})", last.ts, last.model));
    }
    println!("{}", parts.join(" | "));
    Ok(0)
}

pub fn run_fork(ctx: &Context, path: PathBuf, agent: Option<String>) -> Result<i32> {
    let agent = match super::parse_agent(agent.as_deref()) {
        Ok(agent) => agent,
        Err(msg) => {
            eprintln!("evs: {msg}");
            return Ok(2);
        }
    };
    // A non-existent operand is treated as a session id to discover.
    let source = if path.is_file() {
        path
    } else {
        let query = Query {
            session_id: Some(path.display().to_string()),
            ..Query::default()
        };
        match discover::discover(ctx, agent, &query)?.principal {
            Some(candidate) => candidate.path,
            None => {
                eprintln!("evs: no transcript at {} and no session by that id", path.display());
                return Ok(2);
            }
        }
    };
    let fork = evs::fork::fork_session(&source, agent)?;
    println!("forked to {} (id {})", fork.new_path.display(), fork.new_id);
    Ok(0)
}
