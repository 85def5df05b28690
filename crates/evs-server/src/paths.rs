// crates/evs-server/src/paths.rs
// On-disk layout: per-session storage, active-runs registry, agent roots.

use crate::context::Context;
use evs_types::Agent;
use std::path::{Path, PathBuf};

/// Sanitize a session/thread id for use as a directory name: ASCII
/// alphanumeric and hyphens only, anything else dropped.
pub fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

/// Per-session storage directory: `<global-root>/sessions/<session-id>/`.
pub fn session_dir(ctx: &Context, session_id: &str) -> PathBuf {
    ctx.global_root
        .join("sessions")
        .join(sanitize_session_id(session_id))
}

pub fn state_path(ctx: &Context, session_id: &str) -> PathBuf {
    session_dir(ctx, session_id).join("state.json")
}

pub fn log_path(ctx: &Context, session_id: &str) -> PathBuf {
    session_dir(ctx, session_id).join("log.jsonl")
}

pub fn pending_path(ctx: &Context, session_id: &str) -> PathBuf {
    session_dir(ctx, session_id).join("pending-compact.json")
}

pub fn backups_dir(ctx: &Context, session_id: &str) -> PathBuf {
    session_dir(ctx, session_id).join("backups")
}

/// Active-runs registry directory: `<global-root>/active/`.
pub fn active_runs_dir(ctx: &Context) -> PathBuf {
    ctx.global_root.join("active")
}

pub fn active_run_path(ctx: &Context, agent: Agent, run_id: &str) -> PathBuf {
    active_runs_dir(ctx).join(format!("{}-{}.json", agent, sanitize_session_id(run_id)))
}

/// Lock file guarding a transcript: `<transcript>.evs.lock`.
pub fn lock_path(transcript: &Path) -> PathBuf {
    let mut name = transcript
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".evs.lock");
    transcript.with_file_name(name)
}

/// Root of Agent A project transcript directories (`~/.claude/projects`).
pub fn claude_projects_root(ctx: &Context) -> PathBuf {
    ctx.claude_home.join("projects")
}

/// Directory name Agent A derives from a cwd: every character outside
/// `[A-Za-z0-9]` becomes `-`, so `/home/ann/webapp` -> `-home-ann-webapp`.
pub fn claude_project_dir_name(cwd: &str) -> String {
    cwd.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Project transcript directory for a cwd.
pub fn claude_project_dir(ctx: &Context, cwd: &str) -> PathBuf {
    claude_projects_root(ctx).join(claude_project_dir_name(cwd))
}

/// Root of Agent B session trees: `<codex-home>/sessions/YYYY/MM/DD/`.
pub fn codex_sessions_root(ctx: &Context) -> PathBuf {
    ctx.codex_home.join("sessions")
}

/// The byCwd -> thread_id cache file for Agent B discovery.
pub fn codex_state_path(ctx: &Context) -> PathBuf {
    ctx.codex_state_path
        .clone()
        .unwrap_or_else(|| ctx.global_root.join("codex-state.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, Context, FixedClock};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn ctx() -> Context {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        Context::for_test("/tmp/evs-root", clock)
    }

    #[test]
    fn test_session_dir_sanitizes_id() {
        let dir = session_dir(&ctx(), "abc/../123-def");
        assert!(dir.ends_with("sessions/abc123-def"));
    }

    #[test]
    fn test_storage_layout() {
        let c = ctx();
        assert!(state_path(&c, "s1").ends_with("sessions/s1/state.json"));
        assert!(log_path(&c, "s1").ends_with("sessions/s1/log.jsonl"));
        assert!(pending_path(&c, "s1").ends_with("sessions/s1/pending-compact.json"));
        assert!(backups_dir(&c, "s1").ends_with("sessions/s1/backups"));
        assert!(active_run_path(&c, Agent::Codex, "r1").ends_with("active/codex-r1.json"));
    }

    #[test]
    fn test_lock_path_is_sibling() {
        let lock = lock_path(Path::new("/tmp/proj/session.jsonl"));
        assert_eq!(lock, PathBuf::from("/tmp/proj/session.jsonl.evs.lock"));
    }

    #[test]
    fn test_claude_project_dir_name() {
        assert_eq!(claude_project_dir_name("/home/ann/webapp"), "-home-ann-webapp");
        assert_eq!(claude_project_dir_name("/a/b.c_d"), "-a-b-c-d");
    }

    #[test]
    fn test_codex_state_path_default_and_override() {
        let mut c = ctx();
        assert!(codex_state_path(&c).ends_with(".evs/codex-state.json"));
        c.codex_state_path = Some(PathBuf::from("/custom/state.json"));
        assert_eq!(codex_state_path(&c), PathBuf::from("/custom/state.json"));
    }
}
