// crates/evs-server/src/discover/codex.rs
// Rollout-transcript discovery: dated session directories under the codex
// home, plus the byCwd -> thread_id cache with newer-session override.

use super::{Candidate, Method, Query, confidence_for, read_head, read_tail, score_candidate};
use crate::context::Context;
use crate::error::{IoResultExt, Result};
use crate::fsio::atomic_write;
use crate::paths;
use chrono::Duration;
use evs_types::Agent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The byCwd cache file shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(rename = "byCwd", default)]
    by_cwd: HashMap<String, String>,
}

pub fn load_bycwd_cache(ctx: &Context) -> HashMap<String, String> {
    let path = paths::codex_state_path(ctx);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|data| serde_json::from_str::<CacheFile>(&data).ok())
        .map(|c| c.by_cwd)
        .unwrap_or_default()
}

pub fn update_bycwd_cache(ctx: &Context, cwd: &str, thread_id: &str) -> Result<()> {
    let path = paths::codex_state_path(ctx);
    let mut cache = CacheFile {
        by_cwd: load_bycwd_cache(ctx),
    };
    cache
        .by_cwd
        .insert(cwd.to_string(), thread_id.to_string());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    atomic_write(&path, serde_json::to_string_pretty(&cache)?.as_bytes())
}

pub(super) fn scan(ctx: &Context, query: &Query) -> Result<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = dated_files(ctx, query)
        .into_iter()
        .filter_map(|path| candidate_for(&path, query))
        .collect();

    // Newest first by the pinned tie-break: head timestamp, then mtime,
    // then filename suffix.
    candidates.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| b.mtime.cmp(&a.mtime))
            .then_with(|| {
                let name_a = a.path.file_name().map(|n| n.to_os_string());
                let name_b = b.path.file_name().map(|n| n.to_os_string());
                name_b.cmp(&name_a)
            })
    });

    // byCwd cache: when the cached thread still exists but a newer
    // candidate shares the cwd, prefer the newer one and update the cache.
    if let Some(cwd) = query.cwd.as_deref() {
        let cache = load_bycwd_cache(ctx);
        let newest_for_cwd = candidates
            .iter()
            .find(|c| c.cwd.as_deref() == Some(cwd))
            .and_then(|c| c.session_id.clone());
        if let Some(newest) = newest_for_cwd {
            match cache.get(cwd) {
                Some(cached) if cached != &newest => {
                    debug!(cwd, cached, newest, "Newer session supersedes byCwd cache");
                    let _ = update_bycwd_cache(ctx, cwd, &newest);
                }
                None => {
                    let _ = update_bycwd_cache(ctx, cwd, &newest);
                }
                _ => {}
            }
        }
    }

    Ok(candidates)
}

/// Session files under `<codex-home>/sessions/YYYY/MM/DD/` inside the
/// lookback window, newest date first.
fn dated_files(ctx: &Context, query: &Query) -> Vec<PathBuf> {
    let root = paths::codex_sessions_root(ctx);
    let today = ctx.now().date_naive();
    let mut out = Vec::new();
    for days_back in 0..=i64::from(query.lookback_days) {
        let date = today - Duration::days(days_back);
        let dir = root
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                out.push(path);
            }
        }
        if out.len() >= query.max_candidates {
            break;
        }
    }
    out.truncate(query.max_candidates);
    out
}

fn candidate_for(path: &Path, query: &Query) -> Option<Candidate> {
    let info = read_head(path);

    let method = if let Some(wanted) = query.session_id.as_deref() {
        if info.session_id.as_deref() != Some(wanted) {
            return None;
        }
        Method::SessionId
    } else if let Some(needle) = query.match_text.as_deref() {
        if !read_tail(path, query.tail_lines).contains(needle) {
            return None;
        }
        Method::Match
    } else if query.cwd.is_some() {
        Method::CwdHash
    } else {
        Method::Fallback
    };

    let score = score_candidate(Agent::Codex, &info, query.cwd.as_deref());
    let confidence = confidence_for(method, score);
    let session_id = info.session_id.clone().or_else(|| {
        path.file_stem().map(|s| s.to_string_lossy().into_owned())
    });
    Some(Candidate {
        agent: Agent::Codex,
        path: path.to_path_buf(),
        session_id,
        cwd: info.cwd,
        last_activity: info.timestamp,
        mtime: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        score,
        method,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, FixedClock};
    use crate::transcript::codex::fixtures as xf;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> Context {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap(),
        ));
        Context::for_test(dir.path(), clock)
    }

    fn write_rollout(ctx: &Context, date_dir: &str, name: &str, id: &str, cwd: &str, ts: &str) -> PathBuf {
        let dir = paths::codex_sessions_root(ctx).join(date_dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let meta = xf::wrapped(
            ts,
            "session_meta",
            &format!(r#"{{"id":"{id}","timestamp":"{ts}","cwd":"{cwd}"}}"#),
        );
        std::fs::write(&path, format!("{meta}\n")).unwrap();
        path
    }

    #[test]
    fn test_scan_dated_dirs_within_lookback() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        write_rollout(&ctx, "2026/03/15", "rollout-a.jsonl", "t-a", "/w", "2026-03-15T10:00:00Z");
        write_rollout(&ctx, "2026/03/01", "rollout-old.jsonl", "t-old", "/w", "2026-03-01T10:00:00Z");
        // Outside the 14-day window.
        write_rollout(&ctx, "2026/02/01", "rollout-ancient.jsonl", "t-x", "/w", "2026-02-01T10:00:00Z");

        let query = Query {
            cwd: Some("/w".into()),
            ..Query::default()
        };
        let candidates = scan(&ctx, &query).unwrap();
        let ids: Vec<_> = candidates
            .iter()
            .map(|c| c.session_id.clone().unwrap())
            .collect();
        assert!(ids.contains(&"t-a".to_string()));
        assert!(ids.contains(&"t-old".to_string()));
        assert!(!ids.contains(&"t-x".to_string()));
        // Newest head timestamp ranks first.
        assert_eq!(candidates[0].session_id.as_deref(), Some("t-a"));
    }

    #[test]
    fn test_session_id_lookup() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        write_rollout(&ctx, "2026/03/15", "rollout-a.jsonl", "t-a", "/w", "2026-03-15T10:00:00Z");
        write_rollout(&ctx, "2026/03/15", "rollout-b.jsonl", "t-b", "/w", "2026-03-15T11:00:00Z");
        let query = Query {
            session_id: Some("t-a".into()),
            ..Query::default()
        };
        let candidates = scan(&ctx, &query).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].method, Method::SessionId);
    }

    #[test]
    fn test_bycwd_cache_prefers_newer_and_updates() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        write_rollout(&ctx, "2026/03/14", "rollout-old.jsonl", "t-old", "/w", "2026-03-14T10:00:00Z");
        write_rollout(&ctx, "2026/03/15", "rollout-new.jsonl", "t-new", "/w", "2026-03-15T10:00:00Z");
        update_bycwd_cache(&ctx, "/w", "t-old").unwrap();

        let query = Query {
            cwd: Some("/w".into()),
            ..Query::default()
        };
        let candidates = scan(&ctx, &query).unwrap();
        assert_eq!(candidates[0].session_id.as_deref(), Some("t-new"));
        let cache = load_bycwd_cache(&ctx);
        assert_eq!(cache.get("/w").map(String::as_str), Some("t-new"));
    }

    #[test]
    fn test_tiebreak_falls_back_to_filename_suffix() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        // Same head timestamp; mtimes may tie on coarse filesystems, so the
        // filename suffix decides: lexicographically later wins.
        write_rollout(&ctx, "2026/03/15", "rollout-aaa.jsonl", "t-1", "/w", "2026-03-15T10:00:00Z");
        write_rollout(&ctx, "2026/03/15", "rollout-zzz.jsonl", "t-2", "/w", "2026-03-15T10:00:00Z");
        let query = Query {
            cwd: Some("/w".into()),
            ..Query::default()
        };
        let candidates = scan(&ctx, &query).unwrap();
        assert_eq!(candidates.len(), 2);
        // Either mtime or name decided, but the ordering is deterministic:
        // run twice and expect the same principal.
        let again = scan(&ctx, &query).unwrap();
        assert_eq!(
            candidates[0].session_id,
            again[0].session_id
        );
    }
}
