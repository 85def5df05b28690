// crates/evs-server/src/store.rs
// Per-session storage: state.json, the append-only event log, and backups.

use crate::context::Context;
use crate::error::{EvsError, IoResultExt, Result};
use crate::fsio::atomic_write;
use crate::paths;
use evs_types::SessionState;
use serde_json::{Map, Value, json};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// Load `state.json`, defaulting when absent or corrupt. A corrupt state
/// file is logged and replaced at the next save rather than aborting the
/// caller.
pub fn load_state(ctx: &Context, session_id: &str) -> SessionState {
    let path = paths::state_path(ctx, session_id);
    match std::fs::read_to_string(&path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!(path = %path.display(), "Corrupt state.json, using defaults: {e}");
            SessionState::default()
        }),
        Err(_) => SessionState::default(),
    }
}

pub fn save_state(ctx: &Context, session_id: &str, state: &SessionState) -> Result<()> {
    let dir = paths::session_dir(ctx, session_id);
    std::fs::create_dir_all(&dir).at(&dir)?;
    let path = paths::state_path(ctx, session_id);
    let body = serde_json::to_string_pretty(state)?;
    atomic_write(&path, body.as_bytes())
}

/// Append one event to `log.jsonl`: `{ts, event, ...payload}`.
pub fn append_log(ctx: &Context, session_id: &str, event: &str, payload: Value) -> Result<()> {
    let dir = paths::session_dir(ctx, session_id);
    std::fs::create_dir_all(&dir).at(&dir)?;
    let path = paths::log_path(ctx, session_id);

    let mut line = Map::new();
    line.insert("ts".to_string(), json!(ctx.now_iso()));
    line.insert("event".to_string(), json!(event));
    if let Value::Object(extra) = payload {
        for (k, v) in extra {
            line.entry(k).or_insert(v);
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .at(&path)?;
    writeln!(file, "{}", Value::Object(line)).at(&path)?;
    Ok(())
}

/// Last `n` events of the log, oldest first. Tolerates unparseable lines.
pub fn read_log_tail(ctx: &Context, session_id: &str, n: usize) -> Vec<Value> {
    let path = paths::log_path(ctx, session_id);
    let Ok(data) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let events: Vec<Value> = data
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let skip = events.len().saturating_sub(n);
    events.into_iter().skip(skip).collect()
}

/// Copy the current transcript bytes into `backups/<stamp>.jsonl` before an
/// in-place rewrite. Returns the backup path.
pub fn write_backup(ctx: &Context, session_id: &str, contents: &[u8]) -> Result<PathBuf> {
    let dir = paths::backups_dir(ctx, session_id);
    std::fs::create_dir_all(&dir).at(&dir)?;
    let path = dir.join(format!("{}.jsonl", ctx.now_backup_stamp()));
    std::fs::write(&path, contents).at(&path)?;
    Ok(path)
}

/// FIFO-prune backups above `cap`, oldest first (names sort
/// chronologically). Returns how many were removed.
pub fn prune_backups(ctx: &Context, session_id: &str, cap: usize) -> Result<usize> {
    let dir = paths::backups_dir(ctx, session_id);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(EvsError::io(&dir, e)),
    };
    let mut names: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    if names.len() <= cap {
        return Ok(0);
    }
    names.sort();
    let excess = names.len() - cap;
    let mut removed = 0;
    for path in names.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), "Failed to prune backup: {e}"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, FixedClock};
    use chrono::{Duration, TimeZone, Utc};
    use evs_types::{LastCompact, PendingReload};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct TickingClock {
        start: chrono::DateTime<Utc>,
        counter: std::sync::atomic::AtomicI64,
    }

    impl Clock for TickingClock {
        fn now(&self) -> chrono::DateTime<Utc> {
            let n = self
                .counter
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.start + Duration::milliseconds(n)
        }
    }

    fn ctx(dir: &TempDir) -> Context {
        let clock: Arc<dyn Clock> = Arc::new(TickingClock {
            start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            counter: std::sync::atomic::AtomicI64::new(0),
        });
        Context::for_test(dir.path(), clock)
    }

    #[test]
    fn test_state_roundtrip_and_default() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let state = load_state(&ctx, "s1");
        assert!(state.pending_reload.is_none());

        let state = SessionState {
            pending_reload: Some(PendingReload {
                ts: "2026-01-01T00:00:00.000Z".into(),
                reason: "compact ready".into(),
            }),
            last_compact: Some(LastCompact {
                ts: "2026-01-01T00:00:00.000Z".into(),
                tokens_before: 100,
                tokens_after: 10,
                model: "haiku".into(),
            }),
            project: None,
        };
        save_state(&ctx, "s1", &state).unwrap();
        let loaded = load_state(&ctx, "s1");
        assert_eq!(loaded.last_compact.unwrap().tokens_after, 10);
    }

    #[test]
    fn test_corrupt_state_defaults() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let path = paths::state_path(&ctx, "s1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{garbage").unwrap();
        let state = load_state(&ctx, "s1");
        assert!(state.last_compact.is_none());
    }

    #[test]
    fn test_append_log_and_tail() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        for i in 0..5 {
            append_log(&ctx, "s1", "compact", json!({"tokens": i})).unwrap();
        }
        let tail = read_log_tail(&ctx, "s1", 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].get("tokens").and_then(|v| v.as_u64()), Some(3));
        assert_eq!(tail[1].get("event").and_then(|v| v.as_str()), Some("compact"));
        assert!(tail[1].get("ts").is_some());
    }

    #[test]
    fn test_backups_pruned_fifo() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        for i in 0..13u8 {
            write_backup(&ctx, "s1", format!("backup {i}\n").as_bytes()).unwrap();
        }
        let removed = prune_backups(&ctx, "s1", 10).unwrap();
        assert_eq!(removed, 3);
        let mut remaining: Vec<_> = std::fs::read_dir(paths::backups_dir(&ctx, "s1"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), 10);
        // The oldest three are gone; the newest survived.
        let contents =
            std::fs::read_to_string(paths::backups_dir(&ctx, "s1").join(remaining.last().unwrap()))
                .unwrap();
        assert_eq!(contents, "backup 12\n");
    }
}
