// crates/evs-server/src/supervise/control.rs
// The supervisor control surface on disk: handshake.json (atomic replace)
// and control.log (append-only commands), plus the cursor-based reader.

use crate::context::Context;
use crate::error::{EvsError, IoResultExt, Result};
use crate::fsio::atomic_write;
use evs_types::{ControlCmd, ControlCommand, Handshake};
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn handshake_path(control_dir: &Path) -> PathBuf {
    control_dir.join("handshake.json")
}

pub fn control_log_path(control_dir: &Path) -> PathBuf {
    control_dir.join("control.log")
}

/// Latest handshake, if one has been written and parses.
pub fn read_handshake(control_dir: &Path) -> Option<Handshake> {
    let path = handshake_path(control_dir);
    let data = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Atomically replace the handshake (hook side).
pub fn write_handshake(control_dir: &Path, handshake: &Handshake) -> Result<()> {
    std::fs::create_dir_all(control_dir).at(control_dir)?;
    let body = serde_json::to_string(handshake)?;
    atomic_write(&handshake_path(control_dir), body.as_bytes())
}

/// Append a reload command to the control log.
pub fn append_reload(ctx: &Context, control_dir: &Path, reason: &str) -> Result<()> {
    std::fs::create_dir_all(control_dir).at(control_dir)?;
    let path = control_log_path(control_dir);
    let command = ControlCommand {
        ts: ctx.now_iso(),
        cmd: ControlCmd::Reload,
        reason: reason.to_string(),
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .at(&path)?;
    writeln!(file, "{}", serde_json::to_string(&command)?).at(&path)?;
    Ok(())
}

/// Commands appended since `cursor` (a line count). Returns the commands in
/// file order and the new cursor. Unparseable lines advance the cursor and
/// are skipped.
pub fn read_commands_since(
    control_dir: &Path,
    cursor: usize,
) -> Result<(Vec<ControlCommand>, usize)> {
    let path = control_log_path(control_dir);
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), cursor)),
        Err(e) => return Err(EvsError::io(&path, e)),
    };
    let lines: Vec<&str> = data.lines().collect();
    let mut commands = Vec::new();
    for line in lines.iter().skip(cursor) {
        match serde_json::from_str::<ControlCommand>(line) {
            Ok(cmd) => commands.push(cmd),
            Err(e) => tracing::warn!("Skipping unparseable control.log line: {e}"),
        }
    }
    Ok((commands, lines.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, Context, FixedClock};
    use chrono::{TimeZone, Utc};
    use evs_types::ClaudeHandshake;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> Context {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        Context::for_test(dir.path(), clock)
    }

    #[test]
    fn test_handshake_roundtrip() {
        let dir = TempDir::new().unwrap();
        assert!(read_handshake(dir.path()).is_none());
        let handshake = Handshake::Claude(ClaudeHandshake {
            run_id: "r1".into(),
            session_id: "s1".into(),
            transcript_path: "/tmp/t.jsonl".into(),
            ts: "2026-01-01T00:00:00Z".into(),
        });
        write_handshake(dir.path(), &handshake).unwrap();
        let read = read_handshake(dir.path()).unwrap();
        assert_eq!(read.run_id(), "r1");
        assert_eq!(read.resume_id(), "s1");
    }

    #[test]
    fn test_commands_processed_in_file_order_with_cursor() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        append_reload(&ctx, dir.path(), "first").unwrap();
        append_reload(&ctx, dir.path(), "second").unwrap();

        let (commands, cursor) = read_commands_since(dir.path(), 0).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].reason, "first");
        assert_eq!(commands[1].reason, "second");
        assert_eq!(cursor, 2);

        // Nothing new.
        let (commands, cursor) = read_commands_since(dir.path(), cursor).unwrap();
        assert!(commands.is_empty());
        assert_eq!(cursor, 2);

        append_reload(&ctx, dir.path(), "third").unwrap();
        let (commands, cursor) = read_commands_since(dir.path(), cursor).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].reason, "third");
        assert_eq!(cursor, 3);
    }

    #[test]
    fn test_unparseable_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        append_reload(&ctx, dir.path(), "ok").unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(control_log_path(dir.path()))
            .map(|mut f| writeln!(f, "not json"))
            .unwrap()
            .unwrap();
        append_reload(&ctx, dir.path(), "after").unwrap();
        let (commands, cursor) = read_commands_since(dir.path(), 0).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(cursor, 3);
    }
}
