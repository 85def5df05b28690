// crates/evs-server/src/supervise/registry.rs
// Active-runs registry: one JSON file per live supervised run under
// <global-root>/active/.

use crate::context::Context;
use crate::error::{EvsError, IoResultExt, Result};
use crate::fsio::atomic_write;
use crate::paths;
use evs_types::{ActiveRun, Agent};
use tracing::warn;

pub fn register(ctx: &Context, run: &ActiveRun) -> Result<()> {
    let dir = paths::active_runs_dir(ctx);
    std::fs::create_dir_all(&dir).at(&dir)?;
    let path = paths::active_run_path(ctx, run.agent, &run.run_id);
    atomic_write(&path, serde_json::to_string_pretty(run)?.as_bytes())
}

pub fn deregister(ctx: &Context, agent: Agent, run_id: &str) -> Result<()> {
    let path = paths::active_run_path(ctx, agent, run_id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EvsError::io(&path, e)),
    }
}

/// All registered runs. Records whose PID is gone are skipped (and
/// cleaned up best-effort).
pub fn list(ctx: &Context) -> Vec<ActiveRun> {
    let dir = paths::active_runs_dir(ctx);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut runs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == "json") {
            continue;
        }
        let Ok(data) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<ActiveRun>(&data) {
            Ok(run) => {
                if crate::fsio::lock::pid_alive(run.pid) {
                    runs.push(run);
                } else {
                    let _ = std::fs::remove_file(&path);
                }
            }
            Err(e) => warn!(path = %path.display(), "Unreadable active-run record: {e}"),
        }
    }
    runs
}
