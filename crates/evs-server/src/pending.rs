// crates/evs-server/src/pending.rs
// Durable pending-compact store: at most one per session, living at
// <session-dir>/pending-compact.json. Writers hold the session lock.

use crate::context::Context;
use crate::error::{EvsError, IoResultExt, Result};
use crate::fsio::atomic_write;
use crate::paths;
use evs_types::{PENDING_SCHEMA_VERSION, PendingCompact, PendingStatus};
use tracing::debug;

/// Load the pending record, if any. Rejects unknown schema versions.
pub fn load(ctx: &Context, session_id: &str) -> Result<Option<PendingCompact>> {
    let path = paths::pending_path(ctx, session_id);
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EvsError::io(&path, e)),
    };
    let pending: PendingCompact = serde_json::from_str(&data)
        .map_err(|e| EvsError::InvalidPending(format!("unparseable pending record: {e}")))?;
    if pending.schema_version != PENDING_SCHEMA_VERSION {
        return Err(EvsError::InvalidPending(format!(
            "unsupported schema_version {}",
            pending.schema_version
        )));
    }
    Ok(Some(pending))
}

/// Persist the record atomically, creating the session directory on first
/// use.
pub fn save(ctx: &Context, pending: &PendingCompact) -> Result<()> {
    let dir = paths::session_dir(ctx, &pending.session_id);
    std::fs::create_dir_all(&dir).at(&dir)?;
    let path = paths::pending_path(ctx, &pending.session_id);
    let body = serde_json::to_string_pretty(pending)?;
    atomic_write(&path, body.as_bytes())?;
    debug!(session = %pending.session_id, status = %pending.status, "Saved pending compact");
    Ok(())
}

/// Consume (delete) the pending record. Missing is fine.
pub fn delete(ctx: &Context, session_id: &str) -> Result<()> {
    let path = paths::pending_path(ctx, session_id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EvsError::io(&path, e)),
    }
}

/// Transition the pending to `stale` with a reason. Terminal: a stale
/// pending is never applied, only inspected and eventually replaced.
pub fn mark_stale(ctx: &Context, session_id: &str, reason: &str) -> Result<()> {
    let Some(mut pending) = load(ctx, session_id)? else {
        return Ok(());
    };
    pending.status = PendingStatus::Stale;
    pending.error = Some(reason.to_string());
    pending.failed_at = Some(ctx.now_iso());
    save(ctx, &pending)
}

/// Transition the pending to `failed` with a reason.
pub fn mark_failed(ctx: &Context, session_id: &str, reason: &str) -> Result<()> {
    let Some(mut pending) = load(ctx, session_id)? else {
        return Ok(());
    };
    pending.status = PendingStatus::Failed;
    pending.error = Some(reason.to_string());
    pending.failed_at = Some(ctx.now_iso());
    save(ctx, &pending)
}
