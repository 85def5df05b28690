// crates/evs-server/src/fsio/lock.rs
// Cross-process advisory lock on a transcript: OS lock on a sibling lock
// file plus PID-liveness staleness detection.

use crate::error::{EvsError, IoResultExt, Result};
use crate::paths::lock_path;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Lock files older than this are stale even if their PID is alive,
/// guarding against PID reuse.
const STALE_CEILING: Duration = Duration::from_secs(600);

/// Poll interval for `acquire_with_wait`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Holds the exclusive lock on a transcript. Dropping releases the OS lock
/// and unlinks the lock file.
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "Failed to unlink lock file: {e}");
        }
        // Dropping the handle releases the OS lock.
        self.file.take();
    }
}

/// Try to acquire the lock once. `Ok(None)` means another live holder has it.
pub fn acquire(transcript: &Path) -> Result<Option<LockGuard>> {
    let path = lock_path(transcript);
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .at(&path)?;

    if file.try_lock_exclusive().is_err() {
        // Held by a live process: the OS lock dies with its holder, so a
        // busy lock can only be stale through PID reuse plus an old file.
        if lock_is_stale(&path, &file) {
            warn!(path = %path.display(), "Removing stale transcript lock");
            let _ = std::fs::remove_file(&path);
            return acquire_fresh(&path);
        }
        return Ok(None);
    }

    write_holder(&mut file, &path)?;
    Ok(Some(LockGuard {
        file: Some(file),
        path,
    }))
}

fn acquire_fresh(path: &Path) -> Result<Option<LockGuard>> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .at(path)?;
    if file.try_lock_exclusive().is_err() {
        return Ok(None);
    }
    write_holder(&mut file, path)?;
    Ok(Some(LockGuard {
        file: Some(file),
        path: path.to_path_buf(),
    }))
}

/// Acquire with a deadline, polling at short intervals.
pub async fn acquire_with_wait(transcript: &Path, timeout: Duration) -> Result<LockGuard> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(guard) = acquire(transcript)? {
            return Ok(guard);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EvsError::LockTimeout {
                path: lock_path(transcript).display().to_string(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Record `{pid} {now_ms}` as the holder.
fn write_holder(file: &mut File, path: &Path) -> Result<()> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    file.set_len(0).at(path)?;
    file.seek(SeekFrom::Start(0)).at(path)?;
    writeln!(file, "{} {}", std::process::id(), now_ms).at(path)?;
    file.flush().at(path)?;
    Ok(())
}

/// A busy lock is stale when its recorded PID no longer exists, or the file
/// has outlived the ceiling.
fn lock_is_stale(path: &Path, file: &File) -> bool {
    let mut contents = String::new();
    let mut reader = file;
    if reader.read_to_string(&mut contents).is_err() {
        return false;
    }
    let pid = contents
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u32>().ok());
    match pid {
        Some(pid) if pid_alive(pid) => {
            let age = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok());
            matches!(age, Some(age) if age > STALE_CEILING)
        }
        Some(_) => true,
        None => true,
    }
}

/// Signal 0 probes for existence without delivering anything.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
