// crates/evs-server/src/fsio/stable.rs
// Wait for a transcript to stop changing under the agent's pen.

use crate::error::{EvsError, IoResultExt, Result};
use evs_types::SourceStat;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

/// Sample cadence for the stability poll.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Current `(mtime_ms, size)` of a file.
pub fn stat_token(path: &Path) -> Result<SourceStat> {
    let meta = std::fs::metadata(path).at(path)?;
    let mtime_ms = meta
        .modified()
        .at(path)?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(SourceStat {
        mtime_ms,
        size: meta.len(),
    })
}

/// Poll `(mtime_ms, size)` every 100 ms; the file is stable once the sample
/// has not changed for `window` (>= 200 ms). Returns the final token, or
/// `BusyTimeout` when `budget` elapses first.
pub async fn wait_stable(path: &Path, window: Duration, budget: Duration) -> Result<SourceStat> {
    let window = window.max(Duration::from_millis(200));
    let deadline = tokio::time::Instant::now() + budget;
    let mut current = stat_token(path)?;
    let mut unchanged_since = tokio::time::Instant::now();

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let sample = stat_token(path)?;
        let now = tokio::time::Instant::now();
        if sample == current {
            if now.duration_since(unchanged_since) >= window {
                return Ok(sample);
            }
        } else {
            current = sample;
            unchanged_since = now;
        }
        if now >= deadline {
            return Err(EvsError::BusyTimeout {
                path: path.display().to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stable_file_returns_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{}\n").unwrap();
        let token = wait_stable(&path, Duration::from_millis(200), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(token.size, 3);
        assert_eq!(token, stat_token(&path).unwrap());
    }

    #[tokio::test]
    async fn test_busy_file_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{}\n").unwrap();
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for _ in 0..20 {
                {
                    use std::io::Write;
                    let mut f = std::fs::OpenOptions::new()
                        .append(true)
                        .open(&writer_path)
                        .unwrap();
                    writeln!(f, "{{}}").unwrap();
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        let res = wait_stable(&path, Duration::from_millis(200), Duration::from_millis(400)).await;
        writer.abort();
        assert!(matches!(res, Err(EvsError::BusyTimeout { .. })));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.jsonl");
        let res = wait_stable(&path, Duration::from_millis(200), Duration::from_millis(300)).await;
        assert!(matches!(res, Err(EvsError::Io { .. })));
    }
}
