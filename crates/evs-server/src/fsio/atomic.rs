// crates/evs-server/src/fsio/atomic.rs
// Temp-write-and-rename replacement with a pre-write guard check.

use crate::error::{EvsError, IoResultExt, Result};
use crate::fsio::stable::stat_token;
use evs_types::SourceStat;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::io::Write;
use std::path::Path;

/// Write `bytes` to `<path>.tmp-<random>` in the same directory, fsync, then
/// rename over the target. The temp file is unlinked on any failure.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tmp_name.push_str(&format!(".tmp-{suffix}"));
    let tmp = path.with_file_name(tmp_name);

    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp).at(&tmp)?;
        file.write_all(bytes).at(&tmp)?;
        file.sync_all().at(&tmp)?;
        std::fs::rename(&tmp, path).at(path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
        return result;
    }

    // Durability of the rename itself is best-effort.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Abort with `AbortedGuard` when the file no longer matches the token
/// captured at the start of the critical section.
pub fn check_guard(path: &Path, token: &SourceStat) -> Result<()> {
    let current = stat_token(path)?;
    if current != *token {
        return Err(EvsError::AbortedGuard);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "old\n").unwrap();
        atomic_write(&path, b"new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
        // No temp litter left behind.
        let residue: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(residue.is_empty());
    }

    #[test]
    fn test_atomic_write_creates_new_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.jsonl");
        atomic_write(&path, b"{}\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}\n");
    }

    #[test]
    fn test_check_guard_detects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "a\n").unwrap();
        let token = stat_token(&path).unwrap();
        check_guard(&path, &token).unwrap();
        std::fs::write(&path, "a\nb\n").unwrap();
        let res = check_guard(&path, &token);
        assert!(matches!(res, Err(EvsError::AbortedGuard)));
    }
}
