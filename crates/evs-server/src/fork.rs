// crates/evs-server/src/fork.rs
// Fork a transcript: a sibling file under a freshly generated UUID, with
// every embedded session id rewritten to the new one. The source file is
// never touched.

use crate::error::{EvsError, Result};
use crate::fsio::atomic_write;
use crate::jsonl::{self, Record};
use crate::transcript::{self, codex};
use evs_types::Agent;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ForkResult {
    pub new_id: String,
    pub new_path: PathBuf,
}

pub fn fork_session(source: &Path, agent: Option<Agent>) -> Result<ForkResult> {
    let records = jsonl::parse_file(source)?;
    let agent = agent
        .or_else(|| transcript::detect_agent(&records))
        .ok_or_else(|| {
            EvsError::InvalidInput(format!(
                "cannot detect agent for {}",
                source.display()
            ))
        })?;
    let new_id = uuid::Uuid::new_v4().to_string();

    let (records, old_id) = match agent {
        Agent::Claude => rewrite_claude_ids(records, &new_id),
        Agent::Codex => rewrite_codex_ids(records, &new_id),
    };

    let new_path = fork_path(source, agent, old_id.as_deref(), &new_id);
    if new_path.exists() {
        return Err(EvsError::InvalidInput(format!(
            "fork target already exists: {}",
            new_path.display()
        )));
    }
    atomic_write(&new_path, jsonl::stringify(&records).as_bytes())?;
    Ok(ForkResult { new_id, new_path })
}

/// Chat transcripts: every top-level `sessionId` becomes the new id.
fn rewrite_claude_ids(mut records: Vec<Record>, new_id: &str) -> (Vec<Record>, Option<String>) {
    let mut old_id = None;
    for record in &mut records {
        if let Some(obj) = record.value_mut().and_then(|v| v.as_object_mut()) {
            if let Some(Value::String(existing)) = obj.get("sessionId") {
                if old_id.is_none() {
                    old_id = Some(existing.clone());
                }
                obj.insert("sessionId".to_string(), Value::String(new_id.to_string()));
            }
        }
    }
    (records, old_id)
}

/// Rollout transcripts: every `session_meta.payload.id` becomes the new id.
fn rewrite_codex_ids(mut records: Vec<Record>, new_id: &str) -> (Vec<Record>, Option<String>) {
    let mut old_id = None;
    for record in &mut records {
        let Some(value) = record.value_mut() else {
            continue;
        };
        let is_meta = value.get("type").and_then(|t| t.as_str()) == Some("session_meta");
        if !is_meta {
            continue;
        }
        if let Some(payload) = codex::payload_mut(value).and_then(|p| p.as_object_mut()) {
            if let Some(Value::String(existing)) = payload.get("id") {
                if old_id.is_none() {
                    old_id = Some(existing.clone());
                }
                payload.insert("id".to_string(), Value::String(new_id.to_string()));
            }
        }
    }
    (records, old_id)
}

/// Sibling path for the fork. Chat files are named by their session id;
/// rollout files keep their prefix when the name ends in `-<old-id>`,
/// otherwise get a `rollout-fork-<new>` name.
fn fork_path(source: &Path, agent: Agent, old_id: Option<&str>, new_id: &str) -> PathBuf {
    let dir = source.parent().unwrap_or_else(|| Path::new("."));
    match agent {
        Agent::Claude => dir.join(format!("{new_id}.jsonl")),
        Agent::Codex => {
            let stem = source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Some(old_id) = old_id {
                if let Some(prefix) = stem.strip_suffix(&format!("-{old_id}")) {
                    return dir.join(format!("{prefix}-{new_id}.jsonl"));
                }
            }
            dir.join(format!("rollout-fork-{new_id}.jsonl"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::claude::fixtures as cf;
    use crate::transcript::codex::fixtures as xf;
    use tempfile::TempDir;

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_fork_claude_rewrites_every_session_id() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("sess-1.jsonl");
        let body = format!(
            "{}\n{}\n",
            cf::user("u1", "", "2026-01-01T00:00:00Z", "hello"),
            cf::assistant("a1", "u1", "2026-01-01T00:00:01Z", r#"[{"type":"text","text":"hi"}]"#),
        );
        std::fs::write(&source, &body).unwrap();

        let fork = fork_session(&source, Some(Agent::Claude)).unwrap();
        assert_eq!(file_count(dir.path()), 2);
        // Source untouched.
        assert_eq!(std::fs::read_to_string(&source).unwrap(), body);

        let forked = std::fs::read_to_string(&fork.new_path).unwrap();
        assert!(!forked.contains("sess-1"));
        assert_eq!(forked.matches(&fork.new_id).count(), 2);
        assert!(
            fork.new_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(&fork.new_id)
        );
    }

    #[test]
    fn test_fork_codex_replaces_filename_suffix() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("rollout-2026-01-01-t-999.jsonl");
        let body = format!(
            "{}\n{}\n",
            xf::session_meta("2026-01-01T00:00:00Z", "t-999", "/w"),
            xf::message("2026-01-01T00:00:01Z", "user", "hello"),
        );
        std::fs::write(&source, &body).unwrap();

        let fork = fork_session(&source, Some(Agent::Codex)).unwrap();
        let name = fork.new_path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("rollout-2026-01-01-{}.jsonl", fork.new_id));
        let forked = std::fs::read_to_string(&fork.new_path).unwrap();
        assert!(!forked.contains("t-999"));
        assert!(forked.contains(&fork.new_id));
    }

    #[test]
    fn test_fork_codex_without_suffix_uses_fork_name() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("mysession.jsonl");
        std::fs::write(
            &source,
            format!("{}\n", xf::session_meta("2026-01-01T00:00:00Z", "t-1", "/w")),
        )
        .unwrap();
        let fork = fork_session(&source, Some(Agent::Codex)).unwrap();
        let name = fork.new_path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("rollout-fork-{}.jsonl", fork.new_id));
    }

    #[test]
    fn test_fork_detects_agent() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("auto.jsonl");
        std::fs::write(
            &source,
            format!("{}\n", cf::user("u1", "", "2026-01-01T00:00:00Z", "hi")),
        )
        .unwrap();
        let fork = fork_session(&source, None).unwrap();
        assert!(fork.new_path.exists());
    }
}
