// crates/evs-types/src/lib.rs

//! Shared data contracts between the EverSession server and its
//! collaborators (hooks, supervisors, dashboards).
//!
//! Everything here is an on-disk or on-wire shape:
//! - **Supervisor surface**: `Handshake`, `ControlCommand`, `ActiveRun`
//! - **Session storage**: `SessionState` (`state.json`)
//! - **Compaction**: `PendingCompact` (`pending-compact.json`) and its
//!   `Selection` fingerprint
//!
//! No native-only dependencies are allowed in this crate.

use serde::{Deserialize, Serialize};
use std::fmt;

// ===================================================
// AGENTS
// ===================================================

/// The two transcript dialects EverSession manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    /// Chat-style transcripts: one entry per turn, `uuid`/`parentUuid` tree.
    Claude,
    /// Rollout-style transcripts: wrapped `{timestamp, type, payload}` lines.
    Codex,
}

impl Agent {
    /// Parse an agent from its lowercase name.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Codex => write!(f, "codex"),
        }
    }
}

/// How the supervisor reacts to a ready pending compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// Wait for an explicit `reload` command on the control log.
    #[default]
    Manual,
    /// Reload as soon as a pending compact becomes ready.
    Auto,
    /// Never reload; pendings sit until applied out of band.
    Off,
}

impl ReloadMode {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

impl fmt::Display for ReloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
            Self::Off => write!(f, "off"),
        }
    }
}

// ===================================================
// SUPERVISOR CONTROL SURFACE
// ===================================================

/// Latest handshake written by the agent-side hook (`handshake.json`,
/// atomic replace). Identifies the live session of the current child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Handshake {
    Claude(ClaudeHandshake),
    Codex(CodexHandshake),
}

impl Handshake {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Claude(h) => &h.run_id,
            Self::Codex(h) => &h.run_id,
        }
    }

    /// The value the supervisor passes as the child's resume argument.
    pub fn resume_id(&self) -> &str {
        match self {
            Self::Claude(h) => &h.session_id,
            Self::Codex(h) => &h.thread_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeHandshake {
    pub run_id: String,
    pub session_id: String,
    pub transcript_path: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexHandshake {
    pub run_id: String,
    pub thread_id: String,
    pub cwd: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

/// One appended line of `control.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub ts: String,
    pub cmd: ControlCmd,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCmd {
    Reload,
}

/// Registry record at `<global-root>/active/<agent>-<run-id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    pub agent: Agent,
    pub run_id: String,
    pub pid: u32,
    pub cwd: String,
    pub started_at: String,
    pub reload_mode: ReloadMode,
    pub control_dir: String,
}

// ===================================================
// SESSION STATE (state.json)
// ===================================================

/// Durable per-session state at `<session-dir>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_reload: Option<PendingReload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compact: Option<LastCompact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectHint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReload {
    pub ts: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCompact {
    pub ts: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub model: String,
}

/// Best-effort pointer back to the project this session belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectHint {
    pub cwd: String,
    pub hash: String,
}

// ===================================================
// PENDING COMPACT (pending-compact.json)
// ===================================================

/// Schema version accepted by pending-compact parsers. Any other value is
/// rejected as `InvalidPending`.
pub const PENDING_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Created; the summarizer has not produced a summary yet.
    Running,
    /// Summary computed; waiting for a reload boundary to apply.
    Ready,
    /// Summarizer or plan failed; kept for diagnosis.
    Failed,
    /// Selection no longer matches the transcript. Terminal.
    Stale,
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountMode {
    Messages,
    Tokens,
}

/// `(mtime_ms, size)` of the transcript at plan time. The apply pipeline
/// compares against the live file before rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStat {
    pub mtime_ms: u64,
    pub size: u64,
}

/// Identity of a planned removal set, revalidated at apply time. The fields
/// survive agent-side appends after the plan was computed; any mutation
/// inside the planned range changes the recomputed fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "agent", rename_all = "lowercase")]
pub enum Selection {
    Claude {
        remove_count: usize,
        /// Uuid of the first removed visible message.
        first_removed_uuid: String,
        /// Uuid of the last removed visible message.
        last_removed_uuid: String,
        /// Uuid of the first kept non-root message.
        anchor_uuid: Option<String>,
    },
    Codex {
        remove_count: usize,
        /// Line number of the first kept response item.
        anchor_line: Option<u64>,
        first_removed_line: Option<u64>,
        last_removed_line: Option<u64>,
    },
}

impl Selection {
    pub fn remove_count(&self) -> usize {
        match self {
            Self::Claude { remove_count, .. } | Self::Codex { remove_count, .. } => *remove_count,
        }
    }
}

/// A computed-but-not-applied compaction plan, durable at
/// `<session-dir>/pending-compact.json`. At most one exists per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCompact {
    pub schema_version: u32,
    pub session_id: String,
    pub status: PendingStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_tokens: Option<u64>,
    pub tokens_at_trigger: u64,
    pub amount_mode: AmountMode,
    pub amount_raw: f64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub selection: Selection,
    pub source: SourceStat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_roundtrip() {
        assert_eq!(Agent::from_str("claude"), Some(Agent::Claude));
        assert_eq!(Agent::from_str("CODEX"), Some(Agent::Codex));
        assert_eq!(Agent::from_str("gemini"), None);
        assert_eq!(Agent::Claude.to_string(), "claude");
        let json = serde_json::to_string(&Agent::Codex).unwrap();
        assert_eq!(json, "\"codex\"");
    }

    #[test]
    fn test_handshake_camel_case() {
        let h = Handshake::Claude(ClaudeHandshake {
            run_id: "r1".into(),
            session_id: "s1".into(),
            transcript_path: "/tmp/t.jsonl".into(),
            ts: "2026-01-01T00:00:00Z".into(),
        });
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("\"runId\":\"r1\""));
        assert!(json.contains("\"transcriptPath\""));
        assert_eq!(h.resume_id(), "s1");
    }

    #[test]
    fn test_handshake_untagged_codex() {
        let json = r#"{"runId":"r2","threadId":"t9","cwd":"/work","ts":"2026-01-01T00:00:00Z"}"#;
        let h: Handshake = serde_json::from_str(json).unwrap();
        match &h {
            Handshake::Codex(c) => {
                assert_eq!(c.thread_id, "t9");
                assert!(c.turn_id.is_none());
            }
            other => panic!("expected codex handshake, got {other:?}"),
        }
        assert_eq!(h.resume_id(), "t9");
    }

    #[test]
    fn test_control_command() {
        let json = r#"{"ts":"2026-01-01T00:00:00Z","cmd":"reload","reason":"pending ready"}"#;
        let cmd: ControlCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.cmd, ControlCmd::Reload);
    }

    #[test]
    fn test_session_state_defaults() {
        let state: SessionState = serde_json::from_str("{}").unwrap();
        assert!(state.pending_reload.is_none());
        assert!(state.last_compact.is_none());
        // Empty optionals are omitted entirely on write.
        assert_eq!(serde_json::to_string(&state).unwrap(), "{}");
    }

    #[test]
    fn test_session_state_camel_case() {
        let state = SessionState {
            pending_reload: Some(PendingReload {
                ts: "2026-01-01T00:00:00Z".into(),
                reason: "compact ready".into(),
            }),
            last_compact: Some(LastCompact {
                ts: "2026-01-01T00:00:00Z".into(),
                tokens_before: 120_000,
                tokens_after: 9_000,
                model: "haiku".into(),
            }),
            project: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"pendingReload\""));
        assert!(json.contains("\"tokensBefore\":120000"));
    }

    #[test]
    fn test_pending_compact_roundtrip() {
        let pending = PendingCompact {
            schema_version: PENDING_SCHEMA_VERSION,
            session_id: "s1".into(),
            status: PendingStatus::Ready,
            created_at: "2026-01-01T00:00:00Z".into(),
            ready_at: Some("2026-01-01T00:00:05Z".into()),
            failed_at: None,
            threshold_tokens: Some(150_000),
            tokens_at_trigger: 162_000,
            amount_mode: AmountMode::Messages,
            amount_raw: 0.5,
            model: "haiku".into(),
            summary: Some("S".into()),
            selection: Selection::Claude {
                remove_count: 2,
                first_removed_uuid: "u2".into(),
                last_removed_uuid: "a2".into(),
                anchor_uuid: Some("u3".into()),
            },
            source: SourceStat {
                mtime_ms: 1_700_000_000_000,
                size: 4096,
            },
            error: None,
        };
        let json = serde_json::to_string(&pending).unwrap();
        assert!(json.contains("\"schema_version\":1"));
        assert!(json.contains("\"status\":\"ready\""));
        assert!(json.contains("\"agent\":\"claude\""));
        let back: PendingCompact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.selection, pending.selection);
        assert_eq!(back.selection.remove_count(), 2);
    }

    #[test]
    fn test_selection_codex_tagging() {
        let sel = Selection::Codex {
            remove_count: 3,
            anchor_line: Some(5),
            first_removed_line: Some(2),
            last_removed_line: Some(4),
        };
        let json = serde_json::to_string(&sel).unwrap();
        assert!(json.contains("\"agent\":\"codex\""));
        assert!(json.contains("\"anchor_line\":5"));
    }
}
