// crates/evs-server/src/context.rs
// Process-wide context: paths, environment snapshot, injected clock.
// Populated once at program entry and passed through all APIs.

use chrono::{DateTime, Utc};
use evs_types::{Agent, ReloadMode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Environment variables consumed by EverSession.
pub const ENV_CLAUDE_CONTROL_DIR: &str = "EVS_CLAUDE_CONTROL_DIR";
pub const ENV_CLAUDE_RUN_ID: &str = "EVS_CLAUDE_RUN_ID";
pub const ENV_CLAUDE_RELOAD_MODE: &str = "EVS_CLAUDE_RELOAD_MODE";
pub const ENV_CLAUDE_TRANSCRIPT_PATH: &str = "EVS_CLAUDE_TRANSCRIPT_PATH";
pub const ENV_CODEX_CONTROL_DIR: &str = "EVS_CODEX_CONTROL_DIR";
pub const ENV_CODEX_RUN_ID: &str = "EVS_CODEX_RUN_ID";
pub const ENV_CODEX_RELOAD_MODE: &str = "EVS_CODEX_RELOAD_MODE";
pub const ENV_CODEX_STATE_PATH: &str = "EVS_CODEX_STATE_PATH";
pub const ENV_CODEX_HOME: &str = "CODEX_HOME";

/// Injectable time source. All timestamps flow through this so tests can
/// freeze the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Frozen clock for tests. Every call returns the same instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Immutable snapshot of the process environment, captured once.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }
}

/// Supervisor environment detected from env vars: present when this process
/// was launched under an `evs supervise` run for the given agent.
#[derive(Debug, Clone)]
pub struct SupervisorEnv {
    pub control_dir: PathBuf,
    pub run_id: String,
    pub reload_mode: ReloadMode,
}

/// Process-wide context threaded through every API.
#[derive(Clone)]
pub struct Context {
    /// Root for EverSession state (`~/.evs`).
    pub global_root: PathBuf,
    /// Root for Agent A state (`~/.claude`).
    pub claude_home: PathBuf,
    /// Root for Agent B sessions (`$CODEX_HOME` or `~/.codex`).
    pub codex_home: PathBuf,
    /// Override for the byCwd -> thread_id cache file.
    pub codex_state_path: Option<PathBuf>,
    /// Fallback transcript hint for non-supervised Agent A invocations.
    pub claude_transcript_hint: Option<PathBuf>,
    env: EnvSnapshot,
    clock: Arc<dyn Clock>,
}

impl Context {
    /// Build the context from the real environment. Called once in `main`.
    pub fn from_env() -> Self {
        Self::with_env(EnvSnapshot::capture(), Arc::new(SystemClock))
    }

    /// Build a context over an explicit environment snapshot and clock.
    pub fn with_env(env: EnvSnapshot, clock: Arc<dyn Clock>) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let global_root = home.join(".evs");
        let claude_home = home.join(".claude");
        let codex_home = env
            .get(ENV_CODEX_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".codex"));
        let codex_state_path = env.get(ENV_CODEX_STATE_PATH).map(PathBuf::from);
        let claude_transcript_hint = env.get(ENV_CLAUDE_TRANSCRIPT_PATH).map(PathBuf::from);
        Self {
            global_root,
            claude_home,
            codex_home,
            codex_state_path,
            claude_transcript_hint,
            env,
            clock,
        }
    }

    /// Context rooted at an arbitrary directory, for tests.
    pub fn for_test(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let root = root.into();
        Self {
            global_root: root.join(".evs"),
            claude_home: root.join(".claude"),
            codex_home: root.join(".codex"),
            codex_state_path: None,
            claude_transcript_hint: None,
            env: EnvSnapshot::default(),
            clock,
        }
    }

    /// Replace the environment snapshot (test setups).
    pub fn with_env_snapshot(mut self, env: EnvSnapshot) -> Self {
        self.env = env;
        self
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// ISO-8601 UTC with millisecond precision, e.g. `2026-01-01T12:00:00.000Z`.
    pub fn now_iso(&self) -> String {
        self.now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// Timestamp component for backup file names: `YYYYMMDD-HHMMSS-mmm`.
    pub fn now_backup_stamp(&self) -> String {
        self.now().format("%Y%m%d-%H%M%S-%3f").to_string()
    }

    /// Detect a supervisor environment for the given agent.
    pub fn supervisor_env(&self, agent: Agent) -> Option<SupervisorEnv> {
        let (dir_var, run_var, mode_var) = match agent {
            Agent::Claude => (
                ENV_CLAUDE_CONTROL_DIR,
                ENV_CLAUDE_RUN_ID,
                ENV_CLAUDE_RELOAD_MODE,
            ),
            Agent::Codex => (
                ENV_CODEX_CONTROL_DIR,
                ENV_CODEX_RUN_ID,
                ENV_CODEX_RELOAD_MODE,
            ),
        };
        let control_dir = self.env.get(dir_var)?;
        let run_id = self.env.get(run_var)?;
        if control_dir.is_empty() || run_id.is_empty() {
            return None;
        }
        let reload_mode = self
            .env
            .get(mode_var)
            .and_then(ReloadMode::from_str)
            .unwrap_or_default();
        Some(SupervisorEnv {
            control_dir: PathBuf::from(control_dir),
            run_id: run_id.to_string(),
            reload_mode,
        })
    }

    /// Supervisor environment for whichever agent has one, if any.
    pub fn any_supervisor_env(&self) -> Option<(Agent, SupervisorEnv)> {
        for agent in [Agent::Claude, Agent::Codex] {
            if let Some(env) = self.supervisor_env(agent) {
                return Some((agent, env));
            }
        }
        None
    }
}
