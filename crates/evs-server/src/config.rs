// crates/evs-server/src/config.rs
// File-based configuration from <global-root>/config.toml with env overrides.

use crate::context::Context;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Deserialize, Default)]
pub struct EvsConfig {
    #[serde(default)]
    pub compact: CompactConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub io: IoConfig,
}

/// Compaction tuning section
#[derive(Debug, Deserialize, Clone)]
pub struct CompactConfig {
    /// Token estimate at which auto-compact triggers.
    #[serde(default = "CompactConfig::default_threshold_tokens")]
    pub threshold_tokens: u64,
    /// Default removal amount when none is given, e.g. "50%" or "20".
    #[serde(default = "CompactConfig::default_amount")]
    pub amount: String,
    /// Starting summarizer tier.
    #[serde(default = "CompactConfig::default_model")]
    pub model: String,
    /// Backups retained per session (FIFO).
    #[serde(default = "CompactConfig::default_backup_cap")]
    pub backup_cap: usize,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: 150_000,
            amount: "50%".to_string(),
            model: "haiku".to_string(),
            backup_cap: 10,
        }
    }
}

impl CompactConfig {
    fn default_threshold_tokens() -> u64 {
        150_000
    }
    fn default_amount() -> String {
        "50%".to_string()
    }
    fn default_model() -> String {
        "haiku".to_string()
    }
    fn default_backup_cap() -> usize {
        10
    }
}

/// Supervisor loop tuning section
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Control-log / child poll interval.
    #[serde(default = "SupervisorConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a reload waits for a matching handshake.
    #[serde(default = "SupervisorConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Polite-terminate deadline before force-kill.
    #[serde(default = "SupervisorConfig::default_restart_timeout_ms")]
    pub restart_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            handshake_timeout_ms: 10_000,
            restart_timeout_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    fn default_poll_interval_ms() -> u64 {
        200
    }
    fn default_handshake_timeout_ms() -> u64 {
        10_000
    }
    fn default_restart_timeout_ms() -> u64 {
        5_000
    }
}

/// File I/O tuning section
#[derive(Debug, Deserialize, Clone)]
pub struct IoConfig {
    /// Deadline for acquiring the transcript lock.
    #[serde(default = "IoConfig::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Deadline for the transcript to stop changing.
    #[serde(default = "IoConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Two identical samples this far apart declare the file stable.
    #[serde(default = "IoConfig::default_stability_window_ms")]
    pub stability_window_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
            busy_timeout_ms: 10_000,
            stability_window_ms: 200,
        }
    }
}

impl IoConfig {
    fn default_lock_timeout_ms() -> u64 {
        10_000
    }
    fn default_busy_timeout_ms() -> u64 {
        10_000
    }
    fn default_stability_window_ms() -> u64 {
        200
    }
}

impl EvsConfig {
    /// Load config from `<global-root>/config.toml`, falling back to
    /// defaults on a missing or unparseable file.
    pub fn load(ctx: &Context) -> Self {
        let path = Self::config_path(ctx);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        };
        config.apply_env(ctx);
        config
    }

    /// Get the config file path (public for CLI config commands)
    pub fn config_path(ctx: &Context) -> PathBuf {
        ctx.global_root.join("config.toml")
    }

    /// Env overrides, applied after the file layer.
    fn apply_env(&mut self, ctx: &Context) {
        if let Some(v) = parse_u64_env(ctx, "EVS_THRESHOLD_TOKENS") {
            self.compact.threshold_tokens = v;
        }
        if let Some(v) = ctx.env().get("EVS_COMPACT_AMOUNT") {
            self.compact.amount = v.to_string();
        }
        if let Some(v) = ctx.env().get("EVS_COMPACT_MODEL") {
            self.compact.model = v.to_string();
        }
        if let Some(v) = parse_u64_env(ctx, "EVS_LOCK_TIMEOUT_MS") {
            self.io.lock_timeout_ms = v;
        }
        if let Some(v) = parse_u64_env(ctx, "EVS_BUSY_TIMEOUT_MS") {
            self.io.busy_timeout_ms = v;
        }
    }
}

fn parse_u64_env(ctx: &Context, key: &str) -> Option<u64> {
    let raw = ctx.env().get(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring non-numeric {key}={raw:?}");
            None
        }
    }
}
