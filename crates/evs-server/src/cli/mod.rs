// crates/evs-server/src/cli/mod.rs
// CLI module for evs commands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod compact;
pub mod inspect;
pub mod supervise;

pub use compact::{run_apply, run_compact};
pub use inspect::{run_check, run_fix, run_fork, run_sessions, run_status};
pub use supervise::run_supervise;

#[derive(Parser)]
#[command(name = "evs")]
#[command(about = "EverSession - transcript engine and supervisor for coding agents")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run auto-compaction against the live session
    Compact {
        /// Transcript path (default: discover from cwd/session)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Explicit session id
        #[arg(short, long)]
        session: Option<String>,

        /// Working directory used for discovery (default: current)
        #[arg(long)]
        cwd: Option<String>,

        /// Agent dialect: claude or codex (default: detect)
        #[arg(long)]
        agent: Option<String>,

        /// Amount to remove, e.g. "50%" or "20" (default from config)
        #[arg(short, long)]
        amount: Option<String>,

        /// Interpret the amount as a token budget instead of messages
        #[arg(long)]
        tokens: bool,

        /// Keep the last N messages instead (amount must be a count)
        #[arg(long)]
        keep_last: bool,

        /// Tombstone removed entries instead of deleting them
        #[arg(long)]
        tombstone: bool,

        /// Summarizer tier: haiku, sonnet or opus (default from config)
        #[arg(short, long)]
        model: Option<String>,

        /// Compact even below the token threshold
        #[arg(short, long)]
        force: bool,

        /// Override the trigger threshold in tokens
        #[arg(long)]
        threshold: Option<u64>,
    },

    /// Apply a ready pending compact at a reload boundary
    Apply {
        /// Transcript path (default: discover from session id)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Session id owning the pending record
        #[arg(short, long)]
        session: String,

        /// Agent dialect: claude or codex (default: detect)
        #[arg(long)]
        agent: Option<String>,
    },

    /// Supervise an agent process and broker reload boundaries
    Supervise {
        /// Agent dialect: claude or codex
        #[arg(long)]
        agent: String,

        /// Reload mode: manual, auto or off
        #[arg(long, default_value = "manual")]
        reload: String,

        /// Child command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Agent hook handlers (read JSON on stdin, always exit 0)
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Validate a transcript and print issues
    Check {
        /// Transcript path
        path: PathBuf,

        /// Agent dialect: claude or codex (default: detect)
        #[arg(long)]
        agent: Option<String>,
    },

    /// Repair a transcript (dry-run unless --write)
    Fix {
        /// Transcript path
        path: PathBuf,

        /// Agent dialect: claude or codex (default: detect)
        #[arg(long)]
        agent: Option<String>,

        /// Write the repaired transcript back (with lock and backup)
        #[arg(long)]
        write: bool,

        /// Insert stub outputs for tool calls that never completed
        #[arg(long)]
        insert_aborted_outputs: bool,

        /// Tombstone removed entries instead of deleting them
        #[arg(long)]
        tombstone: bool,
    },

    /// Discover sessions and print the ranked candidates
    Sessions {
        /// Working directory to match (default: current)
        #[arg(long)]
        cwd: Option<String>,

        /// Explicit session id to look up
        #[arg(short, long)]
        session: Option<String>,

        /// Require this text in the transcript tail
        #[arg(long = "match")]
        match_text: Option<String>,

        /// Lookback window in days
        #[arg(long, default_value_t = 14)]
        lookback: u32,
    },

    /// One-line status for the active session
    Status {
        /// Working directory used for discovery (default: current)
        #[arg(long)]
        cwd: Option<String>,

        /// Explicit session id
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Fork a session file under a freshly generated id
    Fork {
        /// Source transcript path, or a session id to discover
        path: PathBuf,

        /// Agent dialect: claude or codex (default: detect)
        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum HookAction {
    /// Session-start hook: refresh the supervisor handshake
    SessionStart,
    /// Turn-complete hook: refresh the handshake and kick auto-compact
    Notify,
}

impl std::fmt::Display for HookAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionStart => write!(f, "session-start"),
            Self::Notify => write!(f, "notify"),
        }
    }
}

/// Parse an agent flag; exits with a caller error on junk.
pub fn parse_agent(raw: Option<&str>) -> Result<Option<evs_types::Agent>, String> {
    match raw {
        None => Ok(None),
        Some(raw) => evs_types::Agent::from_str(raw)
            .map(Some)
            .ok_or_else(|| format!("unknown agent {raw:?} (expected claude or codex)")),
    }
}
