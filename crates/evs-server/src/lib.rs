// crates/evs-server/src/lib.rs
// EverSession - transcript engine and supervisor for JSONL coding agents

#![allow(clippy::collapsible_if)]
#![allow(clippy::too_many_arguments)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod compact;
pub mod config;
pub mod context;
pub mod discover;
pub mod error;
pub mod fix;
pub mod fork;
pub mod fsio;
pub mod hooks;
pub mod jsonl;
pub mod paths;
pub mod pending;
pub mod store;
pub mod summarize;
pub mod supervise;
pub mod transcript;
pub mod validate;

pub use error::{EvsError, Result};
pub use evs_types::Agent;
