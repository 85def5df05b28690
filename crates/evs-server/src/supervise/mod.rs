// crates/evs-server/src/supervise/mod.rs
// Supervisor: owns a child agent process, brokers safe apply boundaries.

pub mod control;
pub mod registry;
pub mod runner;

pub use runner::{Supervisor, SupervisorOptions, Tick};
