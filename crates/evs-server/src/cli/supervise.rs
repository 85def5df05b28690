// crates/evs-server/src/cli/supervise.rs
// The supervise subcommand: run an agent under EverSession's wing.

use anyhow::Result;
use evs::config::EvsConfig;
use evs::context::Context;
use evs::supervise::{Supervisor, SupervisorOptions};
use evs_types::ReloadMode;

pub async fn run_supervise(
    ctx: &Context,
    config: EvsConfig,
    agent: String,
    reload: String,
    command: Vec<String>,
) -> Result<i32> {
    let Some(agent) = evs_types::Agent::from_str(&agent) else {
        eprintln!("evs: unknown agent {agent:?} (expected claude or codex)");
        return Ok(2);
    };
    let Some(reload_mode) = ReloadMode::from_str(&reload) else {
        eprintln!("evs: unknown reload mode {reload:?} (expected manual, auto or off)");
        return Ok(2);
    };
    if command.is_empty() {
        eprintln!("evs: supervise requires a child command");
        return Ok(2);
    }
    let cwd = std::env::current_dir()?;

    let supervisor = Supervisor::new(
        ctx.clone(),
        config,
        SupervisorOptions {
            agent,
            command,
            cwd,
            reload_mode,
            control_dir: None,
        },
    )?;
    tracing::info!(run_id = supervisor.run_id(), "Supervisor starting");
    let code = supervisor.run().await?;
    Ok(code)
}
