// crates/evs-server/src/supervise/runner.rs
// The supervisor loop. Single-threaded state machine: all concurrency is
// child I/O and poll timers. Commands are processed in control.log file
// order; handshakes from earlier run generations are ignored.

use crate::compact::pipeline::{ApplyOptions, apply_pending, last_chance_fix};
use crate::config::EvsConfig;
use crate::context::{
    Context, ENV_CLAUDE_CONTROL_DIR, ENV_CLAUDE_RELOAD_MODE, ENV_CLAUDE_RUN_ID,
    ENV_CODEX_CONTROL_DIR, ENV_CODEX_RELOAD_MODE, ENV_CODEX_RUN_ID,
};
use crate::discover::{self, Query};
use crate::error::{EvsError, Result};
use crate::fix::RemovalMode;
use crate::supervise::{control, registry};
use evs_types::{ActiveRun, Agent, ControlCmd, Handshake, ReloadMode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub agent: Agent,
    /// Child argv: program followed by its arguments.
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub reload_mode: ReloadMode,
    /// Defaults to `<global-root>/control/<agent>-<run-id>`.
    pub control_dir: Option<PathBuf>,
}

/// One poll-loop step's result.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    Running,
    /// The child exited on its own; the supervisor propagates this code.
    Exited(i32),
}

pub struct Supervisor {
    ctx: Context,
    config: EvsConfig,
    options: SupervisorOptions,
    run_id: String,
    control_dir: PathBuf,
    control_cursor: usize,
    pending_reload: bool,
    restarting: bool,
    /// Current child generation; bumped on every spawn. Events observed
    /// for prior generations are ignored.
    active_token: u64,
    child: Option<Child>,
    last_exit: Option<i32>,
}

impl Supervisor {
    pub fn new(ctx: Context, config: EvsConfig, options: SupervisorOptions) -> Result<Self> {
        if options.command.is_empty() {
            return Err(EvsError::InvalidInput(
                "supervise requires a child command".to_string(),
            ));
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let control_dir = options.control_dir.clone().unwrap_or_else(|| {
            ctx.global_root
                .join("control")
                .join(format!("{}-{}", options.agent, run_id))
        });
        Ok(Self {
            ctx,
            config,
            options,
            run_id,
            control_dir,
            control_cursor: 0,
            pending_reload: false,
            restarting: false,
            active_token: 0,
            child: None,
            last_exit: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn control_dir(&self) -> &PathBuf {
        &self.control_dir
    }

    /// Spawn a child generation, optionally with a resume argument.
    pub fn spawn_child(&mut self, resume_id: Option<&str>) -> Result<()> {
        let (dir_var, run_var, mode_var) = match self.options.agent {
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
        std::fs::create_dir_all(&self.control_dir)
            .map_err(|e| EvsError::io(&self.control_dir, e))?;

        let mut command = Command::new(&self.options.command[0]);
        command
            .args(&self.options.command[1..])
            .current_dir(&self.options.cwd)
            .env(dir_var, &self.control_dir)
            .env(run_var, &self.run_id)
            .env(mode_var, self.options.reload_mode.to_string());
        if let Some(resume_id) = resume_id {
            match self.options.agent {
                Agent::Claude => {
                    command.arg("--resume").arg(resume_id);
                }
                Agent::Codex => {
                    command.arg("resume").arg(resume_id);
                }
            }
        }
        let child = command
            .spawn()
            .map_err(|e| EvsError::io(&self.options.command[0], e))?;
        self.active_token += 1;
        info!(
            agent = %self.options.agent,
            run_id = %self.run_id,
            generation = self.active_token,
            pid = child.id().unwrap_or(0),
            resume = resume_id.unwrap_or("-"),
            "Spawned child"
        );
        let _ = registry::register(
            &self.ctx,
            &ActiveRun {
                agent: self.options.agent,
                run_id: self.run_id.clone(),
                pid: child.id().unwrap_or(0),
                cwd: self.options.cwd.display().to_string(),
                started_at: self.ctx.now_iso(),
                reload_mode: self.options.reload_mode,
                control_dir: self.control_dir.display().to_string(),
            },
        );
        self.child = Some(child);
        Ok(())
    }

    /// One step of the loop: drain control commands, then service a
    /// pending reload, then check the child.
    pub async fn tick(&mut self) -> Result<Tick> {
        let (commands, cursor) = control::read_commands_since(&self.control_dir, self.control_cursor)?;
        self.control_cursor = cursor;
        for command in commands {
            match command.cmd {
                ControlCmd::Reload => {
                    debug!(reason = %command.reason, "Reload requested");
                    self.pending_reload = true;
                }
            }
        }

        if self.pending_reload && !self.restarting {
            self.pending_reload = false;
            self.restarting = true;
            let result = self.reload().await;
            self.restarting = false;
            result?;
        }

        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                if !self.restarting {
                    let code = status.code().unwrap_or(1);
                    self.last_exit = Some(code);
                    self.child = None;
                    return Ok(Tick::Exited(code));
                }
            }
        }
        Ok(Tick::Running)
    }

    /// Full reload: handshake gate, stop, apply, repair, respawn.
    async fn reload(&mut self) -> Result<()> {
        let Some(handshake) = self.wait_for_handshake().await else {
            warn!(run_id = %self.run_id, "Reload requested but no matching handshake; skipping");
            return Ok(());
        };

        self.stop_child().await;

        // Apply any pending compact at the now-idle boundary; a failed
        // apply never aborts the restart.
        if let Some((transcript, session_id)) = self.resolve_transcript(&handshake) {
            let apply = apply_pending(
                &self.ctx,
                &self.config,
                &ApplyOptions {
                    agent: self.options.agent,
                    transcript: transcript.clone(),
                    session_id,
                    removal_mode: RemovalMode::Delete,
                },
            )
            .await;
            match apply {
                Ok(outcome) => info!(?outcome, "Apply at reload boundary"),
                Err(e) => warn!("Apply at reload boundary failed: {e}"),
            }
            if last_chance_fix(&transcript, self.options.agent) {
                info!(path = %transcript.display(), "Last-chance fix repaired transcript");
            }
        }

        self.spawn_child(Some(handshake.resume_id()))?;
        Ok(())
    }

    /// Wait up to `handshake_timeout` for a handshake of our own run.
    async fn wait_for_handshake(&self) -> Option<Handshake> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.supervisor.handshake_timeout_ms);
        loop {
            if let Some(handshake) = control::read_handshake(&self.control_dir) {
                if handshake.run_id() == self.run_id {
                    return Some(handshake);
                }
                debug!(
                    got = handshake.run_id(),
                    want = %self.run_id,
                    "Ignoring handshake from another run"
                );
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(
                self.config.supervisor.poll_interval_ms,
            ))
            .await;
        }
    }

    fn resolve_transcript(&self, handshake: &Handshake) -> Option<(PathBuf, String)> {
        match handshake {
            Handshake::Claude(h) => Some((
                PathBuf::from(&h.transcript_path),
                h.session_id.clone(),
            )),
            Handshake::Codex(h) => {
                let query = Query {
                    session_id: Some(h.thread_id.clone()),
                    cwd: Some(h.cwd.clone()),
                    ..Query::default()
                };
                let discovery = discover::discover(&self.ctx, Some(Agent::Codex), &query).ok()?;
                discovery
                    .principal
                    .map(|c| (c.path, h.thread_id.clone()))
            }
        }
    }

    /// Polite-terminate, then force-kill after `restart_timeout`.
    pub async fn stop_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        let deadline = Duration::from_millis(self.config.supervisor.restart_timeout_ms);
        match tokio::time::timeout(deadline, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Child ignored SIGTERM; force-killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }

    /// Run until the child exits on its own or the supervisor is
    /// cancelled. Cancellation stops the child and exits 0.
    pub async fn run(mut self) -> Result<i32> {
        self.spawn_child(None)?;
        let poll = Duration::from_millis(self.config.supervisor.poll_interval_ms);
        let code = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Supervisor cancelled; stopping child");
                    self.stop_child().await;
                    break 0;
                }
                _ = tokio::time::sleep(poll) => {
                    match self.tick().await? {
                        Tick::Running => {}
                        Tick::Exited(code) => break code,
                    }
                }
            }
        };
        let _ = registry::deregister(&self.ctx, self.options.agent, &self.run_id);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, FixedClock};
    use chrono::{TimeZone, Utc};
    use evs_types::ClaudeHandshake;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> Context {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        Context::for_test(dir.path(), clock)
    }

    fn fast_config() -> EvsConfig {
        let mut config = EvsConfig::default();
        config.supervisor.poll_interval_ms = 10;
        config.supervisor.handshake_timeout_ms = 500;
        config.supervisor.restart_timeout_ms = 500;
        config
    }

    fn stub_command(dir: &TempDir) -> Vec<String> {
        // Stub child: append its extra argv to a log, then linger.
        let log = dir.path().join("argv.log");
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo \"ARGS:$*\" >> {}; sleep 30", log.display()),
            "stub".to_string(),
        ]
    }

    fn argv_log(dir: &TempDir) -> String {
        std::fs::read_to_string(dir.path().join("argv.log")).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = Supervisor::new(
            ctx(&dir),
            fast_config(),
            SupervisorOptions {
                agent: Agent::Claude,
                command: stub_command(&dir),
                cwd: dir.path().to_path_buf(),
                reload_mode: ReloadMode::Manual,
                control_dir: None,
            },
        )
        .unwrap();
        supervisor.spawn_child(None).unwrap();
        assert_eq!(supervisor.tick().await.unwrap(), Tick::Running);
        supervisor.stop_child().await;
    }

    #[tokio::test]
    async fn test_reload_waits_for_matching_handshake() {
        let dir = TempDir::new().unwrap();
        let context = ctx(&dir);
        let mut supervisor = Supervisor::new(
            context.clone(),
            fast_config(),
            SupervisorOptions {
                agent: Agent::Claude,
                command: stub_command(&dir),
                cwd: dir.path().to_path_buf(),
                reload_mode: ReloadMode::Manual,
                control_dir: None,
            },
        )
        .unwrap();
        supervisor.spawn_child(None).unwrap();

        // Reload with only a stale-generation handshake present: skipped.
        control::write_handshake(
            supervisor.control_dir(),
            &Handshake::Claude(ClaudeHandshake {
                run_id: "someone-else".into(),
                session_id: "sX".into(),
                transcript_path: "/nonexistent".into(),
                ts: "2026-01-01T00:00:00Z".into(),
            }),
        )
        .unwrap();
        control::append_reload(&context, supervisor.control_dir(), "test").unwrap();
        assert_eq!(supervisor.tick().await.unwrap(), Tick::Running);
        // Only the initial spawn line is present.
        assert_eq!(argv_log(&dir).lines().count(), 1);
        supervisor.stop_child().await;
    }

    #[tokio::test]
    async fn test_supervised_reload_resumes_with_handshake_session() {
        let dir = TempDir::new().unwrap();
        let context = ctx(&dir);
        // Transcript the handshake points at (no pending: apply no-ops).
        let transcript = dir.path().join("session.jsonl");
        std::fs::write(
            &transcript,
            format!(
                "{}\n",
                crate::transcript::claude::fixtures::user("u1", "", "2026-01-01T00:00:00Z", "hi")
            ),
        )
        .unwrap();

        let mut supervisor = Supervisor::new(
            context.clone(),
            fast_config(),
            SupervisorOptions {
                agent: Agent::Claude,
                command: stub_command(&dir),
                cwd: dir.path().to_path_buf(),
                reload_mode: ReloadMode::Manual,
                control_dir: None,
            },
        )
        .unwrap();
        supervisor.spawn_child(None).unwrap();

        control::write_handshake(
            supervisor.control_dir(),
            &Handshake::Claude(ClaudeHandshake {
                run_id: supervisor.run_id().to_string(),
                session_id: "sess-42".into(),
                transcript_path: transcript.display().to_string(),
                ts: "2026-01-01T00:00:00Z".into(),
            }),
        )
        .unwrap();
        control::append_reload(&context, supervisor.control_dir(), "pending ready").unwrap();

        assert_eq!(supervisor.tick().await.unwrap(), Tick::Running);
        // The second spawn carries the resume argument from the handshake.
        // Give the fresh stub a moment to write its argv line.
        let mut log = argv_log(&dir);
        for _ in 0..50 {
            if log.lines().count() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            log = argv_log(&dir);
        }
        assert_eq!(log.lines().count(), 2, "log: {log}");
        assert!(log.lines().nth(1).unwrap().contains("--resume sess-42"));
        supervisor.stop_child().await;
    }

    #[tokio::test]
    async fn test_child_exit_propagates() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = Supervisor::new(
            ctx(&dir),
            fast_config(),
            SupervisorOptions {
                agent: Agent::Claude,
                command: vec!["/bin/sh".into(), "-c".into(), "exit 7".into()],
                cwd: dir.path().to_path_buf(),
                reload_mode: ReloadMode::Manual,
                control_dir: None,
            },
        )
        .unwrap();
        supervisor.spawn_child(None).unwrap();
        // Allow the child to exit, then observe it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.tick().await.unwrap(), Tick::Exited(7));
    }
}
