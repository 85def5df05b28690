// crates/evs-server/src/hooks.rs
// Agent-side hook ingestion. The parse functions are pure and total:
// unrecognized payloads yield None, never an error. The entrypoints
// swallow everything — a failing hook would destabilize the agent.

use crate::compact::{AutoCompactOptions, run_auto_compact};
use crate::config::EvsConfig;
use crate::context::Context;
use crate::error::Result;
use crate::summarize::Summarizer;
use crate::supervise::control;
use serde_json::Value;
use std::io::Read;
use tracing::{debug, warn};

/// Fields of a session-start / turn hook payload we care about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookInput {
    pub session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub hook_event_name: Option<String>,
}

/// Parse a hook stdin payload. `None` for anything unrecognizable.
pub fn parse_hook_input(value: &Value) -> Option<HookInput> {
    let obj = value.as_object()?;
    let get = |snake: &str, camel: &str| {
        obj.get(snake)
            .or_else(|| obj.get(camel))
            .and_then(|v| v.as_str())
            .map(String::from)
    };
    let input = HookInput {
        session_id: get("session_id", "sessionId"),
        transcript_path: get("transcript_path", "transcriptPath"),
        cwd: get("cwd", "cwd"),
        hook_event_name: get("hook_event_name", "hookEventName"),
    };
    if input.session_id.is_none() && input.transcript_path.is_none() {
        return None;
    }
    Some(input)
}

/// A notify event reported by the rollout agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    pub event_type: String,
    pub thread_id: String,
    pub cwd: Option<String>,
    pub turn_id: Option<String>,
}

/// Parse a notify payload. `None` for anything unrecognizable.
pub fn parse_notify_event(value: &Value) -> Option<NotifyEvent> {
    let obj = value.as_object()?;
    let event_type = obj.get("type")?.as_str()?.to_string();
    let thread_id = obj
        .get("thread-id")
        .or_else(|| obj.get("thread_id"))
        .and_then(|v| v.as_str())?
        .to_string();
    Some(NotifyEvent {
        event_type,
        thread_id,
        cwd: obj.get("cwd").and_then(|v| v.as_str()).map(String::from),
        turn_id: obj
            .get("turn-id")
            .or_else(|| obj.get("turn_id"))
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

/// Read hook input from stdin (the agent passes JSON, capped at 1 MiB).
pub fn read_hook_input() -> Result<Value> {
    let mut input = String::new();
    std::io::stdin()
        .take(1_048_576)
        .read_to_string(&mut input)
        .map_err(|e| crate::error::EvsError::io("<stdin>", e))?;
    Ok(serde_json::from_str(&input)?)
}

/// Write hook output to stdout. Hooks always emit a JSON object.
pub fn write_hook_output(output: &Value) {
    use std::io::Write;
    match serde_json::to_string(output) {
        Ok(s) => {
            let _ = writeln!(std::io::stdout(), "{}", s);
        }
        Err(e) => {
            eprintln!("[evs] Failed to serialize hook output: {}", e);
            let _ = writeln!(std::io::stdout(), "{{}}");
        }
    }
}

/// Session-start hook: refresh the supervisor handshake from the payload.
/// Swallows every failure.
pub async fn run_session_start(ctx: &Context, input: &Value) -> Result<()> {
    let Some(hook) = parse_hook_input(input) else {
        debug!("Unrecognized session-start payload");
        return Ok(());
    };
    let Some((agent, sup)) = ctx.any_supervisor_env() else {
        debug!("Not supervised; session-start is a no-op");
        return Ok(());
    };
    let ts = ctx.now_iso();
    let handshake = match agent {
        evs_types::Agent::Claude => {
            let (Some(session_id), Some(transcript_path)) =
                (hook.session_id.clone(), hook.transcript_path.clone())
            else {
                return Ok(());
            };
            evs_types::Handshake::Claude(evs_types::ClaudeHandshake {
                run_id: sup.run_id.clone(),
                session_id,
                transcript_path,
                ts,
            })
        }
        evs_types::Agent::Codex => {
            let Some(thread_id) = hook.session_id.clone() else {
                return Ok(());
            };
            evs_types::Handshake::Codex(evs_types::CodexHandshake {
                run_id: sup.run_id.clone(),
                thread_id,
                cwd: hook.cwd.clone().unwrap_or_default(),
                ts,
                turn_id: None,
            })
        }
    };
    if let Err(e) = control::write_handshake(&sup.control_dir, &handshake) {
        warn!("Failed to write handshake: {e}");
    }
    Ok(())
}

/// Turn-complete notify: refresh the handshake, then kick auto-compact.
/// Swallows every failure.
pub async fn run_notify(
    ctx: &Context,
    config: &EvsConfig,
    summarizer: &dyn Summarizer,
    input: &Value,
    options: &AutoCompactOptions,
) -> Result<()> {
    let mut options = options.clone();
    if let Some(event) = parse_notify_event(input) {
        if event.event_type != "agent-turn-complete" {
            debug!(event = %event.event_type, "Ignoring notify event");
            return Ok(());
        }
        options.agent = Some(evs_types::Agent::Codex);
        options.session_id = Some(event.thread_id.clone());
        options.cwd = event.cwd.clone().or(options.cwd);
        if let Some(sup) = ctx.supervisor_env(evs_types::Agent::Codex) {
            let handshake = evs_types::Handshake::Codex(evs_types::CodexHandshake {
                run_id: sup.run_id.clone(),
                thread_id: event.thread_id.clone(),
                cwd: event.cwd.clone().unwrap_or_default(),
                ts: ctx.now_iso(),
                turn_id: event.turn_id.clone(),
            });
            if let Err(e) = control::write_handshake(&sup.control_dir, &handshake) {
                warn!("Failed to write handshake: {e}");
            }
        }
    } else if let Some(hook) = parse_hook_input(input) {
        options.agent = Some(evs_types::Agent::Claude);
        options.session_id = hook.session_id.clone();
        if options.transcript.is_none() {
            options.transcript = hook
                .transcript_path
                .as_deref()
                .map(std::path::PathBuf::from);
        }
        options.cwd = hook.cwd.clone().or(options.cwd);
    } else {
        debug!("Unrecognized notify payload");
        return Ok(());
    }

    match run_auto_compact(ctx, config, summarizer, &options).await {
        Ok(outcome) => debug!(?outcome, "Notify-triggered auto-compact"),
        Err(e) => warn!("Notify-triggered auto-compact failed: {e}"),
    }
    Ok(())
}
