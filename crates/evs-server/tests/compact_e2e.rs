// crates/evs-server/tests/compact_e2e.rs
// End-to-end compaction against real files: the unsupervised rewrite, the
// supervised pending protocol, guard aborts, and the apply pipeline.

use evs::compact::plan::{Amount, CountOrPercent};
use evs::compact::{
    ApplyOptions, ApplyOutcome, AutoCompactOptions, AutoCompactOutcome, apply_pending,
    run_auto_compact,
};
use evs::config::EvsConfig;
use evs::context::{
    Clock, Context, ENV_CLAUDE_CONTROL_DIR, ENV_CLAUDE_RELOAD_MODE, ENV_CLAUDE_RUN_ID,
    EnvSnapshot, FixedClock,
};
use evs::error::Result;
use evs::fix::RemovalMode;
use evs::summarize::{ModelTier, StubSummarizer, Summarizer};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use evs_types::{Agent, PendingStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn ctx(dir: &TempDir) -> Context {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock(
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    ));
    Context::for_test(dir.path(), clock)
}

fn supervised_ctx(dir: &TempDir, control_dir: &Path) -> Context {
    ctx(dir).with_env_snapshot(EnvSnapshot::from_pairs(&[
        (ENV_CLAUDE_CONTROL_DIR, &control_dir.display().to_string()),
        (ENV_CLAUDE_RUN_ID, "run-1"),
        (ENV_CLAUDE_RELOAD_MODE, "manual"),
    ]))
}

fn claude_line(entry_type: &str, uuid: &str, parent: &str, ts: &str, text: &str) -> String {
    let parent = if parent.is_empty() {
        "null".to_string()
    } else {
        format!("\"{parent}\"")
    };
    format!(
        r#"{{"type":"{entry_type}","uuid":"{uuid}","parentUuid":{parent},"sessionId":"sess-e2e","timestamp":"{ts}","message":{{"role":"{entry_type}","content":"{text}"}}}}"#
    )
}

fn write_chain(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("sess-e2e.jsonl");
    let lines = [
        claude_line("user", "u1", "", "2026-01-01T00:00:00Z", "first question about the parser"),
        claude_line("assistant", "a1", "u1", "2026-01-01T00:00:01Z", "the parser answer, at length"),
        claude_line("user", "u2", "a1", "2026-01-01T00:00:02Z", "second question about the fixer"),
        claude_line("assistant", "a2", "u2", "2026-01-01T00:00:03Z", "the fixer answer, at length"),
        claude_line("user", "u3", "a2", "2026-01-01T00:00:04Z", "third question, still open"),
    ];
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

fn options(path: &Path) -> AutoCompactOptions {
    AutoCompactOptions {
        agent: Some(Agent::Claude),
        transcript: Some(path.to_path_buf()),
        session_id: None,
        cwd: None,
        amount: Amount::Messages(CountOrPercent::Percent(0.5)),
        keep_last: false,
        removal_mode: RemovalMode::Delete,
        model: ModelTier::Haiku,
        force: true,
        threshold_tokens: None,
    }
}

fn fast_config() -> EvsConfig {
    let mut config = EvsConfig::default();
    config.io.lock_timeout_ms = 2_000;
    config.io.busy_timeout_ms = 2_000;
    config
}

#[tokio::test]
async fn test_unsupervised_compact_rewrites_file() {
    let dir = TempDir::new().unwrap();
    let ctx = ctx(&dir);
    let path = write_chain(&dir);
    let config = fast_config();
    let stub = StubSummarizer::replying("S");

    let outcome = run_auto_compact(&ctx, &config, &stub, &options(&path))
        .await
        .unwrap();
    let AutoCompactOutcome::Success {
        session_id,
        tokens_before,
        tokens_after,
        backup,
    } = outcome
    else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(session_id, "sess-e2e");
    assert!(tokens_after < tokens_before);
    assert!(backup.exists());

    let rewritten = std::fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains(r#""content":"S""#));
    assert!(!rewritten.contains("second question"));
    assert!(rewritten.contains("third question"));
    // u3 now hangs off the summary root.
    assert!(rewritten.contains(r#""uuid":"u3","parentUuid":"u1""#));

    // Storage side effects.
    let state = evs::store::load_state(&ctx, "sess-e2e");
    assert_eq!(state.last_compact.unwrap().tokens_after, tokens_after);
    let log = evs::store::read_log_tail(&ctx, "sess-e2e", 10);
    assert!(log.iter().any(|e| e.get("event").and_then(|v| v.as_str()) == Some("compact")));
}

#[tokio::test]
async fn test_below_threshold_not_triggered() {
    let dir = TempDir::new().unwrap();
    let ctx = ctx(&dir);
    let path = write_chain(&dir);
    let config = fast_config();
    let stub = StubSummarizer::replying("S");
    let mut opts = options(&path);
    opts.force = false;
    opts.threshold_tokens = Some(1_000_000);

    let before = std::fs::read_to_string(&path).unwrap();
    let outcome = run_auto_compact(&ctx, &config, &stub, &opts).await.unwrap();
    assert!(matches!(outcome, AutoCompactOutcome::NotTriggered { .. }));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[tokio::test]
async fn test_missing_session_reports_no_session() {
    let dir = TempDir::new().unwrap();
    let ctx = ctx(&dir);
    let config = fast_config();
    let stub = StubSummarizer::replying("S");
    let mut opts = options(&dir.path().join("absent.jsonl"));
    opts.cwd = None;
    let outcome = run_auto_compact(&ctx, &config, &stub, &opts).await.unwrap();
    assert!(matches!(outcome, AutoCompactOutcome::NoSession));
}

/// Summarizer that sneaks an agent write into the transcript while the
/// "network call" is in flight.
struct WritingSummarizer {
    path: PathBuf,
}

#[async_trait]
impl Summarizer for WritingSummarizer {
    async fn summarize(&self, _prompt: &str, _tier: ModelTier) -> Result<String> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| evs::error::EvsError::io(&self.path, e))?;
        writeln!(
            file,
            "{}",
            claude_line("user", "u4", "u3", "2026-01-01T00:00:09Z", "typed during summarize")
        )
        .map_err(|e| evs::error::EvsError::io(&self.path, e))?;
        Ok("S".to_string())
    }
}

#[tokio::test]
async fn test_agent_write_during_summarize_aborts_guard() {
    let dir = TempDir::new().unwrap();
    let ctx = ctx(&dir);
    let path = write_chain(&dir);
    let config = fast_config();
    let sneaky = WritingSummarizer { path: path.clone() };

    let outcome = run_auto_compact(&ctx, &config, &sneaky, &options(&path))
        .await
        .unwrap();
    assert!(matches!(outcome, AutoCompactOutcome::AbortedGuard));
    // The rewrite never happened; only the agent's own append landed.
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("second question"));
    assert!(text.contains("typed during summarize"));
    assert!(!text.contains(r#""content":"S""#));
}

#[tokio::test]
async fn test_supervised_compact_persists_pending() {
    let dir = TempDir::new().unwrap();
    let control_dir = dir.path().join("control");
    let ctx = supervised_ctx(&dir, &control_dir);
    let path = write_chain(&dir);
    let config = fast_config();
    let stub = StubSummarizer::replying("S");

    let before = std::fs::read_to_string(&path).unwrap();
    let outcome = run_auto_compact(&ctx, &config, &stub, &options(&path))
        .await
        .unwrap();
    let AutoCompactOutcome::PendingReady { session_id, .. } = outcome else {
        panic!("expected pending-ready, got {outcome:?}");
    };
    assert_eq!(session_id, "sess-e2e");
    // The transcript itself is untouched.
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

    let record = evs::pending::load(&ctx, "sess-e2e").unwrap().unwrap();
    assert_eq!(record.status, PendingStatus::Ready);
    assert_eq!(record.summary.as_deref(), Some("S"));
    assert_eq!(record.selection.remove_count(), 3);

    // Manual reload mode: the flag is set for the supervisor to pick up.
    let state = evs::store::load_state(&ctx, "sess-e2e");
    assert!(state.pending_reload.is_some());
}

#[tokio::test]
async fn test_apply_pending_rewrites_and_consumes() {
    let dir = TempDir::new().unwrap();
    let control_dir = dir.path().join("control");
    let ctx = supervised_ctx(&dir, &control_dir);
    let path = write_chain(&dir);
    let config = fast_config();
    let stub = StubSummarizer::replying("S");

    let outcome = run_auto_compact(&ctx, &config, &stub, &options(&path))
        .await
        .unwrap();
    assert!(matches!(outcome, AutoCompactOutcome::PendingReady { .. }));

    let apply = apply_pending(
        &ctx,
        &config,
        &ApplyOptions {
            agent: Agent::Claude,
            transcript: path.clone(),
            session_id: "sess-e2e".to_string(),
            removal_mode: RemovalMode::Delete,
        },
    )
    .await
    .unwrap();
    assert!(matches!(apply, ApplyOutcome::Applied { .. }), "got {apply:?}");

    let rewritten = std::fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains(r#""content":"S""#));
    assert!(!rewritten.contains("second question"));
    // Pending consumed, reload flag cleared.
    assert!(evs::pending::load(&ctx, "sess-e2e").unwrap().is_none());
    let state = evs::store::load_state(&ctx, "sess-e2e");
    assert!(state.pending_reload.is_none());
    assert!(state.last_compact.is_some());
}

#[tokio::test]
async fn test_appended_turn_stales_pending_on_apply() {
    let dir = TempDir::new().unwrap();
    let control_dir = dir.path().join("control");
    let ctx = supervised_ctx(&dir, &control_dir);
    let path = write_chain(&dir);
    let config = fast_config();
    let stub = StubSummarizer::replying("S");

    let outcome = run_auto_compact(&ctx, &config, &stub, &options(&path))
        .await
        .unwrap();
    assert!(matches!(outcome, AutoCompactOutcome::PendingReady { .. }));

    // The human kept typing: one extra user turn lands before the reload.
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            file,
            "{}",
            claude_line("user", "u4", "u3", "2026-01-01T00:01:00Z", "one more thing")
        )
        .unwrap();
    }
    let before = std::fs::read_to_string(&path).unwrap();

    let apply = apply_pending(
        &ctx,
        &config,
        &ApplyOptions {
            agent: Agent::Claude,
            transcript: path.clone(),
            session_id: "sess-e2e".to_string(),
            removal_mode: RemovalMode::Delete,
        },
    )
    .await
    .unwrap();
    assert_eq!(apply, ApplyOutcome::SelectionMismatch);

    // Transcript bytes unchanged; pending is terminally stale.
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    let record = evs::pending::load(&ctx, "sess-e2e").unwrap().unwrap();
    assert_eq!(record.status, PendingStatus::Stale);
    assert!(record.error.is_some());
}

#[tokio::test]
async fn test_apply_without_pending_is_noop() {
    let dir = TempDir::new().unwrap();
    let ctx = ctx(&dir);
    let path = write_chain(&dir);
    let config = fast_config();
    let apply = apply_pending(
        &ctx,
        &config,
        &ApplyOptions {
            agent: Agent::Claude,
            transcript: path,
            session_id: "sess-e2e".to_string(),
            removal_mode: RemovalMode::Delete,
        },
    )
    .await
    .unwrap();
    assert_eq!(apply, ApplyOutcome::NoPending);
}

#[tokio::test]
async fn test_codex_unsupervised_compact() {
    let dir = TempDir::new().unwrap();
    let ctx = ctx(&dir);
    let path = dir.path().join("rollout-t9.jsonl");
    let mut lines = vec![
        r#"{"timestamp":"2026-01-01T00:00:00Z","type":"session_meta","payload":{"id":"t9","timestamp":"2026-01-01T00:00:00Z","cwd":"/w"}}"#.to_string(),
    ];
    for i in 1..=6 {
        let role = if i % 2 == 1 { "user" } else { "assistant" };
        lines.push(format!(
            r#"{{"timestamp":"2026-01-01T00:00:0{i}Z","type":"response_item","payload":{{"type":"message","role":"{role}","content":[{{"type":"input_text","text":"message number {i}"}}]}}}}"#
        ));
    }
    lines.push(
        r#"{"timestamp":"2026-01-01T00:00:09Z","type":"event_msg","payload":{"type":"token_count","info":{"total_token_usage":{"total_tokens":200000}}}}"#
            .to_string(),
    );
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    let config = fast_config();
    let stub = StubSummarizer::replying("S");
    let opts = AutoCompactOptions {
        agent: Some(Agent::Codex),
        transcript: Some(path.clone()),
        session_id: None,
        cwd: None,
        amount: Amount::Messages(CountOrPercent::Count(3)),
        keep_last: false,
        removal_mode: RemovalMode::Delete,
        model: ModelTier::Haiku,
        force: false,
        threshold_tokens: Some(150_000),
    };
    let outcome = run_auto_compact(&ctx, &config, &stub, &opts).await.unwrap();
    assert!(
        matches!(outcome, AutoCompactOutcome::Success { .. }),
        "got {outcome:?}"
    );

    let rewritten = std::fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains(r#""type":"compacted""#));
    assert!(rewritten.contains(r#""message":"S""#));
    assert!(!rewritten.contains("message number 2"));
    assert!(rewritten.contains("message number 4"));
}
