// crates/evs-server/src/summarize.rs
// Summarizer adapter. Knows nothing about transcripts: callers hand it a
// prompt, it hands back a summary string or a retryable failure. The
// fallback ladder promotes the model tier exactly once per run.

use crate::error::{EvsError, Result};
use crate::transcript::{claude, codex};
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use tracing::{debug, warn};

/// Model tiers, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "haiku" => Some(Self::Haiku),
            "sonnet" => Some(Self::Sonnet),
            "opus" => Some(Self::Opus),
            _ => None,
        }
    }

    /// Next rung of the ladder, if any.
    pub fn promote(&self) -> Option<Self> {
        match self {
            Self::Haiku => Some(Self::Sonnet),
            Self::Sonnet => Some(Self::Opus),
            Self::Opus => None,
        }
    }

    /// Concrete model id sent over the wire.
    pub fn model_id(&self) -> &'static str {
        match self {
            Self::Haiku => "claude-haiku-4-5",
            Self::Sonnet => "claude-sonnet-4-5",
            Self::Opus => "claude-opus-4-1",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Haiku => write!(f, "haiku"),
            Self::Sonnet => write!(f, "sonnet"),
            Self::Opus => write!(f, "opus"),
        }
    }
}

/// Black-box summary producer.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, tier: ModelTier) -> Result<String>;
}

/// Run the ladder: try `tier`, and on failure (including empty output)
/// retry exactly once at the next tier up. Returns the summary and the
/// tier that produced it.
pub async fn summarize_with_fallback(
    summarizer: &dyn Summarizer,
    prompt: &str,
    tier: ModelTier,
) -> Result<(String, ModelTier)> {
    match try_tier(summarizer, prompt, tier).await {
        Ok(summary) => Ok((summary, tier)),
        Err(e) => {
            let Some(next) = tier.promote() else {
                return Err(e);
            };
            warn!(tier = %tier, next = %next, "Summarizer failed, promoting tier: {e}");
            let summary = try_tier(summarizer, prompt, next).await?;
            Ok((summary, next))
        }
    }
}

async fn try_tier(summarizer: &dyn Summarizer, prompt: &str, tier: ModelTier) -> Result<String> {
    let summary = summarizer.summarize(prompt, tier).await?;
    if summary.trim().is_empty() {
        return Err(EvsError::SummarizerFailed {
            tier: tier.to_string(),
            message: "empty summary".to_string(),
        });
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Prompt building
// ---------------------------------------------------------------------------

const PROMPT_HEADER: &str = "Summarize the following conversation excerpt so a coding agent can \
resume with full context. Keep decisions, open tasks, file paths, and \
constraints. Be concise.";

/// Role-prefixed text of the selected chat messages.
pub fn build_prompt_claude(session: &claude::Session, selected: &[usize]) -> String {
    let mut out = String::from(PROMPT_HEADER);
    out.push_str("\n\n");
    for &index in selected {
        let Some(entry) = session.entry_at(index) else {
            continue;
        };
        let role = match entry.role {
            claude::Role::User => "user",
            claude::Role::Assistant => "assistant",
            claude::Role::System => "system",
        };
        let text = session.records[index]
            .value()
            .map(claude::entry_text)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&text);
        out.push('\n');
    }
    out
}

/// Role-prefixed text of the selected response items.
pub fn build_prompt_codex(session: &codex::Session, selected: &[usize]) -> String {
    let mut out = String::from(PROMPT_HEADER);
    out.push_str("\n\n");
    for &index in selected {
        let Some(codex::Line::ResponseItem { role, .. }) = session.lines.get(index) else {
            continue;
        };
        let text = session.records[index]
            .value()
            .map(codex::item_text)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        out.push_str(role.as_deref().unwrap_or("assistant"));
        out.push_str(": ");
        out.push_str(&text);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_SUMMARY_TOKENS: u32 = 2048;

/// Summarizer backed by an Anthropic-style messages endpoint.
pub struct HttpSummarizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSummarizer {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.into(),
        }
    }

    /// Build from the environment; `None` without an API key.
    pub fn from_env(env: &crate::context::EnvSnapshot) -> Option<Self> {
        let api_key = env.get("ANTHROPIC_API_KEY")?.to_string();
        if api_key.is_empty() {
            return None;
        }
        let base_url = env.get("ANTHROPIC_BASE_URL").map(String::from);
        Some(Self::new(api_key, base_url))
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, prompt: &str, tier: ModelTier) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = json!({
            "model": tier.model_id(),
            "max_tokens": MAX_SUMMARY_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });
        debug!(model = tier.model_id(), "Requesting summary");
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EvsError::SummarizerFailed {
                tier: tier.to_string(),
                message: format!("{status}: {detail}"),
            });
        }
        let value: serde_json::Value = response.json().await?;
        let text = value
            .pointer("/content/0/text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Stub implementation (tests, dry runs)
// ---------------------------------------------------------------------------

/// Deterministic summarizer: a fixed reply, with optional failures at
/// chosen tiers.
pub struct StubSummarizer {
    pub reply: String,
    pub fail_tiers: Vec<ModelTier>,
}

impl StubSummarizer {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            fail_tiers: Vec::new(),
        }
    }
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, _prompt: &str, tier: ModelTier) -> Result<String> {
        if self.fail_tiers.contains(&tier) {
            return Err(EvsError::SummarizerFailed {
                tier: tier.to_string(),
                message: "stubbed failure".to_string(),
            });
        }
        Ok(self.reply.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::parse_str;
    use crate::transcript::claude::fixtures as cf;

    #[test]
    fn test_tier_ladder() {
        assert_eq!(ModelTier::Haiku.promote(), Some(ModelTier::Sonnet));
        assert_eq!(ModelTier::Sonnet.promote(), Some(ModelTier::Opus));
        assert_eq!(ModelTier::Opus.promote(), None);
        assert_eq!(ModelTier::from_str("SONNET"), Some(ModelTier::Sonnet));
        assert_eq!(ModelTier::from_str("gpt"), None);
    }

    #[tokio::test]
    async fn test_fallback_promotes_once() {
        let stub = StubSummarizer {
            reply: "summary".into(),
            fail_tiers: vec![ModelTier::Haiku],
        };
        let (summary, tier) = summarize_with_fallback(&stub, "p", ModelTier::Haiku)
            .await
            .unwrap();
        assert_eq!(summary, "summary");
        assert_eq!(tier, ModelTier::Sonnet);
    }

    #[tokio::test]
    async fn test_fallback_fails_after_two_tiers() {
        let stub = StubSummarizer {
            reply: "summary".into(),
            fail_tiers: vec![ModelTier::Haiku, ModelTier::Sonnet],
        };
        let res = summarize_with_fallback(&stub, "p", ModelTier::Haiku).await;
        assert!(matches!(res, Err(EvsError::SummarizerFailed { .. })));
    }

    #[tokio::test]
    async fn test_opus_failure_is_terminal() {
        let stub = StubSummarizer {
            reply: "summary".into(),
            fail_tiers: vec![ModelTier::Opus],
        };
        let res = summarize_with_fallback(&stub, "p", ModelTier::Opus).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_whitespace_summary_is_failure() {
        let stub = StubSummarizer {
            reply: "   \n ".into(),
            fail_tiers: vec![],
        };
        // Whitespace at every tier: haiku fails, sonnet fails, error out.
        let res = summarize_with_fallback(&stub, "p", ModelTier::Haiku).await;
        assert!(matches!(res, Err(EvsError::SummarizerFailed { .. })));
    }

    #[test]
    fn test_build_prompt_claude_role_prefixed() {
        let session = claude::Session::parse(parse_str(&format!(
            "{}\n{}\n",
            cf::user("u1", "", "2026-01-01T00:00:00Z", "fix the bug in main.rs"),
            cf::assistant("a1", "u1", "2026-01-01T00:00:01Z", r#"[{"type":"text","text":"done, see patch"}]"#),
        )));
        let prompt = build_prompt_claude(&session, &[0, 1]);
        assert!(prompt.contains("user: fix the bug in main.rs"));
        assert!(prompt.contains("assistant: done, see patch"));
        assert!(prompt.starts_with(PROMPT_HEADER));
    }
}
