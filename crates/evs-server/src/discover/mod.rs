// crates/evs-server/src/discover/mod.rs
// Session discovery: locate the live transcript for a cwd and/or explicit
// id, returning a ranked candidate list with confidence.

mod claude;
mod codex;

pub use codex::{load_bycwd_cache, update_bycwd_cache};

use crate::context::Context;
use crate::error::Result;
use crate::jsonl;
use crate::transcript;
use evs_types::Agent;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Head records inspected for identifying metadata.
pub const HEAD_RECORDS: usize = 200;
/// Alternatives returned beside the principal hit.
pub const MAX_ALTERNATIVES: usize = 5;

/// Integer scoring weights.
const SCORE_METADATA: i64 = 50;
const SCORE_CWD_MATCH: i64 = 100;
const SCORE_AGENT_DETECTED: i64 = 20;
const SCORE_INVALID_LINES: i64 = -50;
const SCORE_WRONG_AGENT: i64 = -100;

#[derive(Debug, Clone)]
pub struct Query {
    pub cwd: Option<String>,
    pub session_id: Option<String>,
    pub match_text: Option<String>,
    pub lookback_days: u32,
    pub max_candidates: usize,
    pub tail_lines: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            cwd: None,
            session_id: None,
            match_text: None,
            lookback_days: 14,
            max_candidates: 50,
            tail_lines: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    SessionId,
    CwdHash,
    Match,
    Fallback,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionId => write!(f, "session-id"),
            Self::CwdHash => write!(f, "cwd-hash"),
            Self::Match => write!(f, "match"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent: Agent,
    pub path: PathBuf,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    /// Head timestamp when parseable; drives the newest-first tie-break.
    pub last_activity: Option<String>,
    pub mtime: Option<SystemTime>,
    pub score: i64,
    pub method: Method,
    pub confidence: Confidence,
}

#[derive(Debug)]
pub struct Discovery {
    pub principal: Option<Candidate>,
    pub alternatives: Vec<Candidate>,
}

/// Metadata pulled from a candidate file's bounded head, plus tail text
/// for content matching.
#[derive(Debug, Default)]
pub(crate) struct HeadInfo {
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub timestamp: Option<String>,
    pub detected: Option<Agent>,
    pub invalid_lines: bool,
}

pub(crate) fn read_head(path: &std::path::Path) -> HeadInfo {
    let mut info = HeadInfo::default();
    let Ok(data) = std::fs::read_to_string(path) else {
        return info;
    };
    let records: Vec<_> = jsonl::parse_str(&data).into_iter().take(HEAD_RECORDS).collect();
    info.detected = transcript::detect_agent(&records);
    info.invalid_lines = records.iter().any(|r| r.is_invalid());
    for record in &records {
        let Some(obj) = record.value().and_then(|v| v.as_object()) else {
            continue;
        };
        // Chat entries carry sessionId/cwd at top level; rollout heads
        // carry them in the session_meta payload.
        if info.session_id.is_none() {
            info.session_id = obj
                .get("sessionId")
                .and_then(|s| s.as_str())
                .map(String::from)
                .or_else(|| {
                    obj.get("payload")
                        .and_then(|p| p.get("id"))
                        .and_then(|s| s.as_str())
                        .map(String::from)
                });
        }
        if info.cwd.is_none() {
            info.cwd = obj
                .get("cwd")
                .and_then(|s| s.as_str())
                .map(String::from)
                .or_else(|| {
                    obj.get("payload")
                        .and_then(|p| p.get("cwd"))
                        .and_then(|s| s.as_str())
                        .map(String::from)
                });
        }
        if info.timestamp.is_none() {
            info.timestamp = obj
                .get("timestamp")
                .and_then(|s| s.as_str())
                .map(String::from);
        }
        if info.session_id.is_some() && info.cwd.is_some() && info.timestamp.is_some() {
            break;
        }
    }
    info
}

/// Last `tail_lines` raw lines, for content matching.
pub(crate) fn read_tail(path: &std::path::Path, tail_lines: usize) -> String {
    let Ok(data) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = data.lines().collect();
    let skip = lines.len().saturating_sub(tail_lines);
    lines[skip..].join("\n")
}

pub(crate) fn score_candidate(
    expected_agent: Agent,
    info: &HeadInfo,
    cwd: Option<&str>,
) -> i64 {
    let mut score = 0;
    if info.session_id.is_some() {
        score += SCORE_METADATA;
    }
    if let (Some(want), Some(have)) = (cwd, info.cwd.as_deref()) {
        if want == have {
            score += SCORE_CWD_MATCH;
        }
    }
    match info.detected {
        Some(agent) if agent == expected_agent => score += SCORE_AGENT_DETECTED,
        Some(_) => score += SCORE_WRONG_AGENT,
        None => {}
    }
    if info.invalid_lines {
        score += SCORE_INVALID_LINES;
    }
    score
}

pub(crate) fn confidence_for(method: Method, score: i64) -> Confidence {
    match method {
        Method::SessionId => Confidence::High,
        Method::Fallback => Confidence::Low,
        _ if score >= 140 => Confidence::High,
        _ if score >= 80 => Confidence::Medium,
        _ => Confidence::Low,
    }
}

/// Discover sessions for one agent (or both when `agent` is None), ranked
/// newest-activity first, then newest mtime, then highest score.
pub fn discover(ctx: &Context, agent: Option<Agent>, query: &Query) -> Result<Discovery> {
    let mut candidates = Vec::new();
    if agent.is_none_or(|a| a == Agent::Claude) {
        candidates.extend(claude::scan(ctx, query)?);
    }
    if agent.is_none_or(|a| a == Agent::Codex) {
        candidates.extend(codex::scan(ctx, query)?);
    }

    candidates.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| b.mtime.cmp(&a.mtime))
            .then_with(|| b.score.cmp(&a.score))
    });
    // An exact session-id hit outranks recency.
    if let Some(pos) = candidates.iter().position(|c| c.method == Method::SessionId) {
        let hit = candidates.remove(pos);
        candidates.insert(0, hit);
    }

    let mut iter = candidates.into_iter();
    let principal = iter.next();
    let alternatives: Vec<Candidate> = iter.take(MAX_ALTERNATIVES).collect();
    Ok(Discovery {
        principal,
        alternatives,
    })
}

/// Session id recorded in a transcript's head, if any.
pub fn session_id_of(path: &std::path::Path) -> Option<String> {
    read_head(path).session_id
}

/// A resolved live session for the compaction pipeline.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub agent: Agent,
    pub transcript: PathBuf,
    pub session_id: String,
}

/// Resolve the session a pipeline invocation should operate on: explicit
/// path first, then the env transcript hint, then discovery.
pub fn resolve_session(
    ctx: &Context,
    agent: Option<Agent>,
    transcript: Option<&std::path::Path>,
    query: &Query,
) -> Result<Option<ResolvedSession>> {
    let from_path = |path: &std::path::Path| -> Option<ResolvedSession> {
        if !path.is_file() {
            return None;
        }
        let info = read_head(path);
        let resolved_agent = agent.or(info.detected)?;
        let session_id = info.session_id.or_else(|| {
            path.file_stem().map(|s| s.to_string_lossy().into_owned())
        })?;
        Some(ResolvedSession {
            agent: resolved_agent,
            transcript: path.to_path_buf(),
            session_id,
        })
    };

    if let Some(path) = transcript {
        return Ok(from_path(path));
    }
    if let Some(hint) = ctx.claude_transcript_hint.clone() {
        if let Some(resolved) = from_path(&hint) {
            return Ok(Some(resolved));
        }
    }

    let discovery = discover(ctx, agent, query)?;
    Ok(discovery.principal.and_then(|c| {
        let session_id = c.session_id.clone().or_else(|| {
            c.path.file_stem().map(|s| s.to_string_lossy().into_owned())
        })?;
        Some(ResolvedSession {
            agent: c.agent,
            transcript: c.path,
            session_id,
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bands() {
        assert_eq!(confidence_for(Method::SessionId, 0), Confidence::High);
        assert_eq!(confidence_for(Method::Fallback, 500), Confidence::Low);
        assert_eq!(confidence_for(Method::CwdHash, 150), Confidence::High);
        assert_eq!(confidence_for(Method::CwdHash, 100), Confidence::Medium);
        assert_eq!(confidence_for(Method::Match, 40), Confidence::Low);
    }

    #[test]
    fn test_score_weights() {
        let info = HeadInfo {
            session_id: Some("s1".into()),
            cwd: Some("/w".into()),
            timestamp: None,
            detected: Some(Agent::Claude),
            invalid_lines: false,
        };
        assert_eq!(score_candidate(Agent::Claude, &info, Some("/w")), 170);
        assert_eq!(score_candidate(Agent::Claude, &info, Some("/other")), 70);
        assert_eq!(score_candidate(Agent::Codex, &info, Some("/w")), 50);
        let dirty = HeadInfo {
            invalid_lines: true,
            ..HeadInfo::default()
        };
        assert_eq!(score_candidate(Agent::Claude, &dirty, None), -50);
    }
}
