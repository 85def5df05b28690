// crates/evs-server/src/validate/mod.rs
// Pure structural validation of transcript grammars. Emits issues; never
// mutates, never touches the filesystem.

mod claude;
mod codex;

pub use claude::validate_claude;
pub use codex::validate_codex;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// Where an issue points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    File,
    Line(usize),
    Pair { call_id: String },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Line(n) => write!(f, "line {n}"),
            Self::Pair { call_id } => write!(f, "call {call_id}"),
        }
    }
}

/// One testable rule per code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueCode {
    // Chat-style (Agent A)
    DuplicateUuid,
    BrokenParentChain,
    OrphanToolResult,
    ThinkingBlockOrder,
    ThinkingBlockOrderMerged,
    ApiErrorMessage,
    InvalidJsonLine,
    UnknownJsonLine,
    // Rollout-style (Agent B)
    MissingSessionMeta,
    SessionMetaPayloadNotObject,
    OrphanOutput,
    OutputBeforeCall,
    DuplicateOutputsForCallId,
    DuplicateCallId,
    MissingOutput,
    SandboxPolicyMissingModeOrType,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateUuid => "duplicate_uuid",
            Self::BrokenParentChain => "broken_parent_chain",
            Self::OrphanToolResult => "orphan_tool_result",
            Self::ThinkingBlockOrder => "thinking_block_order",
            Self::ThinkingBlockOrderMerged => "thinking_block_order_merged",
            Self::ApiErrorMessage => "api_error_message",
            Self::InvalidJsonLine => "invalid_json_line",
            Self::UnknownJsonLine => "unknown_json_line",
            Self::MissingSessionMeta => "missing_session_meta",
            Self::SessionMetaPayloadNotObject => "session_meta_payload_not_object",
            Self::OrphanOutput => "orphan_output",
            Self::OutputBeforeCall => "output_before_call",
            Self::DuplicateOutputsForCallId => "duplicate_outputs_for_call_id",
            Self::DuplicateCallId => "duplicate_call_id",
            Self::MissingOutput => "missing_output",
            Self::SandboxPolicyMissingModeOrType => "sandbox_policy_missing_mode_or_type",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub severity: Severity,
    pub code: IssueCode,
    pub location: Location,
    pub detail: String,
}

impl Issue {
    pub fn error(code: IssueCode, location: Location, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            location,
            detail: detail.into(),
        }
    }

    pub fn warning(code: IssueCode, location: Location, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            location,
            detail: detail.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Count of error-severity issues, the pipelines' abort metric.
pub fn error_count(issues: &[Issue]) -> usize {
    issues.iter().filter(|i| i.is_error()).count()
}

/// Error codes present in a set of issues, for the no-new-error-code check.
pub fn error_codes(issues: &[Issue]) -> std::collections::HashSet<IssueCode> {
    issues
        .iter()
        .filter(|i| i.is_error())
        .map(|i| i.code)
        .collect()
}
