// crates/evs-server/src/validate/codex.rs
// Rules for rollout-style transcripts. Call/output pairing is strict: the
// agent refuses to resume a file whose outputs precede their calls.

use super::{Issue, IssueCode, Location};
use crate::transcript::codex::{ItemKind, Line, Session, payload};
use std::collections::{HashMap, HashSet};

pub fn validate_codex(session: &Session) -> Vec<Issue> {
    let mut issues = Vec::new();

    for line in &session.lines {
        match line {
            Line::InvalidJson { line_number, .. } => issues.push(Issue::error(
                IssueCode::InvalidJsonLine,
                Location::Line(*line_number),
                "line is not valid JSON",
            )),
            Line::UnknownJson { line_number, .. } => issues.push(Issue::warning(
                IssueCode::UnknownJsonLine,
                Location::Line(*line_number),
                "valid JSON but not a recognized rollout line",
            )),
            _ => {}
        }
    }

    check_session_meta(session, &mut issues);
    check_call_pairing(session, &mut issues);
    check_sandbox_policy(session, &mut issues);

    issues
}

fn check_session_meta(session: &Session, issues: &mut Vec<Issue>) {
    match session.session_meta() {
        None => issues.push(Issue::error(
            IssueCode::MissingSessionMeta,
            Location::File,
            "no session_meta line",
        )),
        Some(Line::SessionMeta {
            line_number,
            id,
            payload_is_object,
            ..
        }) => {
            if !payload_is_object {
                issues.push(Issue::error(
                    IssueCode::SessionMetaPayloadNotObject,
                    Location::Line(*line_number),
                    "session_meta payload is not an object",
                ));
            } else if id.as_deref().unwrap_or("").is_empty() {
                issues.push(Issue::error(
                    IssueCode::MissingSessionMeta,
                    Location::Line(*line_number),
                    "session_meta carries no id",
                ));
            }
        }
        Some(_) => {}
    }
}

fn check_call_pairing(session: &Session, issues: &mut Vec<Issue>) {
    // First pass: where every call lives, for the before/orphan distinction.
    let mut call_lines: HashMap<&str, (ItemKind, usize)> = HashMap::new();
    for line in &session.lines {
        if let Line::ResponseItem {
            kind,
            call_id: Some(call_id),
            line_number,
            ..
        } = line
        {
            if kind.is_call() && !call_lines.contains_key(call_id.as_str()) {
                call_lines.insert(call_id, (kind.clone(), *line_number));
            }
        }
    }

    let mut seen_calls: HashSet<&str> = HashSet::new();
    let mut seen_outputs: HashSet<&str> = HashSet::new();
    let mut answered: HashSet<&str> = HashSet::new();

    for line in &session.lines {
        let Line::ResponseItem {
            kind,
            call_id: Some(call_id),
            line_number,
            ..
        } = line
        else {
            continue;
        };
        let call_id = call_id.as_str();
        if kind.is_call() {
            if !seen_calls.insert(call_id) {
                issues.push(Issue::warning(
                    IssueCode::DuplicateCallId,
                    Location::Pair {
                        call_id: call_id.to_string(),
                    },
                    format!("second call with call_id on line {line_number}"),
                ));
            }
        } else if kind.is_output() {
            if !seen_outputs.insert(call_id) {
                issues.push(Issue::warning(
                    IssueCode::DuplicateOutputsForCallId,
                    Location::Pair {
                        call_id: call_id.to_string(),
                    },
                    format!("second output with call_id on line {line_number}"),
                ));
                continue;
            }
            match call_lines.get(call_id) {
                None => issues.push(Issue::error(
                    IssueCode::OrphanOutput,
                    Location::Pair {
                        call_id: call_id.to_string(),
                    },
                    format!("output on line {line_number} has no call"),
                )),
                Some(_) if !seen_calls.contains(call_id) => {
                    // The call exists but only later in the file.
                    issues.push(Issue::error(
                        IssueCode::OutputBeforeCall,
                        Location::Pair {
                            call_id: call_id.to_string(),
                        },
                        format!("output on line {line_number} precedes its call"),
                    ));
                }
                Some((call_kind, _)) => {
                    answered.insert(call_id);
                    if call_kind.matching_output().as_ref() != Some(kind) {
                        issues.push(Issue::error(
                            IssueCode::OrphanOutput,
                            Location::Pair {
                                call_id: call_id.to_string(),
                            },
                            "output kind does not match call kind",
                        ));
                    }
                }
            }
        }
    }

    for (call_id, (_, line_number)) in &call_lines {
        if !seen_outputs.contains(call_id) {
            issues.push(Issue::warning(
                IssueCode::MissingOutput,
                Location::Pair {
                    call_id: call_id.to_string(),
                },
                format!("call on line {line_number} has no output"),
            ));
        }
    }
}

fn check_sandbox_policy(session: &Session, issues: &mut Vec<Issue>) {
    for line in &session.lines {
        let Line::TurnContext { index, line_number } = line else {
            continue;
        };
        let Some(policy) = session.records[*index]
            .value()
            .and_then(payload)
            .and_then(|p| p.get("sandbox_policy"))
            .and_then(|p| p.as_object())
        else {
            continue;
        };
        if !policy.contains_key("type") && !policy.contains_key("mode") {
            issues.push(Issue::warning(
                IssueCode::SandboxPolicyMissingModeOrType,
                Location::Line(*line_number),
                "sandbox_policy has neither type nor mode",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::parse_str;
    use crate::transcript::codex::fixtures::*;
    use crate::validate::error_count;

    fn validate(lines: &[String]) -> Vec<Issue> {
        let session = Session::parse(parse_str(&(lines.join("\n") + "\n")));
        validate_codex(&session)
    }

    fn codes(issues: &[Issue]) -> Vec<IssueCode> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_clean_rollout_has_no_issues() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            message("2026-01-01T00:00:01Z", "user", "hi"),
            function_call("2026-01-01T00:00:02Z", "c1", "shell"),
            function_call_output("2026-01-01T00:00:03Z", "c1", "ok"),
        ]);
        assert!(issues.is_empty(), "unexpected: {issues:?}");
    }

    #[test]
    fn test_missing_session_meta() {
        let issues = validate(&[message("2026-01-01T00:00:01Z", "user", "hi")]);
        assert!(codes(&issues).contains(&IssueCode::MissingSessionMeta));
    }

    #[test]
    fn test_empty_session_meta_id() {
        let issues = validate(&[session_meta("2026-01-01T00:00:00Z", "", "/w")]);
        assert!(codes(&issues).contains(&IssueCode::MissingSessionMeta));
    }

    #[test]
    fn test_session_meta_payload_not_object() {
        let issues = validate(&[
            r#"{"timestamp":"2026-01-01T00:00:00Z","type":"session_meta","payload":"nope"}"#
                .to_string(),
        ]);
        assert!(codes(&issues).contains(&IssueCode::SessionMetaPayloadNotObject));
    }

    #[test]
    fn test_orphan_output() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            function_call_output("2026-01-01T00:00:01Z", "ghost", "x"),
        ]);
        assert!(codes(&issues).contains(&IssueCode::OrphanOutput));
        assert_eq!(error_count(&issues), 1);
    }

    #[test]
    fn test_output_before_call_is_error_even_one_line_apart() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            function_call_output("2026-01-01T00:00:01Z", "c1", "early"),
            function_call("2026-01-01T00:00:02Z", "c1", "shell"),
        ]);
        assert!(codes(&issues).contains(&IssueCode::OutputBeforeCall));
    }

    #[test]
    fn test_duplicate_outputs_warning() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            function_call("2026-01-01T00:00:01Z", "c1", "shell"),
            function_call_output("2026-01-01T00:00:02Z", "c1", "one"),
            function_call_output("2026-01-01T00:00:03Z", "c1", "two"),
        ]);
        assert!(codes(&issues).contains(&IssueCode::DuplicateOutputsForCallId));
        assert_eq!(error_count(&issues), 0);
    }

    #[test]
    fn test_duplicate_call_id_warning() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            function_call("2026-01-01T00:00:01Z", "c1", "shell"),
            function_call("2026-01-01T00:00:02Z", "c1", "shell"),
            function_call_output("2026-01-01T00:00:03Z", "c1", "ok"),
        ]);
        assert!(codes(&issues).contains(&IssueCode::DuplicateCallId));
    }

    #[test]
    fn test_missing_output_warning() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            function_call("2026-01-01T00:00:01Z", "c1", "shell"),
        ]);
        assert!(codes(&issues).contains(&IssueCode::MissingOutput));
        assert_eq!(error_count(&issues), 0);
    }

    #[test]
    fn test_kind_mismatch_is_error() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            wrapped(
                "2026-01-01T00:00:01Z",
                "response_item",
                r#"{"type":"custom_tool_call","call_id":"c1","name":"my_tool","input":"{}"}"#,
            ),
            function_call_output("2026-01-01T00:00:02Z", "c1", "wrong kind"),
        ]);
        assert!(codes(&issues).contains(&IssueCode::OrphanOutput));
    }

    #[test]
    fn test_sandbox_policy_warning() {
        let issues = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            turn_context("2026-01-01T00:00:01Z", r#"{"writable_roots":[]}"#),
        ]);
        assert!(codes(&issues).contains(&IssueCode::SandboxPolicyMissingModeOrType));
        let ok = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            turn_context("2026-01-01T00:00:01Z", r#"{"type":"workspace-write"}"#),
        ]);
        assert!(ok.is_empty());
        let legacy = validate(&[
            session_meta("2026-01-01T00:00:00Z", "t1", "/w"),
            turn_context("2026-01-01T00:00:01Z", r#"{"mode":"workspace-write"}"#),
        ]);
        // Legacy spelling is normalized by the fixer, not flagged here.
        assert!(legacy.is_empty());
    }
}
