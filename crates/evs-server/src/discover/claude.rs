// crates/evs-server/src/discover/claude.rs
// Chat-transcript discovery: the project directory derived from the cwd,
// or a session-id lookup across all project directories.

use super::{Candidate, HeadInfo, Method, Query, confidence_for, read_head, read_tail, score_candidate};
use crate::context::Context;
use crate::error::Result;
use crate::paths;
use evs_types::Agent;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

pub(super) fn scan(ctx: &Context, query: &Query) -> Result<Vec<Candidate>> {
    if let Some(session_id) = query.session_id.as_deref() {
        return Ok(scan_by_session_id(ctx, session_id));
    }
    if let Some(cwd) = query.cwd.as_deref() {
        return Ok(scan_project_dir(ctx, cwd, query));
    }
    Ok(scan_fallback(ctx, query))
}

/// `<projects-root>/*/<session-id>.jsonl` anywhere.
fn scan_by_session_id(ctx: &Context, session_id: &str) -> Vec<Candidate> {
    let root = paths::claude_projects_root(ctx);
    let wanted = format!("{session_id}.jsonl");
    let mut out = Vec::new();
    for entry in WalkDir::new(&root).min_depth(2).max_depth(2).into_iter().flatten() {
        if entry.file_name().to_string_lossy() == wanted.as_str() {
            out.push(candidate_for(entry.path(), None, Method::SessionId));
        }
    }
    out
}

/// All transcripts in the project directory named after the cwd.
fn scan_project_dir(ctx: &Context, cwd: &str, query: &Query) -> Vec<Candidate> {
    let dir = paths::claude_project_dir(ctx, cwd);
    let mut files = jsonl_files(&dir, query);
    files.sort_by_key(|(_, mtime)| std::cmp::Reverse(*mtime));
    files.truncate(query.max_candidates);

    files
        .into_iter()
        .filter_map(|(path, _)| {
            let method = match query.match_text.as_deref() {
                Some(needle) => {
                    if read_tail(&path, query.tail_lines).contains(needle) {
                        Method::Match
                    } else {
                        return None;
                    }
                }
                None => Method::CwdHash,
            };
            Some(candidate_for(&path, Some(cwd), method))
        })
        .collect()
}

/// No cwd, no id: the most recent transcripts anywhere under the root.
fn scan_fallback(ctx: &Context, query: &Query) -> Vec<Candidate> {
    let root = paths::claude_projects_root(ctx);
    let mut files: Vec<(PathBuf, SystemTime)> = WalkDir::new(&root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|e| {
            let mtime = e.metadata().ok()?.modified().ok()?;
            Some((e.into_path(), mtime))
        })
        .collect();
    files.sort_by_key(|(_, mtime)| std::cmp::Reverse(*mtime));
    files.truncate(query.max_candidates.min(super::MAX_ALTERNATIVES + 1));
    files
        .into_iter()
        .map(|(path, _)| candidate_for(&path, None, Method::Fallback))
        .collect()
}

fn jsonl_files(dir: &Path, query: &Query) -> Vec<(PathBuf, SystemTime)> {
    let horizon =
        SystemTime::now() - Duration::from_secs(u64::from(query.lookback_days) * 24 * 3600);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|e| {
            let mtime = e.metadata().ok()?.modified().ok()?;
            if mtime < horizon {
                return None;
            }
            Some((e.path(), mtime))
        })
        .collect()
}

fn candidate_for(path: &Path, cwd: Option<&str>, method: Method) -> Candidate {
    let info: HeadInfo = read_head(path);
    let score = score_candidate(Agent::Claude, &info, cwd);
    let confidence = confidence_for(method, score);
    let session_id = info.session_id.clone().or_else(|| {
        path.file_stem().map(|s| s.to_string_lossy().into_owned())
    });
    Candidate {
        agent: Agent::Claude,
        path: path.to_path_buf(),
        session_id,
        cwd: info.cwd,
        last_activity: info.timestamp,
        mtime: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        score,
        method,
        confidence,
    }
}
