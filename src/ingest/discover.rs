//! Transcript-root scanning for the projects diagnostics endpoint.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::ingest::transcript::{parse_line, TranscriptLine};

/// Result of one scan over the transcript root.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Project names (cwd basenames) with at least one user message.
    pub projects: BTreeSet<String>,
    pub scanned_files: usize,
}

/// Scan the transcript root for sessions that contain at least one user
/// message and report the projects they belong to. Used by the viewer to
/// surface "projects discovered but not ingested".
pub fn discover_session_projects(root: &Path) -> Result<DiscoveryReport> {
    let mut report = DiscoveryReport::default();
    for path in collect_jsonl_files(root)? {
        report.scanned_files += 1;
        if let Some(project) = project_with_user_message(&path) {
            report.projects.insert(project);
        }
    }
    Ok(report)
}

/// All `.jsonl` files under the root, recursively.
pub fn collect_jsonl_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Sort files by modification time, oldest first — the engine's processing
/// order.
pub fn sort_by_mtime(files: &mut [PathBuf]) {
    files.sort_by_key(|path| {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });
}

fn project_with_user_message(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut cwd: Option<String> = None;
    let mut has_user_message = false;

    for line in contents.lines() {
        match parse_line(line) {
            Some(TranscriptLine::SessionMeta { cwd: meta_cwd, .. }) => {
                if meta_cwd.is_some() {
                    cwd = meta_cwd;
                }
            }
            Some(TranscriptLine::UserMessage { text }) if !text.trim().is_empty() => {
                has_user_message = true;
            }
            Some(TranscriptLine::Flat { text, .. }) if !text.trim().is_empty() => {
                has_user_message = true;
            }
            _ => {}
        }
    }

    if !has_user_message {
        return None;
    }
    Some(project_name_from_cwd(cwd.as_deref(), path))
}

/// Project name: basename of the working directory, else the file stem.
pub fn project_name_from_cwd(cwd: Option<&str>, fallback_path: &Path) -> String {
    cwd.map(Path::new)
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| {
            fallback_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".into())
        })
}
