//! One-shot data-directory migration from the legacy location.
//!
//! Copy-only: the legacy directory is never mutated. A `migration.lock` in
//! the destination makes the operation one-shot, and a JSON report records
//! what was copied. Existing destination files are not overwritten unless
//! forced.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

pub const MIGRATION_LOCK: &str = "migration.lock";
pub const MIGRATION_REPORT: &str = "migration-report.json";

#[derive(Debug, Default, Serialize)]
pub struct MigrationReport {
    pub copied: Vec<String>,
    pub skipped_existing: Vec<String>,
    pub source: String,
    pub destination: String,
    pub dry_run: bool,
    pub completed_at: Option<String>,
}

/// Outcome of a migration attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Nothing to do: no legacy directory, or the canonical one already exists
    /// with data (and no `--force`).
    NotNeeded,
    /// A previous run already migrated (lock present).
    AlreadyDone,
    /// Dry run: the plan was printed, nothing was created.
    Planned(usize),
    /// Files were copied.
    Migrated(usize),
}

/// Run the migration. `dry_run` prints the plan without creating the
/// destination; `force` allows overwriting existing destination files and
/// re-running despite the lock.
pub fn migrate_data_dir(
    legacy: &Path,
    canonical: &Path,
    dry_run: bool,
    force: bool,
) -> Result<MigrationOutcome> {
    if !legacy.exists() {
        info!("no legacy data directory, nothing to migrate");
        return Ok(MigrationOutcome::NotNeeded);
    }
    if canonical.join(MIGRATION_LOCK).exists() && !force {
        info!("migration lock present, skipping");
        return Ok(MigrationOutcome::AlreadyDone);
    }

    let entries = collect_files(legacy)?;
    let mut report = MigrationReport {
        source: legacy.to_string_lossy().into_owned(),
        destination: canonical.to_string_lossy().into_owned(),
        dry_run,
        ..Default::default()
    };

    if dry_run {
        for rel in &entries {
            println!("would copy {rel}");
            report.copied.push(rel.clone());
        }
        println!("{} file(s) would be copied; destination untouched", entries.len());
        return Ok(MigrationOutcome::Planned(entries.len()));
    }

    std::fs::create_dir_all(canonical)
        .with_context(|| format!("failed to create {}", canonical.display()))?;

    for rel in &entries {
        let src = legacy.join(rel);
        let dst = canonical.join(rel);
        if dst.exists() && !force {
            warn!(file = %rel, "destination exists, not overwriting");
            report.skipped_existing.push(rel.clone());
            continue;
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dst)
            .with_context(|| format!("failed to copy {}", src.display()))?;
        report.copied.push(rel.clone());
    }

    report.completed_at = Some(chrono::Utc::now().to_rfc3339());
    std::fs::write(
        canonical.join(MIGRATION_REPORT),
        serde_json::to_string_pretty(&report)?,
    )?;
    std::fs::write(
        canonical.join(MIGRATION_LOCK),
        format!("migrated {}\n", chrono::Utc::now().to_rfc3339()),
    )?;

    info!(
        copied = report.copied.len(),
        skipped = report.skipped_existing.len(),
        "data directory migrated"
    );
    Ok(MigrationOutcome::Migrated(report.copied.len()))
}

/// Relative paths of all files under the root.
fn collect_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                files.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    files.sort();
    Ok(files)
}
