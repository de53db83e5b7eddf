use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::commands::{CommandReport, VaultContext};
use crate::error::VaultError;
use crate::vault::aggregate::aggregate;
use crate::vault::engine::BackupEngine;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub id: String,
    pub target: PathBuf,
}

/// Pull an archived entry back out of its snapshot into `target`. The ledger
/// is left untouched.
pub fn run(
    ctx: &VaultContext,
    opts: &RestoreOptions,
    engine: &dyn BackupEngine,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("restore");
    let roots = ctx.registry.load()?;
    let view = aggregate(&roots, &ctx.paths.legacy_ledger);

    let Some(item) = view.find(&opts.id) else {
        let err = VaultError::UnknownEntry(opts.id.clone());
        report.issue(format!("[{}] {err}", err.code().as_str()));
        return Ok(report);
    };
    let entry = &item.entry;
    let Some(snapshot) = entry.snapshot_ref.as_deref().filter(|_| entry.status.is_archived())
    else {
        report.issue(format!(
            "entry {} is {} and has no archived snapshot to restore from",
            entry.id, entry.status
        ));
        return Ok(report);
    };

    let include = ctx.canonicalizer.local_path(&entry.staged_location)?;
    fs::create_dir_all(&opts.target)
        .with_context(|| format!("failed to create {}", opts.target.display()))?;
    if let Err(err) = engine.restore(snapshot, &opts.target, &include) {
        report.issue(format!("[{}] {err}", err.code().as_str()));
        return Ok(report);
    }

    let restored = opts
        .target
        .join(include.strip_prefix("/").unwrap_or(&include));
    report.detail(format!("restored id={} snapshot={snapshot}", entry.id));
    report.detail(format!("restored_path={}", restored.display()));
    report.detail(format!("original_location={}", entry.original_location));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::config::VaultConfig;
    use crate::vault::engine::fake::FakeEngine;
    use crate::vault::paths::VaultPaths;
    use tempfile::tempdir;

    #[test]
    fn unknown_entry_is_reported() {
        let tmp = tempdir().expect("tempdir");
        let ctx = VaultContext::with(
            VaultPaths::under(tmp.path().to_path_buf()),
            VaultConfig::default(),
        );
        let opts = RestoreOptions {
            id: "missing".to_string(),
            target: tmp.path().join("out"),
        };
        let report = run(&ctx, &opts, &FakeEngine::succeeding("x")).expect("restore");
        assert!(!report.ok);
        assert!(report.issues[0].starts_with("[E002_UNKNOWN_ENTRY]"));
    }
}
