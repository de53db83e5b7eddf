use anyhow::Result;

use crate::commands::{CommandReport, VaultContext};
use crate::vault::aggregate::aggregate;
use crate::vault::auditor::{Severity, audit};
use crate::vault::engine::BackupEngine;
use crate::vault::events::append_event;

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub deep: bool,
}

pub fn run(
    ctx: &VaultContext,
    opts: &VerifyOptions,
    engine: &dyn BackupEngine,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("verify");
    let roots = ctx.registry.load()?;
    let view = aggregate(&roots, &ctx.paths.legacy_ledger);
    for warning in &view.warnings {
        report.detail(format!("warning: {warning}"));
    }

    let snapshots = match engine.list_snapshots() {
        Ok(snapshots) => snapshots,
        Err(err) => {
            report.issue(format!("[{}] {err}", err.code().as_str()));
            return Ok(report);
        }
    };

    let deep = opts.deep || ctx.config.engine.deep_check;
    let repository_check_ok = match engine.check_repository(deep) {
        Ok(check) => {
            if !check.ok {
                report.issue(format!("repository check failed: {}", check.details.trim()));
            }
            check.ok
        }
        Err(err) => {
            report.issue(format!("[{}] {err}", err.code().as_str()));
            false
        }
    };

    let audit_report = audit(&view, &snapshots, repository_check_ok);
    report.detail(format!("archived_entries={}", audit_report.archived_entries));
    report.detail(format!("remote_snapshots={}", audit_report.remote_snapshots));
    report.detail(format!("deep_check={deep}"));
    for issue in &audit_report.issues {
        match issue.severity() {
            Severity::Error => report.issue(format!("error: {}", issue.describe())),
            Severity::Warning => report.detail(format!("warning: {}", issue.describe())),
            Severity::Info => report.detail(format!("info: {}", issue.describe())),
        }
    }
    report.detail(format!("audit_passed={}", audit_report.passed));

    let status = if audit_report.passed { "ok" } else { "failed" };
    let message = format!(
        "{} errors, {} warnings, {} orphan snapshots",
        audit_report.count(Severity::Error),
        audit_report.count(Severity::Warning),
        audit_report.count(Severity::Info)
    );
    if let Err(err) = append_event(&ctx.paths.logs_dir, "verify", status, &message) {
        tracing::warn!(error = %err, "failed to append verify event");
    }

    report.attach(&audit_report)?;
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
    fn empty_vault_with_healthy_repository_passes() {
        let tmp = tempdir().expect("tempdir");
        let ctx = VaultContext::with(
            VaultPaths::under(tmp.path().to_path_buf()),
            VaultConfig::default(),
        );
        let report =
            run(&ctx, &VerifyOptions::default(), &FakeEngine::succeeding("x")).expect("verify");
        assert!(report.ok, "{:?}", report.issues);
        assert!(report.details.iter().any(|d| d == "audit_passed=true"));
    }

    #[test]
    fn failing_repository_check_fails_verify() {
        let tmp = tempdir().expect("tempdir");
        let ctx = VaultContext::with(
            VaultPaths::under(tmp.path().to_path_buf()),
            VaultConfig::default(),
        );
        let mut engine = FakeEngine::succeeding("x");
        engine.check_ok = false;
        let report = run(&ctx, &VerifyOptions::default(), &engine).expect("verify");
        assert!(!report.ok);
        assert!(report.details.iter().any(|d| d == "audit_passed=false"));
    }
}
