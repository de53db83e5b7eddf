use anyhow::Result;

use crate::commands::{CommandReport, VaultContext};
use crate::vault::aggregate::aggregate;
use crate::vault::config::unknown_env_keys;
use crate::vault::ledger::EntryStatus;
use crate::vault::util::{format_timestamp, human_bytes};

pub fn run(ctx: &VaultContext) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let roots = ctx.registry.load()?;
    let view = aggregate(&roots, &ctx.paths.legacy_ledger);

    report.detail(format!("vault_home={}", ctx.paths.vault_home.display()));
    report.detail(format!("registry={}", ctx.registry.path().display()));
    report.detail(format!(
        "mounts={} ({})",
        ctx.canonicalizer.mounts().entries().len(),
        ctx.config.staging.mounts_file.display()
    ));
    report.detail(format!("registered_roots={}", roots.len()));
    for source in &view.sources {
        report.detail(format!("source={}", source.display()));
    }
    if view.legacy {
        report.detail("legacy_ledger=true");
    }

    for status in EntryStatus::ALL {
        let count = view.entries().filter(|e| e.status == status).count();
        report.detail(format!("{status}={count}"));
    }

    let stats = &view.statistics;
    report.detail(format!(
        "total_archived_bytes={} ({})",
        stats.total_archived_bytes,
        human_bytes(stats.total_archived_bytes)
    ));
    report.detail(format!("total_items={}", stats.total_items));
    report.detail(format!("total_files={}", stats.total_files));
    report.detail(format!(
        "last_archive_date={}",
        stats
            .last_archive_date
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string())
    ));
    report.detail(format!(
        "estimated_monthly_cost_usd={:.4}",
        stats.estimated_monthly_cost
    ));

    for warning in &view.warnings {
        report.detail(format!("warning: {warning}"));
    }
    for key in unknown_env_keys() {
        report.detail(format!("warning: unknown environment variable {key}"));
    }

    report.attach(&view)?;
    Ok(report)
}
