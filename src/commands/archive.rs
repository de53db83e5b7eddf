use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::{CommandReport, Confirm, VaultContext, safety_label};
use crate::vault::engine::BackupEngine;
use crate::vault::events::Notifier;
use crate::vault::ledger::{EntryStatus, LedgerShard};
use crate::vault::lifecycle::{ArchiveController, CycleOptions, CycleOutcome};
use crate::vault::util::human_bytes;
use crate::vault::warn::{self, WarnEvent};

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    pub root: Option<PathBuf>,
    pub keep_local: bool,
    pub yes: bool,
    pub dry_run: bool,
}

struct Batch {
    root: PathBuf,
    shard: LedgerShard,
    ids: Vec<String>,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Tally {
    archived: usize,
    failed: usize,
    skipped: usize,
}

pub fn run(
    ctx: &VaultContext,
    opts: &ArchiveOptions,
    engine: &dyn BackupEngine,
    confirm: &dyn Confirm,
    notifier: &dyn Notifier,
) -> Result<CommandReport> {
    run_cycles(ctx, "archive", EntryStatus::Staged, opts, engine, confirm, notifier)
}

/// Registered staging roots, narrowed to `filter` when given. The filter may
/// name the staging root itself or the volume that holds it.
pub(crate) fn select_roots(
    ctx: &VaultContext,
    filter: Option<&Path>,
    report: &mut CommandReport,
) -> Result<Vec<PathBuf>> {
    let roots = ctx.registry.load()?;
    let Some(filter) = filter else {
        return Ok(roots);
    };
    let filter = fs::canonicalize(filter).unwrap_or_else(|_| filter.to_path_buf());
    let selected = roots
        .into_iter()
        .filter(|root| *root == filter || root.parent() == Some(filter.as_path()))
        .collect::<Vec<_>>();
    if selected.is_empty() {
        report.issue(format!(
            "{} is not a registered staging root or volume",
            filter.display()
        ));
    }
    Ok(selected)
}

pub(crate) fn run_cycles(
    ctx: &VaultContext,
    command: &str,
    wanted: EntryStatus,
    opts: &ArchiveOptions,
    engine: &dyn BackupEngine,
    confirm: &dyn Confirm,
    notifier: &dyn Notifier,
) -> Result<CommandReport> {
    let mut report = CommandReport::new(command);
    let roots = select_roots(ctx, opts.root.as_deref(), &mut report)?;
    let cost = ctx.cost();
    let controller = ArchiveController::new(
        engine,
        &ctx.canonicalizer,
        &cost,
        CycleOptions {
            delete_local: ctx.config.archive.delete_after_verify && !opts.keep_local,
            deep_check: ctx.config.engine.deep_check,
            tag: ctx.config.engine.tag.clone(),
        },
    );

    let mut batches = Vec::new();
    for root in roots {
        let shard = LedgerShard::for_staging_root(&root);
        if !shard.exists() {
            warn::emit(WarnEvent {
                code: "SHARD_UNREACHABLE",
                stage: command,
                action: "collect",
                entry: "",
                root: &root.display().to_string(),
                reason: "shard-missing",
                err: "ledger shard not found; volume may be unmounted",
            });
            report.detail(format!("skipped root={} reason=unreachable", root.display()));
            continue;
        }
        if !opts.dry_run {
            match controller.recover_interrupted(&shard) {
                Ok(recovered) if !recovered.is_empty() => report.detail(format!(
                    "recovered_interrupted root={} ids={} status=failed",
                    root.display(),
                    recovered.join(",")
                )),
                Ok(_) => {}
                Err(err) => {
                    report.issue(format!("skipped root={}: {err:#}", root.display()));
                    continue;
                }
            }
        }
        let loaded = match shard.load() {
            Ok(loaded) => loaded,
            Err(err) => {
                report.issue(format!("skipped root={}: {err:#}", root.display()));
                continue;
            }
        };
        let candidates = loaded
            .ledger
            .entries()
            .iter()
            .filter(|e| e.status == wanted)
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            continue;
        }
        batches.push(Batch {
            bytes: candidates.iter().map(|e| e.size_bytes).sum(),
            ids: candidates.iter().map(|e| e.id.clone()).collect(),
            root,
            shard,
        });
    }

    if batches.is_empty() {
        report.detail(format!("no {wanted} entries to submit"));
        return Ok(report);
    }

    let total_entries = batches.iter().map(|b| b.ids.len()).sum::<usize>();
    let total_bytes = batches.iter().map(|b| b.bytes).sum::<u64>();
    for batch in &batches {
        report.detail(format!(
            "candidates root={} entries={} size={}",
            batch.root.display(),
            batch.ids.len(),
            human_bytes(batch.bytes)
        ));
    }
    if opts.dry_run {
        report.detail("dry_run=true");
        return Ok(report);
    }
    if !opts.yes && !confirm.confirm(total_entries, total_bytes)? {
        report.detail("cancelled by operator; nothing submitted");
        return Ok(report);
    }

    let mut tally = Tally::default();
    for batch in &batches {
        match controller.run_archive_cycle(&batch.shard, &batch.ids) {
            Ok(outcome) => describe_outcome(&mut report, &mut tally, &batch.root, &outcome),
            Err(err) => {
                tally.failed += batch.ids.len();
                report.issue(format!(
                    "cycle for root={} aborted: {err:#}; entries {} need `deepfreeze list` before any retry",
                    batch.root.display(),
                    batch.ids.join(",")
                ));
            }
        }
    }

    let summary = format!(
        "{command}: {} archived, {} failed, {} skipped",
        tally.archived, tally.failed, tally.skipped
    );
    report.detail(summary.clone());
    if let Err(err) = notifier.notify(command, report.ok, &summary) {
        tracing::warn!(error = %err, "failed to deliver archive notification");
    }
    Ok(report)
}

fn describe_outcome(
    report: &mut CommandReport,
    tally: &mut Tally,
    root: &Path,
    outcome: &CycleOutcome,
) {
    for skipped in &outcome.skipped {
        tally.skipped += 1;
        report.detail(format!("skipped id={} reason={}", skipped.id, skipped.reason));
    }

    if let Some(err) = &outcome.failure {
        tally.failed += outcome.failed.len();
        report.issue(format!(
            "[{}] {err}; entries {} are failed and {} (run `deepfreeze retry`)",
            err.code().as_str(),
            outcome.failed.join(","),
            safety_label(EntryStatus::Failed)
        ));
        return;
    }

    tally.archived += outcome.archived.len();
    if let Some(snapshot) = &outcome.snapshot_ref {
        report.detail(format!(
            "archived root={} snapshot={} ids={}",
            root.display(),
            snapshot,
            outcome.archived.join(",")
        ));
    }
    if !outcome.deleted.is_empty() {
        report.detail(format!("deleted_local ids={}", outcome.deleted.join(",")));
    }
    if let Some(err) = outcome.partial_deletion() {
        let failures = outcome
            .deletion_failures
            .iter()
            .map(|(id, reason)| format!("{id} ({reason})"))
            .collect::<Vec<_>>()
            .join("; ");
        report.issue(format!(
            "[{}] {err}: {failures}; these entries are {} and their staged copies can be removed by hand",
            err.code().as_str(),
            safety_label(EntryStatus::Archived)
        ));
    }
    if let Some(stats) = &outcome.statistics {
        report.detail(format!(
            "root={} total_archived_bytes={} total_items={} estimated_monthly_cost={:.4}",
            root.display(),
            stats.total_archived_bytes,
            stats.total_items,
            stats.estimated_monthly_cost
        ));
    }
}
