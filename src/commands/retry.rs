use anyhow::Result;
use std::path::PathBuf;

use crate::commands::archive::{ArchiveOptions, run_cycles};
use crate::commands::{CommandReport, Confirm, VaultContext};
use crate::vault::engine::BackupEngine;
use crate::vault::events::Notifier;
use crate::vault::ledger::EntryStatus;

#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub root: Option<PathBuf>,
    pub yes: bool,
}

/// Resubmit `failed` entries through a fresh cycle. Never runs on its own.
pub fn run(
    ctx: &VaultContext,
    opts: &RetryOptions,
    engine: &dyn BackupEngine,
    confirm: &dyn Confirm,
    notifier: &dyn Notifier,
) -> Result<CommandReport> {
    let archive_opts = ArchiveOptions {
        root: opts.root.clone(),
        keep_local: false,
        yes: opts.yes,
        dry_run: false,
    };
    run_cycles(
        ctx,
        "retry",
        EntryStatus::Failed,
        &archive_opts,
        engine,
        confirm,
        notifier,
    )
}
