use anyhow::Result;

use crate::commands::{CommandReport, VaultContext};
use crate::vault::aggregate::{SourcedEntry, aggregate};
use crate::vault::ledger::EntryStatus;
use crate::vault::util::{format_timestamp, human_bytes};

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub status: Option<EntryStatus>,
}

fn describe(item: &SourcedEntry) -> String {
    let entry = &item.entry;
    let mut line = format!(
        "{} {} {} size={} staged_at={}",
        entry.id,
        entry.status,
        entry.original_location,
        human_bytes(entry.size_bytes),
        format_timestamp(&entry.staged_at)
    );
    if let Some(snapshot) = &entry.snapshot_ref {
        line.push_str(&format!(" snapshot={snapshot}"));
    }
    if let Some(note) = &entry.note {
        line.push_str(&format!(" note={note:?}"));
    }
    if let Some(err) = entry.last_error.as_ref().or(entry.deletion_error.as_ref()) {
        line.push_str(&format!(" error={err:?}"));
    }
    line
}

pub fn run(ctx: &VaultContext, opts: &ListOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("list");
    let roots = ctx.registry.load()?;
    let view = aggregate(&roots, &ctx.paths.legacy_ledger);

    let selected = view
        .archives
        .iter()
        .filter(|item| opts.status.is_none_or(|s| item.entry.status == s))
        .collect::<Vec<_>>();
    for item in &selected {
        report.detail(describe(item));
    }
    if selected.is_empty() {
        report.detail("no entries");
    }
    for warning in &view.warnings {
        report.detail(format!("warning: {warning}"));
    }

    report.attach(&selected)?;
    Ok(report)
}
