use anyhow::Result;

use crate::commands::{CommandReport, VaultContext};
use crate::error::VaultError;
use crate::vault::aggregate::aggregate;
use crate::vault::ledger::LedgerShard;

pub fn run(ctx: &VaultContext, id: &str, text: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("note");
    let roots = ctx.registry.load()?;
    let view = aggregate(&roots, &ctx.paths.legacy_ledger);
    if view.legacy {
        report.issue("only the legacy ledger is reachable; it is read-only");
        return Ok(report);
    }
    let Some(item) = view.find(id) else {
        let err = VaultError::UnknownEntry(id.to_string());
        report.issue(format!("[{}] {err}", err.code().as_str()));
        return Ok(report);
    };

    let shard = LedgerShard::for_staging_root(&item.source);
    let note = Some(text.to_string());
    shard.update(|ledger| ledger.set_note(id, note))?;
    report.detail(format!("note updated id={id} shard={}", shard.path().display()));
    Ok(report)
}
