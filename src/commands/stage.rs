use anyhow::Result;
use std::path::PathBuf;

use crate::commands::{CommandReport, VaultContext};
use crate::error::VaultError;
use crate::vault::events::append_event;
use crate::vault::staging::StagingResolver;
use crate::vault::util::human_bytes;

#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub paths: Vec<PathBuf>,
    pub note: Option<String>,
}

pub fn run(ctx: &VaultContext, opts: &StageOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("stage");
    let resolver = StagingResolver::new(
        &ctx.canonicalizer,
        &ctx.registry,
        ctx.config.staging.dir_name.clone(),
    );

    let mut staged = Vec::new();
    for path in &opts.paths {
        match resolver.stage(path, opts.note.clone()) {
            Ok(entry) => {
                report.detail(format!(
                    "staged id={} original={} staged={} size={} items={}",
                    entry.id,
                    entry.original_location,
                    entry.staged_location,
                    human_bytes(entry.size_bytes),
                    entry.item_count
                ));
                staged.push(entry);
            }
            Err(err) => match err.downcast_ref::<VaultError>() {
                Some(vault_err) => report.issue(format!(
                    "[{}] {vault_err}; skipped",
                    vault_err.code().as_str()
                )),
                None => report.issue(format!("failed to stage {}: {err:#}", path.display())),
            },
        }
    }

    if !staged.is_empty() {
        let message = format!("staged {} item(s)", staged.len());
        if let Err(err) = append_event(&ctx.paths.logs_dir, "stage", "ok", &message) {
            tracing::warn!(error = %err, "failed to append stage event");
        }
    }
    report.attach(&staged)?;
    Ok(report)
}
