use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use crate::commands::{CommandReport, VaultContext};
use crate::vault::aggregate::load_shards;

#[derive(Debug, Clone, Serialize)]
struct RootState {
    root: PathBuf,
    reachable: bool,
    entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn run(ctx: &VaultContext) -> Result<CommandReport> {
    let mut report = CommandReport::new("roots");
    let roots = ctx.registry.load()?;
    report.detail(format!("registry={}", ctx.paths.registry_file.display()));

    let states = load_shards(&roots)
        .into_iter()
        .map(|(root, loaded)| match loaded {
            Ok(loaded) => RootState {
                root,
                reachable: true,
                entries: loaded.ledger.entries().len(),
                error: None,
            },
            Err(err) => RootState {
                root,
                reachable: false,
                entries: 0,
                error: Some(err.to_string()),
            },
        })
        .collect::<Vec<_>>();

    for state in &states {
        match &state.error {
            None => report.detail(format!(
                "root={} reachable=true entries={}",
                state.root.display(),
                state.entries
            )),
            Some(err) => report.detail(format!(
                "root={} reachable=false error={err}",
                state.root.display()
            )),
        }
    }
    if states.is_empty() {
        report.detail("no staging roots registered");
    }

    report.attach(&states)?;
    Ok(report)
}
