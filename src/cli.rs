use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::archive::ArchiveOptions;
use crate::commands::list::ListOptions;
use crate::commands::restore::RestoreOptions;
use crate::commands::retry::RetryOptions;
use crate::commands::stage::StageOptions;
use crate::commands::verify::VerifyOptions;
use crate::commands::{
    self, AssumeYes, CommandReport, Confirm, StdinConfirm, VaultContext,
};
use crate::logging;
use crate::vault::engine::ResticEngine;
use crate::vault::events::EventLogNotifier;
use crate::vault::ledger::EntryStatus;

#[derive(Debug, Parser)]
#[command(
    name = "deepfreeze",
    version,
    about = "Stage cold files, archive them to a verified remote snapshot, and keep a ledger of where everything went"
)]
struct Cli {
    /// Print the report as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Raise log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Move items into their volume's staging root.
    Stage {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Snapshot, verify and clean up staged items.
    Archive {
        #[arg(long)]
        root: Option<PathBuf>,
        /// Keep staged copies after a verified archive.
        #[arg(long)]
        keep_local: bool,
        #[arg(long, short = 'y')]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Resubmit failed entries.
    Retry {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Aggregated statistics across all staging roots.
    Status,
    /// Ledger entries across all staging roots.
    List {
        #[arg(long)]
        status: Option<EntryStatus>,
    },
    /// Audit the ledger against the repository.
    Verify {
        /// Read back all pack data during the repository check.
        #[arg(long)]
        deep: bool,
    },
    /// Attach a note to an entry.
    Note { id: String, text: String },
    /// Restore an archived entry into a directory.
    Restore {
        id: String,
        #[arg(long)]
        target: PathBuf,
    },
    /// Registered staging roots and whether they are reachable.
    Roots,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for line in &report.details {
        println!("{line}");
    }
    for line in &report.issues {
        eprintln!("issue: {line}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let ctx = VaultContext::load()?;
    let engine = ResticEngine::new(&ctx.config.engine.bin);
    let notifier = EventLogNotifier::new(&ctx.paths.logs_dir);
    let confirm: &dyn Confirm = &StdinConfirm;

    let report = match cli.command {
        Command::Stage { paths, note } => {
            commands::stage::run(&ctx, &StageOptions { paths, note })?
        }
        Command::Archive {
            root,
            keep_local,
            yes,
            dry_run,
        } => {
            let opts = ArchiveOptions {
                root,
                keep_local,
                yes,
                dry_run,
            };
            let confirm: &dyn Confirm = if yes { &AssumeYes } else { confirm };
            commands::archive::run(&ctx, &opts, &engine, confirm, &notifier)?
        }
        Command::Retry { root, yes } => {
            let confirm: &dyn Confirm = if yes { &AssumeYes } else { confirm };
            commands::retry::run(&ctx, &RetryOptions { root, yes }, &engine, confirm, &notifier)?
        }
        Command::Status => commands::status::run(&ctx)?,
        Command::List { status } => commands::list::run(&ctx, &ListOptions { status })?,
        Command::Verify { deep } => commands::verify::run(&ctx, &VerifyOptions { deep }, &engine)?,
        Command::Note { id, text } => commands::note::run(&ctx, &id, &text)?,
        Command::Restore { id, target } => {
            commands::restore::run(&ctx, &RestoreOptions { id, target }, &engine)?
        }
        Command::Roots => commands::roots::run(&ctx)?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}
