pub mod archive;
pub mod list;
pub mod note;
pub mod restore;
pub mod retry;
pub mod roots;
pub mod stage;
pub mod status;
pub mod verify;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, BufRead, Write};

use crate::vault::canonical::{Canonicalizer, MountTable};
use crate::vault::config::{VaultConfig, load_config};
use crate::vault::ledger::EntryStatus;
use crate::vault::paths::{VaultPaths, resolve_paths};
use crate::vault::registry::RootRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    /// Machine-readable payload printed by `--json`.
    pub fn attach(&mut self, data: &impl Serialize) -> Result<()> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(())
    }
}

/// Everything a command needs, loaded fresh on every invocation.
#[derive(Debug, Clone)]
pub struct VaultContext {
    pub paths: VaultPaths,
    pub config: VaultConfig,
    pub canonicalizer: Canonicalizer,
    pub registry: RootRegistry,
}

impl VaultContext {
    pub fn load() -> Result<Self> {
        let paths = resolve_paths()?;
        let config = load_config(&paths)?;
        Ok(Self::with(paths, config))
    }

    pub fn with(paths: VaultPaths, config: VaultConfig) -> Self {
        let canonicalizer = Canonicalizer::new(MountTable::load(&config.staging.mounts_file));
        let registry = RootRegistry::at(&paths.registry_file);
        Self {
            paths,
            config,
            canonicalizer,
            registry,
        }
    }

    pub fn cost(&self) -> impl Fn(u64) -> f64 + '_ {
        move |bytes| self.config.cost.estimate(bytes)
    }
}

/// Whether an entry in `status` can still be staged or resubmitted, or is
/// already held by the remote archive.
pub fn safety_label(status: EntryStatus) -> &'static str {
    if status.is_archived() {
        "already archived"
    } else {
        "safe to re-stage"
    }
}

/// Operator approval for a batch about to be archived.
pub trait Confirm {
    fn confirm(&self, candidates: usize, total_bytes: u64) -> Result<bool>;
}

/// `--yes`.
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _candidates: usize, _total_bytes: u64) -> Result<bool> {
        Ok(true)
    }
}

pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, candidates: usize, total_bytes: u64) -> Result<bool> {
        let mut stderr = io::stderr();
        write!(
            stderr,
            "archive {candidates} item(s), {} total? [y/N] ",
            crate::vault::util::human_bytes(total_bytes)
        )?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("failed to read confirmation")?;
        Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_marks_report_failed() {
        let mut report = CommandReport::new("status");
        report.detail("roots=0");
        assert!(report.ok);
        report.issue("broken");
        assert!(!report.ok);
        assert_eq!(report.issues, vec!["broken".to_string()]);
    }

    #[test]
    fn safety_labels_split_on_archive() {
        assert_eq!(safety_label(EntryStatus::Failed), "safe to re-stage");
        assert_eq!(safety_label(EntryStatus::Staged), "safe to re-stage");
        assert_eq!(safety_label(EntryStatus::Archived), "already archived");
    }
}
