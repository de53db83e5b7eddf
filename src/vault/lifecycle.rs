//! Archive lifecycle controller.
//!
//! One cycle takes the submittable entries of a single staging root through
//! `archiving`, one shared snapshot, verification and optional local deletion.
//! The batch shares its fate up to verification: either every entry becomes
//! `archived` or every entry becomes `failed` and nothing local is touched.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::VaultError;
use crate::vault::canonical::Canonicalizer;
use crate::vault::engine::BackupEngine;
use crate::vault::ledger::{
    ArchiveEntry, EntryStatus, LedgerShard, LedgerStatistics, TransitionFields,
};
use crate::vault::util::{now_utc, remove_path};
use crate::vault::warn::{self, WarnEvent};

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub delete_local: bool,
    pub deep_check: bool,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub id: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub shard: PathBuf,
    pub snapshot_ref: Option<String>,
    pub archived: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
    pub deletion_failures: Vec<(String, String)>,
    pub failure: Option<VaultError>,
    pub statistics: Option<LedgerStatistics>,
}

impl CycleOutcome {
    fn empty(shard: PathBuf) -> Self {
        Self {
            shard,
            snapshot_ref: None,
            archived: Vec::new(),
            deleted: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            deletion_failures: Vec::new(),
            failure: None,
            statistics: None,
        }
    }

    /// Present when the archive succeeded but some local copies remain.
    pub fn partial_deletion(&self) -> Option<VaultError> {
        if self.deletion_failures.is_empty() {
            return None;
        }
        Some(VaultError::PartialDeletion {
            failures: self.deletion_failures.clone(),
        })
    }
}

/// Snapshot tag attributing a snapshot to its source root.
pub fn root_tag(canonical_root: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_root.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("root:{}", &digest[..12])
}

fn failure_message(err: &VaultError) -> String {
    format!("[{}] {err}", err.code().as_str())
}

pub struct ArchiveController<'a> {
    engine: &'a dyn BackupEngine,
    canonicalizer: &'a Canonicalizer,
    cost: &'a dyn Fn(u64) -> f64,
    options: CycleOptions,
}

impl<'a> ArchiveController<'a> {
    pub fn new(
        engine: &'a dyn BackupEngine,
        canonicalizer: &'a Canonicalizer,
        cost: &'a dyn Fn(u64) -> f64,
        options: CycleOptions,
    ) -> Self {
        Self {
            engine,
            canonicalizer,
            cost,
            options,
        }
    }

    /// Entries left in `archiving` can only come from an interrupted run.
    /// Resolve them to `failed` so they can be resubmitted.
    pub fn recover_interrupted(&self, shard: &LedgerShard) -> Result<Vec<String>> {
        let dangling = shard
            .load()?
            .ledger
            .entries()
            .iter()
            .filter(|e| e.status == EntryStatus::Archiving)
            .map(|e| e.id.clone())
            .collect::<Vec<_>>();
        let at = now_utc();
        for id in &dangling {
            shard.transition(
                id,
                EntryStatus::Failed,
                TransitionFields::at(at)
                    .with_error("archive cycle was interrupted before verification"),
            )?;
            tracing::warn!(entry = %id, shard = %shard.path().display(), "resolved interrupted entry to failed");
        }
        Ok(dangling)
    }

    /// Snapshot, verify and (optionally) delete the given entries of one shard.
    pub fn run_archive_cycle(&self, shard: &LedgerShard, ids: &[String]) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::empty(shard.path().to_path_buf());
        let ledger = shard.load()?.ledger;

        let mut batch: Vec<(ArchiveEntry, PathBuf)> = Vec::new();
        for id in ids {
            let entry = ledger
                .get(id)
                .cloned()
                .ok_or_else(|| VaultError::UnknownEntry(id.clone()))?;
            if !entry.status.is_submittable() {
                outcome.skipped.push(SkippedEntry {
                    id: entry.id,
                    reason: format!("status {} cannot be submitted", entry.status),
                });
                continue;
            }
            let local = match self.canonicalizer.local_path(&entry.staged_location) {
                Ok(local) if local.exists() => local,
                Ok(local) => {
                    self.skip_missing(&mut outcome, &entry, &format!("{} is gone", local.display()));
                    continue;
                }
                Err(err) => {
                    self.skip_missing(&mut outcome, &entry, &err.to_string());
                    continue;
                }
            };
            batch.push((entry, local));
        }

        if batch.is_empty() {
            return Ok(outcome);
        }

        let batch_ids = batch.iter().map(|(e, _)| e.id.clone()).collect::<Vec<_>>();
        let started = now_utc();
        shard.update(|ledger| {
            for id in &batch_ids {
                ledger.transition(id, EntryStatus::Archiving, TransitionFields::at(started))?;
            }
            Ok(())
        })?;

        let roots = batch
            .iter()
            .map(|(e, _)| e.staged_location.root.as_str())
            .collect::<std::collections::BTreeSet<_>>();
        let mut tags = vec![self.options.tag.clone()];
        tags.extend(roots.into_iter().map(root_tag));
        let paths = batch.iter().map(|(_, p)| p.clone()).collect::<Vec<_>>();

        let snapshot_ref = match self.snapshot_and_verify(&paths, &tags) {
            Ok(snapshot_ref) => snapshot_ref,
            Err(err) => {
                let message = failure_message(&err);
                let at = now_utc();
                shard.update(|ledger| {
                    for id in &batch_ids {
                        ledger.transition(
                            id,
                            EntryStatus::Failed,
                            TransitionFields::at(at).with_error(message.clone()),
                        )?;
                    }
                    Ok(())
                })?;
                warn::emit(WarnEvent {
                    code: err.code().as_str(),
                    stage: "archive",
                    action: "snapshot-and-verify",
                    entry: &batch_ids.join(","),
                    root: &shard.staging_root().display().to_string(),
                    reason: "batch-failed",
                    err: &err.to_string(),
                });
                outcome.failed = batch_ids;
                outcome.failure = Some(err);
                return Ok(outcome);
            }
        };

        let archived_at = now_utc();
        let cost = self.cost;
        let statistics = shard.update(|ledger| {
            for id in &batch_ids {
                ledger.transition(
                    id,
                    EntryStatus::Archived,
                    TransitionFields::at(archived_at).with_snapshot(snapshot_ref.clone()),
                )?;
            }
            ledger.recompute_statistics(cost);
            Ok(ledger.statistics.clone())
        })?;
        outcome.snapshot_ref = Some(snapshot_ref.clone());
        outcome.archived = batch_ids.clone();
        outcome.statistics = Some(statistics);
        tracing::info!(
            shard = %shard.path().display(),
            snapshot = %snapshot_ref,
            entries = batch_ids.len(),
            "batch archived and verified"
        );

        if !self.options.delete_local {
            return Ok(outcome);
        }

        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for (entry, local) in &batch {
            match remove_path(local) {
                Ok(()) => removed.push(entry.id.clone()),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn::emit(WarnEvent {
                        code: VaultError::PartialDeletion { failures: Vec::new() }
                            .code()
                            .as_str(),
                        stage: "archive",
                        action: "delete-local",
                        entry: &entry.id,
                        root: &shard.staging_root().display().to_string(),
                        reason: "local-delete-failed",
                        err: &message,
                    });
                    failures.push((entry.id.clone(), message));
                }
            }
        }

        let deleted_at = now_utc();
        let statistics = shard.update(|ledger| {
            for id in &removed {
                ledger.transition(
                    id,
                    EntryStatus::ArchivedAndDeleted,
                    TransitionFields::at(deleted_at),
                )?;
            }
            for (id, message) in &failures {
                ledger.record_deletion_failure(id, message.clone())?;
            }
            ledger.recompute_statistics(cost);
            Ok(ledger.statistics.clone())
        })?;
        outcome.deleted = removed;
        outcome.deletion_failures = failures;
        outcome.statistics = Some(statistics);
        Ok(outcome)
    }

    fn skip_missing(&self, outcome: &mut CycleOutcome, entry: &ArchiveEntry, reason: &str) {
        warn::emit(WarnEvent {
            code: "STAGED_COPY_MISSING",
            stage: "archive",
            action: "precondition",
            entry: &entry.id,
            root: &entry.staged_location.root,
            reason: "staged-location-missing",
            err: reason,
        });
        outcome.skipped.push(SkippedEntry {
            id: entry.id.clone(),
            reason: format!("staged copy missing: {reason}"),
        });
    }

    /// Create the shared snapshot, then require both the engine's integrity
    /// check and the snapshot's presence in the listing.
    fn snapshot_and_verify(
        &self,
        paths: &[PathBuf],
        tags: &[String],
    ) -> std::result::Result<String, VaultError> {
        let created = self.engine.create_snapshot(paths, tags)?;
        let snapshot_ref = created.snapshot_id;

        let check = self.engine.check_repository(self.options.deep_check)?;
        if !check.ok {
            return Err(VaultError::VerificationFailed(format!(
                "repository check failed after snapshot {snapshot_ref}: {}",
                check.details.trim()
            )));
        }

        let listed = self.engine.list_snapshots()?;
        if !listed.iter().any(|s| s.matches(&snapshot_ref)) {
            return Err(VaultError::VerificationFailed(format!(
                "snapshot {snapshot_ref} is missing from the repository listing"
            )));
        }
        Ok(snapshot_ref)
    }
}
