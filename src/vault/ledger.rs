//! Tracking ledger: the per-staging-root record of every staged item.
//!
//! A shard is one pretty-printed JSON document holding `version`, `created`,
//! `archives` and `statistics`. Every mutation reloads the whole document,
//! applies the change in memory and atomically replaces the file, so a crash
//! leaves either the previous or the next version on disk, never a mix.
//!
//! Status changes go through [`Ledger::transition`], which consults the one
//! transition table below. Records that violate the entry invariants on load
//! are set aside in a quarantine file rather than repaired.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::VaultError;
use crate::vault::canonical::CanonicalPath;

pub const LEDGER_VERSION: u32 = 1;
pub const SHARD_FILE_NAME: &str = "ledger.json";
const QUARANTINE_SUFFIX: &str = "quarantine.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Staged,
    Archiving,
    Archived,
    ArchivedAndDeleted,
    Failed,
}

/// Every permitted status change. Retaining an archived item is the absence
/// of a transition, so it has no row here.
const TRANSITIONS: &[(EntryStatus, EntryStatus)] = &[
    (EntryStatus::Staged, EntryStatus::Archiving),
    (EntryStatus::Archiving, EntryStatus::Archived),
    (EntryStatus::Archiving, EntryStatus::Failed),
    (EntryStatus::Archived, EntryStatus::ArchivedAndDeleted),
    (EntryStatus::Failed, EntryStatus::Archiving),
];

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Staged,
        EntryStatus::Archiving,
        EntryStatus::Archived,
        EntryStatus::ArchivedAndDeleted,
        EntryStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Archiving => "archiving",
            Self::Archived => "archived",
            Self::ArchivedAndDeleted => "archived_and_deleted",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    /// The remote copy exists and was verified.
    pub fn is_archived(self) -> bool {
        matches!(self, Self::Archived | Self::ArchivedAndDeleted)
    }

    /// Entries an archive cycle may pick up.
    pub fn is_submittable(self) -> bool {
        matches!(self, Self::Staged | Self::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        EntryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == needle)
            .ok_or_else(|| {
                format!(
                    "unknown status `{s}`; expected one of {}",
                    EntryStatus::ALL.map(EntryStatus::as_str).join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: String,
    pub original_location: CanonicalPath,
    pub staged_location: CanonicalPath,
    pub staged_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub snapshot_ref: Option<String>,
    pub size_bytes: u64,
    pub item_count: u64,
    pub status: EntryStatus,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_error: Option<String>,
}

pub fn new_entry_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ArchiveEntry {
    pub fn staged(
        original_location: CanonicalPath,
        staged_location: CanonicalPath,
        staged_at: DateTime<Utc>,
        size_bytes: u64,
        item_count: u64,
        note: Option<String>,
    ) -> Self {
        Self {
            id: new_entry_id(),
            original_location,
            staged_location,
            staged_at,
            archived_at: None,
            deleted_at: None,
            snapshot_ref: None,
            size_bytes,
            item_count,
            status: EntryStatus::Staged,
            note,
            last_error: None,
            deletion_error: None,
        }
    }

    /// Check the cross-field invariants tying timestamps and the snapshot
    /// reference to the status.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("empty id".to_string());
        }
        let archived = self.status.is_archived();
        let deleted = self.status == EntryStatus::ArchivedAndDeleted;
        if self.snapshot_ref.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err("empty snapshot_ref".to_string());
        }
        if self.snapshot_ref.is_some() != archived {
            return Err(format!(
                "snapshot_ref {} but status is {}",
                if self.snapshot_ref.is_some() { "set" } else { "missing" },
                self.status
            ));
        }
        if self.archived_at.is_some() != archived {
            return Err(format!(
                "archived_at {} but status is {}",
                if self.archived_at.is_some() { "set" } else { "missing" },
                self.status
            ));
        }
        if self.deleted_at.is_some() != deleted {
            return Err(format!(
                "deleted_at {} but status is {}",
                if self.deleted_at.is_some() { "set" } else { "missing" },
                self.status
            ));
        }
        if let (Some(archived_at), Some(deleted_at)) = (self.archived_at, self.deleted_at) {
            if deleted_at < archived_at {
                return Err("deleted_at precedes archived_at".to_string());
            }
        }
        Ok(())
    }
}

/// Values a transition may stamp onto the entry.
#[derive(Debug, Clone)]
pub struct TransitionFields {
    pub at: DateTime<Utc>,
    pub snapshot_ref: Option<String>,
    pub error: Option<String>,
}

impl TransitionFields {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            snapshot_ref: None,
            error: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_ref: impl Into<String>) -> Self {
        self.snapshot_ref = Some(snapshot_ref.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerStatistics {
    pub total_archived_bytes: u64,
    pub total_items: u64,
    pub total_files: u64,
    pub last_archive_date: Option<DateTime<Utc>>,
    pub estimated_monthly_cost: f64,
}

impl LedgerStatistics {
    /// Roll up every archived entry from scratch.
    pub fn compute(entries: &[ArchiveEntry], cost: &dyn Fn(u64) -> f64) -> Self {
        let mut out = Self::default();
        for entry in entries.iter().filter(|e| e.status.is_archived()) {
            out.total_archived_bytes += entry.size_bytes;
            out.total_items += 1;
            out.total_files += entry.item_count;
            out.last_archive_date = out.last_archive_date.max(entry.archived_at);
        }
        out.estimated_monthly_cost = cost(out.total_archived_bytes);
        out
    }

    pub fn absorb(&mut self, other: &LedgerStatistics) {
        self.total_archived_bytes += other.total_archived_bytes;
        self.total_items += other.total_items;
        self.total_files += other.total_files;
        self.last_archive_date = self.last_archive_date.max(other.last_archive_date);
        self.estimated_monthly_cost += other.estimated_monthly_cost;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub version: u32,
    pub created: DateTime<Utc>,
    archives: Vec<ArchiveEntry>,
    pub statistics: LedgerStatistics,
}

impl Ledger {
    pub fn new(created: DateTime<Utc>) -> Self {
        Self {
            version: LEDGER_VERSION,
            created,
            archives: Vec::new(),
            statistics: LedgerStatistics::default(),
        }
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.archives
    }

    pub fn get(&self, id: &str) -> Option<&ArchiveEntry> {
        self.archives.iter().find(|e| e.id == id)
    }

    fn get_mut(&mut self, id: &str) -> std::result::Result<&mut ArchiveEntry, VaultError> {
        self.archives
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| VaultError::UnknownEntry(id.to_string()))
    }

    pub fn append(&mut self, entry: ArchiveEntry) -> std::result::Result<(), VaultError> {
        if self.get(&entry.id).is_some() {
            return Err(VaultError::InvalidTransition {
                id: entry.id,
                from: EntryStatus::Staged,
                to: EntryStatus::Staged,
                reason: "id already present in this shard".to_string(),
            });
        }
        if entry.status != EntryStatus::Staged {
            return Err(VaultError::InvalidTransition {
                id: entry.id,
                from: entry.status,
                to: entry.status,
                reason: "new entries must start as staged".to_string(),
            });
        }
        if let Err(reason) = entry.validate() {
            return Err(VaultError::InvalidTransition {
                id: entry.id,
                from: entry.status,
                to: entry.status,
                reason,
            });
        }
        self.archives.push(entry);
        Ok(())
    }

    /// Move entry `id` to `to`, stamping the fields that transition owns.
    pub fn transition(
        &mut self,
        id: &str,
        to: EntryStatus,
        fields: TransitionFields,
    ) -> std::result::Result<&ArchiveEntry, VaultError> {
        let entry = self.get_mut(id)?;
        let from = entry.status;
        let reject = |reason: &str| VaultError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
            reason: reason.to_string(),
        };
        if !from.can_transition_to(to) {
            return Err(reject("not in the transition table"));
        }

        match to {
            EntryStatus::Archiving => {
                entry.last_error = None;
                entry.deletion_error = None;
            }
            EntryStatus::Archived => {
                let snapshot_ref = fields
                    .snapshot_ref
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| reject("archiving requires a snapshot reference"))?;
                entry.snapshot_ref = Some(snapshot_ref);
                entry.archived_at = Some(fields.at);
            }
            EntryStatus::Failed => {
                entry.snapshot_ref = None;
                entry.last_error = fields.error;
            }
            EntryStatus::ArchivedAndDeleted => {
                entry.deleted_at = Some(fields.at);
                entry.deletion_error = None;
            }
            EntryStatus::Staged => {}
        }
        entry.status = to;
        tracing::info!(entry = id, from = %from, to = %to, "ledger transition");
        Ok(&*entry)
    }

    pub fn set_note(
        &mut self,
        id: &str,
        note: Option<String>,
    ) -> std::result::Result<(), VaultError> {
        let entry = self.get_mut(id)?;
        entry.note = note.filter(|n| !n.trim().is_empty());
        Ok(())
    }

    /// Record that removing the local copy of an archived entry failed. The
    /// entry keeps its archived status.
    pub fn record_deletion_failure(
        &mut self,
        id: &str,
        error: impl Into<String>,
    ) -> std::result::Result<(), VaultError> {
        let entry = self.get_mut(id)?;
        if entry.status != EntryStatus::Archived {
            return Err(VaultError::InvalidTransition {
                id: id.to_string(),
                from: entry.status,
                to: entry.status,
                reason: "deletion failures are only recorded on archived entries".to_string(),
            });
        }
        entry.deletion_error = Some(error.into());
        Ok(())
    }

    pub fn recompute_statistics(&mut self, cost: &dyn Fn(u64) -> f64) {
        self.statistics = LedgerStatistics::compute(&self.archives, cost);
    }
}

/// A record set aside on load together with the reason.
#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub index: usize,
    pub reason: String,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct LoadedLedger {
    pub ledger: Ledger,
    pub rejected: Vec<RejectedRecord>,
}

#[derive(Debug, Deserialize)]
struct RawLedger {
    version: u32,
    created: DateTime<Utc>,
    #[serde(default)]
    archives: Vec<Value>,
    #[serde(default)]
    statistics: LedgerStatistics,
}

fn parse_ledger(raw: &str) -> std::result::Result<LoadedLedger, String> {
    let doc: RawLedger = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    if doc.version > LEDGER_VERSION {
        return Err(format!(
            "ledger version {} is newer than supported version {LEDGER_VERSION}",
            doc.version
        ));
    }

    let mut archives: Vec<ArchiveEntry> = Vec::with_capacity(doc.archives.len());
    let mut rejected = Vec::new();
    for (index, value) in doc.archives.into_iter().enumerate() {
        let parsed = serde_json::from_value::<ArchiveEntry>(value.clone())
            .map_err(|err| err.to_string())
            .and_then(|entry| entry.validate().map(|_| entry));
        match parsed {
            Ok(entry) if archives.iter().any(|e| e.id == entry.id) => {
                rejected.push(RejectedRecord {
                    index,
                    reason: format!("duplicate id {}", entry.id),
                    raw: value,
                });
            }
            Ok(entry) => archives.push(entry),
            Err(reason) => rejected.push(RejectedRecord {
                index,
                reason,
                raw: value,
            }),
        }
    }

    Ok(LoadedLedger {
        ledger: Ledger {
            version: LEDGER_VERSION,
            created: doc.created,
            archives,
            statistics: doc.statistics,
        },
        rejected,
    })
}

/// Read a ledger file without side effects; rejected records are reported,
/// not quarantined.
pub fn read_ledger_file(path: &Path) -> std::result::Result<LoadedLedger, VaultError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| VaultError::LedgerLoad(format!("{}: {err}", path.display())))?;
    parse_ledger(&raw).map_err(|err| VaultError::LedgerLoad(format!("{}: {err}", path.display())))
}

/// One ledger shard on disk.
#[derive(Debug, Clone)]
pub struct LedgerShard {
    path: PathBuf,
}

impl LedgerShard {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The shard owned by a staging root directory.
    pub fn for_staging_root(staging_root: &Path) -> Self {
        Self::at(staging_root.join(SHARD_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the shard lives in, which is its staging root.
    pub fn staging_root(&self) -> &Path {
        self.path.parent().unwrap_or(self.path.as_path())
    }

    pub fn quarantine_path(&self) -> PathBuf {
        let name = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("ledger");
        self.path.with_file_name(format!("{name}.{QUARANTINE_SUFFIX}"))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<LoadedLedger> {
        Ok(read_ledger_file(&self.path)?)
    }

    /// Write the shard atomically: temp file in the same directory, then rename.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("ledger path {} has no parent", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let data = serde_json::to_string_pretty(ledger)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
        tmp.write_all(data.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Create an empty shard unless one exists. Returns whether it was created.
    pub fn create_if_absent(&self, created: DateTime<Utc>) -> Result<bool> {
        if self.exists() {
            return Ok(false);
        }
        self.save(&Ledger::new(created))?;
        Ok(true)
    }

    fn quarantine(&self, rejected: &[RejectedRecord]) -> Result<()> {
        if rejected.is_empty() {
            return Ok(());
        }
        let path = self.quarantine_path();
        let mut existing: Vec<Value> = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Vec::new()
        };
        for record in rejected {
            tracing::warn!(
                shard = %self.path.display(),
                index = record.index,
                reason = %record.reason,
                "quarantining malformed ledger record"
            );
            existing.push(serde_json::json!({
                "reason": record.reason,
                "record": record.raw,
            }));
        }
        let data = serde_json::to_string_pretty(&existing)?;
        fs::write(&path, format!("{data}\n"))
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Read-modify-write of the whole shard.
    pub fn update<T>(
        &self,
        apply: impl FnOnce(&mut Ledger) -> std::result::Result<T, VaultError>,
    ) -> Result<T> {
        let LoadedLedger {
            mut ledger,
            rejected,
        } = self.load()?;
        self.quarantine(&rejected)?;
        let out = apply(&mut ledger)?;
        self.save(&ledger)?;
        Ok(out)
    }

    pub fn append(&self, entry: ArchiveEntry) -> Result<()> {
        self.update(|ledger| ledger.append(entry))
    }

    pub fn transition(
        &self,
        id: &str,
        to: EntryStatus,
        fields: TransitionFields,
    ) -> Result<ArchiveEntry> {
        self.update(|ledger| ledger.transition(id, to, fields).cloned())
    }
}
