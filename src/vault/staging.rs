//! Staging-root resolution and the stage operation.
//!
//! Every volume or share gets exactly one staging directory, a fixed name
//! directly under its root. Staging an item is a rename within that volume,
//! so it is instantaneous and needs no extra space.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::VaultError;
use crate::vault::canonical::{CanonicalPath, Canonicalizer};
use crate::vault::ledger::{ArchiveEntry, LedgerShard};
use crate::vault::registry::RootRegistry;
use crate::vault::util::{disk_usage, now_utc};

/// Sub-directory of a staging root holding the staged items themselves.
pub const STAGED_FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRoot {
    pub canonical: CanonicalPath,
    pub local: PathBuf,
}

impl StagingRoot {
    pub fn shard(&self) -> LedgerShard {
        LedgerShard::for_staging_root(&self.local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub created: bool,
    pub registered: bool,
}

pub struct StagingResolver<'a> {
    canonicalizer: &'a Canonicalizer,
    registry: &'a RootRegistry,
    dir_name: String,
}

impl<'a> StagingResolver<'a> {
    pub fn new(
        canonicalizer: &'a Canonicalizer,
        registry: &'a RootRegistry,
        dir_name: impl Into<String>,
    ) -> Self {
        Self {
            canonicalizer,
            registry,
            dir_name: dir_name.into(),
        }
    }

    /// The staging root for a canonical volume or share root.
    pub fn resolve_staging_root(&self, canonical_root: &str) -> Result<StagingRoot, VaultError> {
        let canonical = CanonicalPath::new(canonical_root, self.dir_name.clone());
        let local = self.canonicalizer.local_path(&canonical)?;
        Ok(StagingRoot { canonical, local })
    }

    /// Create the staging directory and its empty shard if needed. A root is
    /// registered only when this call created its shard, and only after the
    /// shard is on disk.
    pub fn provision(&self, root: &StagingRoot) -> Result<ProvisionOutcome> {
        fs::create_dir_all(&root.local)
            .with_context(|| format!("failed to create {}", root.local.display()))?;
        let created = root.shard().create_if_absent(now_utc())?;
        if !created {
            return Ok(ProvisionOutcome {
                created: false,
                registered: false,
            });
        }
        let registered = self.registry.register(&root.local)?;
        tracing::info!(root = %root.canonical, local = %root.local.display(), "provisioned staging root");
        Ok(ProvisionOutcome {
            created,
            registered,
        })
    }

    /// Move `source` into its volume's staging root and record it as staged.
    pub fn stage(&self, source: &Path, note: Option<String>) -> Result<ArchiveEntry> {
        let original = self.canonicalizer.canonicalize(source)?;
        if original.relative.is_empty() {
            return Err(VaultError::invalid_path(
                source.display().to_string(),
                "cannot stage the root of a volume or share",
            )
            .into());
        }

        let staging = self.resolve_staging_root(&original.root)?;
        if staging.canonical.contains(&original) {
            return Err(VaultError::invalid_path(
                source.display().to_string(),
                "path is already inside the staging root",
            )
            .into());
        }
        self.provision(&staging)?;

        let source_local = self.canonicalizer.local_path(&original)?;
        let usage = disk_usage(&source_local)?;

        let staged = staging
            .canonical
            .join(STAGED_FILES_DIR)
            .join(&original.relative);
        let staged_local = self.canonicalizer.local_path(&staged)?;
        if fs::symlink_metadata(&staged_local).is_ok() {
            return Err(VaultError::invalid_path(
                source.display().to_string(),
                format!("an item is already staged at {}", staged_local.display()),
            )
            .into());
        }
        if let Some(parent) = staged_local.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::rename(&source_local, &staged_local).with_context(|| {
            format!(
                "failed to move {} to {}",
                source_local.display(),
                staged_local.display()
            )
        })?;

        let entry = ArchiveEntry::staged(
            original,
            staged,
            now_utc(),
            usage.size_bytes,
            usage.item_count,
            note.filter(|n| !n.trim().is_empty()),
        );
        if let Err(err) = staging.shard().append(entry.clone()) {
            if let Err(undo) = fs::rename(&staged_local, &source_local) {
                tracing::error!(
                    staged = %staged_local.display(),
                    original = %source_local.display(),
                    error = %undo,
                    "ledger append failed and the item could not be moved back"
                );
            }
            return Err(err);
        }

        tracing::info!(
            entry = %entry.id,
            original = %entry.original_location,
            staged = %entry.staged_location,
            size_bytes = entry.size_bytes,
            item_count = entry.item_count,
            "staged item"
        );
        Ok(entry)
    }
}
