//! Read-only merge of every reachable ledger shard into one view.
//!
//! The view is rebuilt on every query and never written back. Each entry
//! carries the staging root it came from so callers can route writes to the
//! owning shard.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::VaultError;
use crate::vault::ledger::{ArchiveEntry, LedgerShard, LedgerStatistics, LoadedLedger, read_ledger_file};
use crate::vault::warn::{self, WarnEvent};

#[derive(Debug, Clone, Serialize)]
pub struct SourcedEntry {
    #[serde(flatten)]
    pub entry: ArchiveEntry,
    #[serde(rename = "_source")]
    pub source: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedView {
    pub archives: Vec<SourcedEntry>,
    pub statistics: LedgerStatistics,
    #[serde(rename = "_sources")]
    pub sources: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// True when the view came from the pre-sharding single ledger.
    pub legacy: bool,
}

impl AggregatedView {
    pub fn find(&self, id: &str) -> Option<&SourcedEntry> {
        self.archives.iter().find(|e| e.entry.id == id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.archives.iter().map(|e| &e.entry)
    }

    fn absorb(&mut self, source: &Path, loaded: LoadedLedger) {
        for record in &loaded.rejected {
            self.warnings.push(format!(
                "{}: record {} ignored ({})",
                source.display(),
                record.index,
                record.reason
            ));
        }
        self.statistics.absorb(&loaded.ledger.statistics);
        self.sources.push(source.to_path_buf());
        self.archives
            .extend(loaded.ledger.entries().iter().cloned().map(|entry| SourcedEntry {
                entry,
                source: source.to_path_buf(),
            }));
    }

    fn flag_duplicate_ids(&mut self) {
        let mut seen: BTreeMap<&str, Vec<&Path>> = BTreeMap::new();
        for item in &self.archives {
            seen.entry(item.entry.id.as_str())
                .or_default()
                .push(item.source.as_path());
        }
        let duplicates = seen
            .into_iter()
            .filter(|(_, sources)| sources.len() > 1)
            .map(|(id, sources)| {
                let sources = sources
                    .iter()
                    .map(|s| s.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("entry id {id} appears in more than one shard: {sources}")
            })
            .collect::<Vec<_>>();
        self.warnings.extend(duplicates);
    }
}

/// Load the shard of every known staging root, one result per root.
pub fn load_shards(known_roots: &[PathBuf]) -> Vec<(PathBuf, Result<LoadedLedger, VaultError>)> {
    known_roots
        .iter()
        .map(|root| {
            let shard = LedgerShard::for_staging_root(root);
            (root.clone(), read_ledger_file(shard.path()))
        })
        .collect()
}

/// Merge every reachable shard. Unreachable shards are skipped with a
/// warning; when none is reachable the legacy single ledger is read instead.
pub fn aggregate(known_roots: &[PathBuf], legacy_ledger: &Path) -> AggregatedView {
    let mut view = load_shards(known_roots).into_iter().fold(
        AggregatedView::default(),
        |mut view, (root, loaded)| {
            match loaded {
                Ok(loaded) => view.absorb(&root, loaded),
                Err(err) => {
                    warn::emit(WarnEvent {
                        code: err.code().as_str(),
                        stage: "aggregate",
                        action: "load-shard",
                        entry: "",
                        root: &root.display().to_string(),
                        reason: "shard-unreachable",
                        err: &err.to_string(),
                    });
                    view.warnings
                        .push(format!("skipped {}: {err}", root.display()));
                }
            }
            view
        },
    );

    if view.sources.is_empty() && legacy_ledger.is_file() {
        match read_ledger_file(legacy_ledger) {
            Ok(loaded) => {
                tracing::info!(path = %legacy_ledger.display(), "no shard reachable; reading legacy ledger");
                view.absorb(legacy_ledger, loaded);
                view.legacy = true;
            }
            Err(err) => view
                .warnings
                .push(format!("skipped legacy ledger {}: {err}", legacy_ledger.display())),
        }
    }

    view.flag_duplicate_ids();
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::canonical::CanonicalPath;
    use crate::vault::ledger::{EntryStatus, Ledger, TransitionFields};
    use crate::vault::util::now_utc;
    use std::fs;
    use tempfile::tempdir;

    fn cost(bytes: u64) -> f64 {
        bytes as f64
    }

    /// A shard under `root` holding one archived entry of `bytes`.
    fn archived_shard(root: &Path, bytes: u64) -> String {
        let mut ledger = Ledger::new(now_utc());
        let entry = ArchiveEntry::staged(
            CanonicalPath::new(root.display().to_string(), "item"),
            CanonicalPath::new(root.display().to_string(), ".stage/files/item"),
            now_utc(),
            bytes,
            3,
            None,
        );
        let id = entry.id.clone();
        ledger.append(entry).expect("append");
        ledger
            .transition(&id, EntryStatus::Archiving, TransitionFields::at(now_utc()))
            .expect("archiving");
        ledger
            .transition(
                &id,
                EntryStatus::Archived,
                TransitionFields::at(now_utc()).with_snapshot("abc123"),
            )
            .expect("archived");
        ledger.recompute_statistics(&cost);
        LedgerShard::for_staging_root(root).save(&ledger).expect("save");
        id
    }

    #[test]
    fn zero_roots_and_no_legacy_is_empty() {
        let tmp = tempdir().expect("tempdir");
        let view = aggregate(&[], &tmp.path().join("tracking.json"));
        assert!(view.archives.is_empty());
        assert!(view.sources.is_empty());
        assert_eq!(view.statistics, LedgerStatistics::default());
        assert!(!view.legacy);
    }

    #[test]
    fn two_roots_sum_statistics_with_provenance() {
        let tmp = tempdir().expect("tempdir");
        let a = tmp.path().join("a/.stage");
        let b = tmp.path().join("b/.stage");
        let id_a = archived_shard(&a, 100);
        archived_shard(&b, 50);

        let view = aggregate(&[a.clone(), b.clone()], &tmp.path().join("tracking.json"));
        assert_eq!(view.statistics.total_items, 2);
        assert_eq!(view.statistics.total_archived_bytes, 150);
        assert_eq!(view.statistics.total_files, 6);
        assert_eq!(view.statistics.estimated_monthly_cost, 150.0);
        assert_eq!(view.sources, vec![a.clone(), b]);
        assert_eq!(view.find(&id_a).expect("entry").source, a);

        let json = serde_json::to_value(&view).expect("json");
        assert_eq!(json["_sources"].as_array().expect("sources").len(), 2);
        assert!(json["archives"][0]["_source"].is_string());
        assert_eq!(json["archives"][0]["status"], "archived");
    }

    #[test]
    fn unreadable_shard_is_skipped_with_warning() {
        let tmp = tempdir().expect("tempdir");
        let good = tmp.path().join("good/.stage");
        let broken = tmp.path().join("broken/.stage");
        let missing = tmp.path().join("unmounted/.stage");
        archived_shard(&good, 10);
        fs::create_dir_all(&broken).expect("mkdir");
        fs::write(broken.join("ledger.json"), "{ not json").expect("write");

        let view = aggregate(
            &[broken.clone(), good.clone(), missing],
            &tmp.path().join("tracking.json"),
        );
        assert_eq!(view.sources, vec![good]);
        assert_eq!(view.statistics.total_items, 1);
        assert_eq!(view.warnings.len(), 2);
        assert!(view.warnings[0].contains("broken"));
    }

    #[test]
    fn legacy_ledger_is_read_only_when_no_shard_is_reachable() {
        let tmp = tempdir().expect("tempdir");
        let legacy_dir = tmp.path().join("home");
        archived_shard(&legacy_dir, 42);
        let legacy = legacy_dir.join("ledger.json");

        let view = aggregate(&[tmp.path().join("gone/.stage")], &legacy);
        assert!(view.legacy);
        assert_eq!(view.statistics.total_archived_bytes, 42);
        assert_eq!(view.sources, vec![legacy.clone()]);

        let live = tmp.path().join("live/.stage");
        archived_shard(&live, 7);
        let view = aggregate(&[live.clone()], &legacy);
        assert!(!view.legacy);
        assert_eq!(view.statistics.total_archived_bytes, 7);
        assert_eq!(view.sources, vec![live]);
    }

    #[test]
    fn duplicate_ids_across_shards_are_flagged() {
        let tmp = tempdir().expect("tempdir");
        let a = tmp.path().join("a/.stage");
        let b = tmp.path().join("b/.stage");
        archived_shard(&a, 1);
        fs::create_dir_all(&b).expect("mkdir");
        fs::copy(a.join("ledger.json"), b.join("ledger.json")).expect("copy shard");

        let view = aggregate(&[a, b], &tmp.path().join("tracking.json"));
        assert_eq!(view.archives.len(), 2);
        assert!(
            view.warnings
                .iter()
                .any(|w| w.contains("appears in more than one shard"))
        );
    }
}
