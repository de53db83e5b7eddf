//! Reconciles ledger records against the repository's own snapshot list.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::vault::aggregate::AggregatedView;
use crate::vault::engine::RemoteSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    /// Archived entry whose reference matches no remote snapshot.
    DanglingReference { entry_id: String, snapshot_ref: String },
    /// Archived entry without any reference.
    MissingReference { entry_id: String },
    /// Remote snapshot no archived entry refers to.
    OrphanSnapshot { snapshot_id: String, paths: Vec<String> },
}

impl Issue {
    pub fn severity(&self) -> Severity {
        match self {
            Self::DanglingReference { .. } => Severity::Error,
            Self::MissingReference { .. } => Severity::Warning,
            Self::OrphanSnapshot { .. } => Severity::Info,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::DanglingReference {
                entry_id,
                snapshot_ref,
            } => format!("entry {entry_id} references snapshot {snapshot_ref} which is not in the repository"),
            Self::MissingReference { entry_id } => {
                format!("entry {entry_id} is archived but has no snapshot reference")
            }
            Self::OrphanSnapshot { snapshot_id, paths } => format!(
                "snapshot {snapshot_id} is not referenced by any entry ({})",
                if paths.is_empty() {
                    "no paths".to_string()
                } else {
                    paths.join(", ")
                }
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub passed: bool,
    pub repository_check_ok: bool,
    pub archived_entries: usize,
    pub remote_snapshots: usize,
    pub issues: Vec<Issue>,
}

impl AuditReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity() == severity)
            .count()
    }
}

/// Compare archived entries with the remote listing. Never fails; passing
/// requires no error-severity issue and a passing repository check.
pub fn audit(
    view: &AggregatedView,
    snapshots: &[RemoteSnapshot],
    repository_check_ok: bool,
) -> AuditReport {
    let mut issues = Vec::new();
    let mut referenced: BTreeSet<usize> = BTreeSet::new();
    let mut archived_entries = 0usize;

    for entry in view.entries().filter(|e| e.status.is_archived()) {
        archived_entries += 1;
        let Some(reference) = entry.snapshot_ref.as_deref() else {
            issues.push(Issue::MissingReference {
                entry_id: entry.id.clone(),
            });
            continue;
        };
        let matched = snapshots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.matches(reference))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if matched.is_empty() {
            issues.push(Issue::DanglingReference {
                entry_id: entry.id.clone(),
                snapshot_ref: reference.to_string(),
            });
        }
        referenced.extend(matched);
    }

    for (index, snapshot) in snapshots.iter().enumerate() {
        if !referenced.contains(&index) {
            issues.push(Issue::OrphanSnapshot {
                snapshot_id: snapshot.short_id.clone(),
                paths: snapshot.paths.clone(),
            });
        }
    }

    issues.sort_by(|a, b| b.severity().cmp(&a.severity()));
    let passed = repository_check_ok && !issues.iter().any(|i| i.severity() == Severity::Error);
    AuditReport {
        passed,
        repository_check_ok,
        archived_entries,
        remote_snapshots: snapshots.len(),
        issues,
    }
}
