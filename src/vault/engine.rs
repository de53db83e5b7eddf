use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::VaultError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl RemoteSnapshot {
    /// Short and long identifiers coexist, so references match by prefix.
    /// The short id only stands in for references no longer than itself.
    pub fn matches(&self, reference: &str) -> bool {
        let reference = reference.trim();
        if reference.is_empty() {
            return false;
        }
        self.id.starts_with(reference)
            || (!self.id.is_empty() && reference.starts_with(&self.id))
            || (!self.short_id.is_empty()
                && reference.len() <= self.short_id.len()
                && reference.starts_with(&self.short_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCreated {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryCheck {
    pub ok: bool,
    pub details: String,
}

/// The external content-addressed backup tool.
pub trait BackupEngine {
    fn create_snapshot(
        &self,
        paths: &[PathBuf],
        tags: &[String],
    ) -> Result<SnapshotCreated, VaultError>;

    /// `Err` means the check could not run; a check that ran and found
    /// problems is `Ok` with `ok == false`.
    fn check_repository(&self, deep: bool) -> Result<RepositoryCheck, VaultError>;

    fn list_snapshots(&self) -> Result<Vec<RemoteSnapshot>, VaultError>;

    fn restore(&self, snapshot_id: &str, target: &Path, include: &Path)
    -> Result<(), VaultError>;
}

/// [`BackupEngine`] backed by the `restic` command line. Repository location
/// and credentials come from restic's own environment variables.
#[derive(Debug, Clone)]
pub struct ResticEngine {
    bin: PathBuf,
}

fn resolve_engine_bin(bin: &Path) -> Result<PathBuf, VaultError> {
    if bin.components().count() > 1 || bin.is_absolute() {
        if bin.exists() {
            return Ok(bin.to_path_buf());
        }
        return Err(VaultError::EngineInvocation(format!(
            "backup engine binary not found at {}",
            bin.display()
        )));
    }
    which::which(bin).map_err(|err| {
        VaultError::EngineInvocation(format!(
            "backup engine `{}` not found on PATH: {err}",
            bin.display()
        ))
    })
}

fn output_failure(what: &str, out: &Output) -> VaultError {
    VaultError::EngineInvocation(format!(
        "{what} exited with {}\nstdout: {}\nstderr: {}",
        out.status,
        String::from_utf8_lossy(&out.stdout).trim(),
        String::from_utf8_lossy(&out.stderr).trim()
    ))
}

/// Snapshot id from `backup --json` output: the `summary` message.
fn parse_backup_summary(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter(|msg| msg.get("message_type").and_then(Value::as_str) == Some("summary"))
        .filter_map(|msg| {
            msg.get("snapshot_id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
        .find(|id| !id.trim().is_empty())
}

fn parse_snapshot_list(stdout: &str) -> Result<Vec<RemoteSnapshot>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let mut snapshots: Vec<RemoteSnapshot> =
        serde_json::from_str(trimmed).map_err(|err| err.to_string())?;
    for snapshot in &mut snapshots {
        if snapshot.id.trim().is_empty() {
            return Err("snapshot without id".to_string());
        }
        if snapshot.short_id.is_empty() {
            snapshot.short_id = snapshot.id.chars().take(8).collect();
        }
    }
    Ok(snapshots)
}

impl ResticEngine {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn run<I, S>(&self, args: I) -> Result<Output, VaultError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let bin = resolve_engine_bin(&self.bin)?;
        let args = args
            .into_iter()
            .map(|a| a.as_ref().to_os_string())
            .collect::<Vec<OsString>>();
        tracing::debug!(bin = %bin.display(), args = ?args, "invoking backup engine");
        Command::new(&bin).args(&args).output().map_err(|err| {
            VaultError::EngineInvocation(format!("failed to run `{}`: {err}", bin.display()))
        })
    }
}

impl BackupEngine for ResticEngine {
    fn create_snapshot(
        &self,
        paths: &[PathBuf],
        tags: &[String],
    ) -> Result<SnapshotCreated, VaultError> {
        if paths.is_empty() {
            return Err(VaultError::EngineInvocation(
                "refusing to create a snapshot of zero paths".to_string(),
            ));
        }
        let mut args: Vec<OsString> = vec!["backup".into(), "--json".into()];
        for tag in tags {
            args.push("--tag".into());
            args.push(tag.into());
        }
        args.extend(paths.iter().map(|p| p.as_os_str().to_os_string()));
        let out = self.run(args)?;
        if !out.status.success() {
            return Err(output_failure("restic backup", &out));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let snapshot_id = parse_backup_summary(&stdout).ok_or_else(|| {
            VaultError::EngineInvocation(
                "restic backup output had no summary with a snapshot id".to_string(),
            )
        })?;
        Ok(SnapshotCreated { snapshot_id })
    }

    fn check_repository(&self, deep: bool) -> Result<RepositoryCheck, VaultError> {
        let args: &[&str] = if deep {
            &["check", "--read-data"]
        } else {
            &["check"]
        };
        let out = self.run(args)?;
        let details = format!(
            "{}{}",
            String::from_utf8_lossy(&out.stdout).trim(),
            match String::from_utf8_lossy(&out.stderr).trim() {
                "" => String::new(),
                err => format!("\n{err}"),
            }
        );
        Ok(RepositoryCheck {
            ok: out.status.success(),
            details,
        })
    }

    fn list_snapshots(&self) -> Result<Vec<RemoteSnapshot>, VaultError> {
        let out = self.run(["snapshots", "--json"])?;
        if !out.status.success() {
            return Err(output_failure("restic snapshots", &out));
        }
        parse_snapshot_list(&String::from_utf8_lossy(&out.stdout)).map_err(|err| {
            VaultError::EngineInvocation(format!("malformed restic snapshots output: {err}"))
        })
    }

    fn restore(
        &self,
        snapshot_id: &str,
        target: &Path,
        include: &Path,
    ) -> Result<(), VaultError> {
        let out = self.run([
            OsStr::new("restore"),
            OsStr::new(snapshot_id),
            OsStr::new("--target"),
            target.as_os_str(),
            OsStr::new("--include"),
            include.as_os_str(),
        ])?;
        if !out.status.success() {
            return Err(output_failure("restic restore", &out));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    /// In-process engine with scripted outcomes.
    #[derive(Debug, Default)]
    pub(crate) struct FakeEngine {
        pub snapshot_id: String,
        pub create_error: Option<String>,
        pub check_ok: bool,
        pub check_error: Option<String>,
        pub hide_created_snapshot: bool,
        /// Delete the submitted paths while the snapshot is taken.
        pub remove_during_snapshot: bool,
        pub listed: RefCell<Vec<RemoteSnapshot>>,
        pub created_paths: RefCell<Vec<Vec<PathBuf>>>,
        pub created_tags: RefCell<Vec<Vec<String>>>,
    }

    impl FakeEngine {
        pub(crate) fn succeeding(snapshot_id: &str) -> Self {
            Self {
                snapshot_id: snapshot_id.to_string(),
                check_ok: true,
                ..Self::default()
            }
        }
    }

    pub(crate) fn remote(id: &str) -> RemoteSnapshot {
        RemoteSnapshot {
            id: id.to_string(),
            short_id: id.chars().take(8).collect(),
            time: None,
            tags: Vec::new(),
            paths: Vec::new(),
        }
    }

    impl BackupEngine for FakeEngine {
        fn create_snapshot(
            &self,
            paths: &[PathBuf],
            tags: &[String],
        ) -> Result<SnapshotCreated, VaultError> {
            self.created_paths.borrow_mut().push(paths.to_vec());
            self.created_tags.borrow_mut().push(tags.to_vec());
            if let Some(err) = &self.create_error {
                return Err(VaultError::EngineInvocation(err.clone()));
            }
            if self.remove_during_snapshot {
                for path in paths {
                    let _ = if path.is_dir() {
                        std::fs::remove_dir_all(path)
                    } else {
                        std::fs::remove_file(path)
                    };
                }
            }
            if !self.hide_created_snapshot {
                self.listed.borrow_mut().push(remote(&self.snapshot_id));
            }
            Ok(SnapshotCreated {
                snapshot_id: self.snapshot_id.clone(),
            })
        }

        fn check_repository(&self, _deep: bool) -> Result<RepositoryCheck, VaultError> {
            if let Some(err) = &self.check_error {
                return Err(VaultError::EngineInvocation(err.clone()));
            }
            Ok(RepositoryCheck {
                ok: self.check_ok,
                details: if self.check_ok {
                    "no errors were found".to_string()
                } else {
                    "pack abc: checksum mismatch".to_string()
                },
            })
        }

        fn list_snapshots(&self) -> Result<Vec<RemoteSnapshot>, VaultError> {
            Ok(self.listed.borrow().clone())
        }

        fn restore(
            &self,
            _snapshot_id: &str,
            _target: &Path,
            _include: &Path,
        ) -> Result<(), VaultError> {
            Ok(())
        }
    }
}
