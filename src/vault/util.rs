use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::path::Path;

/// Current wall-clock time, truncated to whole milliseconds so persisted
/// timestamps compare equal after a round-trip.
pub fn now_utc() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub size_bytes: u64,
    pub item_count: u64,
}

/// Total file bytes and file count below `path` (a single file counts as one).
/// Symlinks are counted as items but never followed.
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let meta =
        fs::symlink_metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if !meta.is_dir() {
        return Ok(DiskUsage {
            size_bytes: if meta.is_file() { meta.len() } else { 0 },
            item_count: 1,
        });
    }

    let mut out = DiskUsage::default();
    let entries = fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?;
    for entry in entries {
        let entry = entry?;
        let child = disk_usage(&entry.path())?;
        out.size_bytes += child.size_bytes;
        out.item_count += child.item_count;
    }
    Ok(out)
}

/// Remove a staged file or folder tree.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta =
        fs::symlink_metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
