//! Storage-identity normalisation for user supplied paths.
//!
//! A path is identified by the volume or network share that holds it plus the
//! path relative to that root. Network mounts are always expressed in share
//! form (`//server/share`), so two machines that mount the same share at
//! different places still agree on the identity of every file below it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::VaultError;

const NETWORK_FS_TYPES: &[&str] = &[
    "cifs", "smb3", "smbfs", "nfs", "nfs4", "9p", "fuse.sshfs", "afpfs",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalPath {
    pub root: String,
    pub relative: String,
}

impl CanonicalPath {
    pub fn new(root: impl Into<String>, relative: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            relative: relative.into(),
        }
    }

    pub fn is_network(&self) -> bool {
        self.root.starts_with("//")
    }

    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_matches('/');
        if self.relative.is_empty() {
            return Self::new(self.root.clone(), relative);
        }
        if relative.is_empty() {
            return self.clone();
        }
        Self::new(self.root.clone(), format!("{}/{relative}", self.relative))
    }

    /// True when `self` names `other` or something below it.
    pub fn contains(&self, other: &CanonicalPath) -> bool {
        if self.root != other.root {
            return false;
        }
        self.relative.is_empty()
            || other.relative == self.relative
            || other
                .relative
                .strip_prefix(&self.relative)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relative.is_empty() {
            return f.write_str(&self.root);
        }
        write!(f, "{}/{}", self.root.trim_end_matches('/'), self.relative)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fstype: String,
}

/// Share root plus the sub-directory of the share a mount exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ShareLocation {
    root: String,
    prefix: String,
}

impl MountEntry {
    fn share(&self) -> Option<ShareLocation> {
        if let Some(loc) = parse_share(&self.source) {
            return Some(loc);
        }
        if !NETWORK_FS_TYPES.contains(&self.fstype.as_str()) {
            return None;
        }
        // NFS style `server:/export/sub`.
        let (server, export) = self.source.split_once(':')?;
        if server.is_empty() || !export.starts_with('/') {
            return None;
        }
        let segments = split_segments(export);
        let (share, rest) = segments.split_first()?;
        Some(ShareLocation {
            root: format!("//{}/{share}", server.to_ascii_lowercase()),
            prefix: rest.join("/"),
        })
    }
}

fn split_segments(raw: &str) -> Vec<&str> {
    raw.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// Parse `//server/share/rest` or `\\server\share\rest`. SMB server and
/// share names are case-insensitive, so both are folded.
fn parse_share(raw: &str) -> Option<ShareLocation> {
    let rest = raw
        .strip_prefix("//")
        .or_else(|| raw.strip_prefix("\\\\"))?;
    let segments = split_segments(rest);
    if segments.len() < 2 {
        return None;
    }
    Some(ShareLocation {
        root: format!(
            "//{}/{}",
            segments[0].to_ascii_lowercase(),
            segments[1].to_ascii_lowercase()
        ),
        prefix: segments[2..].join("/"),
    })
}

fn strip_relative_prefix<'a>(relative: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(relative);
    }
    if relative == prefix {
        return Some("");
    }
    relative
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// Undo the octal escaping `/proc/self/mounts` applies to whitespace.
fn unescape_mount_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn new(entries: Vec<MountEntry>) -> Self {
        Self { entries }
    }

    pub fn parse(raw: &str) -> Self {
        let mut entries = Vec::new();
        for line in raw.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let (Some(source), Some(mount_point), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            entries.push(MountEntry {
                source: unescape_mount_field(source),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fstype: fstype.to_string(),
            });
        }
        Self { entries }
    }

    /// Read a mount table file. A missing table degrades to a single `/` volume.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw),
            Err(err) => {
                tracing::warn!(
                    mounts_file = %path.display(),
                    error = %err,
                    "mount table unreadable; treating / as the only volume"
                );
                Self::new(vec![MountEntry {
                    source: "rootfs".to_string(),
                    mount_point: PathBuf::from("/"),
                    fstype: "rootfs".to_string(),
                }])
            }
        }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Mount with the longest mount point containing `path`. Later entries win
    /// ties because they shadow earlier mounts on the same directory.
    fn containing(&self, path: &Path) -> Option<&MountEntry> {
        let mut best: Option<&MountEntry> = None;
        for entry in &self.entries {
            if !path.starts_with(&entry.mount_point) {
                continue;
            }
            let depth = entry.mount_point.components().count();
            match best {
                Some(current) if current.mount_point.components().count() > depth => {}
                _ => best = Some(entry),
            }
        }
        best
    }

    /// Local mount exposing `relative` inside the share `root`.
    fn local_for_share(&self, root: &str, relative: &str) -> Option<PathBuf> {
        let mut best: Option<(usize, PathBuf)> = None;
        for entry in &self.entries {
            let Some(share) = entry.share() else {
                continue;
            };
            if share.root != root {
                continue;
            }
            let Some(rest) = strip_relative_prefix(relative, &share.prefix) else {
                continue;
            };
            let depth = share.prefix.len();
            if best.as_ref().is_some_and(|(d, _)| *d > depth) {
                continue;
            }
            let local = if rest.is_empty() {
                entry.mount_point.clone()
            } else {
                entry.mount_point.join(rest)
            };
            best = Some((depth, local));
        }
        best.map(|(_, p)| p)
    }
}

fn relative_components(path: &Path) -> Result<Vec<String>, VaultError> {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let Some(part) = part.to_str() else {
                    return Err(VaultError::invalid_path(
                        path.display().to_string(),
                        "path is not valid UTF-8",
                    ));
                };
                out.push(part.to_string());
            }
            Component::CurDir => {}
            _ => {
                return Err(VaultError::invalid_path(
                    path.display().to_string(),
                    "unexpected component in relative path",
                ));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    mounts: MountTable,
}

impl Canonicalizer {
    pub fn new(mounts: MountTable) -> Self {
        Self { mounts }
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Map `path` to its storage identity. Accepts local paths, paths below a
    /// mounted network share and share-form paths (`//server/share/...`).
    pub fn canonicalize(&self, path: &Path) -> Result<CanonicalPath, VaultError> {
        let display = path.display().to_string();
        let local = match path.to_str().and_then(parse_share) {
            Some(share) => self
                .mounts
                .local_for_share(&share.root, &share.prefix)
                .ok_or_else(|| {
                    VaultError::invalid_path(&display, format!("share {} is not mounted", share.root))
                })?,
            None => path.to_path_buf(),
        };

        let resolved = fs::canonicalize(&local)
            .map_err(|err| VaultError::invalid_path(&display, format!("cannot resolve: {err}")))?;
        let mount = self
            .mounts
            .containing(&resolved)
            .ok_or_else(|| VaultError::invalid_path(&display, "no volume or share contains it"))?;

        let below_mount = resolved.strip_prefix(&mount.mount_point).map_err(|_| {
            VaultError::invalid_path(&display, "resolved path escapes its mount point")
        })?;
        let mut segments = relative_components(below_mount)?;

        match mount.share() {
            Some(share) => {
                let mut relative = split_segments(&share.prefix)
                    .into_iter()
                    .map(ToOwned::to_owned)
                    .collect::<Vec<_>>();
                relative.append(&mut segments);
                Ok(CanonicalPath::new(share.root, relative.join("/")))
            }
            None => Ok(CanonicalPath::new(
                mount.mount_point.display().to_string(),
                segments.join("/"),
            )),
        }
    }

    /// Local filesystem location of a canonical path on this machine.
    pub fn local_path(&self, canonical: &CanonicalPath) -> Result<PathBuf, VaultError> {
        if canonical.is_network() {
            return self
                .mounts
                .local_for_share(&canonical.root, &canonical.relative)
                .ok_or_else(|| {
                    VaultError::invalid_path(
                        canonical.to_string(),
                        format!("share {} is not mounted on this machine", canonical.root),
                    )
                });
        }
        let root = PathBuf::from(&canonical.root);
        if canonical.relative.is_empty() {
            return Ok(root);
        }
        Ok(root.join(&canonical.relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn local_volume(mount_point: &Path) -> MountEntry {
        MountEntry {
            source: "/dev/sdb1".to_string(),
            mount_point: mount_point.to_path_buf(),
            fstype: "ext4".to_string(),
        }
    }

    #[test]
    fn parses_proc_mounts_with_escapes() {
        let table = MountTable::parse(
            "/dev/sda1 / ext4 rw,relatime 0 0\n//NAS/media /mnt/My\\040Media cifs rw 0 0\n",
        );
        assert_eq!(table.entries().len(), 2);
        assert_eq!(
            table.entries()[1].mount_point,
            PathBuf::from("/mnt/My Media")
        );
        assert_eq!(
            table.entries()[1].share(),
            Some(ShareLocation {
                root: "//nas/media".to_string(),
                prefix: String::new(),
            })
        );
    }

    #[test]
    fn nfs_export_is_split_into_share_and_prefix() {
        let entry = MountEntry {
            source: "filer:/export/projects/2019".to_string(),
            mount_point: PathBuf::from("/mnt/old"),
            fstype: "nfs4".to_string(),
        };
        assert_eq!(
            entry.share(),
            Some(ShareLocation {
                root: "//filer/export".to_string(),
                prefix: "projects/2019".to_string(),
            })
        );
    }

    #[test]
    fn local_volume_path_splits_at_mount_point() {
        let tmp = tempdir().expect("tempdir");
        let vol = fs::canonicalize(tmp.path()).expect("canon");
        fs::create_dir_all(vol.join("docs")).expect("mkdir");
        fs::write(vol.join("docs/report.pdf"), "x").expect("write");

        let canon = Canonicalizer::new(MountTable::new(vec![local_volume(&vol)]));
        let got = canon.canonicalize(&vol.join("docs/report.pdf")).expect("canonicalize");
        assert_eq!(got.root, vol.display().to_string());
        assert_eq!(got.relative, "docs/report.pdf");
    }

    #[test]
    fn different_mappings_of_one_share_agree() {
        let tmp = tempdir().expect("tempdir");
        let base = fs::canonicalize(tmp.path()).expect("canon");
        // Machine A mounts the whole share, machine B only its `photos` folder,
        // machine C the whole share spelled in another case.
        let whole = base.join("machine-a/media");
        let photos_only = base.join("machine-b/photos");
        let other_case = base.join("machine-c/Media");
        fs::create_dir_all(whole.join("photos/2012")).expect("mkdir whole");
        fs::create_dir_all(photos_only.join("2012")).expect("mkdir photos");
        fs::create_dir_all(other_case.join("photos/2012")).expect("mkdir other case");

        let canon = Canonicalizer::new(MountTable::new(vec![
            MountEntry {
                source: "//NAS/media".to_string(),
                mount_point: whole.clone(),
                fstype: "cifs".to_string(),
            },
            MountEntry {
                source: "//nas/media/photos".to_string(),
                mount_point: photos_only.clone(),
                fstype: "cifs".to_string(),
            },
            MountEntry {
                source: "//nas/Media".to_string(),
                mount_point: other_case.clone(),
                fstype: "cifs".to_string(),
            },
        ]));

        let via_whole = canon
            .canonicalize(&whole.join("photos/2012"))
            .expect("whole share mount");
        let via_sub = canon
            .canonicalize(&photos_only.join("2012"))
            .expect("sub-folder mount");
        let via_share = canon
            .canonicalize(Path::new("\\\\nas\\media\\photos\\2012"))
            .expect("share form");
        assert_eq!(via_whole, CanonicalPath::new("//nas/media", "photos/2012"));
        assert_eq!(via_sub, via_whole);
        assert_eq!(via_share, via_whole);
        let via_other_case = canon
            .canonicalize(&other_case.join("photos/2012"))
            .expect("other-case mount");
        assert_eq!(via_other_case, via_whole);
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let tmp = tempdir().expect("tempdir");
        let base = fs::canonicalize(tmp.path()).expect("canon");
        let local = base.join("local");
        let share = base.join("share");
        fs::create_dir_all(local.join("a")).expect("mkdir local");
        fs::create_dir_all(share.join("b/c")).expect("mkdir share");

        let canon = Canonicalizer::new(MountTable::new(vec![
            local_volume(&local),
            MountEntry {
                source: "//srv/archive".to_string(),
                mount_point: share.clone(),
                fstype: "cifs".to_string(),
            },
        ]));

        for input in [local.join("a"), share.join("b/c"), share.clone()] {
            let once = canon.canonicalize(&input).expect("first pass");
            let twice = canon
                .canonicalize(Path::new(&once.to_string()))
                .expect("second pass");
            assert_eq!(once, twice, "input {}", input.display());
        }
    }

    #[test]
    fn missing_path_is_invalid() {
        let tmp = tempdir().expect("tempdir");
        let canon = Canonicalizer::new(MountTable::new(vec![local_volume(tmp.path())]));
        let err = canon
            .canonicalize(&tmp.path().join("nope"))
            .expect_err("missing path");
        assert!(matches!(err, VaultError::InvalidPath { .. }));
    }

    #[test]
    fn unmounted_share_is_invalid() {
        let canon = Canonicalizer::new(MountTable::default());
        let err = canon
            .canonicalize(Path::new("//ghost/share/file"))
            .expect_err("unmounted share");
        assert!(err.to_string().contains("not mounted"));
    }

    #[test]
    fn local_path_inverts_canonicalize() {
        let tmp = tempdir().expect("tempdir");
        let share = fs::canonicalize(tmp.path()).expect("canon");
        fs::create_dir_all(share.join("x/y")).expect("mkdir");
        let canon = Canonicalizer::new(MountTable::new(vec![MountEntry {
            source: "fileserver:/vol/data".to_string(),
            mount_point: share.clone(),
            fstype: "nfs".to_string(),
        }]));

        let c = canon.canonicalize(&share.join("x/y")).expect("canonicalize");
        assert_eq!(c, CanonicalPath::new("//fileserver/vol", "data/x/y"));
        assert_eq!(canon.local_path(&c).expect("local"), share.join("x/y"));
    }

    #[test]
    fn contains_respects_segment_boundaries() {
        let staging = CanonicalPath::new("/mnt/d", ".staging");
        assert!(staging.contains(&CanonicalPath::new("/mnt/d", ".staging/a")));
        assert!(!staging.contains(&CanonicalPath::new("/mnt/d", ".staging2/a")));
        assert!(!staging.contains(&CanonicalPath::new("/mnt/e", ".staging/a")));
    }
}
