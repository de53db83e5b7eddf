use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Installation-wide list of provisioned staging roots. Append-only and
/// re-read from disk on every call.
#[derive(Debug, Clone)]
pub struct RootRegistry {
    path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    roots: Vec<PathBuf>,
}

impl RootRegistry {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<PathBuf>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let parsed: RegistryFile = toml::from_str(&raw)
            .map_err(|err| anyhow!("failed to parse registry {}: {err}", self.path.display()))?;

        let mut out: Vec<PathBuf> = Vec::with_capacity(parsed.roots.len());
        for root in parsed.roots {
            if !out.contains(&root) {
                out.push(root);
            }
        }
        Ok(out)
    }

    /// Append `root` unless already present. Returns whether it was added.
    pub fn register(&self, root: &Path) -> Result<bool> {
        let mut roots = self.load()?;
        if roots.iter().any(|r| r == root) {
            return Ok(false);
        }
        roots.push(root.to_path_buf());
        self.save(&RegistryFile { roots })?;
        tracing::info!(root = %root.display(), registry = %self.path.display(), "registered staging root");
        Ok(true)
    }

    fn save(&self, file: &RegistryFile) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("registry path {} has no parent", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let data = toml::to_string_pretty(file)
            .with_context(|| format!("failed to encode {}", self.path.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_registry_is_empty() {
        let tmp = tempdir().expect("tempdir");
        let registry = RootRegistry::at(tmp.path().join("staging_roots.toml"));
        assert!(registry.load().expect("load").is_empty());
    }

    #[test]
    fn register_appends_in_order_and_dedupes() {
        let tmp = tempdir().expect("tempdir");
        let registry = RootRegistry::at(tmp.path().join("nested/staging_roots.toml"));

        assert!(registry.register(Path::new("/mnt/b/.stage")).expect("first"));
        assert!(registry.register(Path::new("/mnt/a/.stage")).expect("second"));
        assert!(!registry.register(Path::new("/mnt/b/.stage")).expect("duplicate"));

        assert_eq!(
            registry.load().expect("load"),
            vec![PathBuf::from("/mnt/b/.stage"), PathBuf::from("/mnt/a/.stage")]
        );
    }

    #[test]
    fn hand_edited_duplicates_collapse_on_load() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("staging_roots.toml");
        fs::write(&path, "roots = [\"/x\", \"/y\", \"/x\"]\n").expect("write");
        let registry = RootRegistry::at(path);
        assert_eq!(
            registry.load().expect("load"),
            vec![PathBuf::from("/x"), PathBuf::from("/y")]
        );
    }
}
