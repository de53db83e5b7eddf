use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub vault_home: PathBuf,
    pub config_file: PathBuf,
    pub registry_file: PathBuf,
    pub legacy_ledger: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

impl VaultPaths {
    /// Lay out every installation file under one home directory.
    pub fn under(vault_home: PathBuf) -> Self {
        Self {
            config_file: vault_home.join("deepfreeze.toml"),
            registry_file: vault_home.join("staging_roots.toml"),
            legacy_ledger: vault_home.join("tracking.json"),
            logs_dir: vault_home.join("logs"),
            vault_home,
        }
    }
}

pub fn resolve_paths() -> Result<VaultPaths> {
    let home = required_home_dir()?;
    let vault_home = env_or_default_path("DEEPFREEZE_HOME", home.join(".deepfreeze"));
    let defaults = VaultPaths::under(vault_home);

    Ok(VaultPaths {
        config_file: env_or_default_path("DEEPFREEZE_CONFIG_PATH", defaults.config_file),
        registry_file: env_or_default_path("DEEPFREEZE_REGISTRY_FILE", defaults.registry_file),
        legacy_ledger: env_or_default_path("DEEPFREEZE_LEGACY_LEDGER", defaults.legacy_ledger),
        logs_dir: env_or_default_path("DEEPFREEZE_LOGS_DIR", defaults.logs_dir),
        vault_home: defaults.vault_home,
    })
}

#[cfg(test)]
mod tests {
    use super::VaultPaths;
    use std::path::PathBuf;

    #[test]
    fn layout_is_rooted_at_home() {
        let paths = VaultPaths::under(PathBuf::from("/srv/df"));
        assert_eq!(paths.registry_file, PathBuf::from("/srv/df/staging_roots.toml"));
        assert_eq!(paths.legacy_ledger, PathBuf::from("/srv/df/tracking.json"));
        assert_eq!(paths.logs_dir, PathBuf::from("/srv/df/logs"));
    }
}
