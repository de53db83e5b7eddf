use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::VaultError;
use crate::vault::paths::VaultPaths;

pub const DEFAULT_STAGING_DIR_NAME: &str = ".deepfreeze-staging";

/// Every `DEEPFREEZE_*` variable the binary reads, wherever it is read.
pub const KNOWN_ENV_KEYS: &[&str] = &[
    "DEEPFREEZE_HOME",
    "DEEPFREEZE_CONFIG_PATH",
    "DEEPFREEZE_REGISTRY_FILE",
    "DEEPFREEZE_LEGACY_LEDGER",
    "DEEPFREEZE_LOGS_DIR",
    "DEEPFREEZE_LOG",
    "DEEPFREEZE_STAGING_DIR_NAME",
    "DEEPFREEZE_MOUNTS_FILE",
    "DEEPFREEZE_ENGINE_BIN",
    "DEEPFREEZE_DEEP_CHECK",
    "DEEPFREEZE_ENGINE_TAG",
    "DEEPFREEZE_DELETE_AFTER_VERIFY",
    "DEEPFREEZE_COST_USD_PER_GB_MONTH",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub dir_name: String,
    pub mounts_file: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir_name: DEFAULT_STAGING_DIR_NAME.to_string(),
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bin: PathBuf,
    pub deep_check: bool,
    pub tag: String,
}

fn default_engine_tag() -> String {
    "deepfreeze".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("restic"),
            deep_check: false,
            tag: default_engine_tag(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub delete_after_verify: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            delete_after_verify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub usd_per_gb_month: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        // Deep-archive object storage list price.
        Self {
            usd_per_gb_month: 0.00099,
        }
    }
}

impl CostConfig {
    /// Recurring monthly storage cost of `bytes`, decimal gigabytes.
    pub fn estimate(&self, bytes: u64) -> f64 {
        bytes as f64 / 1_000_000_000.0 * self.usd_per_gb_month
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    pub staging: StagingConfig,
    pub engine: EngineConfig,
    pub archive: ArchiveConfig,
    pub cost: CostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialVaultConfig {
    staging: Option<StagingConfig>,
    engine: Option<EngineConfig>,
    archive: Option<ArchiveConfig>,
    cost: Option<CostConfig>,
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_path(var: &str, fallback: &Path) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback.to_path_buf(),
    }
}

pub fn validate(cfg: &VaultConfig) -> Result<()> {
    let dir_name = cfg.staging.dir_name.trim();
    if dir_name.is_empty() {
        return Err(VaultError::InvalidConfig("invalid staging dir name: cannot be empty".to_string()).into());
    }
    if dir_name.contains('/') || dir_name.contains('\\') || dir_name == "." || dir_name == ".." {
        return Err(VaultError::InvalidConfig(format!(
            "invalid staging dir name `{dir_name}`: must be a single path component"
        ))
        .into());
    }
    if cfg.engine.bin.as_os_str().is_empty() {
        return Err(VaultError::InvalidConfig("invalid engine bin: cannot be empty".to_string()).into());
    }
    if cfg.engine.tag.trim().is_empty() {
        return Err(VaultError::InvalidConfig("invalid engine tag: cannot be empty".to_string()).into());
    }
    let rate = cfg.cost.usd_per_gb_month;
    if !rate.is_finite() || rate < 0.0 {
        return Err(VaultError::InvalidConfig("invalid cost rate: require a finite value >= 0".to_string()).into());
    }
    Ok(())
}

fn merge_file_config(base: &mut VaultConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PartialVaultConfig = toml::from_str(&raw)
        .map_err(|err| {
            VaultError::InvalidConfig(format!(
                "failed to parse deepfreeze config {}: {err}",
                path.display()
            ))
        })?;
    if let Some(staging) = parsed.staging {
        base.staging = staging;
    }
    if let Some(engine) = parsed.engine {
        base.engine = engine;
    }
    if let Some(archive) = parsed.archive {
        base.archive = archive;
    }
    if let Some(cost) = parsed.cost {
        base.cost = cost;
    }
    Ok(())
}

pub fn load_config(paths: &VaultPaths) -> Result<VaultConfig> {
    let mut cfg = VaultConfig::default();
    merge_file_config(&mut cfg, &paths.config_file)?;

    cfg.staging.dir_name = env_or_string("DEEPFREEZE_STAGING_DIR_NAME", &cfg.staging.dir_name);
    cfg.staging.mounts_file = env_or_path("DEEPFREEZE_MOUNTS_FILE", &cfg.staging.mounts_file);
    cfg.engine.bin = env_or_path("DEEPFREEZE_ENGINE_BIN", &cfg.engine.bin);
    cfg.engine.deep_check = env_or_bool("DEEPFREEZE_DEEP_CHECK", cfg.engine.deep_check);
    cfg.engine.tag = env_or_string("DEEPFREEZE_ENGINE_TAG", &cfg.engine.tag);
    cfg.archive.delete_after_verify = env_or_bool(
        "DEEPFREEZE_DELETE_AFTER_VERIFY",
        cfg.archive.delete_after_verify,
    );
    cfg.cost.usd_per_gb_month =
        env_or_f64("DEEPFREEZE_COST_USD_PER_GB_MONTH", cfg.cost.usd_per_gb_month);

    validate(&cfg)?;
    Ok(cfg)
}

/// `DEEPFREEZE_*` variables present in the environment that nothing reads.
pub fn unknown_env_keys() -> Vec<String> {
    let present = env::vars().map(|(k, _)| k).collect::<Vec<_>>();
    filter_unknown_keys(present)
}

fn filter_unknown_keys(present: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = present
        .into_iter()
        .filter(|k| k.starts_with("DEEPFREEZE_"))
        .filter(|k| !KNOWN_ENV_KEYS.contains(&k.as_str()))
        .collect::<Vec<_>>();
    out.sort();
    out
}
