use thiserror::Error;

use crate::vault::ledger::EntryStatus;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("unknown ledger entry {0}")]
    UnknownEntry(String),
    #[error("invalid transition for entry {id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        id: String,
        from: EntryStatus,
        to: EntryStatus,
        reason: String,
    },
    #[error("backup engine invocation failed: {0}")]
    EngineInvocation(String),
    #[error("snapshot verification failed: {0}")]
    VerificationFailed(String),
    #[error("archive verified but local cleanup failed for {} entries", .failures.len())]
    PartialDeletion { failures: Vec<(String, String)> },
    #[error("ledger shard unreadable: {0}")]
    LedgerLoad(String),
    #[error("config file invalid or unreadable: {0}")]
    InvalidConfig(String),
}

impl VaultError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> VaultErrorCode {
        match self {
            Self::InvalidPath { .. } => VaultErrorCode::E001InvalidPath,
            Self::UnknownEntry(_) => VaultErrorCode::E002UnknownEntry,
            Self::InvalidTransition { .. } => VaultErrorCode::E003InvalidTransition,
            Self::EngineInvocation(_) => VaultErrorCode::E004EngineInvocation,
            Self::VerificationFailed(_) => VaultErrorCode::E005VerificationFailed,
            Self::PartialDeletion { .. } => VaultErrorCode::E006PartialDeletion,
            Self::LedgerLoad(_) => VaultErrorCode::E007LedgerLoad,
            Self::InvalidConfig(_) => VaultErrorCode::E008InvalidConfig,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultErrorCode {
    E001InvalidPath,
    E002UnknownEntry,
    E003InvalidTransition,
    E004EngineInvocation,
    E005VerificationFailed,
    E006PartialDeletion,
    E007LedgerLoad,
    E008InvalidConfig,
}

impl VaultErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001InvalidPath => "E001_INVALID_PATH",
            Self::E002UnknownEntry => "E002_UNKNOWN_ENTRY",
            Self::E003InvalidTransition => "E003_INVALID_TRANSITION",
            Self::E004EngineInvocation => "E004_ENGINE_INVOCATION",
            Self::E005VerificationFailed => "E005_VERIFICATION_FAILED",
            Self::E006PartialDeletion => "E006_PARTIAL_DELETION",
            Self::E007LedgerLoad => "E007_LEDGER_LOAD",
            Self::E008InvalidConfig => "E008_INVALID_CONFIG",
        }
    }
}
