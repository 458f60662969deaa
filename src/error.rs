// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::providers::ProviderError;

/// Process-level error taxonomy for the guardian daemon.
///
/// The orchestrator converts `Transient` and `Stale` into per-block `Skip`
/// decisions; `Inconsistent` on unsealed cache data triggers rollback and
/// refetch; `Fatal` and `ConfigInvalid` terminate the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardianError {
    // RPC / HTTP / bus I/O failure, safe to retry
    Transient(String),
    // Registry snapshot too old or taken on a non-canonical block
    Stale(String),
    // Data that contradicts itself: duplicate pubkeys, malformed logs,
    // unsealed-segment disagreement
    Inconsistent(String),
    // Missing or malformed configuration
    ConfigInvalid(String),
    // The wallet is not in the guardian set. A state, not a failure.
    NotGuardian,
    // Anything that invalidates the cache or chain identity. The process
    // must exit; the operator clears cache/config if the fault recurs.
    Fatal(String),
}

impl GuardianError {
    /// Short stable string identifying the error kind for metric labels
    pub fn error_type(&self) -> &'static str {
        match self {
            GuardianError::Transient(_) => "transient",
            GuardianError::Stale(_) => "stale",
            GuardianError::Inconsistent(_) => "inconsistent",
            GuardianError::ConfigInvalid(_) => "config_invalid",
            GuardianError::NotGuardian => "not_guardian",
            GuardianError::Fatal(_) => "fatal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GuardianError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, GuardianError::Fatal(_))
    }

    /// Process exit code. 0 is reserved for clean shutdown.
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardianError::ConfigInvalid(_) => 64,
            GuardianError::Fatal(_) => 70,
            _ => 1,
        }
    }
}

impl std::fmt::Display for GuardianError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardianError::Transient(msg) => write!(f, "transient error: {}", msg),
            GuardianError::Stale(msg) => write!(f, "stale snapshot: {}", msg),
            GuardianError::Inconsistent(msg) => write!(f, "inconsistent data: {}", msg),
            GuardianError::ConfigInvalid(msg) => write!(f, "invalid configuration: {}", msg),
            GuardianError::NotGuardian => write!(f, "wallet is not in the guardian set"),
            GuardianError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for GuardianError {}

impl From<ProviderError> for GuardianError {
    fn from(e: ProviderError) -> Self {
        GuardianError::Transient(format!("provider: {}", e))
    }
}

impl From<reqwest::Error> for GuardianError {
    fn from(e: reqwest::Error) -> Self {
        GuardianError::Transient(format!("http: {}", e))
    }
}

pub type GuardianResult<T> = Result<T, GuardianError>;
