use std::time;

use thiserror::Error;

use crate::types::ApplyStatus;

/// Enumeration of errors returned by `ResolveCache` lookups.
/// Both are recoverable: callers fall back to their default value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("flag {0} is not present in the cache")]
    CacheMiss(String),
    #[error("cache holds values without a resolve token")]
    NoResolveToken,
}

/// Enumeration of errors related to mutations of the `ApplyLedger`.
/// A failed mutation never changes the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("resolve token {0} is not tracked by the ledger")]
    StaleResolveToken(String),
    #[error("illegal apply transition for {flag} under {token}: {from} -> {to}")]
    IllegalApplyTransition {
        token: String,
        flag: String,
        from: ApplyStatus,
        to: ApplyStatus,
    },
}

/// Enumeration of errors raised by a `Storage` backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io failed for {path}: {error}")]
    Io {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to serialize persistent state: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("persistent state is corrupted: {0}")]
    Corrupted(String),
}

/// Reasons a drain of the ledger did not deliver its batch.
/// These are logged by the worker and never reach the application.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("apply events could not be delivered but will be retried in {retry_in:?}: {reason}")]
    Transient {
        reason: String,
        retry_in: time::Duration,
    },
    #[error("apply events were rejected by the backend and dropped: {0}")]
    PermanentRejection(String),
}

/// Errors surfaced by the `FlagProvider` when refreshing its cache.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("the backend did not return a resolve token")]
    NoResolveTokenFromServer,
    #[error("failed to resolve flags: {0}")]
    Resolve(String),
}
