use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The format version written into every persisted `CacheSnapshot`.
pub const CACHE_FORMAT_VERSION: &str = "1.0.0";
/// Snapshots with a different semver major are treated as corrupted on load.
pub const SUPPORTED_FORMAT_MAJOR: u64 = 1;

/// Why the backend resolved a flag to its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolveReason {
    Match,
    NoMatch,
    Disabled,
    TargetingKeyError,
    GeneralError,
}

impl fmt::Display for ResolveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ResolveReason::Match => "match",
                ResolveReason::NoMatch => "noMatch",
                ResolveReason::Disabled => "disabled",
                ResolveReason::TargetingKeyError => "targetingKeyError",
                ResolveReason::GeneralError => "generalError",
            }
        )
    }
}

/// A flag value as returned by the resolve backend.
///
/// `value` may be `None` even when the reason is `Match`: the backend can
/// match a rule that assigns no value, and we store that as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    pub flag: String,
    pub variant: Option<String>,
    pub value: Option<Value>,
    pub resolve_reason: ResolveReason,
}

impl ResolvedValue {
    pub fn new(flag: &str, value: Option<Value>, resolve_reason: ResolveReason) -> Self {
        Self {
            flag: flag.to_owned(),
            variant: None,
            value,
            resolve_reason,
        }
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_owned());
        self
    }

    /// Walk into an object value following `path`. An empty path returns the whole value.
    pub fn value_at(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(self.value.as_ref()?, |current, key| current.get(*key))
    }
}

/// Everything the cache knows, replaced wholesale on every resolve.
/// All values share `resolve_token` and `context_fingerprint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SnapshotRepr", into = "SnapshotRepr")]
pub struct CacheSnapshot {
    pub format_version: String,
    pub resolve_token: Option<String>,
    pub context_fingerprint: Option<String>,
    pub values: HashMap<String, ResolvedValue>,
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION.to_owned(),
            resolve_token: None,
            context_fingerprint: None,
            values: HashMap::new(),
        }
    }
}

impl CacheSnapshot {
    pub fn new(
        values: Vec<ResolvedValue>,
        context_fingerprint: &str,
        resolve_token: &str,
    ) -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION.to_owned(),
            resolve_token: Some(resolve_token.to_owned()),
            context_fingerprint: Some(context_fingerprint.to_owned()),
            values: values
                .into_iter()
                .map(|value| (value.flag.clone(), value))
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredValue {
    variant: Option<String>,
    value: Option<Value>,
    resolve_reason: ResolveReason,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRepr {
    format_version: String,
    resolve_token: Option<String>,
    context_fingerprint: Option<String>,
    values: HashMap<String, StoredValue>,
}

impl TryFrom<SnapshotRepr> for CacheSnapshot {
    type Error = String;

    fn try_from(repr: SnapshotRepr) -> Result<Self, Self::Error> {
        let version = semver::Version::parse(&repr.format_version)
            .map_err(|e| format!("invalid formatVersion {}: {}", repr.format_version, e))?;
        if version.major != SUPPORTED_FORMAT_MAJOR {
            return Err(format!("unsupported formatVersion {}", repr.format_version));
        }

        let values = repr
            .values
            .into_iter()
            .map(|(flag, stored)| {
                let value = ResolvedValue {
                    flag: flag.clone(),
                    variant: stored.variant,
                    value: stored.value,
                    resolve_reason: stored.resolve_reason,
                };
                (flag, value)
            })
            .collect();

        Ok(CacheSnapshot {
            format_version: repr.format_version,
            resolve_token: repr.resolve_token,
            context_fingerprint: repr.context_fingerprint,
            values,
        })
    }
}

impl From<CacheSnapshot> for SnapshotRepr {
    fn from(snapshot: CacheSnapshot) -> Self {
        SnapshotRepr {
            format_version: snapshot.format_version,
            resolve_token: snapshot.resolve_token,
            context_fingerprint: snapshot.context_fingerprint,
            values: snapshot
                .values
                .into_iter()
                .map(|(flag, value)| {
                    let stored = StoredValue {
                        variant: value.variant,
                        value: value.value,
                        resolve_reason: value.resolve_reason,
                    };
                    (flag, stored)
                })
                .collect(),
        }
    }
}

/// Result of a cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub resolved_value: ResolvedValue,
    pub resolve_token: String,
    /// True when the value was resolved for a different context than the one asked for.
    pub needs_update: bool,
}

/// One use of a flag under a resolve token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRecord {
    pub flag_name: String,
    pub applied_at: DateTime<Utc>,
    pub sent: bool,
}

/// All apply records tracked for a single resolve token, in first-use order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveEventGroup {
    pub resolve_token: String,
    pub records: Vec<ApplyRecord>,
}

/// An apply event as handed to an `ApplyPublisher`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedFlag {
    pub resolve_token: String,
    pub flag_name: String,
    pub applied_at: DateTime<Utc>,
}

/// Enumeration of the apply states of a (resolve token, flag) pair.
/// NotApplied: the flag was never used under the token, or its record was delivered and removed.
/// Applying: the use is recorded and waiting for delivery.
/// Applied: the backend confirmed the use.
/// ApplyFailed: the backend rejected the use; it will not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyStatus {
    NotApplied,
    Applying,
    Applied,
    ApplyFailed,
}

/// The effect of a legal `ApplyStatus` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced,
    AlreadyInFlight,
}

impl ApplyStatus {
    /// Returns `None` when moving from `self` to `next` is not allowed.
    pub fn transition(self, next: ApplyStatus) -> Option<Transition> {
        match (self, next) {
            (ApplyStatus::NotApplied, ApplyStatus::Applying) => Some(Transition::Advanced),
            (ApplyStatus::Applying, ApplyStatus::Applying) => Some(Transition::AlreadyInFlight),
            (ApplyStatus::Applying, ApplyStatus::Applied) => Some(Transition::Advanced),
            (ApplyStatus::Applying, ApplyStatus::ApplyFailed) => Some(Transition::Advanced),
            _ => None,
        }
    }
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ApplyStatus::NotApplied => "notApplied",
                ApplyStatus::Applying => "applying",
                ApplyStatus::Applied => "applied",
                ApplyStatus::ApplyFailed => "applyFailed",
            }
        )
    }
}

/// The context flags are resolved for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targeting_key: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EvaluationContext {
    pub fn new(targeting_key: &str) -> Self {
        Self {
            targeting_key: Some(targeting_key.to_owned()),
            attributes: Map::new(),
        }
    }

    pub fn attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_owned(), value);
        self
    }
}
