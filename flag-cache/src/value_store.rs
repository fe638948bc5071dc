use crate::error::CacheError;
use crate::types::{CacheSnapshot, CachedValue, ResolvedValue};

/// In-memory flag values for one resolve token and one context fingerprint.
///
/// Not synchronized: `ResolveCache` owns the only instance and guards it.
#[derive(Debug, Default)]
pub struct ValueStore {
    snapshot: CacheSnapshot,
}

impl ValueStore {
    pub fn new(snapshot: CacheSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &CacheSnapshot {
        &self.snapshot
    }

    /// Look up `flag`, flagging the result as stale when `context_fingerprint`
    /// differs from the fingerprint the values were resolved for.
    pub fn get(&self, flag: &str, context_fingerprint: &str) -> Result<CachedValue, CacheError> {
        let resolve_token = match &self.snapshot.resolve_token {
            Some(token) => token,
            None if self.snapshot.values.is_empty() => {
                return Err(CacheError::CacheMiss(flag.to_owned()))
            }
            None => return Err(CacheError::NoResolveToken),
        };

        let resolved_value = self
            .snapshot
            .values
            .get(flag)
            .ok_or_else(|| CacheError::CacheMiss(flag.to_owned()))?;

        Ok(CachedValue {
            resolved_value: resolved_value.clone(),
            resolve_token: resolve_token.clone(),
            needs_update: self.snapshot.context_fingerprint.as_deref()
                != Some(context_fingerprint),
        })
    }

    /// Swap every value, the token and the fingerprint at once.
    pub fn replace(
        &mut self,
        values: Vec<ResolvedValue>,
        context_fingerprint: &str,
        resolve_token: &str,
    ) {
        self.snapshot = CacheSnapshot::new(values, context_fingerprint, resolve_token);
    }

    pub fn clear(&mut self) {
        self.snapshot = CacheSnapshot::default();
    }

    pub fn resolve_token(&self) -> Option<&str> {
        self.snapshot.resolve_token.as_deref()
    }

    pub fn context_fingerprint(&self) -> Option<&str> {
        self.snapshot.context_fingerprint.as_deref()
    }

    pub fn len(&self) -> usize {
        self.snapshot.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.values.is_empty()
    }
}
