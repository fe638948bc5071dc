//! # Provider
//!
//! Glue between the host application, the resolve backend, the `ResolveCache`
//! and the `ApplyLedger`. Evaluations are served from the cache only; talking
//! to the backend happens in `set_context` and `refresh`.
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::apply_ledger::{ApplyLedger, RecordOutcome};
use crate::error::{CacheError, ProviderError};
use crate::fingerprint::{ContextFingerprinter, Sha1Fingerprinter};
use crate::resolve_cache::ResolveCache;
use crate::types::{EvaluationContext, ResolveReason, ResolvedValue};

/// What the backend returned for one resolve call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveResponse {
    pub resolved_values: Vec<ResolvedValue>,
    pub resolve_token: Option<String>,
}

/// Resolves flags for a context against the backend.
#[async_trait]
pub trait FlagResolver: Send + Sync {
    /// An empty `flags` slice asks for every flag the client can see.
    async fn resolve_flags(
        &self,
        flags: &[String],
        context: &EvaluationContext,
    ) -> Result<ResolveResponse, ProviderError>;
}

/// Why an evaluation produced its value.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationReason {
    /// Served from the cache for the current context.
    Resolved(ResolveReason),
    /// Served from the cache, but resolved for a different context.
    Stale,
    /// The flag was resolved without a value at the requested path.
    Default,
    /// No cached value could be used; the default was returned.
    Error(CacheError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Value,
    pub variant: Option<String>,
    pub reason: EvaluationReason,
}

impl Evaluation {
    fn fallback(default: Value, reason: EvaluationReason) -> Self {
        Self {
            value: default,
            variant: None,
            reason,
        }
    }
}

pub struct FlagProvider<R: FlagResolver, F: ContextFingerprinter = Sha1Fingerprinter> {
    resolver: R,
    fingerprinter: F,
    cache: Arc<ResolveCache>,
    ledger: Arc<ApplyLedger>,
    /// Flags to resolve. Empty means all.
    flags: Vec<String>,
    context: RwLock<EvaluationContext>,
    delivery_waker: Option<Arc<Notify>>,
}

impl<R: FlagResolver> FlagProvider<R, Sha1Fingerprinter> {
    pub fn new(resolver: R, cache: Arc<ResolveCache>, ledger: Arc<ApplyLedger>) -> Self {
        FlagProvider::with_fingerprinter(resolver, Sha1Fingerprinter, cache, ledger)
    }
}

impl<R: FlagResolver, F: ContextFingerprinter> FlagProvider<R, F> {
    pub fn with_fingerprinter(
        resolver: R,
        fingerprinter: F,
        cache: Arc<ResolveCache>,
        ledger: Arc<ApplyLedger>,
    ) -> Self {
        Self {
            resolver,
            fingerprinter,
            cache,
            ledger,
            flags: Vec::new(),
            context: RwLock::new(EvaluationContext::default()),
            delivery_waker: None,
        }
    }

    /// Only resolve `flags` instead of every flag.
    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    /// Wake the delivery worker whenever a new apply event is recorded.
    pub fn with_delivery_waker(mut self, waker: Arc<Notify>) -> Self {
        self.delivery_waker = Some(waker);
        self
    }

    pub fn context(&self) -> EvaluationContext {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch to `context`, resolving again unless the cache already holds
    /// values for an identical context.
    pub async fn set_context(&self, context: EvaluationContext) -> Result<(), ProviderError> {
        let fingerprint = self.fingerprinter.fingerprint(&context);
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = context;

        if self.cache.resolve_token().is_some()
            && self.cache.context_fingerprint().as_deref() == Some(fingerprint.as_str())
        {
            debug!("cached values already match the new context");
            return Ok(());
        }

        self.refresh().await
    }

    /// Resolve every flag for the current context and replace the cache.
    /// On failure the cache keeps its previous values.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<(), ProviderError> {
        let context = self.context();
        let fingerprint = self.fingerprinter.fingerprint(&context);

        let response = self.resolver.resolve_flags(&self.flags, &context).await?;

        let resolve_token = match response.resolve_token {
            Some(token) if !token.is_empty() => token,
            _ => {
                warn!("resolve response carried no resolve token");
                return Err(ProviderError::NoResolveTokenFromServer);
            }
        };

        info!(
            flags = response.resolved_values.len(),
            resolve_token, "resolved flags"
        );
        self.cache
            .replace(response.resolved_values, &fingerprint, &resolve_token);

        Ok(())
    }

    /// Evaluate `path`, a flag name optionally followed by dot-separated keys
    /// into the flag's value. Never fails: when no cached value can be used,
    /// `default` is returned along with the reason.
    pub fn evaluate(&self, path: &str, default: Value) -> Evaluation {
        let mut segments = path.split('.');
        let flag = segments.next().unwrap_or_default();
        let keys: Vec<&str> = segments.collect();

        let fingerprint = self.fingerprinter.fingerprint(&self.context());

        let hit = match self.cache.get(flag, &fingerprint) {
            Ok(hit) => hit,
            Err(e) => {
                debug!(flag, "serving default: {}", e);
                return Evaluation::fallback(default, EvaluationReason::Error(e));
            }
        };

        self.record_apply(&hit.resolve_token, flag);

        let resolved = hit.resolved_value;
        let value = match resolved.value_at(&keys) {
            Some(value) => value.clone(),
            None => return Evaluation::fallback(default, EvaluationReason::Default),
        };
        let reason = if hit.needs_update {
            EvaluationReason::Stale
        } else {
            EvaluationReason::Resolved(resolved.resolve_reason)
        };

        Evaluation {
            value,
            variant: resolved.variant,
            reason,
        }
    }

    fn record_apply(&self, resolve_token: &str, flag: &str) {
        match self.ledger.record(resolve_token, flag, Utc::now()) {
            Ok(RecordOutcome::Recorded) => {
                if let Some(waker) = &self.delivery_waker {
                    waker.notify_one();
                }
            }
            Ok(RecordOutcome::AlreadyTracked) => {}
            // Already delivered or rejected under this token.
            Err(e) => debug!(flag, "apply not recorded: {}", e),
        }
    }
}
