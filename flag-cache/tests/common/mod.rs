use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use envconfig::Envconfig;

use flag_cache::config::Config;
use flag_cache::error::ProviderError;
use flag_cache::types::{EvaluationContext, ResolvedValue};
use flag_cache::{FlagResolver, ResolveResponse};

static TRACING: Once = Once::new();

pub fn setup_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Configuration pointing at `storage_dir` and `apply_url`, with a short retry policy.
pub fn test_config(storage_dir: &Path, apply_url: &str) -> Config {
    let env = HashMap::from([
        (
            "FLAG_CACHE_STORAGE_DIR".to_owned(),
            storage_dir.display().to_string(),
        ),
        ("APPLY_URL".to_owned(), apply_url.to_owned()),
        ("CLIENT_SECRET".to_owned(), "test-secret".to_owned()),
        ("REQUEST_TIMEOUT".to_owned(), "2000".to_owned()),
        ("INITIAL_INTERVAL".to_owned(), "1000".to_owned()),
        ("MAXIMUM_INTERVAL".to_owned(), "60000".to_owned()),
    ]);

    Config::init_from_hashmap(&env).expect("failed to build test config")
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).expect("timestamp out of range")
}

/// Resolves every context to the same values under a new token per call: t1, t2, ...
pub struct StaticResolver {
    values: Vec<ResolvedValue>,
    calls: Mutex<usize>,
}

impl StaticResolver {
    pub fn new(values: Vec<ResolvedValue>) -> Self {
        Self {
            values,
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl FlagResolver for StaticResolver {
    async fn resolve_flags(
        &self,
        _flags: &[String],
        _context: &EvaluationContext,
    ) -> Result<ResolveResponse, ProviderError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;

        Ok(ResolveResponse {
            resolved_values: self.values.clone(),
            resolve_token: Some(format!("t{}", *calls)),
        })
    }
}
