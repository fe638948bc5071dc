pub mod apply_ledger;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod metrics_consts;
pub mod provider;
pub mod publisher;
pub mod resolve_cache;
pub mod retry;
pub mod storage;
pub mod types;
pub mod value_store;
pub mod worker;

pub use apply_ledger::{ApplyLedger, RecordOutcome};
pub use provider::{Evaluation, EvaluationReason, FlagProvider, FlagResolver, ResolveResponse};
pub use publisher::{ApplyPublisher, DeliveryOutcome, HttpApplyPublisher};
pub use resolve_cache::ResolveCache;
pub use worker::{DrainReport, EventDeliveryWorker, WorkerConfig};

use std::sync::Arc;

use config::{Config, APPLY_LEDGER_FILE_NAME, RESOLVE_CACHE_FILE_NAME};
use error::StorageError;
use storage::FileStorage;

/// Open the resolve cache and apply ledger kept in `config.storage_dir`.
pub fn open_stores(config: &Config) -> Result<(Arc<ResolveCache>, Arc<ApplyLedger>), StorageError> {
    let cache_storage = FileStorage::in_dir(&config.storage_dir, RESOLVE_CACHE_FILE_NAME)?;
    let ledger_storage = FileStorage::in_dir(&config.storage_dir, APPLY_LEDGER_FILE_NAME)?;

    Ok((
        Arc::new(ResolveCache::new(Arc::new(cache_storage))?),
        Arc::new(ApplyLedger::new(Arc::new(ledger_storage))?),
    ))
}

/// Build a delivery worker that publishes over HTTP as configured by `config`.
pub fn http_worker(
    config: &Config,
    ledger: Arc<ApplyLedger>,
) -> Result<EventDeliveryWorker<HttpApplyPublisher>, reqwest::Error> {
    let publisher = HttpApplyPublisher::new(
        &config.apply_url,
        &config.client_secret,
        config.request_timeout.0,
    )?;

    Ok(EventDeliveryWorker::new(
        ledger,
        publisher,
        WorkerConfig {
            flush_interval: config.flush_interval.0,
            request_timeout: config.request_timeout.0,
            max_batch_size: config.max_batch_size,
            retry_policy: config.retry_policy.retry_policy(),
        },
    ))
}
