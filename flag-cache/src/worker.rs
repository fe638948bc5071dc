use std::sync::Arc;
use std::time;

use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::apply_ledger::ApplyLedger;
use crate::error::DeliveryError;
use crate::metrics_consts::{
    APPLY_DELIVERED_COUNTER, APPLY_DELIVERY_DURATION_HISTOGRAM, APPLY_REJECTED_COUNTER,
    APPLY_RETRIED_COUNTER,
};
use crate::publisher::{ApplyPublisher, DeliveryOutcome};
use crate::retry::RetryPolicy;
use crate::types::AppliedFlag;

/// What a single drain of the ledger achieved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Events accepted by the backend and removed from the ledger.
    pub delivered: usize,
    /// Events rejected by the backend, or dropped after exhausting retries.
    pub rejected: usize,
    /// Events left in the ledger for a later drain.
    pub deferred: usize,
    /// Set after a transient failure: how long to wait before draining again.
    pub retry_in: Option<time::Duration>,
}

/// Settings for an `EventDeliveryWorker`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub flush_interval: time::Duration,
    pub request_timeout: time::Duration,
    pub max_batch_size: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            flush_interval: time::Duration::from_secs(10),
            request_timeout: time::Duration::from_secs(5),
            max_batch_size: 200,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Delivers the apply events kept in an `ApplyLedger`.
pub struct EventDeliveryWorker<P: ApplyPublisher> {
    ledger: Arc<ApplyLedger>,
    publisher: P,
    config: WorkerConfig,
    /// Wakes the run loop before the next flush tick.
    wake: Arc<Notify>,
    /// Consecutive transient failures. Also serializes drains.
    failed_attempts: Mutex<u32>,
}

impl<P: ApplyPublisher> EventDeliveryWorker<P> {
    pub fn new(ledger: Arc<ApplyLedger>, publisher: P, config: WorkerConfig) -> Self {
        Self {
            ledger,
            publisher,
            config,
            wake: Arc::new(Notify::new()),
            failed_attempts: Mutex::new(0),
        }
    }

    /// A handle that makes the run loop drain as soon as possible.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Drain until the ledger holds no unsent events or a delivery fails transiently.
    #[instrument(skip_all)]
    pub async fn flush(&self) -> DrainReport {
        let mut failed_attempts = self.failed_attempts.lock().await;
        let mut report = DrainReport::default();

        let leftovers = self.ledger.remove_sent();
        if leftovers > 0 {
            info!(events = leftovers, "removed apply events delivered before a restart");
        }

        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                return report;
            }

            match self.publish(&batch).await {
                DeliveryOutcome::Success => {
                    *failed_attempts = 0;
                    report.delivered += self.settle_delivered(&batch);
                }
                DeliveryOutcome::PermanentReject(reason) => {
                    *failed_attempts = 0;
                    warn!("{}", DeliveryError::PermanentRejection(reason));
                    report.rejected += self.settle_rejected(&batch);
                }
                DeliveryOutcome::TransientFail {
                    reason,
                    retry_after,
                } => {
                    *failed_attempts += 1;

                    if self.config.retry_policy.is_exhausted(*failed_attempts) {
                        *failed_attempts = 0;
                        warn!(
                            events = batch.len(),
                            "dropping apply events after exhausting retries: {}", reason
                        );
                        report.rejected += self.settle_rejected(&batch);
                        continue;
                    }

                    let retry_in = self
                        .config
                        .retry_policy
                        .retry_interval(*failed_attempts, retry_after);
                    warn!(
                        attempt = *failed_attempts,
                        "{}",
                        DeliveryError::Transient { reason, retry_in }
                    );
                    metrics::counter!(APPLY_RETRIED_COUNTER).increment(batch.len() as u64);

                    report.deferred = self.ledger.pending_count();
                    report.retry_in = Some(retry_in);
                    return report;
                }
            }
        }
    }

    /// Drain on every `flush_interval` tick and whenever woken, until `shutdown`
    /// turns true or its sender goes away. A final drain runs before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            flush_interval = ?self.config.flush_interval,
            "starting apply event delivery"
        );
        let mut delay = self.config.flush_interval;
        let mut backing_off = false;

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified(), if !backing_off => {}
            }

            let report = self.flush().await;
            backing_off = report.retry_in.is_some();
            delay = report.retry_in.unwrap_or(self.config.flush_interval);
        }

        let report = self.flush().await;
        info!(
            delivered = report.delivered,
            deferred = report.deferred,
            "stopped apply event delivery"
        );
    }

    /// Up to `max_batch_size` unsent events, oldest token first.
    fn next_batch(&self) -> Vec<AppliedFlag> {
        self.ledger
            .pending_groups()
            .into_iter()
            .flat_map(|group| {
                let resolve_token = group.resolve_token;
                group.records.into_iter().map(move |record| AppliedFlag {
                    resolve_token: resolve_token.clone(),
                    flag_name: record.flag_name,
                    applied_at: record.applied_at,
                })
            })
            .take(self.config.max_batch_size.max(1))
            .collect()
    }

    async fn publish(&self, batch: &[AppliedFlag]) -> DeliveryOutcome {
        let start = time::Instant::now();
        let outcome =
            match tokio::time::timeout(self.config.request_timeout, self.publisher.publish(batch))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::transient(format!(
                    "publishing timed out after {:?}",
                    self.config.request_timeout
                )),
            };
        metrics::histogram!(APPLY_DELIVERY_DURATION_HISTOGRAM)
            .record(start.elapsed().as_secs_f64());
        debug!(events = batch.len(), ?outcome, "published apply events");

        outcome
    }

    fn settle_delivered(&self, batch: &[AppliedFlag]) -> usize {
        let settled = self.ledger.settle_delivered(batch);
        metrics::counter!(APPLY_DELIVERED_COUNTER).increment(settled as u64);
        settled
    }

    fn settle_rejected(&self, batch: &[AppliedFlag]) -> usize {
        let settled = self.ledger.settle_rejected(batch);
        metrics::counter!(APPLY_REJECTED_COUNTER).increment(settled as u64);
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use crate::types::ApplyStatus;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;

    /// Replays scripted outcomes and remembers every batch it was handed.
    #[derive(Default)]
    struct ScriptedPublisher {
        outcomes: std::sync::Mutex<VecDeque<DeliveryOutcome>>,
        batches: std::sync::Mutex<Vec<Vec<AppliedFlag>>>,
    }

    impl ScriptedPublisher {
        fn new(outcomes: Vec<DeliveryOutcome>) -> Self {
            Self {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                batches: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn batches(&self) -> Vec<Vec<AppliedFlag>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApplyPublisher for Arc<ScriptedPublisher> {
        async fn publish(&self, flags: &[AppliedFlag]) -> DeliveryOutcome {
            self.batches.lock().unwrap().push(flags.to_vec());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DeliveryOutcome::Success)
        }
    }

    struct HangingPublisher;

    #[async_trait]
    impl ApplyPublisher for HangingPublisher {
        async fn publish(&self, _flags: &[AppliedFlag]) -> DeliveryOutcome {
            std::future::pending().await
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn ledger_with(records: &[(&str, &str)]) -> Arc<ApplyLedger> {
        let ledger = Arc::new(ApplyLedger::new(Arc::new(MemoryStorage::new())).unwrap());
        for (i, (token, flag)) in records.iter().enumerate() {
            ledger.record(token, flag, at(i as i64)).unwrap();
        }
        ledger
    }

    fn worker(
        ledger: &Arc<ApplyLedger>,
        outcomes: Vec<DeliveryOutcome>,
        config: WorkerConfig,
    ) -> (EventDeliveryWorker<Arc<ScriptedPublisher>>, Arc<ScriptedPublisher>) {
        let publisher = Arc::new(ScriptedPublisher::new(outcomes));
        (
            EventDeliveryWorker::new(ledger.clone(), publisher.clone(), config),
            publisher,
        )
    }

    fn flag_names(batch: &[AppliedFlag]) -> Vec<&str> {
        batch.iter().map(|a| a.flag_name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_success_removes_everything() {
        let ledger = ledger_with(&[("t0", "f1"), ("t0", "f2"), ("t1", "f1")]);
        let (worker, publisher) = worker(&ledger, vec![], WorkerConfig::default());

        let report = worker.flush().await;

        assert_eq!(report.delivered, 3);
        assert_eq!(report.retry_in, None);
        assert!(ledger.is_empty());
        assert_eq!(ledger.status("t0", "f1"), ApplyStatus::Applied);

        let batches = publisher.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(flag_names(&batches[0]), vec!["f1", "f2", "f1"]);
        assert_eq!(batches[0][2].resolve_token, "t1");
        assert_eq!(batches[0][0].applied_at, at(0));
    }

    #[tokio::test]
    async fn test_flush_removes_events_sent_before_a_restart() {
        let document = serde_json::json!([{
            "resolveToken": "t0",
            "records": [{"flagName": "f1", "appliedAt": "1970-01-01T00:00:01Z", "sent": true}]
        }]);
        let storage = Arc::new(MemoryStorage::with_document(
            document.to_string().as_bytes(),
        ));
        let ledger = Arc::new(ApplyLedger::new(storage.clone()).unwrap());
        let (worker, publisher) = worker(&ledger, vec![], WorkerConfig::default());

        let report = worker.flush().await;

        assert_eq!(report, DrainReport::default());
        assert!(publisher.batches().is_empty());
        assert!(ledger.is_empty());
        assert_eq!(ledger.status("t0", "f1"), ApplyStatus::Applied);

        let persisted: serde_json::Value =
            serde_json::from_slice(&storage.load().unwrap().unwrap()).unwrap();
        assert_eq!(persisted, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_empty_ledger_does_not_publish() {
        let ledger = ledger_with(&[]);
        let (worker, publisher) = worker(&ledger, vec![], WorkerConfig::default());

        assert_eq!(worker.flush().await, DrainReport::default());
        assert!(publisher.batches().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_reject_drops_without_marking_sent() {
        let ledger = ledger_with(&[("t0", "f1"), ("t0", "f2")]);
        let (worker, _) = worker(
            &ledger,
            vec![DeliveryOutcome::PermanentReject("400 Bad Request".to_owned())],
            WorkerConfig::default(),
        );

        let report = worker.flush().await;

        assert_eq!(report.rejected, 2);
        assert_eq!(report.delivered, 0);
        assert!(ledger.is_empty());
        assert_eq!(ledger.status("t0", "f1"), ApplyStatus::ApplyFailed);
        // A rejected flag is not recorded again under the same token.
        assert!(ledger.record("t0", "f1", at(99)).is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_ledger_and_backs_off() {
        let ledger = ledger_with(&[("t0", "f1"), ("t0", "f2")]);
        let config = WorkerConfig {
            retry_policy: RetryPolicy::build(2, time::Duration::from_secs(1))
                .maximum_interval(time::Duration::from_secs(3))
                .provide(),
            ..WorkerConfig::default()
        };
        let (worker, publisher) = worker(
            &ledger,
            vec![
                DeliveryOutcome::transient("503"),
                DeliveryOutcome::transient("503"),
                DeliveryOutcome::transient("503"),
            ],
            config,
        );

        let first = worker.flush().await;
        assert_eq!(first.retry_in, Some(time::Duration::from_secs(1)));
        assert_eq!(first.deferred, 2);
        assert_eq!(ledger.pending_count(), 2);
        assert_eq!(ledger.status("t0", "f1"), ApplyStatus::Applying);

        let second = worker.flush().await;
        assert_eq!(second.retry_in, Some(time::Duration::from_secs(2)));

        let third = worker.flush().await;
        assert_eq!(third.retry_in, Some(time::Duration::from_secs(3)));

        // Scripted failures are used up; the next drain succeeds.
        let fourth = worker.flush().await;
        assert_eq!(fourth.delivered, 2);
        assert!(ledger.is_empty());
        assert_eq!(publisher.batches().len(), 4);
    }

    #[tokio::test]
    async fn test_retry_after_is_honoured() {
        let ledger = ledger_with(&[("t0", "f1")]);
        let (worker, _) = worker(
            &ledger,
            vec![DeliveryOutcome::TransientFail {
                reason: "429".to_owned(),
                retry_after: Some(time::Duration::from_secs(30)),
            }],
            WorkerConfig::default(),
        );

        let report = worker.flush().await;

        assert_eq!(report.retry_in, Some(time::Duration::from_secs(30)));
        assert_eq!(ledger.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let ledger = ledger_with(&[("t0", "f1")]);
        let (worker, _) = worker(
            &ledger,
            vec![
                DeliveryOutcome::transient("503"),
                DeliveryOutcome::Success,
                DeliveryOutcome::transient("503"),
            ],
            WorkerConfig::default(),
        );

        worker.flush().await;
        worker.flush().await;
        ledger.record("t1", "f1", at(10)).unwrap();

        let report = worker.flush().await;
        assert_eq!(report.retry_in, Some(time::Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_batches_are_capped() {
        let ledger = ledger_with(&[
            ("t0", "f1"),
            ("t0", "f2"),
            ("t1", "f3"),
            ("t1", "f4"),
            ("t2", "f5"),
        ]);
        let config = WorkerConfig {
            max_batch_size: 2,
            ..WorkerConfig::default()
        };
        let (worker, publisher) = worker(&ledger, vec![], config);

        let report = worker.flush().await;

        assert_eq!(report.delivered, 5);
        let batches = publisher.batches();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(flag_names(&batches[1]), vec!["f3", "f4"]);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_block_later_batches() {
        let ledger = ledger_with(&[("t0", "f1"), ("t1", "f2")]);
        let config = WorkerConfig {
            max_batch_size: 1,
            ..WorkerConfig::default()
        };
        let (worker, _) = worker(
            &ledger,
            vec![DeliveryOutcome::PermanentReject("403".to_owned())],
            config,
        );

        let report = worker.flush().await;

        assert_eq!(report.rejected, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(ledger.status("t0", "f1"), ApplyStatus::ApplyFailed);
        assert_eq!(ledger.status("t1", "f2"), ApplyStatus::Applied);
    }

    #[tokio::test]
    async fn test_batch_is_dropped_after_max_attempts() {
        let ledger = ledger_with(&[("t0", "f1")]);
        let config = WorkerConfig {
            retry_policy: RetryPolicy::build(2, time::Duration::from_secs(1))
                .maximum_attempts(2)
                .provide(),
            ..WorkerConfig::default()
        };
        let (worker, _) = worker(
            &ledger,
            vec![
                DeliveryOutcome::transient("503"),
                DeliveryOutcome::transient("503"),
            ],
            config,
        );

        let first = worker.flush().await;
        assert!(first.retry_in.is_some());
        assert_eq!(ledger.pending_count(), 1);

        let second = worker.flush().await;
        assert_eq!(second.rejected, 1);
        assert_eq!(second.retry_in, None);
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_is_transient() {
        let ledger = ledger_with(&[("t0", "f1")]);
        let worker = EventDeliveryWorker::new(
            ledger.clone(),
            HangingPublisher,
            WorkerConfig {
                request_timeout: time::Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        );

        let report = worker.flush().await;

        assert!(report.retry_in.is_some());
        assert_eq!(ledger.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_on_wake_and_on_shutdown() {
        let ledger = ledger_with(&[]);
        let (worker, publisher) = worker(
            &ledger,
            vec![],
            WorkerConfig {
                flush_interval: time::Duration::from_secs(3600),
                ..WorkerConfig::default()
            },
        );
        let worker = Arc::new(worker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(shutdown_rx).await }
        });

        ledger.record("t0", "f1", at(1)).unwrap();
        worker.waker().notify_one();
        tokio::time::sleep(time::Duration::from_millis(10)).await;
        assert!(ledger.is_empty());
        assert_eq!(publisher.batches().len(), 1);

        ledger.record("t0", "f2", at(2)).unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(ledger.is_empty());
        assert_eq!(publisher.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_on_tick() {
        let ledger = ledger_with(&[("t0", "f1")]);
        let (worker, publisher) = worker(
            &ledger,
            vec![],
            WorkerConfig {
                flush_interval: time::Duration::from_secs(10),
                ..WorkerConfig::default()
            },
        );
        let worker = Arc::new(worker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(shutdown_rx).await }
        });

        tokio::time::sleep(time::Duration::from_secs(5)).await;
        assert_eq!(ledger.pending_count(), 1);

        tokio::time::sleep(time::Duration::from_secs(6)).await;
        assert!(ledger.is_empty());
        assert_eq!(publisher.batches().len(), 1);

        drop(shutdown_tx);
        handle.await.unwrap();
    }
}
