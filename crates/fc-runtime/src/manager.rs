//! Message Manager (C4) - the in-flight engine.
//!
//! Owns the set of messages one poller currently has in flight: starts
//! handler dispatch against the subscriber registry, tracks each record's
//! visibility expiry, and extends visibility in batches on a heartbeat
//! tick. Used directly by the standard-queue poller (one call per message)
//! and indirectly by the FIFO scheduler (one call per message, awaited
//! sequentially inside a per-group worker).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use fc_common::InFlightRecord;
use fc_queue::{chunk_receipt_handles, QueueConsumer};

use crate::error::RuntimeError;
use crate::registry::{DispatchOutcome, SubscriberRegistry};
use crate::Result;

/// Per-queue settings governing concurrency and visibility extension.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent_messages: usize,
    pub visibility_timeout: Duration,
    pub extension_threshold: Duration,
    pub heartbeat_interval: Duration,
    /// Lambda sets this `false`: the platform already controls the
    /// underlying visibility timeout, so no heartbeat timer should run.
    pub supports_extension: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 10,
            visibility_timeout: Duration::from_secs(30),
            extension_threshold: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            supports_extension: true,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_messages == 0 {
            return Err(RuntimeError::Config(
                "max_concurrent_messages must be >= 1".to_string(),
            ));
        }
        if self.visibility_timeout.is_zero() {
            return Err(RuntimeError::Config(
                "visibility_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Owns in-flight bookkeeping for one poller and dispatches decoded
/// messages to the registry.
///
/// The in-flight set is a `DashMap` keyed by receipt handle so the
/// heartbeat tick can snapshot it for a bulk change-visibility call without
/// holding a single lock across the whole set.
pub struct MessageManager {
    config: ManagerConfig,
    consumer: Arc<dyn QueueConsumer>,
    registry: Arc<SubscriberRegistry>,
    in_flight: Arc<DashMap<String, InFlightRecord>>,
    capacity_notify: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MessageManager {
    pub fn new(
        config: ManagerConfig,
        consumer: Arc<dyn QueueConsumer>,
        registry: Arc<SubscriberRegistry>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            consumer,
            registry,
            in_flight: Arc::new(DashMap::new()),
            capacity_notify: Arc::new(Notify::new()),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.config.max_concurrent_messages
    }

    /// Suspends until capacity frees or `timeout` elapses, whichever first.
    /// The bounded fallback exists so a missed notification (a message
    /// finishing between the caller's capacity check and this call) cannot
    /// wedge the poller forever.
    pub async fn wait_for_capacity(&self, timeout: Duration) {
        if self.has_capacity() {
            return;
        }
        let notified = self.capacity_notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    /// Spawns `process_one` in the background and forgets the result. Used
    /// by the standard-queue poller, where messages run fully concurrently
    /// with each other.
    pub fn start_process(
        self: &Arc<Self>,
        receipt_handle: String,
        message_group_id: Option<String>,
        type_id: String,
        data: Value,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.process_one(receipt_handle, message_group_id, type_id, data)
                .await;
        });
    }

    /// Runs one message's full lifecycle: insert in-flight record, dispatch
    /// to the registry, then delete on success or abandon on failure.
    /// Awaited directly (not spawned) by the FIFO scheduler so a group
    /// worker only ever has one message in flight at a time.
    pub async fn process_one(
        &self,
        receipt_handle: String,
        message_group_id: Option<String>,
        type_id: String,
        data: Value,
    ) -> DispatchOutcome {
        let record = InFlightRecord::new(
            receipt_handle.clone(),
            message_group_id,
            receipt_handle.clone(),
            self.config.visibility_timeout,
        );
        self.in_flight.insert(receipt_handle.clone(), record);

        let shutdown_rx = self.shutdown_tx.subscribe();
        let outcome = self
            .registry
            .dispatch(&type_id, data, shutdown_rx)
            .await
            .unwrap_or_else(|| {
                warn!(type_id = %type_id, "no subscriber registered; treating as failed so the message is left for redelivery");
                DispatchOutcome::Failed
            });

        self.finish(&receipt_handle, &outcome).await;
        outcome
    }

    /// Drops a record from the in-flight set without ever dispatching it,
    /// e.g. an unknown-type or malformed envelope, or a FIFO message
    /// abandoned because an earlier message in its group failed this cycle.
    /// Visibility is left to expire naturally so SQS redelivers.
    pub fn abandon_undispatched(&self, receipt_handle: &str) {
        debug!(receipt_handle, "message abandoned without dispatch; will redeliver after visibility expiry");
        self.in_flight.remove(receipt_handle);
        self.capacity_notify.notify_one();
    }

    async fn finish(&self, receipt_handle: &str, outcome: &DispatchOutcome) {
        self.in_flight.remove(receipt_handle);
        self.capacity_notify.notify_one();

        match outcome {
            DispatchOutcome::Success => {
                if let Err(e) = self.consumer.ack(receipt_handle).await {
                    warn!(error = %e, receipt_handle, "delete failed; message will redeliver and the handler must be idempotent");
                }
            }
            DispatchOutcome::Failed | DispatchOutcome::PayloadDeserialization(_) => {
                debug!(receipt_handle, "handler did not succeed; leaving visibility to expire so SQS redelivers");
            }
        }
    }

    /// One heartbeat tick: collects every record within `extension_threshold`
    /// of expiry and extends it in chunks of at most `MAX_BATCH_SIZE`.
    pub async fn heartbeat_tick(&self) {
        if !self.config.supports_extension {
            return;
        }
        let now = Instant::now();
        let threshold = self.config.extension_threshold;
        let due: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value().expires_at.saturating_duration_since(now) <= threshold)
            .map(|entry| entry.key().clone())
            .collect();

        if due.is_empty() {
            return;
        }

        let new_timeout = self.config.visibility_timeout.as_secs() as u32;
        for chunk in chunk_receipt_handles(&due) {
            match self.consumer.extend_visibility_batch(chunk, new_timeout).await {
                Ok(results) => {
                    for result in results {
                        if result.result.is_ok() {
                            if let Some(mut record) = self.in_flight.get_mut(&result.receipt_handle) {
                                record.extend(self.config.visibility_timeout);
                            }
                        } else {
                            warn!(
                                receipt_handle = %result.receipt_handle,
                                "visibility extension failed; expiry left unchanged, handler may still finish in time"
                            );
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, batch_size = chunk.len(), "bulk change-visibility call failed");
                }
            }
        }
    }

    /// Runs the heartbeat timer for the lifetime of the poller. A single
    /// shared timer (rather than one per message) is what makes extension
    /// calls naturally batchable.
    pub async fn run_heartbeat(self: Arc<Self>) {
        if !self.config.supports_extension {
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.heartbeat_tick().await,
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_queue::{BatchEntryResult, QueueError, RawMessage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::{Barrier, Mutex};

    #[derive(Default)]
    struct FakeConsumer {
        acked: Mutex<Vec<String>>,
        extended: Mutex<Vec<String>>,
        fail_extend: AtomicU32,
        batch_calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl QueueConsumer for FakeConsumer {
        fn identifier(&self) -> &str {
            "fake"
        }
        fn is_fifo(&self) -> bool {
            false
        }
        async fn poll(&self, _max_messages: u32) -> fc_queue::Result<Vec<RawMessage>> {
            Ok(vec![])
        }
        async fn ack(&self, receipt_handle: &str) -> fc_queue::Result<()> {
            self.acked.lock().await.push(receipt_handle.to_string());
            Ok(())
        }
        async fn ack_batch(&self, _handles: &[String]) -> fc_queue::Result<Vec<BatchEntryResult>> {
            Ok(vec![])
        }
        async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> fc_queue::Result<()> {
            Ok(())
        }
        async fn extend_visibility_batch(
            &self,
            receipt_handles: &[String],
            _seconds: u32,
        ) -> fc_queue::Result<Vec<BatchEntryResult>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_extend.load(Ordering::SeqCst) > 0 {
                return Err(QueueError::Sqs("throttled".to_string()));
            }
            self.extended.lock().await.extend(receipt_handles.iter().cloned());
            Ok(receipt_handles
                .iter()
                .map(|h| BatchEntryResult {
                    receipt_handle: h.clone(),
                    result: Ok(()),
                })
                .collect())
        }
        async fn abandon(&self, _receipt_handle: &str) -> fc_queue::Result<()> {
            Ok(())
        }
        fn is_healthy(&self) -> bool {
            true
        }
        async fn stop(&self) {}
    }

    fn registry_with_echo() -> Arc<SubscriberRegistry> {
        let registry = SubscriberRegistry::new();
        registry.register::<serde_json::Value, _, _>("echo", false, |_payload, _shutdown| async {
            DispatchOutcome::Success
        });
        Arc::new(registry)
    }

    /// A registry whose single handler rendezvouses on `barrier` (so the
    /// caller knows the handler has started, and thus the in-flight record
    /// has been inserted) and then blocks on `release` until the caller lets
    /// it finish. Used to deterministically pin a message in flight across a
    /// paused-clock advance instead of racing a real sleep against it.
    fn registry_with_blocking_handler(
        type_id: &'static str,
        barrier: Arc<tokio::sync::Barrier>,
        release: Arc<Notify>,
    ) -> Arc<SubscriberRegistry> {
        let registry = SubscriberRegistry::new();
        registry.register::<serde_json::Value, _, _>(type_id, false, move |_payload, _shutdown| {
            let barrier = Arc::clone(&barrier);
            let release = Arc::clone(&release);
            async move {
                barrier.wait().await;
                release.notified().await;
                DispatchOutcome::Success
            }
        });
        Arc::new(registry)
    }

    #[tokio::test]
    async fn successful_dispatch_deletes_exactly_once() {
        let consumer = Arc::new(FakeConsumer::default());
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let manager = MessageManager::new(
            ManagerConfig::default(),
            consumer.clone(),
            registry_with_echo(),
            shutdown_tx,
        )
        .unwrap();

        let outcome = manager
            .process_one("r-1".to_string(), None, "echo".to_string(), serde_json::json!({}))
            .await;

        assert_eq!(outcome, DispatchOutcome::Success);
        assert_eq!(consumer.acked.lock().await.as_slice(), ["r-1"]);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn failed_dispatch_does_not_delete() {
        let consumer = Arc::new(FakeConsumer::default());
        let registry = SubscriberRegistry::new();
        registry.register::<serde_json::Value, _, _>("boom", false, |_p, _s| async {
            DispatchOutcome::Failed
        });
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let manager = MessageManager::new(
            ManagerConfig::default(),
            consumer.clone(),
            Arc::new(registry),
            shutdown_tx,
        )
        .unwrap();

        let outcome = manager
            .process_one("r-2".to_string(), None, "boom".to_string(), serde_json::json!({}))
            .await;

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(consumer.acked.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_records_near_expiry() {
        let consumer = Arc::new(FakeConsumer::default());
        let config = ManagerConfig {
            visibility_timeout: Duration::from_secs(50),
            extension_threshold: Duration::from_secs(40),
            ..Default::default()
        };
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let barrier = Arc::new(Barrier::new(2));
        let release = Arc::new(Notify::new());
        let registry = registry_with_blocking_handler("echo", Arc::clone(&barrier), Arc::clone(&release));
        let manager = Arc::new(
            MessageManager::new(config, consumer.clone(), registry, shutdown_tx).unwrap(),
        );

        let manager_clone = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            manager_clone
                .process_one(
                    "r-3".to_string(),
                    None,
                    "echo".to_string(),
                    serde_json::json!({}),
                )
                .await
        });

        // Rendezvous with the handler so the in-flight record is guaranteed to
        // exist before the clock moves, then advance past the threshold.
        barrier.wait().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        manager.heartbeat_tick().await;
        assert!(consumer.extended.lock().await.contains(&"r-3".to_string()));

        release.notify_waiters();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn extension_failure_leaves_expiry_unchanged_but_does_not_abort_handler() {
        let consumer = Arc::new(FakeConsumer::default());
        consumer.fail_extend.store(1, Ordering::SeqCst);
        let config = ManagerConfig {
            visibility_timeout: Duration::from_secs(50),
            extension_threshold: Duration::from_secs(40),
            ..Default::default()
        };
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let barrier = Arc::new(Barrier::new(2));
        let release = Arc::new(Notify::new());
        let registry = registry_with_blocking_handler("echo", Arc::clone(&barrier), Arc::clone(&release));
        let manager = Arc::new(
            MessageManager::new(config, consumer.clone(), registry, shutdown_tx).unwrap(),
        );

        let manager_clone = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            manager_clone
                .process_one(
                    "r-4".to_string(),
                    None,
                    "echo".to_string(),
                    serde_json::json!({}),
                )
                .await
        });

        barrier.wait().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        manager.heartbeat_tick().await;
        assert!(consumer.extended.lock().await.is_empty());

        release.notify_waiters();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_tick_issues_two_batches_for_eleven_due_records() {
        let consumer = Arc::new(FakeConsumer::default());
        let config = ManagerConfig {
            visibility_timeout: Duration::from_secs(50),
            extension_threshold: Duration::from_secs(40),
            ..Default::default()
        };
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let barrier = Arc::new(Barrier::new(12));
        let release = Arc::new(Notify::new());
        let registry = registry_with_blocking_handler("echo", Arc::clone(&barrier), Arc::clone(&release));
        let manager = Arc::new(
            MessageManager::new(config, consumer.clone(), registry, shutdown_tx).unwrap(),
        );

        let mut handles = Vec::with_capacity(11);
        for i in 0..11 {
            let manager_clone = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager_clone
                    .process_one(format!("r-{i}"), None, "echo".to_string(), serde_json::json!({}))
                    .await
            }));
        }

        barrier.wait().await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        manager.heartbeat_tick().await;
        assert_eq!(consumer.batch_calls.load(Ordering::SeqCst), 2);

        release.notify_waiters();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn capacity_rejects_construction_with_zero_max_concurrency() {
        let consumer = Arc::new(FakeConsumer::default());
        let config = ManagerConfig {
            max_concurrent_messages: 0,
            ..Default::default()
        };
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let err = MessageManager::new(config, consumer, registry_with_echo(), shutdown_tx).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[tokio::test]
    async fn zero_visibility_timeout_is_rejected() {
        let consumer = Arc::new(FakeConsumer::default());
        let config = ManagerConfig {
            visibility_timeout: Duration::ZERO,
            ..Default::default()
        };
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let err = MessageManager::new(config, consumer, registry_with_echo(), shutdown_tx).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }
}
