//! SQS Poller (C5) - the standard (non-FIFO) receive loop.
//!
//! One instance per configured queue: computes remaining capacity, issues a
//! backoff-wrapped long-poll receive, decodes each raw delivery through the
//! envelope codec, and hands the result to the Message Manager (standard
//! queues) or the FIFO scheduler (`.fifo` queues). Malformed envelopes and
//! unknown message types are logged and left alone so SQS redelivers them
//! until they land in a DLQ.

use std::sync::Arc;
use std::time::Duration;

use fc_codec::{decode, CodecError};
use fc_queue::{QueueConsumer, MAX_BATCH_SIZE};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::backoff::{run_with_backoff, BackoffLoopResult, BackoffPolicy, FatalErrorClassifier};
use crate::fifo::{FifoMessage, FifoScheduler};
use crate::manager::MessageManager;
use crate::registry::SubscriberRegistry;

/// Fallback poll interval used while waiting for capacity to free up; bounds
/// how long a capacity-wait can go unnoticed by the shutdown signal.
const CAPACITY_POLL_FALLBACK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub backoff_policy: BackoffPolicy,
    pub fatal_error_classifier: FatalErrorClassifier,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            backoff_policy: BackoffPolicy::default(),
            fatal_error_classifier: FatalErrorClassifier::default(),
        }
    }
}

/// Drives one queue's receive loop until its shutdown signal fires.
pub struct SqsPoller {
    consumer: Arc<dyn QueueConsumer>,
    registry: Arc<SubscriberRegistry>,
    manager: Arc<MessageManager>,
    fifo: Option<Arc<FifoScheduler>>,
    config: PollerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl SqsPoller {
    pub fn new(
        consumer: Arc<dyn QueueConsumer>,
        registry: Arc<SubscriberRegistry>,
        manager: Arc<MessageManager>,
        fifo: Option<Arc<FifoScheduler>>,
        config: PollerConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            consumer,
            registry,
            manager,
            fifo,
            config,
            shutdown_tx,
        }
    }

    /// Runs the receive loop and the manager's heartbeat concurrently until
    /// shutdown. Returns once both have wound down.
    pub async fn run(self: Arc<Self>) {
        let heartbeat = tokio::spawn(Arc::clone(&self.manager).run_heartbeat());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("poller received shutdown signal");
                    break;
                }
                terminate = self.poll_once() => {
                    if terminate {
                        let _ = self.shutdown_tx.send(());
                        break;
                    }
                }
            }
        }

        let _ = heartbeat.await;
    }

    /// Performs one iteration: wait for capacity, receive, dispatch. Returns
    /// `true` if a fatal error was hit and the poller should terminate.
    async fn poll_once(&self) -> bool {
        if !self.manager.has_capacity() {
            self.manager.wait_for_capacity(CAPACITY_POLL_FALLBACK).await;
            return false;
        }

        let capacity = self
            .manager
            .config()
            .max_concurrent_messages
            .saturating_sub(self.manager.active_count())
            .min(MAX_BATCH_SIZE);
        if capacity == 0 {
            tokio::time::sleep(CAPACITY_POLL_FALLBACK).await;
            return false;
        }

        let shutdown_rx = self.shutdown_tx.subscribe();
        let result = run_with_backoff(
            || self.consumer.poll(capacity as u32),
            &self.config.backoff_policy,
            &self.config.fatal_error_classifier,
            shutdown_rx,
        )
        .await;

        match result {
            Ok(raw_messages) => {
                self.dispatch_received(raw_messages);
                false
            }
            Err(BackoffLoopResult::Fatal) => {
                error!("receive failed with a fatal error; poller terminating");
                true
            }
            Err(BackoffLoopResult::ShutDown) => false,
        }
    }

    fn dispatch_received(&self, raw_messages: Vec<fc_queue::RawMessage>) {
        if raw_messages.is_empty() {
            return;
        }

        let mut fifo_batch = Vec::new();
        for raw in raw_messages {
            let decoded = match decode(&raw.body) {
                Ok(decoded) => decoded,
                Err(CodecError::MalformedEnvelope(field)) => {
                    warn!(field, receipt_handle = %raw.receipt_handle, "malformed envelope; leaving message for redelivery");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, receipt_handle = %raw.receipt_handle, "failed to decode envelope; leaving message for redelivery");
                    continue;
                }
            };

            if !self.registry.is_registered(&decoded.type_id) {
                warn!(type_id = %decoded.type_id, receipt_handle = %raw.receipt_handle, "unknown message type; leaving message for redelivery");
                continue;
            }

            if let Some(fifo) = &self.fifo {
                fifo_batch.push(FifoMessage {
                    receipt_handle: raw.receipt_handle,
                    message_group_id: raw.message_group_id.unwrap_or_default(),
                    type_id: decoded.type_id,
                    data: decoded.data,
                });
            } else {
                self.manager.start_process(raw.receipt_handle, None, decoded.type_id, decoded.data);
            }
        }

        if let Some(fifo) = &self.fifo {
            if !fifo_batch.is_empty() {
                if let Err(e) = fifo.dispatch_batch(fifo_batch) {
                    error!(error = %e, "FIFO batch rejected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use fc_codec::encode;
    use fc_queue::{BatchEntryResult, RawMessage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeConsumer {
        queue: Mutex<Vec<RawMessage>>,
        acked: Mutex<Vec<String>>,
        polls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl QueueConsumer for FakeConsumer {
        fn identifier(&self) -> &str {
            "fake"
        }
        fn is_fifo(&self) -> bool {
            false
        }
        async fn poll(&self, max_messages: u32) -> fc_queue::Result<Vec<RawMessage>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut queue = self.queue.lock().await;
            let take = (max_messages as usize).min(queue.len());
            Ok(queue.drain(0..take).collect())
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
            _handles: &[String],
            _seconds: u32,
        ) -> fc_queue::Result<Vec<BatchEntryResult>> {
            Ok(vec![])
        }
        async fn abandon(&self, _receipt_handle: &str) -> fc_queue::Result<()> {
            Ok(())
        }
        fn is_healthy(&self) -> bool {
            true
        }
        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn happy_path_dispatches_once_and_deletes_once() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Order {
            id: String,
        }

        let envelope = encode(&Order { id: "o-1".to_string() }, "order", "urn:test").unwrap();
        let body = serde_json::to_vec(&envelope).unwrap();

        let consumer = Arc::new(FakeConsumer::default());
        consumer.queue.lock().await.push(RawMessage {
            body,
            receipt_handle: "r-1".to_string(),
            message_id: Some("m-1".to_string()),
            message_group_id: None,
            message_deduplication_id: None,
            attributes: Default::default(),
        });

        let call_count = Arc::new(AtomicU32::new(0));
        let registry = SubscriberRegistry::new();
        let call_count_clone = Arc::clone(&call_count);
        registry.register::<Order, _, _>("order", false, move |_payload, _shutdown| {
            let call_count = Arc::clone(&call_count_clone);
            async move {
                call_count.fetch_add(1, Ordering::SeqCst);
                crate::registry::DispatchOutcome::Success
            }
        });

        let (shutdown_tx, _rx) = broadcast::channel(1);
        let manager = Arc::new(
            MessageManager::new(ManagerConfig::default(), consumer.clone(), Arc::new(registry.clone()), shutdown_tx.clone())
                .unwrap(),
        );
        let poller = Arc::new(SqsPoller::new(
            consumer.clone(),
            Arc::new(registry),
            manager,
            None,
            PollerConfig::default(),
            shutdown_tx.clone(),
        ));

        poller.poll_once().await;
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.acked.lock().await.as_slice(), ["r-1"]);
    }
}
