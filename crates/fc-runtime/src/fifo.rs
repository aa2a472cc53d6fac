//! FIFO Scheduler (C6).
//!
//! Activated by the poller/Lambda adapter in place of direct
//! `MessageManager::start_process` calls whenever the queue URL ends in
//! `.fifo`. Messages sharing a `message-group-id` are processed strictly in
//! receive order by a dedicated per-group worker task; different groups run
//! fully in parallel. The `max-concurrent-messages` ceiling is enforced by a
//! semaphore each worker acquires once per message, so it counts
//! groups-in-flight rather than messages-in-flight: a worker only ever
//! awaits one message at a time.
//!
//! If a handler returns anything other than success, the rest of that
//! group's messages *for the poll cycle that produced them* are abandoned
//! without dispatch. Poisoned-group and remaining-count bookkeeping is
//! scoped to one poll batch and reference-counted so it never grows
//! unboundedly across the runtime's lifetime.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

use crate::manager::MessageManager;
use crate::Result;
use crate::RuntimeError;

/// One decoded message awaiting FIFO dispatch.
#[derive(Debug, Clone)]
pub struct FifoMessage {
    pub receipt_handle: String,
    pub message_group_id: String,
    pub type_id: String,
    pub data: Value,
}

/// Identifies one group's messages within one poll cycle, so a failure in
/// group G only poisons G's remaining messages from *this* batch — other
/// batches (and other groups) are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchGroupKey {
    poll_batch: u64,
    group_id: Arc<str>,
}

struct Task {
    receipt_handle: String,
    type_id: String,
    data: Value,
    key: BatchGroupKey,
}

/// Schedules FIFO messages one group-worker per `message-group-id`.
pub struct FifoScheduler {
    manager: Arc<MessageManager>,
    semaphore: Arc<Semaphore>,
    group_workers: DashMap<Arc<str>, mpsc::UnboundedSender<Task>>,
    /// Groups poisoned for a given poll batch; consulted by the worker
    /// before dispatching each queued message.
    poisoned: Arc<DashSet<BatchGroupKey>>,
    /// Remaining undispatched-or-inflight message count per batch+group,
    /// used to know when it is safe to drop a batch's bookkeeping entries.
    remaining: Arc<DashMap<BatchGroupKey, AtomicU32>>,
    next_poll_batch: AtomicU64,
}

impl FifoScheduler {
    pub fn new(manager: Arc<MessageManager>, max_concurrent_groups: usize) -> Self {
        Self {
            manager,
            semaphore: Arc::new(Semaphore::new(max_concurrent_groups.max(1))),
            group_workers: DashMap::new(),
            poisoned: Arc::new(DashSet::new()),
            remaining: Arc::new(DashMap::new()),
            next_poll_batch: AtomicU64::new(0),
        }
    }

    /// Groups `messages` by `message_group_id` (insertion order preserved
    /// per group) and feeds each group's worker, spawning one if this is
    /// the group's first message. Returns the poll-batch id used to scope
    /// this call's cascading-failure bookkeeping (useful in tests).
    pub fn dispatch_batch(&self, messages: Vec<FifoMessage>) -> Result<u64> {
        let poll_batch = self.next_poll_batch.fetch_add(1, Ordering::SeqCst);
        let mut groups: IndexMap<Arc<str>, Vec<FifoMessage>> = IndexMap::new();
        for message in messages {
            if message.message_group_id.is_empty() {
                error!(
                    receipt_handle = %message.receipt_handle,
                    "FIFO message arrived without a message-group-id; dropping for redelivery"
                );
                return Err(RuntimeError::MissingMessageGroupId(message.receipt_handle));
            }
            let group_id: Arc<str> = Arc::from(message.message_group_id.as_str());
            groups.entry(group_id).or_default().push(message);
        }

        for (group_id, group_messages) in groups {
            let key_count = group_messages.len() as u32;
            let batch_key = BatchGroupKey {
                poll_batch,
                group_id: Arc::clone(&group_id),
            };
            self.remaining.insert(batch_key.clone(), AtomicU32::new(key_count));

            let sender = self.get_or_spawn_worker(&group_id);
            for message in group_messages {
                let task = Task {
                    receipt_handle: message.receipt_handle,
                    type_id: message.type_id,
                    data: message.data,
                    key: batch_key.clone(),
                };
                if sender.send(task).is_err() {
                    warn!(group_id = %group_id, "group worker channel closed; message abandoned for redelivery");
                }
            }
        }

        Ok(poll_batch)
    }

    fn get_or_spawn_worker(&self, group_id: &Arc<str>) -> mpsc::UnboundedSender<Task> {
        if let Some(sender) = self.group_workers.get(group_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.group_workers.insert(Arc::clone(group_id), tx.clone());

        let group_id = Arc::clone(group_id);
        let manager = Arc::clone(&self.manager);
        let semaphore = Arc::clone(&self.semaphore);
        let poisoned = Arc::clone(&self.poisoned);
        let remaining = Arc::clone(&self.remaining);

        tokio::spawn(Self::run_group_worker(group_id, rx, manager, semaphore, poisoned, remaining));

        tx
    }

    async fn run_group_worker(
        group_id: Arc<str>,
        mut rx: mpsc::UnboundedReceiver<Task>,
        manager: Arc<MessageManager>,
        semaphore: Arc<Semaphore>,
        poisoned: Arc<DashSet<BatchGroupKey>>,
        remaining: Arc<DashMap<BatchGroupKey, AtomicU32>>,
    ) {
        while let Some(task) = rx.recv().await {
            if poisoned.contains(&task.key) {
                debug!(
                    group_id = %group_id,
                    receipt_handle = %task.receipt_handle,
                    "group poisoned by an earlier failure this poll cycle; abandoning without dispatch"
                );
                manager.abandon_undispatched(&task.receipt_handle);
            } else {
                let permit = semaphore
                    .acquire()
                    .await
                    .expect("scheduler semaphore is never closed while workers run");
                let outcome = manager
                    .process_one(
                        task.receipt_handle.clone(),
                        Some(group_id.to_string()),
                        task.type_id.clone(),
                        task.data.clone(),
                    )
                    .await;
                drop(permit);

                if !matches!(outcome, crate::registry::DispatchOutcome::Success) {
                    poisoned.insert(task.key.clone());
                    warn!(
                        group_id = %group_id,
                        receipt_handle = %task.receipt_handle,
                        "handler did not succeed; remaining messages in this group are abandoned for this poll cycle"
                    );
                }
            }

            Self::retire(&remaining, &poisoned, &task.key);
        }
    }

    /// Decrements the batch+group's remaining count and, once it reaches
    /// zero, drops its bookkeeping entries so `poisoned`/`remaining` do not
    /// grow without bound across the runtime's lifetime.
    fn retire(
        remaining: &DashMap<BatchGroupKey, AtomicU32>,
        poisoned: &DashSet<BatchGroupKey>,
        key: &BatchGroupKey,
    ) {
        let done = if let Some(counter) = remaining.get(key) {
            counter.fetch_sub(1, Ordering::SeqCst) == 1
        } else {
            false
        };
        if done {
            remaining.remove(key);
            poisoned.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::registry::SubscriberRegistry;
    use fc_queue::{BatchEntryResult, QueueConsumer, RawMessage};
    use std::time::Duration;
    use tokio::sync::{broadcast, Mutex};

    #[derive(Default)]
    struct FakeConsumer {
        acked: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl QueueConsumer for FakeConsumer {
        fn identifier(&self) -> &str {
            "fake"
        }
        fn is_fifo(&self) -> bool {
            true
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

    fn new_scheduler(registry: Arc<SubscriberRegistry>) -> (Arc<FifoScheduler>, Arc<FakeConsumer>) {
        let consumer = Arc::new(FakeConsumer::default());
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let manager = Arc::new(
            MessageManager::new(ManagerConfig::default(), consumer.clone(), registry, shutdown_tx).unwrap(),
        );
        (Arc::new(FifoScheduler::new(manager, 4)), consumer)
    }

    fn msg(receipt: &str, group: &str, type_id: &str) -> FifoMessage {
        FifoMessage {
            receipt_handle: receipt.to_string(),
            message_group_id: group.to_string(),
            type_id: type_id.to_string(),
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn two_groups_each_process_in_receive_order() {
        let registry = SubscriberRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for type_id in ["a", "b"] {
            let order = Arc::clone(&order);
            registry.register::<serde_json::Value, _, _>(type_id, true, move |_p, _s| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().await.push("ran".to_string());
                    crate::registry::DispatchOutcome::Success
                }
            });
        }
        let (scheduler, consumer) = new_scheduler(Arc::new(registry));

        scheduler
            .dispatch_batch(vec![
                msg("a1", "A", "a"),
                msg("a2", "A", "a"),
                msg("a3", "A", "a"),
                msg("b1", "B", "b"),
                msg("b2", "B", "b"),
            ])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let acked = consumer.acked.lock().await;
        let group_a: Vec<_> = acked.iter().filter(|h| h.starts_with('a')).collect();
        let group_b: Vec<_> = acked.iter().filter(|h| h.starts_with('b')).collect();
        assert_eq!(group_a, vec!["a1", "a2", "a3"]);
        assert_eq!(group_b, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn failure_halts_the_rest_of_the_group_this_cycle() {
        let registry = SubscriberRegistry::new();
        registry.register::<serde_json::Value, _, _>("ok", false, |_p, _s| async {
            crate::registry::DispatchOutcome::Success
        });
        registry.register::<serde_json::Value, _, _>("fail", false, |_p, _s| async {
            crate::registry::DispatchOutcome::Failed
        });
        let (scheduler, consumer) = new_scheduler(Arc::new(registry));

        scheduler
            .dispatch_batch(vec![
                msg("a1", "A", "ok"),
                msg("a2", "A", "fail"),
                msg("a3", "A", "ok"),
            ])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let acked = consumer.acked.lock().await;
        assert_eq!(acked.as_slice(), ["a1"]);
    }

    #[tokio::test]
    async fn missing_group_id_is_rejected() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (scheduler, _consumer) = new_scheduler(registry);

        let err = scheduler
            .dispatch_batch(vec![FifoMessage {
                receipt_handle: "x".to_string(),
                message_group_id: String::new(),
                type_id: "whatever".to_string(),
                data: serde_json::json!({}),
            }])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MissingMessageGroupId(_)));
    }
}
