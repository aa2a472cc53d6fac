//! Lambda Adapter (C7).
//!
//! Dispatches a batch of SQS records delivered directly to a Lambda
//! invocation through the same envelope codec and subscriber registry the
//! standalone poller uses, but with a different lifecycle: no heartbeat (the
//! Lambda platform already owns the underlying visibility timeout) and a
//! partial-batch-failure report instead of individual deletes.
//!
//! `handle_batch` is deliberately independent of `lambda_runtime::run` /
//! `service_fn` wiring — that binary-level glue is a sample-app concern this
//! crate doesn't cover — so it can be unit-tested by constructing an
//! `SqsEvent` directly.

pub mod error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_lambda_events::event::sqs::{SqsBatchResponse, SqsEvent};
use aws_lambda_events::sqs::{BatchItemFailure, SqsMessage};
use fc_codec::{decode, CodecError};
use fc_queue::{BatchEntryResult, QueueConsumer, RawMessage, MAX_BATCH_SIZE};
use fc_runtime::{DispatchOutcome, ManagerConfig, MessageManager, SubscriberRegistry};
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tracing::{error, warn};

pub use error::LambdaAdapterError;

/// Settings controlling how a batch's outcome is reported back to Lambda.
#[derive(Debug, Clone)]
pub struct LambdaAdapterConfig {
    /// Issue an SQS delete for each successfully processed message. Usually
    /// left `false`: returning a partial-batch response already tells
    /// Lambda which records to consider acknowledged.
    pub delete_messages_when_completed: bool,
    /// Return a `SqsBatchResponse` listing only the failed message ids. If
    /// `false`, any failure fails the whole invocation so Lambda redelivers
    /// the entire batch.
    pub use_batch_response: bool,
    /// If set, failed items have their visibility reset to this value via a
    /// bulk change-visibility call instead of waiting out the queue's
    /// configured (possibly long) timeout.
    pub visibility_timeout_for_batch_failures: Option<Duration>,
}

impl Default for LambdaAdapterConfig {
    fn default() -> Self {
        Self {
            delete_messages_when_completed: false,
            use_batch_response: false,
            visibility_timeout_for_batch_failures: None,
        }
    }
}

/// No-op transport used when the caller has no real queue consumer (the
/// common case: Lambda's partial-batch response is the only acknowledgement
/// mechanism needed, so deletes and visibility extension are never called).
struct NullConsumer;

#[async_trait]
impl QueueConsumer for NullConsumer {
    fn identifier(&self) -> &str {
        "lambda-null-consumer"
    }
    fn is_fifo(&self) -> bool {
        false
    }
    async fn poll(&self, _max_messages: u32) -> fc_queue::Result<Vec<RawMessage>> {
        Ok(Vec::new())
    }
    async fn ack(&self, _receipt_handle: &str) -> fc_queue::Result<()> {
        Ok(())
    }
    async fn ack_batch(&self, _receipt_handles: &[String]) -> fc_queue::Result<Vec<BatchEntryResult>> {
        Ok(Vec::new())
    }
    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> fc_queue::Result<()> {
        Ok(())
    }
    async fn extend_visibility_batch(
        &self,
        _receipt_handles: &[String],
        _seconds: u32,
    ) -> fc_queue::Result<Vec<BatchEntryResult>> {
        Ok(Vec::new())
    }
    async fn abandon(&self, _receipt_handle: &str) -> fc_queue::Result<()> {
        Ok(())
    }
    fn is_healthy(&self) -> bool {
        true
    }
    async fn stop(&self) {}
}

struct DecodedRecord {
    message_id: String,
    receipt_handle: String,
    message_group_id: Option<String>,
    type_id: String,
    data: serde_json::Value,
}

struct RecordResult {
    message_id: String,
    receipt_handle: String,
    succeeded: bool,
}

/// Dispatches one Lambda-delivered batch through `registry`, returning a
/// partial-batch-failure report (or an error, if `use_batch_response` is
/// off and anything failed).
pub async fn handle_batch(
    event: SqsEvent,
    registry: Arc<SubscriberRegistry>,
    consumer: Option<Arc<dyn QueueConsumer>>,
    cfg: &LambdaAdapterConfig,
) -> Result<SqsBatchResponse, LambdaAdapterError> {
    let batch_size = event.records.len().max(1);
    let manager_config = ManagerConfig {
        max_concurrent_messages: batch_size,
        supports_extension: false,
        ..ManagerConfig::default()
    };

    // The manager's own delete-on-success is only wired to a real consumer
    // when the caller actually wants per-message deletes; otherwise a
    // partial-batch response is the only acknowledgement mechanism and the
    // manager gets a no-op sink. The real consumer (if any) is still used
    // below for the visibility-reset-on-failure path regardless.
    let manager_consumer: Arc<dyn QueueConsumer> = match (&consumer, cfg.delete_messages_when_completed) {
        (Some(real), true) => Arc::clone(real),
        _ => Arc::new(NullConsumer),
    };

    let (shutdown_tx, _rx) = broadcast::channel(1);
    let manager = Arc::new(MessageManager::new(manager_config, manager_consumer, Arc::clone(&registry), shutdown_tx)?);

    let mut groups: IndexMap<String, Vec<DecodedRecord>> = IndexMap::new();
    let mut upfront_failures: Vec<RecordResult> = Vec::new();

    for record in event.records {
        match decode_record(&record, &registry) {
            Ok(decoded) => {
                let group_key = decoded
                    .message_group_id
                    .clone()
                    .unwrap_or_else(|| format!("__single__{}", decoded.message_id));
                groups.entry(group_key).or_default().push(decoded);
            }
            Err((message_id, receipt_handle)) => {
                upfront_failures.push(RecordResult {
                    message_id,
                    receipt_handle,
                    succeeded: false,
                });
            }
        }
    }

    let group_futures = groups
        .into_iter()
        .map(|(group_id, records)| process_group(Arc::clone(&manager), group_id, records));
    let grouped_results: Vec<RecordResult> = futures::future::join_all(group_futures)
        .await
        .into_iter()
        .flatten()
        .collect();

    let all_results: Vec<RecordResult> = upfront_failures.into_iter().chain(grouped_results).collect();
    let failed: Vec<&RecordResult> = all_results.iter().filter(|r| !r.succeeded).collect();

    if let (Some(real_consumer), Some(new_timeout)) = (&consumer, cfg.visibility_timeout_for_batch_failures) {
        if !failed.is_empty() {
            let handles: Vec<String> = failed.iter().map(|r| r.receipt_handle.clone()).collect();
            for chunk in handles.chunks(MAX_BATCH_SIZE) {
                if let Err(e) = real_consumer
                    .extend_visibility_batch(chunk, new_timeout.as_secs() as u32)
                    .await
                {
                    warn!(error = %e, "failed to reset visibility on batch failures");
                }
            }
        }
    }

    let failure_count = failed.len();
    let total = all_results.len();

    if cfg.use_batch_response {
        let batch_item_failures = failed
            .into_iter()
            .map(|r| BatchItemFailure {
                item_identifier: r.message_id.clone(),
            })
            .collect();
        Ok(SqsBatchResponse { batch_item_failures })
    } else if failure_count > 0 {
        Err(LambdaAdapterError::BatchFailed(failure_count, total))
    } else {
        Ok(SqsBatchResponse::default())
    }
}

fn decode_record(
    record: &SqsMessage,
    registry: &SubscriberRegistry,
) -> Result<DecodedRecord, (String, String)> {
    let message_id = record.message_id.clone().unwrap_or_default();
    let receipt_handle = record.receipt_handle.clone().unwrap_or_default();
    let body = record.body.as_deref().unwrap_or_default();

    let decoded = match decode(body.as_bytes()) {
        Ok(decoded) => decoded,
        Err(CodecError::MalformedEnvelope(field)) => {
            warn!(field, message_id = %message_id, "malformed envelope in lambda batch; reporting as failed item");
            return Err((message_id, receipt_handle));
        }
        Err(e) => {
            warn!(error = %e, message_id = %message_id, "failed to decode envelope in lambda batch");
            return Err((message_id, receipt_handle));
        }
    };

    if !registry.is_registered(&decoded.type_id) {
        warn!(type_id = %decoded.type_id, message_id = %message_id, "unknown message type in lambda batch; reporting as failed item");
        return Err((message_id, receipt_handle));
    }

    let message_group_id = message_group_id_attribute(record);

    Ok(DecodedRecord {
        message_id,
        receipt_handle,
        message_group_id,
        type_id: decoded.type_id,
        data: decoded.data,
    })
}

fn message_group_id_attribute(record: &SqsMessage) -> Option<String> {
    record
        .attributes
        .get("MessageGroupId")
        .cloned()
        .filter(|s| !s.is_empty())
}

/// Processes one group's records sequentially, short-circuiting the rest of
/// the group as soon as one fails — identical cascading behavior to the
/// standalone FIFO scheduler (C6), scoped to this one invocation's batch.
async fn process_group(
    manager: Arc<MessageManager>,
    group_id: String,
    records: Vec<DecodedRecord>,
) -> Vec<RecordResult> {
    let mut results = Vec::with_capacity(records.len());
    let mut poisoned = false;

    for record in records {
        if poisoned {
            results.push(RecordResult {
                message_id: record.message_id,
                receipt_handle: record.receipt_handle,
                succeeded: false,
            });
            continue;
        }

        let outcome = manager
            .process_one(
                record.receipt_handle.clone(),
                Some(group_id.clone()),
                record.type_id,
                record.data,
            )
            .await;
        let succeeded = matches!(outcome, DispatchOutcome::Success);
        if !succeeded {
            poisoned = true;
            error!(group_id = %group_id, message_id = %record.message_id, "handler did not succeed; remaining group messages in this batch are reported failed without dispatch");
        }
        results.push(RecordResult {
            message_id: record.message_id,
            receipt_handle: record.receipt_handle,
            succeeded,
        });
    }

    results
}

/// Returns an owned `HashMap` view of a batch's receipt handles to message
/// ids, useful for callers that need to correlate a `BatchItemFailure` back
/// to the raw SQS record.
pub fn receipt_handles_by_message_id(event: &SqsEvent) -> HashMap<String, String> {
    event
        .records
        .iter()
        .filter_map(|r| Some((r.message_id.clone()?, r.receipt_handle.clone()?)))
        .collect()
}
