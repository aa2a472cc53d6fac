use std::collections::HashMap;

use async_trait::async_trait;

pub mod error;
pub mod publisher;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::QueueError;
pub use publisher::Publisher;

pub type Result<T> = std::result::Result<T, QueueError>;

/// The SQS service cap on entries per batch request (receive, delete,
/// change-visibility-batch). The Message Manager chunks to this size.
pub const MAX_BATCH_SIZE: usize = 10;

/// A message as delivered by the transport, before envelope decoding.
/// Deliberately codec-agnostic: this crate knows nothing about envelopes.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub receipt_handle: String,
    pub message_id: Option<String>,
    pub message_group_id: Option<String>,
    pub message_deduplication_id: Option<String>,
    pub attributes: HashMap<String, String>,
}

/// Queue metrics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub pending_messages: u64,
    pub in_flight_messages: u64,
    pub queue_identifier: String,
    pub total_polled: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
}

/// Outcome of one entry in a batch change-visibility or delete call.
#[derive(Debug, Clone)]
pub struct BatchEntryResult {
    pub receipt_handle: String,
    pub result: std::result::Result<(), String>,
}

/// Trait for consuming messages from a queue.
///
/// FIFO-ness (queue URL ending in `.fifo`) is a property of the underlying
/// queue the consumer was constructed against; this trait does not branch on
/// it — that is the FIFO scheduler's job, one layer up.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Unique identifier for this consumer (queue name).
    fn identifier(&self) -> &str;

    /// True if this consumer is reading from a FIFO queue.
    fn is_fifo(&self) -> bool;

    /// Long-polls for up to `max_messages` messages (clamped to
    /// [`MAX_BATCH_SIZE`]).
    async fn poll(&self, max_messages: u32) -> Result<Vec<RawMessage>>;

    /// Deletes a single message.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Deletes up to [`MAX_BATCH_SIZE`] messages in one call. Callers are
    /// responsible for chunking larger sets.
    async fn ack_batch(&self, receipt_handles: &[String]) -> Result<Vec<BatchEntryResult>>;

    /// Extends the visibility timeout of a single message.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Extends the visibility timeout of up to [`MAX_BATCH_SIZE`] messages in
    /// one call, all to the same new timeout. Callers are responsible for
    /// chunking larger sets.
    async fn extend_visibility_batch(
        &self,
        receipt_handles: &[String],
        seconds: u32,
    ) -> Result<Vec<BatchEntryResult>>;

    /// Makes a message immediately visible again for redelivery (used to
    /// abandon a message rather than waiting out its visibility timeout).
    async fn abandon(&self, receipt_handle: &str) -> Result<()>;

    fn is_healthy(&self) -> bool;

    async fn stop(&self);

    /// Returns queue-level metrics, if the transport can report them.
    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}

/// Splits a slice into chunks of at most [`MAX_BATCH_SIZE`] owned `String`s.
pub fn chunk_receipt_handles(handles: &[String]) -> impl Iterator<Item = &[String]> {
    handles.chunks(MAX_BATCH_SIZE)
}
