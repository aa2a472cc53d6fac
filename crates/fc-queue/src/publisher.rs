use async_trait::async_trait;
use fc_codec::Envelope;

use crate::{QueueError, Result};

/// Where an envelope is published to. FIFO variants require a
/// `message_group_id`; the publisher rejects missing ones rather than
/// defaulting to a synthetic group, since silently collapsing every
/// caller into one group would erase whatever ordering they asked for.
pub enum Destination<'a> {
    Queue {
        queue_url: &'a str,
        message_group_id: Option<&'a str>,
        message_deduplication_id: Option<&'a str>,
    },
    Topic {
        topic_arn: &'a str,
        message_group_id: Option<&'a str>,
        message_deduplication_id: Option<&'a str>,
    },
    EventBus {
        bus_name: &'a str,
    },
}

/// Thin transport selector: encodes nothing itself, just forwards an
/// already-encoded envelope to the right AWS API shape.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `envelope` to `destination`, returning the broker-assigned
    /// message id. Raises [`QueueError::InvalidFifoPublish`] if `destination`
    /// is FIFO and carries no `message_group_id`.
    async fn publish(&self, envelope: &Envelope, destination: Destination<'_>) -> Result<String>;
}

pub(crate) fn is_fifo_arn_or_url(s: &str) -> bool {
    s.ends_with(".fifo")
}

pub(crate) fn require_group_id<'a>(
    group_id: Option<&'a str>,
    is_fifo: bool,
) -> Result<Option<&'a str>> {
    if is_fifo && group_id.is_none() {
        return Err(QueueError::InvalidFifoPublish);
    }
    Ok(group_id)
}

#[cfg(feature = "sqs")]
pub mod sqs_publisher {
    use super::*;
    use aws_sdk_sqs::Client;

    pub struct SqsPublisher {
        client: Client,
    }

    impl SqsPublisher {
        pub fn new(client: Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Publisher for SqsPublisher {
        async fn publish(&self, envelope: &Envelope, destination: Destination<'_>) -> Result<String> {
            let Destination::Queue {
                queue_url,
                message_group_id,
                message_deduplication_id,
            } = destination
            else {
                return Err(QueueError::Config(
                    "SqsPublisher only accepts Destination::Queue".to_string(),
                ));
            };

            let fifo = is_fifo_arn_or_url(queue_url);
            let group_id = require_group_id(message_group_id, fifo)?;

            let body = serde_json::to_string(envelope)
                .map_err(|e| QueueError::Sqs(format!("failed to serialize envelope: {e}")))?;

            let mut request = self.client.send_message().queue_url(queue_url).message_body(body);
            if let Some(group_id) = group_id {
                request = request.message_group_id(group_id);
            }
            if let Some(dedup_id) = message_deduplication_id {
                request = request.message_deduplication_id(dedup_id);
            }

            let output = request
                .send()
                .await
                .map_err(|e| QueueError::Sqs(e.to_string()))?;

            output
                .message_id()
                .map(str::to_string)
                .ok_or_else(|| QueueError::Sqs("send_message returned no message id".to_string()))
        }
    }
}

#[cfg(feature = "sns")]
pub mod sns_publisher {
    use super::*;
    use aws_sdk_sns::Client;

    pub struct SnsPublisher {
        client: Client,
    }

    impl SnsPublisher {
        pub fn new(client: Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Publisher for SnsPublisher {
        async fn publish(&self, envelope: &Envelope, destination: Destination<'_>) -> Result<String> {
            let Destination::Topic {
                topic_arn,
                message_group_id,
                message_deduplication_id,
            } = destination
            else {
                return Err(QueueError::Config(
                    "SnsPublisher only accepts Destination::Topic".to_string(),
                ));
            };

            let fifo = is_fifo_arn_or_url(topic_arn);
            let group_id = require_group_id(message_group_id, fifo)?;

            let message = serde_json::to_string(envelope)
                .map_err(|e| QueueError::Sns(format!("failed to serialize envelope: {e}")))?;

            let mut request = self.client.publish().topic_arn(topic_arn).message(message);
            if let Some(group_id) = group_id {
                request = request.message_group_id(group_id);
            }
            if let Some(dedup_id) = message_deduplication_id {
                request = request.message_deduplication_id(dedup_id);
            }

            let output = request
                .send()
                .await
                .map_err(|e| QueueError::Sns(e.to_string()))?;

            output
                .message_id()
                .map(str::to_string)
                .ok_or_else(|| QueueError::Sns("publish returned no message id".to_string()))
        }
    }
}

#[cfg(feature = "eventbridge")]
pub mod event_bridge_publisher {
    use super::*;
    use aws_sdk_eventbridge::types::PutEventsRequestEntry;
    use aws_sdk_eventbridge::Client;

    pub struct EventBridgePublisher {
        client: Client,
        source: String,
        detail_type: String,
    }

    impl EventBridgePublisher {
        pub fn new(client: Client, source: String, detail_type: String) -> Self {
            Self {
                client,
                source,
                detail_type,
            }
        }
    }

    #[async_trait]
    impl Publisher for EventBridgePublisher {
        async fn publish(&self, envelope: &Envelope, destination: Destination<'_>) -> Result<String> {
            let Destination::EventBus { bus_name } = destination else {
                return Err(QueueError::Config(
                    "EventBridgePublisher only accepts Destination::EventBus".to_string(),
                ));
            };

            let detail = serde_json::to_string(envelope)
                .map_err(|e| QueueError::EventBridge(format!("failed to serialize envelope: {e}")))?;

            let entry = PutEventsRequestEntry::builder()
                .event_bus_name(bus_name)
                .source(&self.source)
                .detail_type(&self.detail_type)
                .detail(detail)
                .build();

            let output = self
                .client
                .put_events()
                .entries(entry)
                .send()
                .await
                .map_err(|e| QueueError::EventBridge(e.to_string()))?;

            if output.failed_entry_count() > 0 {
                let reason = output
                    .entries()
                    .first()
                    .and_then(|e| e.error_message())
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(QueueError::EventBridge(reason));
            }

            output
                .entries()
                .first()
                .and_then(|e| e.event_id())
                .map(str::to_string)
                .ok_or_else(|| QueueError::EventBridge("put_events returned no event id".to_string()))
        }
    }
}
