use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("queue is stopped")]
    Stopped,

    #[error("AWS SQS error: {0}")]
    Sqs(String),

    #[error("AWS SNS error: {0}")]
    Sns(String),

    #[error("AWS EventBridge error: {0}")]
    EventBridge(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fifo publish is missing a required message-group-id")]
    InvalidFifoPublish,

    #[error("missing receipt handle for in-flight message {0}")]
    MissingReceiptHandle(String),
}
