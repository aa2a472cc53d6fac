use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("queue error: {0}")]
    Queue(#[from] fc_queue::QueueError),

    #[error("envelope codec error: {0}")]
    Codec(#[from] fc_codec::CodecError),

    #[error("no subscriber registered for type '{0}'")]
    UnknownMessageType(String),

    #[error("fifo message is missing a message-group-id: {0}")]
    MissingMessageGroupId(String),

    #[error("fatal error, poller terminating: {0}")]
    Fatal(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("configuration error: {0}")]
    Config(String),
}
