use thiserror::Error;

#[derive(Error, Debug)]
pub enum LambdaAdapterError {
    #[error("runtime error: {0}")]
    Runtime(#[from] fc_runtime::RuntimeError),

    #[error("queue error: {0}")]
    Queue(#[from] fc_queue::QueueError),

    #[error("{0} of {1} messages in this batch failed and partial-batch responses are disabled; the whole invocation is reported failed so Lambda redelivers the full batch")]
    BatchFailed(usize, usize),
}
