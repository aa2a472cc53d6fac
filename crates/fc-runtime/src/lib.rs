//! The subscriber runtime: polling, concurrency governance, per-message
//! lifecycle, FIFO ordering, and the backoff policy that guards all of it.
//!
//! - [`registry::SubscriberRegistry`] (C2): maps envelope `type` identifiers
//!   to type-erased handler closures.
//! - [`backoff`] (C3): classifies errors as fatal vs. transient and
//!   computes retry delays.
//! - [`manager::MessageManager`] (C4): owns one poller's in-flight set,
//!   dispatches to the registry, and extends visibility on a heartbeat.
//! - [`poller::SqsPoller`] (C5): the standard-queue receive loop.
//! - [`fifo::FifoScheduler`] (C6): per-message-group serial execution with
//!   bounded concurrency across groups, for `.fifo` queues.

pub mod backoff;
pub mod error;
pub mod fifo;
pub mod manager;
pub mod poller;
pub mod registry;

pub use error::RuntimeError;
pub use fifo::{FifoMessage, FifoScheduler};
pub use manager::{ManagerConfig, MessageManager};
pub use poller::{PollerConfig, SqsPoller};
pub use registry::{DispatchOutcome, SubscriberRegistry};

pub type Result<T> = std::result::Result<T, RuntimeError>;
