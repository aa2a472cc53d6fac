use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Outcome of one closure invocation, as seen by the dispatch layer.
///
/// `PayloadDeserialization` is distinguished from `Failed` because it is
/// treated the same way a decode-time `MalformedEnvelope` is: the message is
/// left alone (no handler side effects happened), not subject to the
/// handler-failure redelivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failed,
    PayloadDeserialization(String),
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A type-erased handler: takes the envelope's raw `data` value and a
/// shutdown signal the handler may poll, and returns a dispatch outcome.
/// The generic payload type is captured and consumed inside the closure body
/// at registration time — this is what lets the registry avoid any runtime
/// reflection over the handler's signature.
type ErasedHandler = Arc<dyn Fn(Value, broadcast::Receiver<()>) -> BoxFuture<DispatchOutcome> + Send + Sync>;

struct RegisteredHandler {
    handler: ErasedHandler,
    enforce_ordering: bool,
}

/// Maps envelope `type` identifiers to handlers. Populated once at startup;
/// read concurrently (lock-free) from every poller thereafter.
#[derive(Default, Clone)]
pub struct SubscriberRegistry {
    handlers: Arc<DashMap<String, RegisteredHandler>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `type_id`. `enforce_ordering` should be `true`
    /// for payload types that must only ever be processed one at a time per
    /// message group (the FIFO scheduler consults this when deciding whether
    /// a missing group id is a hard error).
    ///
    /// Returns `false` without registering if `type_id` is already taken.
    pub fn register<P, F, Fut>(&self, type_id: impl Into<String>, enforce_ordering: bool, handler: F) -> bool
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, broadcast::Receiver<()>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchOutcome> + Send + 'static,
    {
        let type_id = type_id.into();
        if self.handlers.contains_key(&type_id) {
            return false;
        }

        let erased: ErasedHandler = Arc::new(move |data, shutdown| {
            let payload: Result<P, _> = serde_json::from_value(data);
            match payload {
                Ok(payload) => {
                    let fut = handler(payload, shutdown);
                    Box::pin(fut) as BoxFuture<DispatchOutcome>
                }
                Err(e) => Box::pin(async move { DispatchOutcome::PayloadDeserialization(e.to_string()) }),
            }
        });

        self.handlers.insert(
            type_id,
            RegisteredHandler {
                handler: erased,
                enforce_ordering,
            },
        );
        true
    }

    pub fn is_registered(&self, type_id: &str) -> bool {
        self.handlers.contains_key(type_id)
    }

    pub fn enforces_ordering(&self, type_id: &str) -> bool {
        self.handlers
            .get(type_id)
            .map(|h| h.enforce_ordering)
            .unwrap_or(false)
    }

    /// Dispatches `data` to the handler registered for `type_id`. Returns
    /// `None` if no handler is registered (caller should treat this as
    /// `UnknownMessageType` and leave the message alone).
    ///
    /// The handler future is run under `catch_unwind`: a panicking handler is
    /// logged and normalized to `DispatchOutcome::Failed` rather than
    /// unwinding through the caller, so `MessageManager::finish` always runs
    /// and the in-flight record is never leaked (per §4.4/§7's "HandlerThrew"
    /// row — an uncaught throw is treated as `Failed`, not a crash).
    pub async fn dispatch(
        &self,
        type_id: &str,
        data: Value,
        shutdown: broadcast::Receiver<()>,
    ) -> Option<DispatchOutcome> {
        let handler = match self.handlers.get(type_id) {
            Some(entry) => entry.handler.clone(),
            None => {
                warn!(type_id, "no subscriber registered for message type");
                return None;
            }
        };

        let outcome = AssertUnwindSafe(handler(data, shutdown)).catch_unwind().await;
        Some(match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(type_id, panic = %panic_message(&panic), "handler panicked; treating as failed");
                DispatchOutcome::Failed
            }
        })
    }
}

/// Extracts a printable message from a `catch_unwind` payload, which is
/// almost always a `&'static str` or `String` (the two types `panic!`'s
/// formatting machinery produces) but is typed `Box<dyn Any + Send>` since a
/// panic payload can in principle be anything.
fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
