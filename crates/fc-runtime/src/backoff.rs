use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Retry-delay strategy applied to transient errors from the poller's
/// receive/delete/change-visibility calls.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Never retries.
    None,
    /// Fixed jitter window: `uniform(0, fixed)`.
    Interval { fixed: Duration },
    /// Exponential with a ceiling: `uniform(0, 1) * min(2^attempt, cap)`.
    CappedExponential { cap: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::CappedExponential {
            cap: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    pub fn should_retry(&self, is_fatal: bool) -> bool {
        match self {
            BackoffPolicy::None => false,
            _ => !is_fatal,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Interval { fixed } => {
                let millis = rng.gen_range(0..=fixed.as_millis().max(1)) as u64;
                Duration::from_millis(millis)
            }
            BackoffPolicy::CappedExponential { cap } => {
                let pow = 2u64.saturating_pow(attempt.min(62));
                let bounded_secs = pow.min(cap.as_secs().max(1));
                let millis = rng.gen_range(0..=(bounded_secs * 1000).max(1));
                Duration::from_millis(millis)
            }
        }
    }
}

/// Classifies AWS error codes that no amount of retry will fix, plus any
/// caller-supplied additions. Shared by every poller so "access denied" means
/// the same thing queue to queue.
#[derive(Debug, Clone, Default)]
pub struct FatalErrorClassifier {
    extra_fatal_substrings: Vec<String>,
}

const BUILTIN_FATAL_SUBSTRINGS: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
    "AccessDenied",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
    "InvalidSecurity",
    "KMS.AccessDeniedException",
    "KMS.NotFoundException",
    "KMS.DisabledException",
    "KMS.InvalidStateException",
];

impl FatalErrorClassifier {
    pub fn new(extra_fatal_substrings: Vec<String>) -> Self {
        Self { extra_fatal_substrings }
    }

    pub fn is_fatal(&self, error_message: &str) -> bool {
        BUILTIN_FATAL_SUBSTRINGS
            .iter()
            .any(|needle| error_message.contains(needle))
            || self
                .extra_fatal_substrings
                .iter()
                .any(|needle| error_message.contains(needle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffLoopResult {
    Succeeded,
    Fatal,
    ShutDown,
}

/// Runs `op` under `policy`, retrying transient failures and honoring
/// `shutdown`. Returns as soon as `op` succeeds, a fatal error is hit, or a
/// shutdown signal arrives while waiting out a backoff delay.
pub async fn run_with_backoff<T, E, Op, Fut>(
    mut op: Op,
    policy: &BackoffPolicy,
    classifier: &FatalErrorClassifier,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<T, BackoffLoopResult>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let message = e.to_string();
                let fatal = classifier.is_fatal(&message);
                if fatal {
                    warn!(error = %message, "fatal error, will not retry");
                    return Err(BackoffLoopResult::Fatal);
                }
                if !policy.should_retry(false) {
                    return Err(BackoffLoopResult::Fatal);
                }
                let delay = policy.delay_for(attempt);
                debug!(error = %message, attempt, delay_ms = delay.as_millis() as u64, "transient error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => return Err(BackoffLoopResult::ShutDown),
                }
                attempt += 1;
            }
        }
    }
}
