use tokio::time::Instant;

pub mod logging;

/// Bookkeeping for a message currently being processed by a poller.
///
/// Owned by the runtime's Message Manager; queue transports never see this type.
///
/// Uses `tokio::time::Instant` rather than `std::time::Instant` so that
/// expiry math observes `tokio::time::pause`/`advance` in tests — the two
/// types otherwise behave identically outside a paused runtime.
#[derive(Debug, Clone)]
pub struct InFlightRecord {
    pub envelope_id: String,
    pub message_group_id: Option<String>,
    pub receipt_handle: String,
    pub started_at: Instant,
    pub expires_at: Instant,
}

impl InFlightRecord {
    pub fn new(
        envelope_id: String,
        message_group_id: Option<String>,
        receipt_handle: String,
        visibility_timeout: std::time::Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            envelope_id,
            message_group_id,
            receipt_handle,
            started_at: now,
            expires_at: now + visibility_timeout,
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn seconds_until_expiry(&self) -> i64 {
        let now = Instant::now();
        if self.expires_at > now {
            (self.expires_at - now).as_secs() as i64
        } else {
            -((now - self.expires_at).as_secs() as i64)
        }
    }

    pub fn extend(&mut self, visibility_timeout: std::time::Duration) {
        self.expires_at = Instant::now() + visibility_timeout;
    }
}
