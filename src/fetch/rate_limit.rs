/// Process-wide spacing between outbound calls.
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default minimum gap between two upstream calls.
pub const DEFAULT_SPACING: Duration = Duration::from_millis(100);

/// Enforces a minimum spacing between consecutive calls, shared by every
/// worker that holds a reference.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait until the next slot is free and claim it.
    ///
    /// The lock is held while sleeping so waiters are released one at a time.
    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next_slot {
            Some(at) if at > now => {
                tokio::time::sleep_until(at).await;
                at
            }
            _ => now,
        };
        *next_slot = Some(slot + self.spacing);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SPACING)
    }
}
