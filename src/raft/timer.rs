use rand::Rng;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Randomized election deadline with a wake signal for the waiter task.
///
/// The deadline itself lives in the node state so it is reset under the same
/// lock as the term and role changes that cause the reset.
#[derive(Debug)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    wake: Notify,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            wake: Notify::new(),
        }
    }

    /// Draw a fresh timeout, move `deadline` to now + timeout and wake the waiter.
    pub fn reset(&self, deadline: &mut Instant) -> Duration {
        let timeout = random_election_timeout(self.min_ms, self.max_ms);
        *deadline = Instant::now() + timeout;
        self.wake.notify_one();
        timeout
    }

    /// Sleep until `deadline`. Returns false if a reset arrived first.
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => true,
            _ = self.wake.notified() => false,
        }
    }

    /// Wait for the next reset (leaders have no deadline).
    pub async fn wait_for_reset(&self) {
        self.wake.notified().await;
    }
}
