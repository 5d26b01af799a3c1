//! Bounded retry for publish/subscribe.

use std::{fmt::Display, future::Future, time::Duration};

/// Fixed-count, fixed-delay retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Failures are logged, never returned; the result is `true` on success.
    pub async fn run<F, Fut, E>(&self, what: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let attempts = self.attempts.max(1);
        for attempt in 1..=attempts {
            match op().await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(attempt, attempts, "Failed to {what}: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
        tracing::error!("All {attempts} attempts to {what} failed");
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_three_attempts() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let ok = RetryPolicy::default()
            .run("publish to exec", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("broker unavailable")
            })
            .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two delays between three attempts.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_millis(4100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_first_success() {
        let calls = &AtomicU32::new(0);
        let ok = RetryPolicy::default()
            .run("subscribe to exec/response", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("queue full")
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
