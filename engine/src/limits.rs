use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Monotonic spacing between invocations: each waiter is assigned the next
/// free slot and sleeps until it arrives. Used for pool-level QPS and for
/// per-data-source pacing.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

struct LimiterState {
    interval: Duration,
    next_slot: Instant,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                interval,
                next_slot: Instant::now(),
            }),
        }
    }

    /// Limiter allowing `per_second` invocations each second. A zero rate
    /// means no limiting.
    pub fn per_second(per_second: usize) -> Self {
        let interval = if per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / per_second as f64)
        };
        Self::new(interval)
    }

    /// Replace the spacing; the next waiter uses the new interval.
    pub fn set_interval(&self, interval: Duration) {
        self.state.lock().unwrap().interval = interval;
    }

    /// True when a slot is immediately available.
    pub fn ready(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.next_slot <= Instant::now()
    }

    /// Claim the next slot and wait for it.
    pub async fn wait(&self) {
        let slot = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let slot = state.next_slot.max(now);
            state.next_slot = slot + state.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waiters_are_spaced_by_the_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        // First slot is immediate; the next two cost one interval each.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn zero_rate_never_waits() {
        let limiter = RateLimiter::per_second(0);
        assert!(limiter.ready());
        limiter.wait().await;
        assert!(limiter.ready());
    }
}
