use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Token bucket: `tokens_per_sec` refill rate, at most `burst` tokens banked.
pub struct RateLimiter {
    sem: Arc<Semaphore>,
    _refill: Arc<Refill>,
}

struct Refill(JoinHandle<()>);

impl Drop for Refill {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self { RateLimiter { sem: self.sem.clone(), _refill: self._refill.clone() } }
}

impl RateLimiter {
    /// Must be called from within a tokio runtime.
    pub fn new(tokens_per_sec: u32) -> Self {
        Self::with_burst(tokens_per_sec, 1)
    }

    pub fn with_burst(tokens_per_sec: u32, burst: usize) -> Self {
        let sem = Arc::new(Semaphore::new(0));
        let sem_bg = sem.clone();
        let burst = burst.max(1);
        let interval = Duration::from_secs_f64(1.0 / f64::from(tokens_per_sec.max(1)));
        let handle = tokio::spawn(async move {
            let mut t = tokio::time::interval(interval);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                t.tick().await;
                if sem_bg.available_permits() < burst {
                    sem_bg.add_permits(1);
                }
            }
        });
        RateLimiter { sem, _refill: Arc::new(Refill(handle)) }
    }

    /// Wait for one token and consume it.
    pub async fn acquire(&self) {
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn tokens_are_consumed_at_the_configured_rate() {
        let rl = RateLimiter::new(20);
        let started = Instant::now();
        for _ in 0..5 {
            rl.acquire().await;
        }
        // First tick fires immediately, the remaining four need ~50ms each.
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn bucket_does_not_exceed_burst() {
        let rl = RateLimiter::with_burst(1000, 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rl.sem.available_permits() <= 3);
    }
}
