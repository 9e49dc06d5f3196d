use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source for the engine. Polling never calls `tokio::time` directly so
/// retry behaviour can be exercised without real sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` advances time instantly and records the request.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sleeps
            .clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.sleeps.push(duration);
            st.now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_advances_on_sleep() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.sleep(Duration::from_secs(30)).await;
        clock.sleep(Duration::from_secs(10)).await;
        assert_eq!(clock.now() - start, chrono::Duration::seconds(40));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30), Duration::from_secs(10)]);
        assert_eq!(clock.total_slept(), Duration::from_secs(40));
    }

    #[test]
    fn test_advance_moves_time_without_sleeping() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(1500));
        assert!(clock.sleeps().is_empty());
    }
}
