//! Bounded polling and transient-retry helpers.
//!
//! Both loops sleep through an injected [`Clock`] and stop promptly when the
//! caller's [`CancellationToken`] fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use keel_common::PollingSettings;
use keel_control::RemoteError;

use crate::clock::Clock;
use crate::error::DeployError;

/// Outcome of one probe of a remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    Ready(T),
    /// Not there yet; carries a short description of what was observed.
    Pending(String),
}

#[derive(Debug)]
pub enum PollError {
    Exhausted { attempts: u32, last: Option<String> },
    Cancelled,
    /// The probe reported a condition that will not resolve by waiting.
    Aborted(DeployError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Wait once before the first probe.
    pub settle: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
    /// Interval multiplier per attempt. `1.0` is a fixed interval.
    pub backoff: f64,
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            settle: Duration::ZERO,
            interval,
            max_attempts,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff = multiplier;
        self.max_interval = max_interval;
        self
    }

    /// Deletion confirmation: one settle delay, then fixed-interval checks.
    pub fn deletion(settings: &PollingSettings) -> Self {
        Self::fixed(
            Duration::from_secs(settings.deletion_interval_secs),
            settings.deletion_attempts,
        )
        .with_settle(Duration::from_secs(settings.deletion_settle_secs))
    }

    /// Long-horizon wait for an endpoint transition.
    pub fn rollout(settings: &PollingSettings) -> Self {
        Self::fixed(
            Duration::from_secs(settings.rollout_interval_secs),
            settings.rollout_attempts,
        )
    }

    /// Pause after the `attempt`-th probe (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff.max(1.0).powi(exp);
        let secs = self.interval.as_secs_f64() * factor;
        let cap = self.max_interval.max(self.interval);
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Sleep unless cancelled first.
async fn pause(clock: &dyn Clock, duration: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = clock.sleep(duration) => true,
    }
}

/// Probe until `probe` returns [`PollStep::Ready`], making at most
/// `policy.max_attempts` probes. There is no sleep after the final probe.
pub async fn poll_until<T, F, Fut>(
    clock: &dyn Clock,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStep<T>, DeployError>>,
{
    if !pause(clock, policy.settle, cancel).await {
        return Err(PollError::Cancelled);
    }

    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        match probe(attempt).await.map_err(PollError::Aborted)? {
            PollStep::Ready(value) => return Ok(value),
            PollStep::Pending(detail) => {
                tracing::debug!(attempt, max_attempts = policy.max_attempts, %detail, "not ready yet");
                last = Some(detail);
            }
        }
        if attempt < policy.max_attempts && !pause(clock, policy.delay_after(attempt), cancel).await {
            return Err(PollError::Cancelled);
        }
    }

    Err(PollError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}

/// Exponential backoff for single remote calls that fail transiently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn as_poll(&self) -> PollPolicy {
        PollPolicy::fixed(self.initial_delay, self.max_attempts)
            .with_backoff(self.multiplier, self.max_delay)
    }
}

/// Run `call`, retrying only [`RemoteError::is_transient`] failures.
///
/// The final remote error is wrapped as [`DeployError::Remote`] tagged with
/// `operation`; callers re-map it where a more specific variant applies.
pub async fn retry_transient<T, F, Fut>(
    clock: &dyn Clock,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &'static str,
    mut call: F,
) -> Result<T, DeployError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let backoff = policy.as_poll();
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff.delay_after(attempt);
                tracing::warn!(operation, attempt, error = %e, ?delay, "transient failure, retrying");
                if !pause(clock, delay, cancel).await {
                    return Err(DeployError::Cancelled);
                }
                attempt += 1;
            }
            Err(e) => return Err(DeployError::remote(operation, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use keel_control::ResourceKind;

    #[test]
    fn test_delay_after_caps_backoff() {
        let p = PollPolicy::fixed(Duration::from_secs(1), 10).with_backoff(2.0, Duration::from_secs(20));
        assert_eq!(p.delay_after(1), Duration::from_secs(1));
        assert_eq!(p.delay_after(2), Duration::from_secs(2));
        assert_eq!(p.delay_after(5), Duration::from_secs(16));
        assert_eq!(p.delay_after(6), Duration::from_secs(20));
        assert_eq!(p.delay_after(200), Duration::from_secs(20));

        let fixed = PollPolicy::fixed(Duration::from_secs(30), 120);
        assert_eq!(fixed.delay_after(7), Duration::from_secs(30));
    }

    #[test]
    fn test_policies_from_settings() {
        let s = PollingSettings::default();
        let del = PollPolicy::deletion(&s);
        assert_eq!(del.settle, Duration::from_secs(30));
        assert_eq!(del.interval, Duration::from_secs(10));
        assert_eq!(del.max_attempts, 10);
        let roll = PollPolicy::rollout(&s);
        assert_eq!(roll.settle, Duration::ZERO);
        assert_eq!(roll.max_attempts, 120);
    }

    #[tokio::test]
    async fn test_exhausts_after_exactly_n_probes() {
        let clock = ManualClock::default();
        let policy = PollPolicy::fixed(Duration::from_secs(10), 5).with_settle(Duration::from_secs(30));
        let probes = AtomicU32::new(0);
        let probes_ref = &probes;

        let out: Result<(), PollError> =
            poll_until(&clock, &policy, &CancellationToken::new(), move |n| async move {
                probes_ref.fetch_add(1, Ordering::SeqCst);
                Ok(PollStep::Pending(format!("probe {n}")))
            })
            .await;

        match out {
            Err(PollError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last.as_deref(), Some("probe 5"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(probes.load(Ordering::SeqCst), 5);
        // settle + 4 gaps, nothing after the last probe
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 5);
        assert_eq!(sleeps[0], Duration::from_secs(30));
        assert_eq!(clock.total_slept(), Duration::from_secs(70));
    }

    #[tokio::test]
    async fn test_ready_stops_polling() {
        let clock = ManualClock::default();
        let policy = PollPolicy::fixed(Duration::from_secs(1), 10);
        let out = poll_until(&clock, &policy, &CancellationToken::new(), |n| async move {
            if n == 3 {
                Ok(PollStep::Ready(n))
            } else {
                Ok(PollStep::Pending("waiting".into()))
            }
        })
        .await;
        assert!(matches!(out, Ok(3)));
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_abort_and_cancel() {
        let clock = ManualClock::default();
        let policy = PollPolicy::fixed(Duration::from_secs(1), 10);

        let out: Result<(), _> = poll_until(&clock, &policy, &CancellationToken::new(), |_| async {
            Err(DeployError::RolloutFailed {
                endpoint: "e1".into(),
                reason: "boom".into(),
            })
        })
        .await;
        assert!(matches!(out, Err(PollError::Aborted(DeployError::RolloutFailed { .. }))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let out: Result<(), _> = poll_until(&clock, &policy, &cancel, |_| async {
            Ok(PollStep::Pending("never".into()))
        })
        .await;
        assert!(matches!(out, Err(PollError::Cancelled)));
    }

    #[tokio::test]
    async fn test_retry_transient_then_success() {
        let clock = ManualClock::default();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let out = retry_transient(
            &clock,
            &RetryPolicy::default(),
            &CancellationToken::new(),
            "describe image",
            move || async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::Unavailable("throttled".into()))
                } else {
                    Ok(7)
                }
            },
        )
        .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn test_retry_never_retries_not_found() {
        let clock = ManualClock::default();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let out: Result<(), _> = retry_transient(
            &clock,
            &RetryPolicy::default(),
            &CancellationToken::new(),
            "describe model",
            move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::not_found(ResourceKind::Model, "m1"))
            },
        )
        .await;
        assert!(out.unwrap_err().is_remote_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let clock = ManualClock::default();
        let out: Result<(), _> = retry_transient(
            &clock,
            &RetryPolicy::default(),
            &CancellationToken::new(),
            "describe endpoint",
            || async { Err(RemoteError::Unavailable("down".into())) },
        )
        .await;
        let err = out.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Transient);
        assert_eq!(clock.sleeps().len(), 3);
    }
}
