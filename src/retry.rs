//! Bounded retry with stop-conditions, shared by HTTP and database
//! actions.

use crate::stop_condition::StopCondition;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `retry` block of an action definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    #[serde(default)]
    pub attempt: Option<u32>,
    /// Seconds between attempts.
    #[serde(default)]
    pub interval: Option<f64>,
    #[serde(default)]
    pub stop_condition: Option<StopCondition>,
}

/// Longest pause between two attempts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempt: u32,
    pub interval: Duration,
    pub stop_condition: Option<StopCondition>,
}

impl RetryPolicy {
    /// Negative and NaN intervals mean no pause; anything beyond
    /// [`MAX_INTERVAL`] is clamped to it.
    pub fn new(attempt: u32, interval_secs: f64) -> Self {
        let interval = if interval_secs.is_nan() || interval_secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(interval_secs)
                .map_or(MAX_INTERVAL, |interval| interval.min(MAX_INTERVAL))
        };
        Self {
            attempt: attempt.max(1),
            interval,
            stop_condition: None,
        }
    }

    pub fn with_stop_condition(mut self, stop: StopCondition) -> Self {
        self.stop_condition = Some(stop);
        self
    }

    fn from_spec(spec: Option<&RetrySpec>, attempt: u32, interval: f64) -> Self {
        let spec = spec.cloned().unwrap_or_default();
        Self {
            stop_condition: spec.stop_condition,
            ..Self::new(
                spec.attempt.unwrap_or(attempt),
                spec.interval.unwrap_or(interval),
            )
        }
    }

    /// HTTP defaults: two attempts, no pause.
    pub fn for_http(spec: Option<&RetrySpec>) -> Self {
        Self::from_spec(spec, 2, 0.0)
    }

    /// Database defaults: a single attempt, one second pause.
    pub fn for_database(spec: Option<&RetrySpec>) -> Self {
        Self::from_spec(spec, 1, 1.0)
    }
}

/// Errors that may be retried.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Error returned when the retry loop is cancelled.
    fn cancelled() -> Self;
}

/// Run `operation` up to `policy.attempt` times.
///
/// A successful attempt ends the loop once `accept` holds for its
/// value. Retryable errors are retried, others are returned at once.
/// The final attempt is returned whatever its outcome.
pub async fn retry<T, E, F, Fut, A>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
    accept: A,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    A: Fn(&T) -> bool,
{
    let attempts = policy.attempt.max(1);
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(E::cancelled()),
            result = operation(attempt) => result,
        };

        if attempt >= attempts {
            return result;
        }
        let done = match &result {
            Ok(value) => accept(value),
            Err(err) => !err.is_retryable(),
        };
        if done {
            return result;
        }
        match &result {
            Ok(_) => {
                debug!(attempt, attempts, "Stop condition not met, retrying")
            }
            Err(err) => {
                warn!(attempt, attempts, "Retryable failure: {}", err)
            }
        }

        if !policy.interval.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(E::cancelled()),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Transient,
        Fatal,
        Cancelled,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            *self == FakeError::Transient
        }

        fn cancelled() -> Self {
            FakeError::Cancelled
        }
    }

    fn ok_policy(attempt: u32) -> RetryPolicy {
        let stop: StopCondition =
            serde_json::from_value(json!({"contentEquals": "ok"})).unwrap();
        RetryPolicy::new(attempt, 0.0).with_stop_condition(stop)
    }

    async fn replay(
        policy: &RetryPolicy,
        responses: &[&'static str],
    ) -> (Result<&'static str, FakeError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let responses = responses.to_vec();
        let stop = policy.stop_condition.clone().unwrap_or_default();
        let result = retry(
            policy,
            &CancellationToken::new(),
            move |n| {
                counter.fetch_add(1, Ordering::SeqCst);
                let body = responses[(n - 1) as usize];
                async move { Ok::<_, FakeError>(body) }
            },
            |body| stop.evaluate_body(body),
        )
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_stops_early_when_condition_met() {
        let (result, calls) = replay(&ok_policy(3), &["no", "ok", "no"]).await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_last_attempt_returned_unconditionally() {
        let (result, calls) = replay(&ok_policy(3), &["no", "no", "no"]).await;
        assert_eq!(result, Ok("no"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FakeError> = retry(
            &RetryPolicy::new(5, 0.0),
            &CancellationToken::new(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Fatal) }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Err(FakeError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_error_until_success() {
        let result = retry(
            &RetryPolicy::new(3, 0.0),
            &CancellationToken::new(),
            |n| async move {
                if n < 3 {
                    Err(FakeError::Transient)
                } else {
                    Ok(n)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), FakeError> = retry(
            &RetryPolicy::new(3, 60.0),
            &cancel,
            |_| async { Ok(()) },
            |_| false,
        )
        .await;
        assert_eq!(result, Err(FakeError::Cancelled));
    }

    #[test]
    fn test_defaults_per_call_kind() {
        let http = RetryPolicy::for_http(None);
        assert_eq!((http.attempt, http.interval), (2, Duration::ZERO));
        let db = RetryPolicy::for_database(None);
        assert_eq!((db.attempt, db.interval), (1, Duration::from_secs(1)));
        let spec = RetrySpec {
            attempt: Some(0),
            interval: Some(0.5),
            stop_condition: None,
        };
        let custom = RetryPolicy::for_database(Some(&spec));
        assert_eq!(custom.attempt, 1);
        assert_eq!(custom.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_out_of_range_intervals_do_not_panic() {
        assert_eq!(RetryPolicy::new(2, 1e20).interval, MAX_INTERVAL);
        assert_eq!(RetryPolicy::new(2, f64::INFINITY).interval, MAX_INTERVAL);
        assert_eq!(RetryPolicy::new(2, 7200.0).interval, MAX_INTERVAL);
        assert_eq!(RetryPolicy::new(2, f64::NAN).interval, Duration::ZERO);
        assert_eq!(RetryPolicy::new(2, -3.0).interval, Duration::ZERO);
    }
}
