use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use super::failure::{classify, FailureCategory};
use super::utils::sleep_cancellable;

/// Poll step for backoff sleeps, bounding how long a cancelled retry lingers.
const BACKOFF_POLL: Duration = Duration::from_secs(5);
const MIN_JITTER_SECS: u64 = 1;
const MAX_JITTER_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_secs(5),
        }
    }
}

/// Exponential part of the schedule: `base * 2^(attempt - 2) + jitter`.
///
/// `attempt` is 1-based; the first attempt never waits, so values below 2
/// are treated as 2.
pub fn exponential_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.saturating_sub(2));
    base.saturating_mul(multiplier).saturating_add(jitter)
}

/// Delay before `attempt`, given the category of the previous failure.
/// A category with its own, longer backoff overrides the exponential delay.
pub fn next_delay<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    attempt: u32,
    previous_failure: FailureCategory,
    rng: &mut R,
) -> Duration {
    let jitter = Duration::from_secs(rng.random_range(MIN_JITTER_SECS..=MAX_JITTER_SECS));
    let standard = exponential_delay(policy.base_interval, attempt, jitter);
    match previous_failure.backoff_policy().sample(rng) {
        Some(category_delay) if category_delay > standard => category_delay,
        _ => standard,
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The error is never empty.
    pub result: Result<T, String>,
    pub attempts: u32,
}

/// Runs `operation` up to `policy.max_attempts` times.
///
/// Each failure message is classified so the following wait can honour the
/// category's backoff. Waits poll `is_cancelled`; a cancelled retry returns
/// right away with an error describing the cancellation.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    is_cancelled: C,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: Fn() -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();
    let mut last_category = FailureCategory::Unknown;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = {
                let mut rng = rand::rng();
                next_delay(policy, attempt, last_category, &mut rng)
            };
            info!(
                attempt,
                delay_secs = delay.as_secs(),
                category = %last_category,
                "Waiting before next attempt."
            );
            if sleep_cancellable(delay, BACKOFF_POLL, &is_cancelled).await {
                warn!(attempt, "Retry cancelled during backoff.");
                return RetryOutcome {
                    result: Err(format!(
                        "retry cancelled after {} attempt(s), last error: {last_error}",
                        attempt - 1
                    )),
                    attempts: attempt - 1,
                };
            }
        }

        info!(attempt, max_attempts, "Starting attempt.");
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "Operation succeeded after retrying.");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => {
                last_error = e.to_string();
                if last_error.trim().is_empty() {
                    last_error = "attempt failed without a message".to_string();
                }
                last_category = classify(&last_error);
                warn!(attempt, error = %last_error, category = %last_category, "Attempt failed.");
                if last_category == FailureCategory::Blacklisted {
                    warn!("The portal may be refusing this client; backing off for several minutes.");
                }
            }
        }
    }

    error!(max_attempts, error = %last_error, "All attempts failed.");
    RetryOutcome {
        result: Err(format!(
            "failed after {max_attempts} attempt(s), last error: {last_error}"
        )),
        attempts: max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32, base_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_interval: Duration::from_secs(base_secs),
        }
    }

    /// Fails with the scripted messages in order, then succeeds.
    fn scripted(
        failures: Vec<&'static str>,
    ) -> (
        impl FnMut(u32) -> std::future::Ready<Result<u32, String>>,
        Arc<Mutex<Vec<Instant>>>,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = calls.clone();
        let op = move |attempt: u32| {
            recorder.lock().unwrap().push(Instant::now());
            let idx = (attempt - 1) as usize;
            std::future::ready(match failures.get(idx) {
                Some(msg) => Err(msg.to_string()),
                None => Ok(attempt),
            })
        };
        (op, calls)
    }

    #[test]
    fn test_exponential_delay_terms() {
        let base = Duration::from_secs(5);
        for jitter in 1..=5 {
            let j = Duration::from_secs(jitter);
            assert_eq!(exponential_delay(base, 2, j), Duration::from_secs(5 + jitter));
            assert_eq!(exponential_delay(base, 3, j), Duration::from_secs(10 + jitter));
            assert_eq!(exponential_delay(base, 4, j), Duration::from_secs(20 + jitter));
        }
        // Saturates instead of overflowing.
        assert_eq!(exponential_delay(Duration::MAX, 40, Duration::from_secs(1)), Duration::MAX);
    }

    #[test]
    fn test_next_delay_bounds() {
        let p = policy(3, 5);
        let mut rng = rand::rng();
        for _ in 0..500 {
            let d2 = next_delay(&p, 2, FailureCategory::Unknown, &mut rng);
            let d3 = next_delay(&p, 3, FailureCategory::NetworkError, &mut rng);
            assert!(d2 >= Duration::from_secs(6) && d2 <= Duration::from_secs(10));
            assert!(d3 >= Duration::from_secs(11) && d3 <= Duration::from_secs(15));

            let blacklisted = next_delay(&p, 2, FailureCategory::Blacklisted, &mut rng);
            assert!(blacklisted >= Duration::from_secs(300) && blacklisted <= Duration::from_secs(420));

            let limited = next_delay(&p, 2, FailureCategory::RateLimited, &mut rng);
            assert!(limited >= Duration::from_secs(60) && limited <= Duration::from_secs(90));
        }
    }

    #[test]
    fn test_category_backoff_never_shortens_exponential_delay() {
        // With a large base the exponential term already exceeds the rate-limit cooldown.
        let p = policy(5, 100);
        let mut rng = rand::rng();
        for _ in 0..100 {
            let d = next_delay(&p, 3, FailureCategory::RateLimited, &mut rng);
            assert!(d >= Duration::from_secs(201));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_returns_immediately() {
        let (op, calls) = scripted(vec![]);
        let start = Instant::now();
        let outcome = retry_with_backoff(&policy(3, 5), || false, op).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap(), 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_grow_between_attempts() {
        let (op, calls) = scripted(vec!["portal said no", "portal said no"]);
        let outcome = retry_with_backoff(&policy(3, 5), || false, op).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);

        let calls = calls.lock().unwrap();
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_secs(6) && first_gap <= Duration::from_secs(10));
        assert!(second_gap >= Duration::from_secs(11) && second_gap <= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error() {
        let (op, calls) = scripted(vec!["first", "second", "third and last"]);
        let outcome = retry_with_backoff(&policy(3, 1), || false, op).await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.lock().unwrap().len(), 3);
        let err = outcome.result.as_ref().unwrap_err();
        assert!(err.contains("third and last"), "{err}");
        assert!(err.contains("3 attempt"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_error_is_never_surfaced_blank() {
        let (op, _) = scripted(vec!["  "]);
        let outcome = retry_with_backoff(&policy(1, 1), || false, op).await;
        assert!(outcome.result.as_ref().unwrap_err().contains("without a message"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklisted_failure_waits_minutes() {
        let (op, calls) = scripted(vec!["Access denied: account banned"]);
        let outcome = retry_with_backoff(&policy(2, 5), || false, op).await;
        assert!(outcome.result.is_ok());
        let calls = calls.lock().unwrap();
        let gap = calls[1] - calls[0];
        assert!(gap >= Duration::from_secs(300) && gap <= Duration::from_secs(420), "{gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let (op, calls) = scripted(vec!["too many requests", "too many requests"]);
        let start = Instant::now();
        let outcome =
            retry_with_backoff(&policy(3, 5), || cancelled.load(Ordering::SeqCst), op).await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(outcome.result.as_ref().unwrap_err().contains("cancelled"));
        // Rate-limit backoff is at least 60s; the retry gave up within one poll step of the cancel.
        assert!(start.elapsed() <= Duration::from_secs(35));
    }

    #[tokio::test]
    async fn test_zero_max_attempts_still_runs_once() {
        let (op, calls) = scripted(vec![]);
        let outcome = retry_with_backoff(&policy(0, 5), || false, op).await;
        assert!(outcome.result.is_ok());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }
}
