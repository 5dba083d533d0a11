//! Eviction retry policy for the drain step.
//!
//! Evictions fail transiently while a PodDisruptionBudget waits for
//! replacement pods to become ready; the API server answers those with
//! backpressure rather than a verdict. Each eviction is therefore retried
//! on an exponential, jittered schedule, but only for errors a later
//! attempt could plausibly cure: a non-transient error aborts the drain
//! immediately instead of burning the whole schedule against a
//! misconfiguration.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Backoff schedule for eviction attempts against a single pod.
#[derive(Clone, Debug)]
pub struct EvictionBackoff {
    /// Total attempts before the drain gives up on the pod
    pub max_attempts: u32,
    /// Delay before the first retry; doubles with each further retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for EvictionBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl EvictionBackoff {
    /// Jittered delay before the given retry (1-indexed).
    ///
    /// Jitter of 0.5x to 1.5x keeps a node's worth of evictions from
    /// hammering the API server in lockstep.
    fn delay_before(&self, retry: u32) -> Duration {
        let exponential =
            self.base_delay.as_secs_f64() * 2f64.powi(retry.saturating_sub(1) as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped * rand::thread_rng().gen_range(0.5..1.5))
    }
}

/// Drive one pod's eviction to completion under the backoff schedule.
///
/// Transient failures (PDB backpressure, API timeouts) are retried up to
/// `max_attempts`; anything [`Error::is_transient`] rejects is returned
/// on the spot.
pub async fn evict_with_retries<F, Fut>(
    backoff: &EvictionBackoff,
    pod: &str,
    mut attempt_eviction: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    for attempt in 1..=backoff.max_attempts {
        match attempt_eviction().await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_transient() => {
                warn!(
                    pod,
                    attempt,
                    error = %e,
                    "Eviction failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) if attempt == backoff.max_attempts => {
                warn!(
                    pod,
                    attempt,
                    error = %e,
                    "Eviction still failing after final attempt"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.delay_before(attempt);
                debug!(
                    pod,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Eviction denied; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(Error::drain_failure(
        pod,
        "eviction backoff configured with zero attempts",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn transient() -> Error {
        Error::cloud_provider("api server timeout")
    }

    fn permanent() -> Error {
        Error::serialization("malformed eviction response")
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_needs_no_backoff() {
        let backoff = EvictionBackoff::default();
        let calls = Cell::new(0u32);
        let result = evict_with_retries(&backoff, "default/web-0", || {
            calls.set(calls.get() + 1);
            async { Ok(()) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.get(), 1);
    }

    /// Story: PDB backpressure clears once a replacement pod is ready
    ///
    /// The first two attempts are denied transiently; the third goes
    /// through and the drain proceeds.
    #[tokio::test(start_paused = true)]
    async fn story_transient_denials_are_retried_until_clear() {
        let backoff = EvictionBackoff::default();
        let calls = Cell::new(0u32);
        let result = evict_with_retries(&backoff, "default/web-0", || {
            calls.set(calls.get() + 1);
            let denied = calls.get() <= 2;
            async move {
                if denied {
                    Err(transient())
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.get(), 3);
    }

    /// Story: a non-transient error aborts the drain at once
    ///
    /// Retrying a misconfiguration cannot cure it; the remaining schedule
    /// is skipped so the command fails fast.
    #[tokio::test(start_paused = true)]
    async fn story_non_transient_error_skips_the_schedule() {
        let backoff = EvictionBackoff::default();
        let calls = Cell::new(0u32);
        let result = evict_with_retries(&backoff, "default/web-0", || {
            calls.set(calls.get() + 1);
            async { Err(permanent()) }
        })
        .await;
        assert!(matches!(result, Err(Error::Serialization { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_failure_exhausts_attempts() {
        let backoff = EvictionBackoff {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let calls = Cell::new(0u32);
        let result = evict_with_retries(&backoff, "default/web-0", || {
            calls.set(calls.get() + 1);
            async { Err(transient()) }
        })
        .await;
        assert!(matches!(result, Err(Error::CloudProvider { .. })));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn delays_grow_exponentially_and_cap_out() {
        let backoff = EvictionBackoff {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        };
        // Jitter spans 0.5x..1.5x of the capped exponential.
        let first = backoff.delay_before(1);
        assert!(first >= Duration::from_millis(500) && first < Duration::from_millis(1500));

        let third = backoff.delay_before(3);
        assert!(third >= Duration::from_secs(2) && third < Duration::from_secs(6));

        // Far down the schedule the cap dominates.
        let late = backoff.delay_before(10);
        assert!(late < Duration::from_secs(12));
    }
}
