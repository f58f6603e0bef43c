//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for re-running a dispatch after a saga version conflict.
///
/// `max_attempts` bounds the retries after the first attempt; once spent,
/// the envelope falls back to broker redelivery.
pub fn conflict_backoff(
    min_delay: Duration,
    max_delay: Duration,
    max_attempts: usize,
) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .with_max_times(max_attempts)
        .with_jitter()
}

/// Backoff for re-subscribing after the broker connection was lost.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: 20; callers keep retrying at `RECONNECT_MAX_DELAY` after
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(RECONNECT_MAX_DELAY)
        .with_max_times(20)
        .with_jitter()
}

/// Delay between reconnect attempts once the backoff is spent.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);
