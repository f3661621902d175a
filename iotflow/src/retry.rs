//! Shared retry policy for the Time-Series and Metadata Store call sites
//! in [`crate::pipeline`] (spec.md §4.7/§7): capped exponential backoff,
//! at most 3 attempts, jittered between 200ms and 2s.

use rand::Rng;
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Retries `op` up to [`MAX_ATTEMPTS`] times as long as `is_transient`
/// says so. Returns the last error once exhausted.
pub async fn with_backoff<T, E, F, Fut, IsTransient>(
	mut op: F,
	is_transient: IsTransient,
) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
	IsTransient: Fn(&E) -> bool,
{
	let mut delay = BASE_DELAY;

	for attempt in 1..=MAX_ATTEMPTS {
		match op().await {
			Ok(value) => return Ok(value),
			Err(error) if attempt < MAX_ATTEMPTS && is_transient(&error) => {
				let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
				let sleep_for = delay + Duration::from_millis(jitter);
				tracing::warn!(attempt, ?sleep_for, "transient store error, retrying");
				tokio::time::sleep(sleep_for).await;
				delay = (delay * 2).min(MAX_DELAY);
			}
			Err(error) => return Err(error),
		}
	}

	unreachable!("loop always returns by the final attempt")
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test]
	async fn succeeds_on_third_attempt() {
		let attempts = AtomicU32::new(0);
		let result: Result<&str, &str> = with_backoff(
			|| {
				let n = attempts.fetch_add(1, Ordering::SeqCst);
				async move {
					if n < 2 {
						Err("transient")
					} else {
						Ok("ok")
					}
				}
			},
			|_| true,
		)
		.await;

		assert_eq!(result, Ok("ok"));
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn permanent_error_is_not_retried() {
		let attempts = AtomicU32::new(0);
		let result: Result<&str, &str> = with_backoff(
			|| {
				attempts.fetch_add(1, Ordering::SeqCst);
				async { Err("permanent") }
			},
			|_| false,
		)
		.await;

		assert_eq!(result, Err("permanent"));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn gives_up_after_max_attempts() {
		let attempts = AtomicU32::new(0);
		let result: Result<&str, &str> = with_backoff(
			|| {
				attempts.fetch_add(1, Ordering::SeqCst);
				async { Err("transient") }
			},
			|_| true,
		)
		.await;

		assert_eq!(result, Err("transient"));
		assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
	}
}
