//! The Rate Limiter (spec.md §4.8): a fixed sliding window keyed by
//! device-id or source-ip. Atomic per-key via compare-and-set against the
//! shared store when available, or a striped local mutex otherwise,
//! mirroring `middleware/auth.py::rate_limit_device`'s Redis pipeline —
//! fail-open on shared-store unavailability.

use redis::AsyncCommands;
use std::{
	collections::HashMap,
	net::IpAddr,
	sync::Mutex,
	time::Duration,
};
use time::OffsetDateTime;

const STRIPES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
	Device(i64),
	SourceIp(IpAddr),
}

impl Key {
	fn cache_key(&self) -> String {
		match self {
			Key::Device(id) => format!("rate_limit:device:{id}"),
			Key::SourceIp(ip) => format!("rate_limit:ip:{ip}"),
		}
	}
}

/// Rate-limit response, carrying the fields a future HTTP layer would
/// surface as `X-RateLimit-*` headers (supplemented feature, see
/// SPEC_FULL.md).
#[derive(Debug, Clone, Copy)]
pub struct Decision {
	pub allowed: bool,
	pub limit: u32,
	pub remaining: u32,
	pub reset_ts: i64,
}

struct Counter {
	bucket: i64,
	count: u32,
}

pub struct RateLimiter {
	local: Vec<Mutex<HashMap<Key, Counter>>>,
	redis: Option<redis::Client>,
}

impl RateLimiter {
	pub fn new(redis: Option<redis::Client>) -> Self {
		Self {
			local: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
			redis,
		}
	}

	fn stripe(&self, key: &Key) -> &Mutex<HashMap<Key, Counter>> {
		use std::hash::{Hash, Hasher};
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		key.hash(&mut hasher);
		&self.local[(hasher.finish() as usize) % self.local.len()]
	}

	/// Atomically checks and increments the counter for `key` within its
	/// current `window_seconds` bucket.
	pub async fn check_and_increment(
		&self,
		key: Key,
		max_requests: u32,
		window_seconds: u64,
	) -> Decision {
		if let Some(redis) = &self.redis {
			match self.check_and_increment_redis(redis, &key, max_requests, window_seconds).await {
				Ok(decision) => return decision,
				Err(error) => {
					tracing::warn!("rate limiter shared store unavailable, failing open: {error}");
				}
			}
		}

		self.check_and_increment_local(&key, max_requests, window_seconds)
	}

	fn check_and_increment_local(&self, key: &Key, max_requests: u32, window_seconds: u64) -> Decision {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		let bucket = now / window_seconds as i64;
		let reset_ts = (bucket + 1) * window_seconds as i64;

		let mut table = self.stripe(key).lock().expect("rate limiter stripe poisoned");
		let counter = table.entry(*key).or_insert(Counter { bucket, count: 0 });

		if counter.bucket != bucket {
			counter.bucket = bucket;
			counter.count = 0;
		}

		if counter.count >= max_requests {
			return Decision {
				allowed: false,
				limit: max_requests,
				remaining: 0,
				reset_ts,
			};
		}

		counter.count += 1;
		Decision {
			allowed: true,
			limit: max_requests,
			remaining: max_requests - counter.count,
			reset_ts,
		}
	}

	async fn check_and_increment_redis(
		&self,
		redis: &redis::Client,
		key: &Key,
		max_requests: u32,
		window_seconds: u64,
	) -> redis::RedisResult<Decision> {
		let deadline = Duration::from_millis(100);
		tokio::time::timeout(deadline, async {
			let now = OffsetDateTime::now_utc().unix_timestamp();
			let bucket = now / window_seconds as i64;
			let reset_ts = (bucket + 1) * window_seconds as i64;
			let cache_key = format!("{}:{bucket}", key.cache_key());

			let mut conn = redis.get_multiplexed_async_connection().await?;
			let count: u32 = conn.incr(&cache_key, 1u32).await?;
			if count == 1 {
				let _: () = conn.expire(&cache_key, window_seconds as i64).await?;
			}

			if count > max_requests {
				Ok(Decision {
					allowed: false,
					limit: max_requests,
					remaining: 0,
					reset_ts,
				})
			} else {
				Ok(Decision {
					allowed: true,
					limit: max_requests,
					remaining: max_requests - count,
					reset_ts,
				})
			}
		})
		.await
		.unwrap_or_else(|_| {
			Err(redis::RedisError::from(std::io::Error::new(
				std::io::ErrorKind::TimedOut,
				"rate limiter redis round-trip exceeded 100ms",
			)))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn allows_up_to_max_requests_then_rejects() {
		let limiter = RateLimiter::new(None);
		let key = Key::Device(7);

		for _ in 0..100 {
			let decision = limiter.check_and_increment(key, 100, 60).await;
			assert!(decision.allowed);
		}

		let decision = limiter.check_and_increment(key, 100, 60).await;
		assert!(!decision.allowed);
		assert_eq!(decision.remaining, 0);
	}

	#[tokio::test]
	async fn different_keys_have_independent_counters() {
		let limiter = RateLimiter::new(None);
		for _ in 0..100 {
			assert!(limiter.check_and_increment(Key::Device(1), 100, 60).await.allowed);
		}
		assert!(limiter.check_and_increment(Key::Device(2), 100, 60).await.allowed);
	}

	#[tokio::test]
	async fn source_ip_key_is_distinct_from_device_key() {
		let limiter = RateLimiter::new(None);
		let ip: IpAddr = "127.0.0.1".parse().unwrap();
		for _ in 0..5 {
			assert!(limiter.check_and_increment(Key::SourceIp(ip), 5, 60).await.allowed);
		}
		assert!(!limiter.check_and_increment(Key::SourceIp(ip), 5, 60).await.allowed);
		assert!(limiter.check_and_increment(Key::Device(1), 5, 60).await.allowed);
	}
}
