//! The Liveness Cache (spec.md §4.3): the only shared-mutable structure
//! inside the core, protected by fine-grained locking keyed by device-id
//! (spec.md §5, stripe count >= 64). An optional `redis` tier is a
//! coherent-but-not-authoritative second tier; the in-process map is
//! always authoritative for reads.

use redis::AsyncCommands;
use std::{
	collections::HashMap,
	sync::Mutex,
	time::Duration,
};
use time::OffsetDateTime;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);
const STRIPES: usize = 64;
const REDIS_DEADLINE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Online,
	Offline,
	Unknown,
}

impl Status {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Online => "online",
			Self::Offline => "offline",
			Self::Unknown => "unknown",
		}
	}
}

#[derive(Debug, Clone)]
struct Entry {
	status: Status,
	last_seen: OffsetDateTime,
	ttl_expires_at: OffsetDateTime,
	version: u64,
}

pub struct LivenessCache {
	stripes: Vec<Mutex<HashMap<i64, Entry>>>,
	redis: Option<redis::Client>,
	ttl: Duration,
}

impl LivenessCache {
	pub fn new(redis: Option<redis::Client>) -> Self {
		Self::with_ttl(redis, DEFAULT_TTL)
	}

	pub fn with_ttl(redis: Option<redis::Client>, ttl: Duration) -> Self {
		Self {
			stripes: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
			redis,
			ttl,
		}
	}

	fn stripe(&self, device_id: i64) -> &Mutex<HashMap<i64, Entry>> {
		&self.stripes[(device_id.rem_euclid(STRIPES as i64)) as usize]
	}

	/// Marks a device online at `ts`, refreshing its TTL. Two concurrent
	/// writers resolve by higher `last_seen` wins; ties resolve by the
	/// version counter (spec.md §4.3 Concurrency).
	pub async fn touch(&self, device_id: i64, ts: OffsetDateTime) {
		let wrote = {
			let mut table = self.stripe(device_id).lock().expect("liveness stripe poisoned");
			let expires_at = ts + self.ttl;
			match table.get_mut(&device_id) {
				Some(existing) if existing.last_seen > ts => false,
				Some(existing) => {
					existing.status = Status::Online;
					existing.last_seen = ts;
					existing.ttl_expires_at = expires_at;
					existing.version += 1;
					true
				}
				None => {
					table.insert(
						device_id,
						Entry {
							status: Status::Online,
							last_seen: ts,
							ttl_expires_at: expires_at,
							version: 0,
						},
					);
					true
				}
			}
		};

		if wrote {
			self.write_through(device_id, Status::Online, ts).await;
		}
	}

	/// Explicit status override (offline/maintenance), bypassing the
	/// last-seen-wins comparison `touch` uses.
	pub async fn set_status(&self, device_id: i64, status: Status) {
		let now = OffsetDateTime::now_utc();
		{
			let mut table = self.stripe(device_id).lock().expect("liveness stripe poisoned");
			let entry = table.entry(device_id).or_insert_with(|| Entry {
				status,
				last_seen: now,
				ttl_expires_at: now + self.ttl,
				version: 0,
			});
			entry.status = status;
			entry.version += 1;
		}
		self.write_through(device_id, status, now).await;
	}

	pub fn get(&self, device_id: i64) -> Option<(Status, OffsetDateTime)> {
		let table = self.stripe(device_id).lock().expect("liveness stripe poisoned");
		table.get(&device_id).map(|e| (e.status, e.last_seen))
	}

	/// Batch read in a single round-trip against the shared tier when
	/// available, falling back to per-stripe local reads otherwise. Local
	/// entries still win over whatever the shared tier returns for the
	/// same device, since the in-process map is authoritative for reads
	/// (spec.md §4.3) and may hold a touch not yet written through.
	pub async fn get_many(&self, device_ids: &[i64]) -> HashMap<i64, (Status, OffsetDateTime)> {
		let mut result = match &self.redis {
			Some(redis) => self.get_many_redis(redis, device_ids).await.unwrap_or_default(),
			None => HashMap::new(),
		};

		for &id in device_ids {
			if let Some(entry) = self.get(id) {
				result.insert(id, entry);
			}
		}
		result
	}

	/// Issues a single pipelined `MGET`-style round-trip against the
	/// shared tier for every `device:status:<id>`/`device:lastseen:<id>`
	/// pair, bounded by [`REDIS_DEADLINE`]. Returns `None` on any failure
	/// or timeout so the caller falls back to local-only reads.
	async fn get_many_redis(
		&self,
		redis: &redis::Client,
		device_ids: &[i64],
	) -> Option<HashMap<i64, (Status, OffsetDateTime)>> {
		if device_ids.is_empty() {
			return Some(HashMap::new());
		}

		let result = tokio::time::timeout(REDIS_DEADLINE, async {
			let mut conn = redis.get_multiplexed_async_connection().await?;
			let mut pipe = redis::pipe();
			for &id in device_ids {
				pipe.get(format!("device:status:{id}"));
				pipe.get(format!("device:lastseen:{id}"));
			}
			let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
			Ok::<_, redis::RedisError>(values)
		})
		.await;

		let values = match result {
			Ok(Ok(values)) => values,
			Ok(Err(error)) => {
				tracing::warn!("liveness cache get_many redis round-trip failed: {error}");
				return None;
			}
			Err(_) => {
				tracing::warn!("liveness cache get_many redis round-trip timed out after {REDIS_DEADLINE:?}");
				return None;
			}
		};

		let mut map = HashMap::new();
		for (index, &id) in device_ids.iter().enumerate() {
			let status_str = values.get(index * 2).cloned().flatten();
			let last_seen_str = values.get(index * 2 + 1).cloned().flatten();
			let (Some(status_str), Some(last_seen_str)) = (status_str, last_seen_str) else {
				continue;
			};

			let status = match status_str.as_str() {
				"online" => Status::Online,
				"offline" => Status::Offline,
				_ => Status::Unknown,
			};
			if let Ok(last_seen) =
				OffsetDateTime::parse(&last_seen_str, &time::format_description::well_known::Rfc3339)
			{
				map.insert(id, (status, last_seen));
			}
		}
		Some(map)
	}

	/// Online iff status is online and `last_seen` is within the
	/// freshness window (spec.md §4.3 `evaluate`).
	pub fn evaluate(&self, device_id: i64, now: OffsetDateTime) -> Status {
		match self.get(device_id) {
			Some((Status::Online, last_seen)) => {
				if now - last_seen < time::Duration::try_from(FRESHNESS_WINDOW).unwrap() {
					Status::Online
				} else {
					Status::Offline
				}
			}
			Some((status, _)) => status,
			None => Status::Unknown,
		}
	}

	pub fn clear(&self, device_id: i64) {
		self.stripe(device_id)
			.lock()
			.expect("liveness stripe poisoned")
			.remove(&device_id);
	}

	pub fn clear_all(&self) {
		for stripe in &self.stripes {
			stripe.lock().expect("liveness stripe poisoned").clear();
		}
	}

	/// Best-effort write-through to the shared cache tier. Failures are
	/// logged and swallowed (`CacheUnavailable`, spec.md §7) — the
	/// in-process map is already authoritative.
	async fn write_through(&self, device_id: i64, status: Status, last_seen: OffsetDateTime) {
		let Some(redis) = &self.redis else {
			return;
		};

		let result = tokio::time::timeout(REDIS_DEADLINE, async {
			let mut conn = redis.get_multiplexed_async_connection().await?;
			let last_seen_str = last_seen
				.format(&time::format_description::well_known::Rfc3339)
				.unwrap_or_default();
			conn.set::<_, _, ()>(format!("device:status:{device_id}"), status.as_str())
				.await?;
			conn.set::<_, _, ()>(format!("device:lastseen:{device_id}"), last_seen_str)
				.await?;
			Ok::<_, redis::RedisError>(())
		})
		.await;

		match result {
			Ok(Ok(())) => {}
			Ok(Err(error)) => tracing::warn!("liveness cache write-through failed: {error}"),
			Err(_) => tracing::warn!("liveness cache write-through timed out after {REDIS_DEADLINE:?}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use time::macros::datetime;

	#[tokio::test]
	async fn touch_marks_device_online() {
		let cache = LivenessCache::new(None);
		let ts = datetime!(2024-01-01 00:00:00 UTC);
		cache.touch(7, ts).await;
		let (status, last_seen) = cache.get(7).unwrap();
		assert_eq!(status, Status::Online);
		assert_eq!(last_seen, ts);
	}

	#[tokio::test]
	async fn higher_timestamp_wins_over_concurrent_touch() {
		let cache = LivenessCache::new(None);
		let earlier = datetime!(2024-01-01 00:00:00 UTC);
		let later = datetime!(2024-01-01 00:05:00 UTC);

		cache.touch(7, later).await;
		cache.touch(7, earlier).await;

		let (_, last_seen) = cache.get(7).unwrap();
		assert_eq!(last_seen, later);
	}

	#[tokio::test]
	async fn evaluate_is_online_only_within_freshness_window() {
		let cache = LivenessCache::new(None);
		let now = OffsetDateTime::now_utc();
		cache.touch(7, now).await;
		assert_eq!(cache.evaluate(7, now), Status::Online);

		let far_future = now + time::Duration::hours(1);
		assert_eq!(cache.evaluate(7, far_future), Status::Offline);
	}

	#[tokio::test]
	async fn unknown_device_evaluates_unknown() {
		let cache = LivenessCache::new(None);
		assert_eq!(cache.evaluate(42, OffsetDateTime::now_utc()), Status::Unknown);
	}

	#[tokio::test]
	async fn clear_removes_entry() {
		let cache = LivenessCache::new(None);
		cache.touch(7, OffsetDateTime::now_utc()).await;
		cache.clear(7);
		assert!(cache.get(7).is_none());
	}
}
