//! The Authenticator (spec.md §4.4): a stateless policy over the metadata
//! store, with a bounded LRU of resolved device handles in front of it
//! (spec.md §3 Ownership). Authorization on the broker path is pure
//! string-prefix matching against a device's own subtree, generalizing
//! the prefix/suffix trimming idiom in the teacher's `HomeTasmotaTopicScheme`.

use crate::{broker::topic::Kind, retry, source::Source};
use catalog::{ApiKey, Device, DeviceStatus, SqliteMetadataStore, StoreError};
use lru::LruCache;
use std::{
	num::NonZeroUsize,
	sync::Mutex,
	time::{Duration, Instant},
};

/// Default TTL for a resolved device handle in the Authenticator's LRU,
/// matching the Liveness Cache's TTL (spec.md §3 Ownership).
pub const HANDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub enum AuthOutcome {
	Authorized(Device),
	RejectedUnknownKey,
	RejectedInactive(DeviceStatus),
	RejectedTopicMismatch { device_id: i64, topic: String },
	RejectedMalformed(String),
	/// The metadata store stayed unavailable through [`retry::MAX_ATTEMPTS`]
	/// lookup attempts — distinct from [`AuthOutcome::RejectedUnknownKey`],
	/// which means the store was reachable and the key simply isn't known
	/// (spec.md §7: Unauthorized vs StoreTransient).
	StoreUnavailable,
}

impl AuthOutcome {
	pub fn device(&self) -> Option<&Device> {
		match self {
			AuthOutcome::Authorized(device) => Some(device),
			_ => None,
		}
	}
}

struct CachedHandle {
	device: Device,
	cached_at: Instant,
}

pub struct Authenticator {
	store: SqliteMetadataStore,
	cache: Mutex<LruCache<String, CachedHandle>>,
}

impl Authenticator {
	pub fn new(store: SqliteMetadataStore, cache_capacity: NonZeroUsize) -> Self {
		Self {
			store,
			cache: Mutex::new(LruCache::new(cache_capacity)),
		}
	}

	pub async fn authenticate(&self, source: &Source) -> AuthOutcome {
		match source {
			Source::BrokerMessage {
				topic,
				device_id_in_topic,
				payload,
				..
			} => {
				let Some(api_key) = payload.get("api_key").and_then(|v| v.as_str()) else {
					return AuthOutcome::RejectedMalformed("payload missing 'api_key'".into());
				};

				let device = match self.resolve(api_key).await {
					Ok(device) => device,
					Err(outcome) => return outcome,
				};

				if !device.is_active() {
					return AuthOutcome::RejectedInactive(device.status);
				}

				// The Authenticator MUST NOT trust a device-id taken from the
				// topic unless it agrees with the key's device (spec.md §4.4).
				if let Some(topic_device_id) = device_id_in_topic {
					if *topic_device_id != device.id {
						return AuthOutcome::RejectedTopicMismatch {
							device_id: *topic_device_id,
							topic: topic.clone(),
						};
					}
				}

				AuthOutcome::Authorized(device)
			}
			Source::Request {
				api_key,
				device_id_in_path,
				..
			} => {
				let device = match self.resolve(api_key).await {
					Ok(device) => device,
					Err(outcome) => return outcome,
				};

				if !device.is_active() {
					return AuthOutcome::RejectedInactive(device.status);
				}

				if let Some(path_id) = device_id_in_path {
					if *path_id != device.id {
						return AuthOutcome::RejectedTopicMismatch {
							device_id: *path_id,
							topic: String::from("<request path>"),
						};
					}
				}

				AuthOutcome::Authorized(device)
			}
		}
	}

	/// Checks whether `device_id` may publish telemetry/status/heartbeat on
	/// `topic`, per spec.md §4.4's rooted-subtree policy. Called after
	/// authentication succeeds and the topic has been classified.
	pub fn authorize_publish(kind: &Kind, device_id: i64, topic_device_id: i64) -> bool {
		device_id == topic_device_id
			&& matches!(kind, Kind::Telemetry | Kind::Status | Kind::Heartbeat | Kind::Lwt)
	}

	async fn resolve(&self, api_key: &str) -> Result<Device, AuthOutcome> {
		if let Some(device) = self.cached(api_key) {
			return Ok(device);
		}

		let key = ApiKey::new(api_key);
		let result = retry::with_backoff(
			|| {
				let key = key.clone();
				async move { self.store.find_by_api_key(&key).await }
			},
			StoreError::is_transient,
		)
		.await;

		match result {
			Ok(device) => {
				self.cache.lock().expect("authenticator cache poisoned").put(
					api_key.to_string(),
					CachedHandle {
						device: device.clone(),
						cached_at: Instant::now(),
					},
				);
				Ok(device)
			}
			Err(StoreError::NotFound) => Err(AuthOutcome::RejectedUnknownKey),
			Err(StoreError::Transient(detail)) => {
				tracing::warn!("metadata store stayed unavailable after retries during auth: {detail}");
				Err(AuthOutcome::StoreUnavailable)
			}
		}
	}

	fn cached(&self, api_key: &str) -> Option<Device> {
		let mut cache = self.cache.lock().expect("authenticator cache poisoned");
		match cache.get(api_key) {
			Some(entry) if entry.cached_at.elapsed() < HANDLE_TTL => Some(entry.device.clone()),
			Some(_) => {
				cache.pop(api_key);
				None
			}
			None => None,
		}
	}

	/// Evicts a cached handle immediately, used when admin rotation or
	/// deactivation must take effect before the TTL would naturally expire.
	pub fn invalidate(&self, api_key: &str) {
		self.cache.lock().expect("authenticator cache poisoned").pop(api_key);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::broker::topic::Kind;

	#[tokio::test]
	async fn unknown_key_is_rejected() {
		let store = SqliteMetadataStore::open_in_memory().unwrap();
		let auth = Authenticator::new(store, NonZeroUsize::new(64).unwrap());

		let source = Source::BrokerMessage {
			topic: "iotflow/devices/7/telemetry".into(),
			device_id_in_topic: Some(7),
			measurement: "telemetry".into(),
			payload: serde_json::json!({"api_key": "WRONG", "data": {"x": 1}}),
		};

		assert!(matches!(
			auth.authenticate(&source).await,
			AuthOutcome::RejectedUnknownKey
		));
	}

	#[tokio::test]
	async fn valid_key_but_topic_mismatch_is_rejected() {
		let store = SqliteMetadataStore::open_in_memory().unwrap();
		let device = store.register("sensor-7", "tempsensor").await.unwrap();
		let auth = Authenticator::new(store, NonZeroUsize::new(64).unwrap());

		let source = Source::BrokerMessage {
			topic: "iotflow/devices/9/telemetry".into(),
			device_id_in_topic: Some(9),
			measurement: "telemetry".into(),
			payload: serde_json::json!({"api_key": device.api_key.as_str(), "data": {"x": 1}}),
		};

		match auth.authenticate(&source).await {
			AuthOutcome::RejectedTopicMismatch { device_id, .. } => assert_eq!(device_id, 9),
			other => panic!("expected topic mismatch, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn active_device_with_matching_topic_is_authorized() {
		let store = SqliteMetadataStore::open_in_memory().unwrap();
		let device = store.register("sensor-7", "tempsensor").await.unwrap();
		let device_id = device.id;
		let auth = Authenticator::new(store, NonZeroUsize::new(64).unwrap());

		let source = Source::BrokerMessage {
			topic: format!("iotflow/devices/{device_id}/telemetry"),
			device_id_in_topic: Some(device_id),
			measurement: "telemetry".into(),
			payload: serde_json::json!({"api_key": device.api_key.as_str(), "data": {"x": 1}}),
		};

		assert!(matches!(
			auth.authenticate(&source).await,
			AuthOutcome::Authorized(_)
		));
	}

	#[test]
	fn authorize_publish_is_total_on_own_subtree() {
		assert!(Authenticator::authorize_publish(&Kind::Telemetry, 7, 7));
		assert!(Authenticator::authorize_publish(&Kind::Status, 7, 7));
		assert!(Authenticator::authorize_publish(&Kind::Heartbeat, 7, 7));
		assert!(!Authenticator::authorize_publish(&Kind::Telemetry, 7, 9));
		assert!(!Authenticator::authorize_publish(&Kind::Commands, 7, 7));
	}
}
