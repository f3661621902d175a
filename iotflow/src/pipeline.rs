//! The Ingestion Pipeline (spec.md §4.7): the single entry point both
//! transports call. Authenticates, rate-limits, normalizes, writes to the
//! Time-Series Adapter, and refreshes the Liveness Cache and the
//! metadata store's last-seen column.

use crate::{
	auth::{AuthOutcome, Authenticator},
	liveness::LivenessCache,
	normalize::{self, NormalizeError},
	ratelimit::{Key, RateLimiter},
	retry,
	source::Source,
};
use catalog::{Device, SqliteMetadataStore};
use std::{sync::Arc, time::Duration};
use time::OffsetDateTime;
use timeseries::{
	adapter::{InfluxAdapter, WritePoint},
	buffered::BufferedWriteError,
};

/// TSA write deadline from the ladder in spec.md §5.
const TSA_WRITE_DEADLINE: Duration = Duration::from_secs(2);
/// MSA write deadline from the ladder in spec.md §5.
const MSA_WRITE_DEADLINE: Duration = Duration::from_secs(1);

/// The buffered time-series writer's flush cadence must stay comfortably
/// under [`TSA_WRITE_DEADLINE`] — otherwise a low-rate stream of telemetry
/// sits at `Status::Buffered` past the deadline on every call, and the
/// pipeline's retry loop mistakes a slow flush for a transient store
/// failure. `main` wires the writer's `buffered::Options::max_timeout` to
/// this constant.
pub const TSA_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum Outcome {
	Accepted { points: usize, timestamp_ms: i64 },
	Rejected(AuthOutcome),
	RateLimited { retry_after_secs: u64 },
	Malformed(String),
	StoreUnavailable,
}

pub struct RateLimitDefaults {
	pub max_requests: u32,
	pub window_seconds: u64,
}

impl Default for RateLimitDefaults {
	fn default() -> Self {
		Self {
			max_requests: 100,
			window_seconds: 60,
		}
	}
}

pub struct IngestionPipeline {
	auth: Arc<Authenticator>,
	rate_limiter: Arc<RateLimiter>,
	rate_limit_defaults: RateLimitDefaults,
	tsa: Arc<InfluxAdapter>,
	liveness: Arc<LivenessCache>,
	msa: Arc<SqliteMetadataStore>,
}

impl IngestionPipeline {
	pub fn new(
		auth: Arc<Authenticator>,
		rate_limiter: Arc<RateLimiter>,
		rate_limit_defaults: RateLimitDefaults,
		tsa: Arc<InfluxAdapter>,
		liveness: Arc<LivenessCache>,
		msa: Arc<SqliteMetadataStore>,
	) -> Self {
		Self {
			auth,
			rate_limiter,
			rate_limit_defaults,
			tsa,
			liveness,
			msa,
		}
	}

	pub async fn ingest(&self, source: Source) -> Outcome {
		let measurement = source.measurement().to_string();

		// 1-2. Authenticate. Any Rejected outcome stops here without
		// touching TSA or MSA (spec.md §4.7 step 2).
		let auth_outcome = self.auth.authenticate(&source).await;
		let device = match &auth_outcome {
			AuthOutcome::Authorized(device) => device.clone(),
			AuthOutcome::StoreUnavailable => return Outcome::StoreUnavailable,
			_ => return Outcome::Rejected(auth_outcome),
		};

		// 3. Rate limit.
		let decision = self
			.rate_limiter
			.check_and_increment(
				Key::Device(device.id),
				self.rate_limit_defaults.max_requests,
				self.rate_limit_defaults.window_seconds,
			)
			.await;
		if !decision.allowed {
			let now = OffsetDateTime::now_utc().unix_timestamp();
			let retry_after_secs = (decision.reset_ts - now).max(0) as u64;
			return Outcome::RateLimited { retry_after_secs };
		}

		// 4. Normalize.
		let payload = match &source {
			Source::BrokerMessage { payload, .. } => payload,
			Source::Request { body, .. } => body,
		};
		let batch = match normalize::normalize(device.id, &measurement, payload) {
			Ok(batch) => batch,
			Err(NormalizeError(reason)) => return Outcome::Malformed(reason),
		};

		// 5. Write to the Time-Series Adapter, retrying transient failures.
		let points: Vec<WritePoint> = batch
			.points
			.iter()
			.map(|p| {
				let mut tags = p.tags.clone();
				tags.insert("device_type".to_string(), device.device_type.clone());
				WritePoint {
					device_id: device.id,
					measurement: batch.measurement.clone(),
					field: p.field.clone(),
					value: p.value.clone(),
					tags,
					timestamp_ms: batch.timestamp_ms,
				}
			})
			.collect();

		match self.append_with_retry(&points).await {
			Ok(()) => {}
			Err(()) => return Outcome::StoreUnavailable,
		}

		// 6. Refresh the Liveness Cache — only once the write is durable,
		// so LC never advertises freshness not yet recorded at the
		// primary source (spec.md §4.7 step 5).
		let sample_ts = millis_to_datetime(batch.timestamp_ms);
		self.liveness.touch(device.id, sample_ts).await;

		// 7. Best-effort MSA last-seen touch; failure is logged, not fatal.
		self.touch_last_seen_best_effort(&device, sample_ts).await;

		// 8. Report.
		Outcome::Accepted {
			points: points.len(),
			timestamp_ms: batch.timestamp_ms,
		}
	}

	async fn append_with_retry(&self, points: &[WritePoint]) -> Result<(), ()> {
		let tsa = Arc::clone(&self.tsa);
		let result = retry::with_backoff(
			|| {
				let tsa = Arc::clone(&tsa);
				let points = points.to_vec();
				async move { wait_for_accepted(&tsa, &points).await }
			},
			|error: &AppendError| error.is_transient(),
		)
		.await;

		result.map_err(|_| ())
	}

	async fn touch_last_seen_best_effort(&self, device: &Device, ts: OffsetDateTime) {
		let result = tokio::time::timeout(MSA_WRITE_DEADLINE, self.msa.touch_last_seen(device.id, ts)).await;
		match result {
			Ok(Ok(())) => {}
			Ok(Err(error)) => {
				tracing::warn!(device_id = device.id, "metadata store last-seen touch failed: {error}");
			}
			Err(_) => {
				tracing::warn!(device_id = device.id, "metadata store last-seen touch timed out");
			}
		}
	}
}

#[derive(Debug)]
enum AppendError {
	Transient,
	Permanent,
}

impl AppendError {
	fn is_transient(&self) -> bool {
		matches!(self, AppendError::Transient)
	}
}

/// Enqueues `points` and waits (up to the TSA write deadline) for the
/// buffered writer to report the batch `Accepted`.
async fn wait_for_accepted(tsa: &InfluxAdapter, points: &[WritePoint]) -> Result<(), AppendError> {
	let mut receiver = match tsa.append(points).await {
		Ok(receiver) => receiver,
		Err(BufferedWriteError) => return Err(AppendError::Transient),
	};

	let wait = tokio::time::timeout(TSA_WRITE_DEADLINE, async {
		loop {
			if *receiver.borrow() == timeseries::write::Status::Accepted {
				return Ok(());
			}
			if receiver.changed().await.is_err() {
				return Err(AppendError::Transient);
			}
		}
	})
	.await;

	match wait {
		Ok(result) => result,
		Err(_) => Err(AppendError::Transient),
	}
}

fn millis_to_datetime(millis: i64) -> OffsetDateTime {
	OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
		.unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ratelimit::RateLimiter;
	use std::num::NonZeroUsize;
	use timeseries::Client as TimeSeriesClient;

	async fn build_pipeline() -> (IngestionPipeline, Device, tokio::sync::watch::Sender<bool>) {
		let store = SqliteMetadataStore::open_in_memory().unwrap();
		let device = store.register("sensor-7", "tempsensor").await.unwrap();
		let auth = Arc::new(Authenticator::new(store, NonZeroUsize::new(64).unwrap()));

		let msa = SqliteMetadataStore::open_in_memory().unwrap();
		let msa = Arc::new(msa);

		let client = TimeSeriesClient::new("http://localhost:8086", "test-token").unwrap();
		let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
		let (write_client, _handle) = client
			.write_to_bucket("test")
			.org("test-org")
			.build()
			.buffered(shutdown_rx);
		let tsa = Arc::new(InfluxAdapter::new(
			write_client,
			client.query_client(),
			"test".to_string(),
			"test-org".to_string(),
			"iotflow".to_string(),
		));

		let pipeline = IngestionPipeline::new(
			auth,
			Arc::new(RateLimiter::new(None)),
			RateLimitDefaults::default(),
			tsa,
			Arc::new(LivenessCache::new(None)),
			msa,
		);

		(pipeline, device, shutdown_tx)
	}

	#[tokio::test]
	async fn wrong_key_is_rejected_without_touching_liveness() {
		let (pipeline, device, _shutdown) = build_pipeline().await;

		let source = Source::BrokerMessage {
			topic: format!("iotflow/devices/{}/telemetry", device.id),
			device_id_in_topic: Some(device.id),
			measurement: "telemetry".into(),
			payload: serde_json::json!({"api_key": "WRONG", "data": {"x": 1}}),
		};

		let outcome = pipeline.ingest(source).await;
		assert!(matches!(outcome, Outcome::Rejected(AuthOutcome::RejectedUnknownKey)));
		assert!(pipeline.liveness.get(device.id).is_none());
	}

	#[tokio::test]
	async fn topic_mismatch_is_rejected() {
		let (pipeline, device, _shutdown) = build_pipeline().await;

		let source = Source::BrokerMessage {
			topic: "iotflow/devices/999/telemetry".into(),
			device_id_in_topic: Some(999),
			measurement: "telemetry".into(),
			payload: serde_json::json!({"api_key": device.api_key.as_str(), "data": {"x": 1}}),
		};

		let outcome = pipeline.ingest(source).await;
		assert!(matches!(
			outcome,
			Outcome::Rejected(AuthOutcome::RejectedTopicMismatch { .. })
		));
	}

	#[tokio::test]
	async fn malformed_payload_is_rejected_after_auth() {
		let (pipeline, device, _shutdown) = build_pipeline().await;

		let source = Source::BrokerMessage {
			topic: format!("iotflow/devices/{}/telemetry", device.id),
			device_id_in_topic: Some(device.id),
			measurement: "telemetry".into(),
			payload: serde_json::json!({"api_key": device.api_key.as_str()}),
		};

		let outcome = pipeline.ingest(source).await;
		assert!(matches!(outcome, Outcome::Malformed(_)));
	}
}
