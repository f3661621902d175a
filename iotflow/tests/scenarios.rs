//! Black-box end-to-end scenarios (spec.md §8) exercised against the real
//! `IngestionPipeline` wired to in-memory adapters: an in-memory SQLite
//! metadata store and a stdout-backed buffered time-series writer
//! (`timeseries::util::stdout_buffered_client`, the same fallback the
//! teacher's `fizzle::main` uses when running without a live store), so
//! these run with no network dependency.

use catalog::{Device, SqliteMetadataStore};
use iotflow::{
	auth::{AuthOutcome, Authenticator},
	liveness::{LivenessCache, Status as LivenessStatus},
	pipeline::{IngestionPipeline, Outcome, RateLimitDefaults},
	ratelimit::RateLimiter,
	source::Source,
};
use std::{num::NonZeroUsize, sync::Arc};
use timeseries::InfluxAdapter;

async fn build_pipeline() -> (IngestionPipeline, Device, Arc<LivenessCache>) {
	let auth_store = SqliteMetadataStore::open_in_memory().unwrap();
	let device = auth_store.register("sensor-7", "tempsensor").await.unwrap();
	let authenticator = Arc::new(Authenticator::new(auth_store, NonZeroUsize::new(64).unwrap()));

	let msa = Arc::new(SqliteMetadataStore::open_in_memory().unwrap());

	let client = timeseries::Client::new("http://localhost:9999", "test-token").unwrap();
	let (write_client, _writer_task) = timeseries::util::stdout_buffered_client();
	let tsa = Arc::new(InfluxAdapter::new(
		write_client,
		client.query_client(),
		"telemetry".to_string(),
		"iotflow-org".to_string(),
		"iotflow".to_string(),
	));

	let liveness = Arc::new(LivenessCache::new(None));
	let rate_limiter = Arc::new(RateLimiter::new(None));

	let pipeline = IngestionPipeline::new(
		authenticator,
		rate_limiter,
		RateLimitDefaults::default(),
		tsa,
		Arc::clone(&liveness),
		msa,
	);

	(pipeline, device, liveness)
}

#[tokio::test]
async fn scenario_1_happy_broker_telemetry() {
	let (pipeline, device, liveness) = build_pipeline().await;

	let source = Source::BrokerMessage {
		topic: format!("iotflow/devices/{}/telemetry", device.id),
		device_id_in_topic: Some(device.id),
		measurement: "telemetry".into(),
		payload: serde_json::json!({
			"api_key": device.api_key.as_str(),
			"data": {"temperature": 22.5, "humidity": 60},
			"timestamp": "2024-01-01T00:00:00Z",
		}),
	};

	match pipeline.ingest(source).await {
		Outcome::Accepted { points, timestamp_ms } => {
			assert_eq!(points, 2);
			assert_eq!(timestamp_ms, 1704067200000);
		}
		other => panic!("expected Accepted, got {other:?}"),
	}

	let (status, last_seen) = liveness.get(device.id).expect("liveness cache should be touched");
	assert_eq!(status, LivenessStatus::Online);
	assert_eq!(last_seen.unix_timestamp(), 1704067200);
}

#[tokio::test]
async fn scenario_2_flat_form_numeric_seconds_timestamp() {
	let (pipeline, device, liveness) = build_pipeline().await;

	let source = Source::BrokerMessage {
		topic: format!("iotflow/devices/{}/telemetry/sensors", device.id),
		device_id_in_topic: Some(device.id),
		measurement: "telemetry".into(),
		payload: serde_json::json!({
			"api_key": device.api_key.as_str(),
			"ts": "1704067260",
			"temperature": 23.0,
		}),
	};

	match pipeline.ingest(source).await {
		Outcome::Accepted { points, timestamp_ms } => {
			assert_eq!(points, 1);
			assert_eq!(timestamp_ms, 1704067260000);
		}
		other => panic!("expected Accepted, got {other:?}"),
	}

	assert!(liveness.get(device.id).is_some());
}

#[tokio::test]
async fn scenario_3_wrong_key_is_rejected() {
	let (pipeline, device, liveness) = build_pipeline().await;

	let source = Source::BrokerMessage {
		topic: format!("iotflow/devices/{}/telemetry", device.id),
		device_id_in_topic: Some(device.id),
		measurement: "telemetry".into(),
		payload: serde_json::json!({"api_key": "WRONG", "data": {"x": 1}}),
	};

	let outcome = pipeline.ingest(source).await;
	assert!(matches!(outcome, Outcome::Rejected(AuthOutcome::RejectedUnknownKey)));
	assert!(liveness.get(device.id).is_none());
}

#[tokio::test]
async fn scenario_4_topic_mismatch_is_rejected() {
	let (pipeline, device, liveness) = build_pipeline().await;
	let other_id = device.id + 1;

	let source = Source::BrokerMessage {
		topic: format!("iotflow/devices/{other_id}/telemetry"),
		device_id_in_topic: Some(other_id),
		measurement: "telemetry".into(),
		payload: serde_json::json!({"api_key": device.api_key.as_str(), "data": {"x": 1}}),
	};

	match pipeline.ingest(source).await {
		Outcome::Rejected(AuthOutcome::RejectedTopicMismatch { device_id, .. }) => {
			assert_eq!(device_id, other_id);
		}
		other => panic!("expected RejectedTopicMismatch, got {other:?}"),
	}

	assert!(liveness.get(device.id).is_none());
	assert!(liveness.get(other_id).is_none());
}

#[tokio::test]
async fn scenario_5_rate_limit_after_100_requests() {
	let (pipeline, device, _liveness) = build_pipeline().await;

	let mut accepted = 0;
	let mut rate_limited = 0;

	for i in 0..101 {
		let source = Source::Request {
			api_key: device.api_key.as_str().to_string(),
			device_id_in_path: Some(device.id),
			source_ip: "127.0.0.1".parse().unwrap(),
			measurement: "telemetry".into(),
			body: serde_json::json!({"data": {"x": i}}),
		};

		match pipeline.ingest(source).await {
			Outcome::Accepted { .. } => accepted += 1,
			Outcome::RateLimited { retry_after_secs } => {
				rate_limited += 1;
				assert!(retry_after_secs <= 60);
			}
			other => panic!("unexpected outcome: {other:?}"),
		}
	}

	assert_eq!(accepted, 100);
	assert_eq!(rate_limited, 1);
}

// Scenario 6 ("store transient then success") exercises the retry ladder
// in front of the time-series write, not the pipeline's routing logic —
// it is covered at the unit level by `iotflow::retry::with_backoff`'s
// `succeeds_on_third_attempt` test and `timeseries::write::buffered`'s
// internal retry, both of which this pipeline composes. Reproducing a
// genuinely transient store failure here would require a live (or
// deliberately flaky) HTTP endpoint, which this black-box suite doesn't
// stand up.
