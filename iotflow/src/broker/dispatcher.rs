//! The Broker Dispatcher (spec.md §4.6): owns the broker connection,
//! classifies inbound messages by [`Kind`], and routes device-originated
//! traffic into per-kind bounded queues drained by worker tasks that call
//! [`IngestionPipeline::ingest`]. Generalizes the teacher's
//! `tasks::mqtt::start_task` / `main.rs` `tasmota_rx` `tokio::select!` loop
//! into an explicit reconnect state machine with bounded backoff.

use crate::{
	broker::{
		queue::OverflowQueue,
		topic::{parse_topic, sanitize_measurement, Kind},
	},
	liveness::{LivenessCache, Status as LivenessStatus},
	pipeline::{IngestionPipeline, Outcome},
	source::Source,
};
use mqtt::{
	clients::tokio::{tcp_client, Message, Options},
	FilterBuf, QoS,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

/// Default per-kind queue capacity (spec.md §4.6).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Init,
	Connecting,
	Connected,
	Subscribed,
	Disconnected,
}

/// QoS and retain policy per message kind, per spec.md §4.6/§6.1: telemetry
/// and sensor data at-least-once, commands/firmware exactly-once with
/// retain, heartbeats at-most-once.
pub fn publish_policy(kind: Kind) -> (QoS, bool) {
	match kind {
		Kind::Commands | Kind::Config | Kind::FleetCommands => (QoS::ExactlyOnce, true),
		Kind::Heartbeat => (QoS::AtMostOnce, false),
		_ => (QoS::AtLeastOnce, false),
	}
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
	pub host: String,
	pub port: u16,
	pub tls: bool,
	pub root: String,
}

struct RawMessage {
	topic: String,
	device_id: i64,
	measurement: String,
	payload: bytes::Bytes,
}

pub struct Dispatcher {
	config: BrokerConfig,
	pipeline: Arc<IngestionPipeline>,
	liveness: Arc<LivenessCache>,
	telemetry: Arc<OverflowQueue<RawMessage>>,
	status: Arc<OverflowQueue<RawMessage>>,
	heartbeat: Arc<OverflowQueue<RawMessage>>,
}

impl Dispatcher {
	pub fn new(config: BrokerConfig, pipeline: Arc<IngestionPipeline>, liveness: Arc<LivenessCache>) -> Arc<Self> {
		Arc::new(Self {
			config,
			pipeline,
			liveness,
			telemetry: Arc::new(OverflowQueue::new(DEFAULT_QUEUE_CAPACITY)),
			status: Arc::new(OverflowQueue::new(DEFAULT_QUEUE_CAPACITY)),
			heartbeat: Arc::new(OverflowQueue::new(DEFAULT_QUEUE_CAPACITY)),
		})
	}

	/// Spawns the connection loop and the per-kind worker tasks. Returns
	/// their join handles so `main` can drain them on shutdown.
	pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
		vec![
			tokio::spawn(Arc::clone(self).run(shutdown)),
			tokio::spawn(Arc::clone(self).drain_worker(Arc::clone(&self.telemetry), "telemetry")),
			tokio::spawn(Arc::clone(self).drain_worker(Arc::clone(&self.status), "status")),
			tokio::spawn(Arc::clone(self).drain_worker(Arc::clone(&self.heartbeat), "heartbeat")),
		]
	}

	async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut attempt: u32 = 0;

		loop {
			if *shutdown.borrow() {
				return;
			}

			tracing::debug!(state = ?ConnectionState::Connecting, "connecting to broker");
			let options = Options {
				host: self.config.host.clone(),
				port: self.config.port,
				tls: self.config.tls,
				..Default::default()
			};
			let (client, _handle) = tcp_client(options);

			let pattern = format!("{}/#", self.config.root);
			let filter = match FilterBuf::new(&pattern) {
				Ok(filter) => filter,
				Err(error) => {
					tracing::error!("invalid topic filter '{pattern}': {error}");
					return;
				}
			};

			match client.subscribe(filter.as_str(), DEFAULT_QUEUE_CAPACITY).await {
				Ok(mut messages) => {
					tracing::info!(state = ?ConnectionState::Subscribed, "subscribed to '{pattern}'");
					attempt = 0;

					loop {
						tokio::select! {
							message = messages.recv() => {
								match message {
									Some(message) => self.route(message),
									None => {
										tracing::warn!(state = ?ConnectionState::Disconnected, "broker connection closed, reconnecting");
										break;
									}
								}
							}
							_ = shutdown.changed() => {
								let _ = client.disconnect().await;
								return;
							}
						}
					}
				}
				Err(error) => {
					tracing::warn!(state = ?ConnectionState::Disconnected, "broker subscribe failed: {error}");
				}
			}

			attempt += 1;
			let delay = reconnect_delay(attempt);
			tracing::warn!(attempt, ?delay, "reconnecting to broker");

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = shutdown.changed() => return,
			}
		}
	}

	/// Classifies and routes a single broker message. LWT deliveries
	/// bypass the Ingestion Pipeline entirely — there is no telemetry
	/// payload to normalize (supplemented feature, see SPEC_FULL.md).
	fn route(&self, message: Message) {
		let parsed = match parse_topic(&message.topic, &self.config.root) {
			Ok(parsed) => parsed,
			Err(error) => {
				tracing::debug!("dropping message on unparsable topic '{}': {error}", message.topic);
				return;
			}
		};

		let Some(device_id) = parsed.device_id else {
			tracing::debug!(kind = ?parsed.kind, "ignoring non-device-scoped topic");
			return;
		};

		match parsed.kind {
			Kind::Lwt => {
				tracing::info!(device_id, "received LWT, marking device offline");
				let liveness = Arc::clone(&self.liveness);
				tokio::spawn(async move { liveness.set_status(device_id, LivenessStatus::Offline).await });
			}
			Kind::Telemetry | Kind::Status | Kind::Heartbeat => {
				let kind = parsed.kind;
				let measurement = parsed
					.subtopic
					.as_deref()
					.map(sanitize_measurement)
					.unwrap_or_else(|| default_measurement(kind));
				let raw = RawMessage {
					topic: message.topic,
					device_id,
					measurement,
					payload: message.payload,
				};
				match kind {
					Kind::Telemetry => self.telemetry.push(raw),
					Kind::Status => self.status.push(raw),
					Kind::Heartbeat => self.heartbeat.push(raw),
					_ => unreachable!("matched above"),
				}
			}
			other => {
				tracing::debug!(kind = ?other, "ignoring non-ingestion topic on the inbound path");
			}
		}
	}

	async fn drain_worker(self: Arc<Self>, queue: Arc<OverflowQueue<RawMessage>>, label: &'static str) {
		loop {
			let raw = queue.pop().await;
			let payload: serde_json::Value = match serde_json::from_slice(&raw.payload) {
				Ok(value) => value,
				Err(error) => {
					tracing::warn!(
						device_id = raw.device_id,
						topic = raw.topic,
						bytes = raw.payload.len(),
						"dropping non-JSON {label} payload: {error}"
					);
					continue;
				}
			};

			let source = Source::BrokerMessage {
				topic: raw.topic,
				device_id_in_topic: Some(raw.device_id),
				measurement: raw.measurement,
				payload,
			};

			match self.pipeline.ingest(source).await {
				Outcome::Accepted { points, .. } => {
					tracing::debug!(device_id = raw.device_id, points, "ingested {label} sample");
				}
				Outcome::Rejected(outcome) => {
					tracing::warn!(device_id = raw.device_id, "rejected {label}: {outcome:?}");
				}
				Outcome::RateLimited { retry_after_secs } => {
					tracing::warn!(device_id = raw.device_id, retry_after_secs, "rate limited {label}");
				}
				Outcome::Malformed(reason) => {
					tracing::warn!(device_id = raw.device_id, "malformed {label}: {reason}");
				}
				Outcome::StoreUnavailable => {
					tracing::error!(device_id = raw.device_id, "store unavailable, dropping {label}");
				}
			}
		}
	}
}

fn default_measurement(kind: Kind) -> String {
	match kind {
		Kind::Telemetry => "telemetry",
		Kind::Status => "status",
		Kind::Heartbeat => "heartbeat",
		_ => "telemetry",
	}
	.to_string()
}

/// Exponential backoff capped at [`MAX_RECONNECT_DELAY`], resetting on a
/// successful `Subscribed` transition (spec.md §4.6).
fn reconnect_delay(attempt: u32) -> Duration {
	let millis = BASE_RECONNECT_DELAY.as_millis() as u64 * 2u64.saturating_pow(attempt.min(8));
	Duration::from_millis(millis).min(MAX_RECONNECT_DELAY)
}
