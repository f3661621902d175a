//! The Health Aggregator (spec.md §4.9): a structured snapshot combining
//! store reachability, process metrics (`sysinfo`), device counts, and
//! telemetry counts, plus a background reconciler that keeps the
//! Liveness Cache honest against the metadata store without blocking
//! ingestion.

use crate::liveness::{LivenessCache, Status as LivenessStatus, FRESHNESS_WINDOW};
use catalog::SqliteMetadataStore;
use std::{sync::Arc, time::Duration};
use sysinfo::System;
use time::OffsetDateTime;
use timeseries::InfluxAdapter;

/// Reconciler tick interval (spec.md §4.9 default).
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
/// Per-tick scan budget: the reconciler must never hold up ingestion
/// (spec.md §4.9 "MUST be bounded in duration").
pub const MAX_DEVICES_PER_TICK: usize = 500;

const CACHE_DEADLINE: Duration = Duration::from_millis(100);
const MSA_READ_DEADLINE: Duration = Duration::from_millis(500);
const TSA_READ_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ComponentHealth {
	pub reachable: bool,
	pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProcessMetrics {
	pub cpu_percent: f32,
	pub memory_bytes: u64,
	pub disk_bytes_available: Option<u64>,
	pub load_average_1m: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct DeviceCounts {
	pub total: u64,
	pub active: u64,
	pub online_last_5m: u64,
	pub offline: u64,
}

#[derive(Debug, Clone)]
pub struct TelemetryCounts {
	pub last_hour: u64,
	pub last_day: u64,
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
	pub metadata_store: ComponentHealth,
	pub time_series_store: ComponentHealth,
	pub shared_cache: ComponentHealth,
	pub process: ProcessMetrics,
	pub devices: DeviceCounts,
	pub telemetry: TelemetryCounts,
}

pub struct HealthAggregator {
	msa: Arc<SqliteMetadataStore>,
	tsa: Arc<InfluxAdapter>,
	liveness: Arc<LivenessCache>,
	redis: Option<redis::Client>,
}

impl HealthAggregator {
	pub fn new(
		msa: Arc<SqliteMetadataStore>,
		tsa: Arc<InfluxAdapter>,
		liveness: Arc<LivenessCache>,
		redis: Option<redis::Client>,
	) -> Self {
		Self {
			msa,
			tsa,
			liveness,
			redis,
		}
	}

	pub async fn snapshot(&self) -> HealthSnapshot {
		let now = OffsetDateTime::now_utc();

		let (metadata_store, active_devices) = self.check_metadata_store().await;
		let time_series_store = self.check_time_series_store().await;
		let shared_cache = self.check_shared_cache().await;

		let total = self.msa.count_all().await.unwrap_or(0);
		let mut online = 0u64;
		for device in &active_devices {
			if self.liveness.evaluate(device.id, now) == LivenessStatus::Online {
				online += 1;
			}
		}
		let active = active_devices.len() as u64;

		let telemetry = self.telemetry_counts().await;

		HealthSnapshot {
			metadata_store,
			time_series_store,
			shared_cache,
			process: process_metrics(),
			devices: DeviceCounts {
				total,
				active,
				online_last_5m: online,
				offline: active.saturating_sub(online),
			},
			telemetry,
		}
	}

	async fn check_metadata_store(&self) -> (ComponentHealth, Vec<catalog::Device>) {
		let start = std::time::Instant::now();
		let result = tokio::time::timeout(MSA_READ_DEADLINE, self.msa.list_active()).await;
		match result {
			Ok(Ok(devices)) => (
				ComponentHealth {
					reachable: true,
					latency_ms: Some(start.elapsed().as_millis() as u64),
				},
				devices,
			),
			_ => (
				ComponentHealth {
					reachable: false,
					latency_ms: None,
				},
				Vec::new(),
			),
		}
	}

	async fn check_time_series_store(&self) -> ComponentHealth {
		let start = std::time::Instant::now();
		let since = OffsetDateTime::now_utc() - time::Duration::minutes(1);
		let result = tokio::time::timeout(TSA_READ_DEADLINE, self.tsa.count(0, since)).await;
		match result {
			Ok(Ok(_)) | Ok(Err(_)) => ComponentHealth {
				reachable: true,
				latency_ms: Some(start.elapsed().as_millis() as u64),
			},
			Err(_) => ComponentHealth {
				reachable: false,
				latency_ms: None,
			},
		}
	}

	async fn check_shared_cache(&self) -> ComponentHealth {
		let Some(redis) = &self.redis else {
			return ComponentHealth {
				reachable: false,
				latency_ms: None,
			};
		};

		let start = std::time::Instant::now();
		let result = tokio::time::timeout(CACHE_DEADLINE, async {
			let mut conn = redis.get_multiplexed_async_connection().await?;
			redis::cmd("PING").query_async::<_, String>(&mut conn).await
		})
		.await;

		match result {
			Ok(Ok(_)) => ComponentHealth {
				reachable: true,
				latency_ms: Some(start.elapsed().as_millis() as u64),
			},
			_ => ComponentHealth {
				reachable: false,
				latency_ms: None,
			},
		}
	}

	async fn telemetry_counts(&self) -> TelemetryCounts {
		let now = OffsetDateTime::now_utc();
		let hour_ago = now - time::Duration::hours(1);
		let day_ago = now - time::Duration::days(1);

		let last_hour = self.tsa.count(0, hour_ago).await.unwrap_or(0);
		let last_day = self.tsa.count(0, day_ago).await.unwrap_or(0);

		TelemetryCounts { last_hour, last_day }
	}

	/// Runs the bounded reconciliation tick: for each active device, if
	/// LC says online but `last_seen` has fallen outside the freshness
	/// window, downgrade it; if LC has no entry but the metadata store's
	/// `last_seen` is still fresh, seed LC from it (spec.md §4.9).
	pub async fn reconcile_once(&self) {
		let Ok(devices) = self.msa.list_active().await else {
			tracing::warn!("health aggregator: metadata store unavailable, skipping reconcile tick");
			return;
		};

		let now = OffsetDateTime::now_utc();
		let window = time::Duration::try_from(FRESHNESS_WINDOW).unwrap();

		for device in devices.into_iter().take(MAX_DEVICES_PER_TICK) {
			match self.liveness.get(device.id) {
				Some((LivenessStatus::Online, last_seen)) if now - last_seen >= window => {
					tracing::debug!(device_id = device.id, "reconciler downgrading stale online entry");
					self.liveness.set_status(device.id, LivenessStatus::Offline).await;
				}
				None => {
					if let Some(last_seen) = device.last_seen {
						if now - last_seen < window {
							tracing::debug!(device_id = device.id, "reconciler seeding liveness cache from metadata store");
							self.liveness.touch(device.id, last_seen).await;
						}
					}
				}
				_ => {}
			}
		}
	}

	/// Spawns the periodic reconciler loop, stopping when `shutdown`
	/// fires.
	pub fn spawn_reconciler(
		self: Arc<Self>,
		mut shutdown: tokio::sync::watch::Receiver<bool>,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
			loop {
				tokio::select! {
					_ = interval.tick() => {
						self.reconcile_once().await;
					}
					_ = shutdown.changed() => {
						tracing::debug!("health aggregator reconciler shutting down");
						break;
					}
				}
			}
		})
	}
}

fn process_metrics() -> ProcessMetrics {
	let mut system = System::new();
	system.refresh_cpu_usage();
	system.refresh_memory();

	let pid = sysinfo::get_current_pid().ok();
	let cpu_percent = pid
		.and_then(|pid| system.process(pid))
		.map(|p| p.cpu_usage())
		.unwrap_or(0.0);
	let memory_bytes = pid
		.and_then(|pid| system.process(pid))
		.map(|p| p.memory())
		.unwrap_or(0);

	let load = System::load_average();

	ProcessMetrics {
		cpu_percent,
		memory_bytes,
		disk_bytes_available: None,
		load_average_1m: Some(load.one),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use time::macros::datetime;

	#[tokio::test]
	async fn reconcile_seeds_liveness_from_fresh_metadata_last_seen() {
		let msa = SqliteMetadataStore::open_in_memory().unwrap();
		let device = msa.register("sensor-7", "tempsensor").await.unwrap();
		let now = OffsetDateTime::now_utc();
		msa.touch_last_seen(device.id, now).await.unwrap();

		let liveness = Arc::new(LivenessCache::new(None));
		let client = timeseries::Client::new("http://localhost:8086", "token").unwrap();
		let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
		let (write_client, _handle) = client
			.write_to_bucket("test")
			.build()
			.buffered(shutdown_rx);
		let tsa = Arc::new(InfluxAdapter::new(
			write_client,
			client.query_client(),
			"test".into(),
			"test-org".into(),
			"iotflow".into(),
		));

		let aggregator = HealthAggregator::new(Arc::new(msa), tsa, Arc::clone(&liveness), None);
		aggregator.reconcile_once().await;

		assert!(liveness.get(device.id).is_some());
		let _ = shutdown_tx;
	}

	#[tokio::test]
	async fn reconcile_downgrades_stale_online_entry() {
		let msa = SqliteMetadataStore::open_in_memory().unwrap();
		let device = msa.register("sensor-7", "tempsensor").await.unwrap();

		let liveness = Arc::new(LivenessCache::new(None));
		let stale = datetime!(2000-01-01 00:00:00 UTC);
		liveness.touch(device.id, stale).await;

		let client = timeseries::Client::new("http://localhost:8086", "token").unwrap();
		let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
		let (write_client, _handle) = client
			.write_to_bucket("test")
			.build()
			.buffered(shutdown_rx);
		let tsa = Arc::new(InfluxAdapter::new(
			write_client,
			client.query_client(),
			"test".into(),
			"test-org".into(),
			"iotflow".into(),
		));

		let aggregator = HealthAggregator::new(Arc::new(msa), tsa, Arc::clone(&liveness), None);
		aggregator.reconcile_once().await;

		let (status, _) = liveness.get(device.id).unwrap();
		assert_eq!(status, LivenessStatus::Offline);
	}
}
