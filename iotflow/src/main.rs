use clap::Parser;
use iotflow::{
	auth::Authenticator,
	broker::{BrokerConfig as DispatcherBrokerConfig, Dispatcher},
	config::Config,
	health::HealthAggregator,
	liveness::LivenessCache,
	pipeline::{IngestionPipeline, RateLimitDefaults, TSA_FLUSH_INTERVAL},
	ratelimit::RateLimiter,
};
use std::{fs::File, num::NonZeroUsize, path::Path, path::PathBuf, sync::Arc};
use time::util::local_offset::Soundness;
use tokio::sync::watch;

#[derive(Parser)]
pub struct Arguments {
	#[clap(env = "IOTFLOW_CONFIG_PATH")]
	config: PathBuf,
}

const AUTH_CACHE_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt::init();

	// SAFETY: we do not modify our own environment, so reading the local
	// UTC offset is sound despite the process being multi-threaded.
	unsafe {
		time::util::local_offset::set_soundness(Soundness::Unsound);
	}

	let arguments = Arguments::parse();
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let config = load_config(&arguments.config)?;

	let metadata_store = catalog::SqliteMetadataStore::open(&config.metadata_store.path)?;
	let metadata_store = Arc::new(metadata_store);

	let time_series_client = timeseries::Client::new(config.time_series.host.clone(), &config.time_series.token)?;
	let query_client = time_series_client.query_client().org(&config.time_series.org);
	// The writer's flush cadence must stay under the pipeline's TSA write
	// deadline (pipeline::TSA_FLUSH_INTERVAL), or a low-rate telemetry
	// stream never reaches `Status::Accepted` before the pipeline gives up
	// and retries, pushing duplicate batches into the buffer.
	let (write_client, time_series_task) = time_series_client
		.write_to_bucket(&config.time_series.bucket)
		.org(&config.time_series.org)
		.precision(timeseries::Precision::Milliseconds)
		.build()
		.buffered_with(
			shutdown_rx.clone(),
			timeseries::buffered::Options {
				max_timeout: TSA_FLUSH_INTERVAL,
				..Default::default()
			},
		);
	let time_series = Arc::new(timeseries::InfluxAdapter::new(
		write_client,
		query_client,
		config.time_series.bucket.clone(),
		config.time_series.org.clone(),
		config.broker.root.clone(),
	));

	let redis_client = match &config.shared_cache {
		Some(shared_cache) => Some(redis::Client::open(shared_cache.url.as_str())?),
		None => None,
	};

	let liveness = Arc::new(LivenessCache::new(redis_client.clone()));
	let rate_limiter = Arc::new(RateLimiter::new(redis_client.clone()));

	let auth_store = catalog::SqliteMetadataStore::open(&config.metadata_store.path)?;
	let authenticator = Arc::new(Authenticator::new(
		auth_store,
		NonZeroUsize::new(AUTH_CACHE_CAPACITY).expect("nonzero constant"),
	));

	let pipeline = Arc::new(IngestionPipeline::new(
		authenticator,
		Arc::clone(&rate_limiter),
		RateLimitDefaults {
			max_requests: config.rate_limit.max_requests,
			window_seconds: config.rate_limit.window_seconds,
		},
		Arc::clone(&time_series),
		Arc::clone(&liveness),
		Arc::clone(&metadata_store),
	));

	let health = Arc::new(HealthAggregator::new(
		Arc::clone(&metadata_store),
		Arc::clone(&time_series),
		Arc::clone(&liveness),
		redis_client,
	));
	let reconciler_task = Arc::clone(&health).spawn_reconciler(shutdown_rx.clone());

	let dispatcher = Dispatcher::new(
		DispatcherBrokerConfig {
			host: config.broker.host.clone(),
			port: config.broker.port.unwrap_or(if config.broker.tls { 8883 } else { 1883 }),
			tls: config.broker.tls,
			root: config.broker.root.clone(),
		},
		Arc::clone(&pipeline),
		Arc::clone(&liveness),
	);
	let dispatcher_tasks = dispatcher.spawn(shutdown_rx.clone());

	tokio::signal::ctrl_c().await?;
	tracing::info!("received ctrl-c, shutting down");
	shutdown_tx.send(true)?;

	for task in dispatcher_tasks {
		let _ = task.await;
	}
	let _ = reconciler_task.await;
	time_series_task.await??;

	Ok(())
}

fn load_config<T: AsRef<Path>>(path: T) -> anyhow::Result<Arc<Config>> {
	let path = path.as_ref();
	let config_file = File::open(path)?;
	let config = match path.extension().and_then(|s| s.to_str()) {
		Some("yaml") | Some("yml") => serde_yaml::from_reader(config_file)?,
		Some("json") => serde_json::from_reader(config_file)?,
		other => anyhow::bail!("unsupported config file extension: {other:?}"),
	};
	Ok(Arc::new(config))
}
