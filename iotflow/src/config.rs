use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
pub struct Config {
	pub broker: BrokerConfig,
	pub metadata_store: MetadataStoreConfig,
	pub time_series: TimeSeriesConfig,

	#[serde(default)]
	pub shared_cache: Option<SharedCacheConfig>,

	#[serde(default)]
	pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
	pub host: String,
	pub port: Option<u16>,

	#[serde(default)]
	pub tls: bool,

	#[serde(default = "default_root")]
	pub root: String,
}

fn default_root() -> String {
	"iotflow".to_string()
}

#[derive(Debug, Deserialize)]
pub struct MetadataStoreConfig {
	pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct TimeSeriesConfig {
	pub host: Url,
	pub token: String,
	pub org: String,
	pub bucket: String,
}

#[derive(Debug, Deserialize)]
pub struct SharedCacheConfig {
	pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
	#[serde(default = "default_max_requests")]
	pub max_requests: u32,
	#[serde(default = "default_window_seconds")]
	pub window_seconds: u64,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			max_requests: default_max_requests(),
			window_seconds: default_window_seconds(),
		}
	}
}

fn default_max_requests() -> u32 {
	100
}

fn default_window_seconds() -> u64 {
	60
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deserializes_minimal_config() {
		let yaml = r#"
broker:
  host: "mqtt.local"
metadata_store:
  path: "/var/lib/iotflow/devices.db"
time_series:
  host: "http://localhost:8086"
  token: "secret"
  org: "iotflow"
  bucket: "telemetry"
"#;
		let config: Config = serde_yaml::from_str(yaml).unwrap();
		assert_eq!(config.broker.root, "iotflow");
		assert_eq!(config.rate_limit.max_requests, 100);
		assert!(config.shared_cache.is_none());
	}
}
