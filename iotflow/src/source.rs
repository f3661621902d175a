use serde_json::Value;
use std::net::IpAddr;

/// Both transports (broker and request) construct one of these and call
/// [`crate::pipeline::IngestionPipeline::ingest`] — no transport-specific
/// branch ever runs inside the pipeline (spec.md Design Note "Multiple
/// transports with one core").
#[derive(Debug, Clone)]
pub enum Source {
	/// A message received on the broker, already topic-parsed by
	/// [`crate::broker::topic::parse_topic`].
	BrokerMessage {
		topic: String,
		device_id_in_topic: Option<i64>,
		measurement: String,
		payload: Value,
	},
	/// A request-transport call. The HTTP router itself is out of scope
	/// (spec.md §1); this variant is the contract it would construct.
	Request {
		api_key: String,
		device_id_in_path: Option<i64>,
		source_ip: IpAddr,
		measurement: String,
		body: Value,
	},
}

impl Source {
	pub fn measurement(&self) -> &str {
		match self {
			Source::BrokerMessage { measurement, .. } => measurement,
			Source::Request { measurement, .. } => measurement,
		}
	}
}
