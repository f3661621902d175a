//! Topic parsing for the fixed `/`-delimited grammar in spec.md §6.1.
//! Generalizes the teacher's `RegexTopicScheme`/`HomeTasmotaTopicScheme`
//! prefix/suffix trimming into a hand-rolled splitter — no regex is needed
//! since the schema is a fixed grammar, not an arbitrary pattern.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	Telemetry,
	Status,
	Heartbeat,
	/// A device's broker-delivered Last Will and Testament: a status
	/// message with no telemetry payload to normalize, handled by the
	/// dispatcher directly rather than through TN/IP (supplemented
	/// feature, see SPEC_FULL.md).
	Lwt,
	Commands,
	Config,
	FleetCommands,
	System,
	Monitoring,
	Discovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
	pub kind: Kind,
	pub device_id: Option<i64>,
	/// The remainder of the topic after the fixed position, e.g. `sensors`
	/// in `.../telemetry/sensors`, or `config` in `.../commands/config`.
	pub subtopic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicError(pub String);

impl fmt::Display for TopicError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "malformed topic: {}", self.0)
	}
}

impl std::error::Error for TopicError {}

/// Parses `topic` against the schema rooted at `root` (spec.md §6.1).
pub fn parse_topic(topic: &str, root: &str) -> Result<ParsedTopic, TopicError> {
	let prefix = format!("{root}/");
	let Some(rest) = topic.strip_prefix(&prefix) else {
		return Err(TopicError(format!("topic '{topic}' is not under root '{root}'")));
	};

	let mut segments = rest.split('/');
	let first = segments.next().ok_or_else(|| TopicError("empty topic".into()))?;

	match first {
		"devices" => {
			let id_str = segments
				.next()
				.ok_or_else(|| TopicError("missing device id segment".into()))?;
			let device_id: i64 = id_str
				.parse()
				.map_err(|_| TopicError(format!("non-numeric device id '{id_str}'")))?;

			let position = segments
				.next()
				.ok_or_else(|| TopicError("missing position segment after device id".into()))?;

			let remainder: Vec<&str> = segments.collect();
			let subtopic = (!remainder.is_empty()).then(|| remainder.join("/"));

			let kind = match position {
				"telemetry" => Kind::Telemetry,
				"status" => {
					if subtopic.as_deref() == Some("offline") {
						Kind::Lwt
					} else {
						Kind::Status
					}
				}
				"heartbeat" => Kind::Heartbeat,
				"commands" => Kind::Commands,
				"config" => Kind::Config,
				other => return Err(TopicError(format!("unknown device subtopic '{other}'"))),
			};

			Ok(ParsedTopic {
				kind,
				device_id: Some(device_id),
				subtopic,
			})
		}
		"fleet" => {
			let position = segments
				.next()
				.ok_or_else(|| TopicError("missing fleet position segment".into()))?;
			if position != "commands" {
				return Err(TopicError(format!("unknown fleet subtopic '{position}'")));
			}
			let group: Vec<&str> = segments.collect();
			Ok(ParsedTopic {
				kind: Kind::FleetCommands,
				device_id: None,
				subtopic: (!group.is_empty()).then(|| group.join("/")),
			})
		}
		"system" => Ok(ParsedTopic {
			kind: Kind::System,
			device_id: None,
			subtopic: segments.next().map(str::to_string),
		}),
		"monitoring" => Ok(ParsedTopic {
			kind: Kind::Monitoring,
			device_id: None,
			subtopic: segments.next().map(str::to_string),
		}),
		"discovery" => Ok(ParsedTopic {
			kind: Kind::Discovery,
			device_id: None,
			subtopic: segments.next().map(str::to_string),
		}),
		other => Err(TopicError(format!("unknown root segment '{other}'"))),
	}
}

/// Strips characters outside the measurement-name alphabet so a broker
/// subtopic can be used directly as a line-protocol measurement name
/// (spec.md §4.5: "reserved characters in the suffix are stripped").
pub fn sanitize_measurement(raw: &str) -> String {
	let cleaned: String = raw
		.chars()
		.filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
		.collect();
	if cleaned.is_empty() {
		"telemetry".to_string()
	} else {
		cleaned
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_telemetry_topic() {
		let parsed = parse_topic("iotflow/devices/7/telemetry", "iotflow").unwrap();
		assert_eq!(parsed.kind, Kind::Telemetry);
		assert_eq!(parsed.device_id, Some(7));
		assert_eq!(parsed.subtopic, None);
	}

	#[test]
	fn parses_telemetry_with_subtopic() {
		let parsed = parse_topic("iotflow/devices/7/telemetry/sensors", "iotflow").unwrap();
		assert_eq!(parsed.kind, Kind::Telemetry);
		assert_eq!(parsed.subtopic.as_deref(), Some("sensors"));
	}

	#[test]
	fn status_offline_is_classified_as_lwt() {
		let parsed = parse_topic("iotflow/devices/7/status/offline", "iotflow").unwrap();
		assert_eq!(parsed.kind, Kind::Lwt);

		let parsed = parse_topic("iotflow/devices/7/status/online", "iotflow").unwrap();
		assert_eq!(parsed.kind, Kind::Status);
	}

	#[test]
	fn rejects_topic_outside_root() {
		assert!(parse_topic("other/devices/7/telemetry", "iotflow").is_err());
	}

	#[test]
	fn rejects_non_numeric_device_id() {
		assert!(parse_topic("iotflow/devices/seven/telemetry", "iotflow").is_err());
	}

	#[test]
	fn sanitize_measurement_strips_reserved_characters() {
		assert_eq!(sanitize_measurement("sensors/a b"), "sensorsab");
		assert_eq!(sanitize_measurement("///"), "telemetry");
	}
}
