//! The Telemetry Normalizer (spec.md §4.5): converts a heterogeneous
//! payload into a canonical [`SampleBatch`]. Reuses `timeseries`'s
//! `FieldValue` so the Ingestion Pipeline can hand normalized points
//! straight to the Time-Series Adapter without a second conversion.

use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use timeseries::query::FieldValue;

/// The four reserved keys that never become fields, regardless of whether
/// the payload is structured or flat (spec.md §4.5).
const RESERVED_KEYS: [&str; 4] = ["api_key", "timestamp", "ts", "metadata"];

#[derive(Debug, Clone)]
pub struct SamplePoint {
	pub field: String,
	pub value: FieldValue,
	pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SampleBatch {
	pub device_id: i64,
	pub measurement: String,
	pub timestamp_ms: i64,
	pub points: Vec<SamplePoint>,
}

#[derive(Debug, Clone)]
pub struct NormalizeError(pub String);

impl std::fmt::Display for NormalizeError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "malformed telemetry payload: {}", self.0)
	}
}

impl std::error::Error for NormalizeError {}

/// Normalizes `payload` for `device_id` into a [`SampleBatch`] under
/// `measurement`. `metadata` tags are shared across every point in the
/// batch, prefixed `meta_` per spec.md §4.5.
pub fn normalize(
	device_id: i64,
	measurement: &str,
	payload: &Value,
) -> Result<SampleBatch, NormalizeError> {
	let object = payload
		.as_object()
		.ok_or_else(|| NormalizeError("payload is not a JSON object".into()))?;

	let timestamp_ms = match object.get("timestamp").or_else(|| object.get("ts")) {
		Some(value) => parse_timestamp(value)?,
		None => millis_from_datetime(OffsetDateTime::now_utc()),
	};

	let metadata_tags = object
		.get("metadata")
		.and_then(Value::as_object)
		.map(|meta| {
			meta.iter()
				.map(|(k, v)| (format!("meta_{k}"), scalar_to_tag_string(v)))
				.collect::<BTreeMap<_, _>>()
		})
		.unwrap_or_default();

	let mut points = Vec::new();
	if let Some(data) = object.get("data") {
		let data_object = data
			.as_object()
			.ok_or_else(|| NormalizeError("'data' must be a JSON object".into()))?;
		for (field, value) in data_object {
			points.push(SamplePoint {
				field: field.clone(),
				value: value_to_field(value)?,
				tags: metadata_tags.clone(),
			});
		}
	} else {
		for (key, value) in object {
			if RESERVED_KEYS.contains(&key.as_str()) {
				continue;
			}
			points.push(SamplePoint {
				field: key.clone(),
				value: value_to_field(value)?,
				tags: metadata_tags.clone(),
			});
		}
	}

	if points.is_empty() {
		return Err(NormalizeError("payload contains no telemetry fields".into()));
	}

	Ok(SampleBatch {
		device_id,
		measurement: measurement.to_string(),
		timestamp_ms,
		points,
	})
}

/// Maps a JSON leaf value to a typed field, per spec.md §4.5's type table.
/// Nested objects/arrays are JSON-encoded to a text field; `null` has no
/// sensible numeric/bool/text mapping and is rejected.
fn value_to_field(value: &Value) -> Result<FieldValue, NormalizeError> {
	match value {
		Value::Bool(b) => Ok(FieldValue::Bool(*b)),
		Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				Ok(FieldValue::Int(i))
			} else if let Some(f) = n.as_f64() {
				Ok(FieldValue::Float(f))
			} else {
				Err(NormalizeError(format!("unrepresentable number '{n}'")))
			}
		}
		Value::String(s) => Ok(FieldValue::Text(s.clone())),
		Value::Object(_) | Value::Array(_) => Ok(FieldValue::Text(value.to_string())),
		Value::Null => Err(NormalizeError("field value is null".into())),
	}
}

fn scalar_to_tag_string(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

/// Parses the three timestamp forms of spec.md §4.5 and returns
/// milliseconds since the epoch.
fn parse_timestamp(value: &Value) -> Result<i64, NormalizeError> {
	match value {
		Value::String(s) => {
			if let Ok(n) = s.parse::<f64>() {
				return Ok(numeric_to_millis(n));
			}
			parse_iso8601(s)
		}
		Value::Number(n) => {
			let as_f64 = n
				.as_f64()
				.ok_or_else(|| NormalizeError(format!("unrepresentable timestamp '{n}'")))?;
			Ok(numeric_to_millis(as_f64))
		}
		other => Err(NormalizeError(format!("unsupported timestamp value {other}"))),
	}
}

/// Numeric timestamps below 10^10 are seconds, at or above are
/// milliseconds (spec.md §4.5).
fn numeric_to_millis(value: f64) -> i64 {
	if value < 1e10 {
		(value * 1000.0).round() as i64
	} else {
		value.round() as i64
	}
}

fn parse_iso8601(raw: &str) -> Result<i64, NormalizeError> {
	use time::format_description::well_known::Rfc3339;

	// `OffsetDateTime::parse` requires an explicit offset; bare `Z` is
	// valid RFC 3339, but a payload with neither offset nor `Z` is not —
	// assume UTC in that case, matching "with/without trailing Z".
	let candidate = if raw.ends_with('Z') || raw.contains('+') || has_trailing_offset(raw) {
		raw.to_string()
	} else {
		format!("{raw}Z")
	};

	OffsetDateTime::parse(&candidate, &Rfc3339)
		.map(millis_from_datetime)
		.map_err(|e| NormalizeError(format!("invalid ISO-8601 timestamp '{raw}': {e}")))
}

fn has_trailing_offset(raw: &str) -> bool {
	// crude check for a trailing "-HH:MM" offset, distinct from date
	// separators that also use '-'.
	raw.len() >= 6 && raw.as_bytes()[raw.len() - 6] == b'-' && raw.as_bytes()[raw.len() - 3] == b':'
}

fn millis_from_datetime(dt: OffsetDateTime) -> i64 {
	(dt.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn structured_form_with_iso8601_timestamp() {
		let payload = json!({
			"api_key": "K7",
			"data": {"temperature": 22.5, "humidity": 60},
			"timestamp": "2024-01-01T00:00:00Z",
		});

		let batch = normalize(7, "telemetry", &payload).unwrap();
		assert_eq!(batch.timestamp_ms, 1704067200000);
		assert_eq!(batch.points.len(), 2);
		let temp = batch.points.iter().find(|p| p.field == "temperature").unwrap();
		assert_eq!(temp.value, FieldValue::Float(22.5));
	}

	#[test]
	fn flat_form_with_numeric_seconds_timestamp() {
		let payload = json!({
			"api_key": "K7",
			"ts": "1704067260",
			"temperature": 23.0,
		});

		let batch = normalize(7, "telemetry", &payload).unwrap();
		assert_eq!(batch.timestamp_ms, 1704067260000);
		assert_eq!(batch.points.len(), 1);
		assert_eq!(batch.points[0].field, "temperature");
	}

	#[test]
	fn numeric_millis_timestamp_is_not_rescaled() {
		let payload = json!({"api_key": "K7", "timestamp": 1704067200000i64, "x": 1});
		let batch = normalize(7, "telemetry", &payload).unwrap();
		assert_eq!(batch.timestamp_ms, 1704067200000);
	}

	#[test]
	fn absent_timestamp_defaults_to_now() {
		let before = millis_from_datetime(OffsetDateTime::now_utc());
		let payload = json!({"api_key": "K7", "x": 1});
		let batch = normalize(7, "telemetry", &payload).unwrap();
		assert!(batch.timestamp_ms >= before);
	}

	#[test]
	fn nested_values_under_data_are_json_encoded() {
		let payload = json!({
			"api_key": "K7",
			"data": {"reading": {"min": 1, "max": 2}},
		});
		let batch = normalize(7, "telemetry", &payload).unwrap();
		match &batch.points[0].value {
			FieldValue::Text(s) => assert!(s.contains("\"min\"")),
			other => panic!("expected text field, got {other:?}"),
		}
	}

	#[test]
	fn metadata_becomes_prefixed_tags() {
		let payload = json!({
			"api_key": "K7",
			"data": {"x": 1},
			"metadata": {"location": "lab"},
		});
		let batch = normalize(7, "telemetry", &payload).unwrap();
		assert_eq!(
			batch.points[0].tags.get("meta_location").map(String::as_str),
			Some("lab")
		);
	}

	#[test]
	fn null_field_value_is_rejected() {
		let payload = json!({"api_key": "K7", "data": {"x": null}});
		assert!(normalize(7, "telemetry", &payload).is_err());
	}

	#[test]
	fn non_object_payload_is_rejected() {
		let payload = json!([1, 2, 3]);
		assert!(normalize(7, "telemetry", &payload).is_err());
	}
}
