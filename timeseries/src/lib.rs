pub mod adapter;
mod client;
pub mod query;
pub mod util;
pub mod write;

pub use write::precision::Precision;

pub use client::Client;

pub use adapter::InfluxAdapter;
pub use query::{Point, QueryError};
pub use write::buffered;
pub use write::immediate;
pub use write::LineBuilder;
pub use write::Status;

/// Strips characters that are not ASCII alphanumeric, `_`, `-` or `.` from a
/// path segment destined for a series path.
///
/// Series paths follow `<root>.devices.device_<id>.<field>`; `field` is
/// ultimately derived from payload keys supplied by the device, so it must
/// never be interpolated verbatim.
pub fn sanitize_segment(segment: &str) -> String {
	segment
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
				c
			} else {
				'_'
			}
		})
		.collect()
}

/// Builds the canonical series path for a device's field, escaping the
/// field name per [`sanitize_segment`].
pub fn series_path(root: &str, device_id: i64, field: &str) -> String {
	format!("{root}.devices.device_{device_id}.{}", sanitize_segment(field))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sanitize_segment_strips_reserved_characters() {
		assert_eq!(sanitize_segment("temperature"), "temperature");
		assert_eq!(sanitize_segment("a/b c"), "a_b_c");
		assert_eq!(sanitize_segment("../../etc"), ".._.._etc");
	}

	#[test]
	fn series_path_is_escaped() {
		assert_eq!(
			series_path("iotflow", 7, "temp/hum"),
			"iotflow.devices.device_7.temp_hum"
		);
	}
}
