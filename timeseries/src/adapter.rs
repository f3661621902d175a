//! The narrow Time-Series Adapter boundary described by spec.md §4.2: create
//! series on demand, append a batch of points atomically, range/latest/count
//! queries, and delete-by-range.

use crate::{
	buffered,
	query::{self, FieldValue, Point, QueryClient, QueryError},
	write::LineBuilder,
};
use std::collections::BTreeMap;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// A single point destined for the store: a device's field value at a
/// timestamp, with its tag set. `series_path` is not stored separately —
/// the measurement/field/tags fully determine where it lands.
#[derive(Clone, Debug)]
pub struct WritePoint {
	pub device_id: i64,
	pub measurement: String,
	pub field: String,
	pub value: FieldValue,
	pub tags: BTreeMap<String, String>,
	/// Milliseconds since the epoch (the wire precision fixed by spec.md §4.2).
	pub timestamp_ms: i64,
}

#[derive(Debug)]
pub struct InfluxAdapter {
	writer: buffered::Client,
	query: QueryClient,
	bucket: String,
	org: String,
	root: String,
}

impl InfluxAdapter {
	pub fn new(writer: buffered::Client, query: QueryClient, bucket: String, org: String, root: String) -> Self {
		Self {
			writer,
			query,
			bucket,
			org,
			root,
		}
	}

	/// No-op: InfluxDB auto-creates series on write (spec.md §4.2).
	pub async fn ensure_series(&self, _device_id: i64, _measurement: &str, _field: &str) {}

	/// Appends a batch of points in one write, so a partial batch never
	/// lands durably (spec.md §4.2 "fails atomically per batch"). The
	/// returned receiver transitions `Buffered` -> `Accepted` once the
	/// buffered writer has durably flushed the batch; callers that need
	/// to know the batch actually landed (the Ingestion Pipeline's
	/// Accepted/StoreUnavailable decision) should await that transition.
	pub async fn append(
		&self,
		points: &[WritePoint],
	) -> Result<tokio::sync::watch::Receiver<crate::write::Status>, buffered::BufferedWriteError> {
		if points.is_empty() {
			let (_, rx) = tokio::sync::watch::channel(crate::write::Status::Accepted);
			return Ok(rx);
		}

		let mut body = bytes::BytesMut::new();
		for point in points {
			let buf = bytes::BytesMut::with_capacity(crate::write::LINE_PROTOCOL_BUFFER_LEN);
			let mut builder = LineBuilder::new_with(buf).measurement(&point.measurement);
			builder = builder.tag("device_id", point.device_id.to_string());
			for (key, value) in &point.tags {
				builder = builder.tag(key, value);
			}
			builder = match &point.value {
				FieldValue::Bool(v) => builder.field(&point.field, *v),
				FieldValue::Int(v) => builder.field(&point.field, *v),
				FieldValue::Float(v) => builder.field(&point.field, *v),
				FieldValue::Text(v) => builder.field(&point.field, v.as_str()),
			};
			let line = builder.timestamp(point.timestamp_ms).close_line().build().freeze();
			body.extend_from_slice(&line);
		}

		self.writer.write_batch(body.freeze()).await
	}

	pub async fn query_range(
		&self,
		device_id: i64,
		start: OffsetDateTime,
		end: OffsetDateTime,
		limit: usize,
	) -> Result<Vec<Point>, QueryError> {
		let flux = format!(
			r#"
from(bucket: "{bucket}")
  |> range(start: {start}, stop: {stop})
  |> filter(fn: (r) => r["device_id"] == "{device_id}")
  |> sort(columns: ["_time"], desc: true)
  |> limit(n: {limit})
"#,
			bucket = self.bucket,
			start = start.format(&Rfc3339).map_err(|e| QueryError::permanent(e.to_string()))?,
			stop = end.format(&Rfc3339).map_err(|e| QueryError::permanent(e.to_string()))?,
			device_id = device_id,
			limit = limit,
		);

		let response = self.query.clone().org(&self.org).query(flux, BTreeMap::new()).await?;
		let body = response.text().await.map_err(|e| QueryError::permanent(e.to_string()))?;
		query::parse_annotated_csv(&body)
	}

	/// Returns the single most recent measurement set for the device, or
	/// `None` if it has never reported telemetry.
	pub async fn query_latest(&self, device_id: i64) -> Result<Option<Vec<Point>>, QueryError> {
		let now = OffsetDateTime::now_utc();
		let window_start = now - time::Duration::days(30);
		let points = self.query_range(device_id, window_start, now, 1).await?;
		if points.is_empty() {
			return Ok(None);
		}
		let latest_ts = points.iter().map(|p| p.timestamp).max().unwrap();
		Ok(Some(
			points.into_iter().filter(|p| p.timestamp == latest_ts).collect(),
		))
	}

	pub async fn count(&self, device_id: i64, start: OffsetDateTime) -> Result<u64, QueryError> {
		let flux = format!(
			r#"
from(bucket: "{bucket}")
  |> range(start: {start})
  |> filter(fn: (r) => r["device_id"] == "{device_id}")
  |> count()
"#,
			bucket = self.bucket,
			start = start.format(&Rfc3339).map_err(|e| QueryError::permanent(e.to_string()))?,
			device_id = device_id,
		);

		let response = self.query.clone().org(&self.org).query(flux, BTreeMap::new()).await?;
		let body = response.text().await.map_err(|e| QueryError::permanent(e.to_string()))?;
		let points = query::parse_annotated_csv(&body)?;
		let total: i64 = points
			.iter()
			.filter_map(|p| match p.value {
				FieldValue::Int(v) => Some(v),
				_ => None,
			})
			.sum();
		Ok(total.max(0) as u64)
	}

	pub async fn delete_range(
		&self,
		device_id: i64,
		start: OffsetDateTime,
		stop: OffsetDateTime,
	) -> Result<(), QueryError> {
		let predicate = format!("device_id=\"{device_id}\"");
		self.query.delete(&self.bucket, &self.org, start, stop, &predicate).await
	}

	/// The canonical series path for a device's field, per spec.md §4.2.
	pub fn series_path(&self, device_id: i64, field: &str) -> String {
		crate::series_path(&self.root, device_id, field)
	}
}
