use std::{borrow::Cow, collections::BTreeMap, fmt, str::from_utf8};

use reqwest::{
	header::{HeaderValue, ACCEPT, CONTENT_TYPE},
	Method, Response, StatusCode, Url,
};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Serialize)]
struct QueryPayload<'a> {
	#[serde(borrow)]
	dialect: Option<Dialect<'a>>,

	#[serde(with = "time::serde::rfc3339")]
	now: OffsetDateTime,

	#[serde(borrow)]
	query: &'a str,

	#[serde(borrow, rename = "type")]
	ty: &'a str,
}

#[derive(Serialize)]
struct Dialect<'a> {
	#[serde(borrow)]
	annotations: &'a [&'a str],

	header: bool,
}

#[derive(Clone, Debug)]
pub struct QueryClient {
	pub(crate) client: reqwest::Client,
	pub(crate) url: Url,
}

impl QueryClient {
	pub fn org<T: AsRef<str>>(mut self, name: T) -> Self {
		self.url.query_pairs_mut().append_pair("org", name.as_ref());
		self
	}

	pub fn org_id<T: AsRef<str>>(mut self, id: T) -> Self {
		self.url
			.query_pairs_mut()
			.append_pair("org_id", id.as_ref());
		self
	}

	/// Issues a raw Flux query, substituting `params.<key>` placeholders in
	/// the query text with the supplied values.
	pub async fn query<'a, T: AsRef<str>, P: Into<BTreeMap<&'a str, &'a str>>>(
		&self,
		flux: T,
		params: P,
	) -> Result<Response, QueryError> {
		let mut query = Cow::Borrowed(flux.as_ref());
		for (k, v) in params.into().into_iter() {
			let search = format!("params.{k}");
			query = Cow::Owned(query.replace(&search, v));
		}

		let payload = QueryPayload {
			dialect: Some(Dialect {
				annotations: &["datatype", "default", "group"],
				header: true,
			}),
			now: OffsetDateTime::now_utc(),
			query: &query,
			ty: "flux",
		};

		let body = serde_json::to_vec(&payload).map_err(|e| QueryError::permanent(e.to_string()))?;
		tracing::trace!("flux query body: {}", from_utf8(&body).unwrap_or("<invalid utf8>"));

		let response = self
			.client
			.request(Method::POST, self.url.clone())
			.header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
			.header(ACCEPT, HeaderValue::from_static("application/csv"))
			.body(body)
			.send()
			.await
			.map_err(|e| QueryError::transient(e.to_string()))?;

		if response.status().is_server_error() {
			return Err(QueryError::transient(format!(
				"time-series store returned {}",
				response.status()
			)));
		}
		if !response.status().is_success() {
			return Err(QueryError::permanent(format!(
				"time-series store returned {}",
				response.status()
			)));
		}

		Ok(response)
	}

	/// Issues a DELETE against the store's predicate-based delete endpoint.
	pub async fn delete(
		&self,
		bucket: &str,
		org: &str,
		start: OffsetDateTime,
		stop: OffsetDateTime,
		predicate: &str,
	) -> Result<(), QueryError> {
		#[derive(Serialize)]
		struct DeletePayload<'a> {
			start: String,
			stop: String,
			predicate: &'a str,
		}

		let mut url = self.url.clone();
		url.set_path("/api/v2/delete");
		url.query_pairs_mut()
			.clear()
			.append_pair("bucket", bucket)
			.append_pair("org", org);

		let payload = DeletePayload {
			start: start
				.format(&time::format_description::well_known::Rfc3339)
				.map_err(|e| QueryError::permanent(e.to_string()))?,
			stop: stop
				.format(&time::format_description::well_known::Rfc3339)
				.map_err(|e| QueryError::permanent(e.to_string()))?,
			predicate,
		};

		let response = self
			.client
			.post(url)
			.json(&payload)
			.send()
			.await
			.map_err(|e| QueryError::transient(e.to_string()))?;

		let status = response.status();
		if status == StatusCode::NO_CONTENT {
			Ok(())
		} else if status.is_server_error() {
			Err(QueryError::transient(format!("delete returned {status}")))
		} else {
			Err(QueryError::permanent(format!("delete returned {status}")))
		}
	}
}

/// A single time-series observation decoded from an annotated-CSV query
/// response: one (timestamp, measurement, field, value) tuple plus its tags.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
	pub timestamp: OffsetDateTime,
	pub measurement: String,
	pub field: String,
	pub value: FieldValue,
	pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
}

impl fmt::Display for FieldValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FieldValue::Bool(v) => write!(f, "{v}"),
			FieldValue::Int(v) => write!(f, "{v}"),
			FieldValue::Float(v) => write!(f, "{v}"),
			FieldValue::Text(v) => write!(f, "{v}"),
		}
	}
}

/// Parses an InfluxDB-style annotated-CSV response (the `#datatype` /
/// `#group` / `#default` comment rows followed by a header and data rows)
/// into [`Point`] values.
///
/// Reserved columns `_time`, `_measurement`, `_field`, `_value` are mapped
/// to the corresponding `Point` field; every other column becomes a tag.
pub fn parse_annotated_csv(body: &str) -> Result<Vec<Point>, QueryError> {
	// Annotation rows (prefixed '#') describe datatypes/grouping; we only
	// need the header row that follows them to know column names.
	let data_section: String = body
		.lines()
		.filter(|line| !line.starts_with('#'))
		.collect::<Vec<_>>()
		.join("\n");

	if data_section.trim().is_empty() {
		return Ok(Vec::new());
	}

	let mut reader = csv::ReaderBuilder::new()
		.has_headers(true)
		.from_reader(data_section.as_bytes());

	let headers = reader
		.headers()
		.map_err(|e| QueryError::permanent(e.to_string()))?
		.clone();

	let mut points = Vec::new();
	for record in reader.records() {
		let record = record.map_err(|e| QueryError::permanent(e.to_string()))?;

		let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
		for (name, value) in headers.iter().zip(record.iter()) {
			fields.insert(name, value);
		}

		let Some(time_str) = fields.get("_time") else {
			continue;
		};
		let Ok(timestamp) =
			OffsetDateTime::parse(time_str, &time::format_description::well_known::Rfc3339)
		else {
			continue;
		};

		let measurement = fields.get("_measurement").unwrap_or(&"").to_string();
		let field = fields.get("_field").unwrap_or(&"").to_string();
		let raw_value = fields.get("_value").copied().unwrap_or_default();

		let value = if let Ok(v) = raw_value.parse::<i64>() {
			FieldValue::Int(v)
		} else if let Ok(v) = raw_value.parse::<f64>() {
			FieldValue::Float(v)
		} else if raw_value.eq_ignore_ascii_case("true") || raw_value.eq_ignore_ascii_case("false") {
			FieldValue::Bool(raw_value.eq_ignore_ascii_case("true"))
		} else {
			FieldValue::Text(raw_value.to_string())
		};

		let tags = fields
			.iter()
			.filter(|(k, _)| !matches!(**k, "_time" | "_measurement" | "_field" | "_value" | "_start" | "_stop" | "result" | "table"))
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();

		points.push(Point {
			timestamp,
			measurement,
			field,
			value,
			tags,
		});
	}

	Ok(points)
}

/// Whether a query/delete failure should be retried (transient) or
/// surfaced immediately (permanent), matching `write::immediate::WriteError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
	Transient,
	Permanent,
}

#[derive(Debug, Clone)]
pub struct QueryError {
	pub kind: QueryErrorKind,
	pub detail: String,
}

impl QueryError {
	fn transient(detail: String) -> Self {
		Self {
			kind: QueryErrorKind::Transient,
			detail,
		}
	}

	fn permanent(detail: String) -> Self {
		Self {
			kind: QueryErrorKind::Permanent,
			detail,
		}
	}

	pub fn is_transient(&self) -> bool {
		self.kind == QueryErrorKind::Transient
	}
}

impl fmt::Display for QueryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}: {}", self.kind, self.detail)
	}
}

impl std::error::Error for QueryError {}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = "#datatype,string,long,dateTime:RFC3339,string,string,double,string,string\n#group,false,false,false,true,true,false,true,true\n#default,mean,,,,,,,\n,result,table,_time,_measurement,_field,_value,device,location\n,,0,2024-01-01T00:00:00Z,telemetry,temperature,22.5,7,lab\n,,0,2024-01-01T00:05:00Z,telemetry,temperature,23.1,7,lab\n";

	#[test]
	fn parses_annotated_csv_into_points() {
		let points = parse_annotated_csv(SAMPLE).unwrap();
		assert_eq!(points.len(), 2);
		assert_eq!(points[0].measurement, "telemetry");
		assert_eq!(points[0].field, "temperature");
		assert_eq!(points[0].value, FieldValue::Float(22.5));
		assert_eq!(points[0].tags.get("device").map(String::as_str), Some("7"));
	}

	#[test]
	fn empty_result_set_parses_to_no_points() {
		let points = parse_annotated_csv("#datatype,string\n#group,false\n#default,\n,result\n").unwrap();
		assert!(points.is_empty());
	}
}
