//! The narrow Metadata Store Adapter boundary described by spec.md §4.1:
//! lookup by id, lookup by API key, coalesced last-seen touch, and a list
//! of active devices. Backed by SQLite (`rusqlite`, bundled), the way
//! `mozilla-application-services`'s `logins`/`places` components keep a
//! local relational store, with blocking calls pushed through
//! `spawn_blocking` per the teacher's async-everywhere style.

use crate::device::{ApiKey, Device, DeviceStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::{
	collections::HashMap,
	fmt,
	path::Path,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};
use time::OffsetDateTime;

const COALESCE_WINDOW: Duration = Duration::from_secs(1);
const LAST_SEEN_STRIPES: usize = 16;

/// Whether a failure is worth retrying (spec.md §4.1: "all operations may
/// return TransientError ... NotFound is terminal").
#[derive(Debug, Clone)]
pub enum StoreError {
	NotFound,
	Transient(String),
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NotFound => write!(f, "device not found"),
			Self::Transient(detail) => write!(f, "transient metadata store error: {detail}"),
		}
	}
}

impl std::error::Error for StoreError {}

impl StoreError {
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transient(_))
	}
}

#[derive(Debug)]
pub struct SqliteMetadataStore {
	connection: Arc<Mutex<Connection>>,
	/// Per-device timestamp of the last durable `touch_last_seen` write,
	/// striped to avoid a single global lock. Used purely to coalesce —
	/// it is not a cache of device state.
	last_write: Vec<Mutex<HashMap<i64, Instant>>>,
}

impl SqliteMetadataStore {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let connection =
			Connection::open(path).map_err(|e| StoreError::Transient(e.to_string()))?;
		connection
			.execute_batch(
				r#"
CREATE TABLE IF NOT EXISTS devices (
	id          INTEGER PRIMARY KEY AUTOINCREMENT,
	name        TEXT NOT NULL UNIQUE,
	api_key     TEXT NOT NULL,
	device_type TEXT NOT NULL,
	status      TEXT NOT NULL DEFAULT 'active',
	firmware    TEXT,
	hardware    TEXT,
	created_at  TEXT NOT NULL,
	updated_at  TEXT NOT NULL,
	last_seen   TEXT
);
CREATE INDEX IF NOT EXISTS devices_api_key_idx ON devices(api_key);
"#,
			)
			.map_err(|e| StoreError::Transient(e.to_string()))?;

		Ok(Self {
			connection: Arc::new(Mutex::new(connection)),
			last_write: (0..LAST_SEEN_STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
		})
	}

	pub fn open_in_memory() -> Result<Self, StoreError> {
		let connection =
			Connection::open_in_memory().map_err(|e| StoreError::Transient(e.to_string()))?;
		connection
			.execute_batch(
				r#"
CREATE TABLE devices (
	id          INTEGER PRIMARY KEY AUTOINCREMENT,
	name        TEXT NOT NULL UNIQUE,
	api_key     TEXT NOT NULL,
	device_type TEXT NOT NULL,
	status      TEXT NOT NULL DEFAULT 'active',
	firmware    TEXT,
	hardware    TEXT,
	created_at  TEXT NOT NULL,
	updated_at  TEXT NOT NULL,
	last_seen   TEXT
);
CREATE INDEX devices_api_key_idx ON devices(api_key);
"#,
			)
			.map_err(|e| StoreError::Transient(e.to_string()))?;

		Ok(Self {
			connection: Arc::new(Mutex::new(connection)),
			last_write: (0..LAST_SEEN_STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
		})
	}

	pub async fn register(
		&self,
		name: &str,
		device_type: &str,
	) -> Result<Device, StoreError> {
		let connection = Arc::clone(&self.connection);
		let name = name.to_string();
		let device_type = device_type.to_string();
		let api_key = ApiKey::generate();
		let key_owned = api_key.as_str().to_string();

		let now = OffsetDateTime::now_utc();
		let device = tokio::task::spawn_blocking(move || -> Result<Device, StoreError> {
			let conn = connection.lock().expect("metadata store mutex poisoned");
			let now_str = now
				.format(&time::format_description::well_known::Rfc3339)
				.map_err(|e| StoreError::Transient(e.to_string()))?;

			conn.execute(
				"INSERT INTO devices (name, api_key, device_type, status, created_at, updated_at) VALUES (?1, ?2, ?3, 'active', ?4, ?4)",
				params![name, key_owned, device_type, now_str],
			)
			.map_err(|e| {
				if e.to_string().contains("UNIQUE") {
					StoreError::Transient(format!("device name '{name}' already registered"))
				} else {
					StoreError::Transient(e.to_string())
				}
			})?;

			let id = conn.last_insert_rowid();
			Ok(Device {
				id,
				name,
				api_key: ApiKey::new(key_owned),
				device_type,
				status: DeviceStatus::Active,
				firmware: None,
				hardware: None,
				created_at: now,
				updated_at: now,
				last_seen: None,
			})
		})
		.await
		.map_err(|e| StoreError::Transient(e.to_string()))??;

		Ok(device)
	}

	/// Looks up a device by id.
	pub async fn find_by_id(&self, id: i64) -> Result<Device, StoreError> {
		let connection = Arc::clone(&self.connection);
		tokio::task::spawn_blocking(move || {
			let conn = connection.lock().expect("metadata store mutex poisoned");
			query_one(&conn, "SELECT * FROM devices WHERE id = ?1", params![id])
		})
		.await
		.map_err(|e| StoreError::Transient(e.to_string()))?
	}

	/// Looks up a device by API key. Rows are scanned and compared in
	/// constant time via [`ApiKey`]'s `PartialEq`, rather than letting
	/// SQLite's `=` short-circuit on the raw string.
	pub async fn find_by_api_key(&self, key: &ApiKey) -> Result<Device, StoreError> {
		let connection = Arc::clone(&self.connection);
		let presented = key.clone();
		tokio::task::spawn_blocking(move || {
			let conn = connection.lock().expect("metadata store mutex poisoned");
			let mut stmt = conn
				.prepare("SELECT * FROM devices")
				.map_err(|e| StoreError::Transient(e.to_string()))?;
			let mut rows = stmt
				.query_map([], row_to_device)
				.map_err(|e| StoreError::Transient(e.to_string()))?;

			for row in &mut rows {
				let device = row.map_err(|e| StoreError::Transient(e.to_string()))?;
				if device.api_key == presented {
					return Ok(device);
				}
			}
			Err(StoreError::NotFound)
		})
		.await
		.map_err(|e| StoreError::Transient(e.to_string()))?
	}

	/// Updates last-seen, coalesced to at most one durable write per
	/// device per 1s window (spec.md §4.1). Callers outside the window
	/// get `Ok(())` without touching the database — the ingestion
	/// pipeline's best-effort touch does not need every call to land.
	pub async fn touch_last_seen(&self, id: i64, ts: OffsetDateTime) -> Result<(), StoreError> {
		let stripe = &self.last_write[(id as usize) % self.last_write.len()];
		{
			let mut table = stripe.lock().expect("last-write stripe poisoned");
			let now = Instant::now();
			if let Some(last) = table.get(&id) {
				if now.duration_since(*last) < COALESCE_WINDOW {
					tracing::debug!(device_id = id, "coalescing last-seen write");
					return Ok(());
				}
			}
			table.insert(id, now);
		}

		let connection = Arc::clone(&self.connection);
		tokio::task::spawn_blocking(move || {
			let conn = connection.lock().expect("metadata store mutex poisoned");
			let ts_str = ts
				.format(&time::format_description::well_known::Rfc3339)
				.map_err(|e| StoreError::Transient(e.to_string()))?;
			conn.execute(
				"UPDATE devices SET last_seen = ?1, updated_at = ?1 WHERE id = ?2",
				params![ts_str, id],
			)
			.map_err(|e| StoreError::Transient(e.to_string()))?;
			Ok(())
		})
		.await
		.map_err(|e| StoreError::Transient(e.to_string()))?
	}

	/// Lists every device with `status = active`. Spec.md describes this
	/// as "a stream of Device"; there is no `futures`/`async-stream`
	/// dependency in this workspace, so callers get the full `Vec` —
	/// reconciliation (§4.9) already bounds its per-tick scan budget
	/// independently.
	pub async fn list_active(&self) -> Result<Vec<Device>, StoreError> {
		let connection = Arc::clone(&self.connection);
		tokio::task::spawn_blocking(move || {
			let conn = connection.lock().expect("metadata store mutex poisoned");
			let mut stmt = conn
				.prepare("SELECT * FROM devices WHERE status = 'active'")
				.map_err(|e| StoreError::Transient(e.to_string()))?;
			let rows = stmt
				.query_map([], row_to_device)
				.map_err(|e| StoreError::Transient(e.to_string()))?;

			let mut devices = Vec::new();
			for row in rows {
				devices.push(row.map_err(|e| StoreError::Transient(e.to_string()))?);
			}
			Ok(devices)
		})
		.await
		.map_err(|e| StoreError::Transient(e.to_string()))?
	}

	/// Total device count, regardless of status (Health Aggregator §4.9).
	pub async fn count_all(&self) -> Result<u64, StoreError> {
		let connection = Arc::clone(&self.connection);
		tokio::task::spawn_blocking(move || {
			let conn = connection.lock().expect("metadata store mutex poisoned");
			conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get::<_, i64>(0))
				.map(|n| n as u64)
				.map_err(|e| StoreError::Transient(e.to_string()))
		})
		.await
		.map_err(|e| StoreError::Transient(e.to_string()))?
	}
}

fn query_one(
	conn: &Connection,
	sql: &str,
	params: impl rusqlite::Params,
) -> Result<Device, StoreError> {
	conn.query_row(sql, params, row_to_device)
		.optional()
		.map_err(|e| StoreError::Transient(e.to_string()))?
		.ok_or(StoreError::NotFound)
}

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
	let status_str: String = row.get("status")?;
	let status = DeviceStatus::try_from(status_str.as_str()).unwrap_or(DeviceStatus::Inactive);

	let created_at: String = row.get("created_at")?;
	let updated_at: String = row.get("updated_at")?;
	let last_seen: Option<String> = row.get("last_seen")?;
	let api_key: String = row.get("api_key")?;

	Ok(Device {
		id: row.get("id")?,
		name: row.get("name")?,
		api_key: ApiKey::new(api_key),
		device_type: row.get("device_type")?,
		status,
		firmware: row.get("firmware")?,
		hardware: row.get("hardware")?,
		created_at: parse_rfc3339(&created_at),
		updated_at: parse_rfc3339(&updated_at),
		last_seen: last_seen.as_deref().map(parse_rfc3339),
	})
}

fn parse_rfc3339(value: &str) -> OffsetDateTime {
	OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
		.unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
