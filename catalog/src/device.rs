use core::fmt;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

/// The opaque credential a device presents on every request. Compared in
/// constant time (spec.md §4.1: "MUST be constant-time comparison on the
/// key"), so timing cannot be used to narrow down a guess.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
	pub fn new(key: impl Into<String>) -> Self {
		Self(key.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Generates a fresh 32-byte key, hex-encoded. Used at registration and
	/// on rotation.
	pub fn generate() -> Self {
		use rand::RngCore;
		let mut bytes = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut bytes);
		let hex = bytes.iter().fold(String::with_capacity(64), |mut s, b| {
			use std::fmt::Write;
			let _ = write!(s, "{b:02x}");
			s
		});
		Self(hex)
	}
}

impl fmt::Debug for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ApiKey(..)")
	}
}

impl PartialEq for ApiKey {
	fn eq(&self, other: &Self) -> bool {
		self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
	}
}

impl Eq for ApiKey {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
	Active,
	Inactive,
	Maintenance,
}

impl DeviceStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Active => "active",
			Self::Inactive => "inactive",
			Self::Maintenance => "maintenance",
		}
	}
}

impl fmt::Display for DeviceStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl TryFrom<&str> for DeviceStatus {
	type Error = ();

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		match value.to_ascii_lowercase().as_str() {
			"active" => Ok(Self::Active),
			"inactive" => Ok(Self::Inactive),
			"maintenance" => Ok(Self::Maintenance),
			_ => Err(()),
		}
	}
}

/// A registered telemetry producer. Owned exclusively by the metadata
/// store (spec.md §3 Ownership) — the rest of the system only ever holds
/// a cloned snapshot.
#[derive(Clone, Debug)]
pub struct Device {
	pub id: i64,
	pub name: String,
	pub api_key: ApiKey,
	pub device_type: String,
	pub status: DeviceStatus,
	pub firmware: Option<String>,
	pub hardware: Option<String>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
	pub last_seen: Option<OffsetDateTime>,
}

impl Device {
	pub fn is_active(&self) -> bool {
		self.status == DeviceStatus::Active
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn api_key_equality_ignores_length_timing_shortcuts() {
		let a = ApiKey::new("abcdef0123456789");
		let b = ApiKey::new("abcdef0123456789");
		let c = ApiKey::new("000000");
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn device_status_round_trips_through_str() {
		for status in [
			DeviceStatus::Active,
			DeviceStatus::Inactive,
			DeviceStatus::Maintenance,
		] {
			let parsed = DeviceStatus::try_from(status.as_str()).unwrap();
			assert_eq!(parsed, status);
		}
		assert!(DeviceStatus::try_from("bogus").is_err());
	}

	#[test]
	fn generated_keys_are_64_hex_characters() {
		let key = ApiKey::generate();
		assert_eq!(key.as_str().len(), 64);
		assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
	}
}
