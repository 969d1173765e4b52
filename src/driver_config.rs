// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parsing of the external driver configuration JSON that lists which ports
//! and devices `update-all`/`recover-all` should scan.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, ErrorKind};
use crate::transport::Parity;

#[derive(Debug, Deserialize)]
pub struct DriverConfig
{
	pub ports: Vec<PortConfig>,
}

#[derive(Debug, Deserialize)]
pub struct PortConfig
{
	pub path: String,
	pub baud_rate: u32,
	#[serde(default = "default_parity")]
	pub parity: String,
	#[serde(default = "default_stop_bits")]
	pub stop_bits: u8,
	pub response_timeout_ms: Option<u64>,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default)]
	pub devices: Vec<RawDeviceConfig>,
	#[serde(default)]
	pub foregoing_noise_cancelling: bool,
}

fn default_parity() -> String
{
	"N".to_string()
}

fn default_stop_bits() -> u8
{
	2
}

fn default_true() -> bool
{
	true
}

#[derive(Debug, Deserialize)]
pub struct RawDeviceConfig
{
	pub device_type: String,
	#[serde(deserialize_with = "slave_id_from_string_or_int")]
	pub slave_id: String,
	pub response_timeout_ms: Option<u64>,
	#[serde(default = "default_true")]
	pub enabled: bool,
}

fn slave_id_from_string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: serde::Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum StringOrInt
	{
		String(String),
		Int(i64),
	}

	match StringOrInt::deserialize(deserializer)? {
		StringOrInt::String(s) => Ok(s),
		StringOrInt::Int(i) => Ok(i.to_string()),
	}
}

/// A device entry resolved from [RawDeviceConfig]: `device_type` rewritten
/// from the `WBIO-` prefix to `WB-MIO` (with the slave id truncated at the
/// first `:`), and `slave_id` parsed to an integer — or flagged `non_wb` if
/// parsing fails.
#[derive(Debug, Clone)]
pub struct DeviceConfig
{
	pub device_type: String,
	pub slave_id: Option<u8>,
	pub response_timeout_ms: Option<u64>,
	pub enabled: bool,
}

impl From<RawDeviceConfig> for DeviceConfig
{
	fn from(raw: RawDeviceConfig) -> Self
	{
		let device_type = if let Some(rest) = raw.device_type.strip_prefix("WBIO-") {
			format!("WB-MIO{}", rest)
		} else {
			raw.device_type
		};

		let slave_id_str = raw.slave_id.split(':').next().unwrap_or(&raw.slave_id);
		let slave_id = slave_id_str.trim().parse::<u8>().ok();

		Self { device_type, slave_id, response_timeout_ms: raw.response_timeout_ms, enabled: raw.enabled }
	}
}

pub fn load(path: impl AsRef<Path>) -> Result<DriverConfig, Error>
{
	let path = path.as_ref();
	let bytes = std::fs::read(path)?;
	serde_json::from_slice(&bytes).map_err(|e| ErrorKind::ConfigParsing(format!("{}: {}", path.display(), e)).error())
}

pub fn parity_from_str(s: &str) -> Result<Parity, Error>
{
	match s.to_ascii_uppercase().as_str() {
		"N" => Ok(Parity::None),
		"O" => Ok(Parity::Odd),
		"E" => Ok(Parity::Even),
		other => Err(ErrorKind::ConfigParsing(format!("unknown parity {other:?}")).error()),
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn wbio_device_type_is_rewritten_to_wb_mio()
	{
		let raw = RawDeviceConfig {
			device_type: "WBIO-DI-16".to_string(),
			slave_id: "12".to_string(),
			response_timeout_ms: None,
			enabled: true,
		};
		let config = DeviceConfig::from(raw);
		assert_eq!(config.device_type, "WB-MIO-DI-16");
	}

	#[test]
	fn slave_id_truncated_at_first_colon()
	{
		let raw = RawDeviceConfig {
			device_type: "WB-MRWL3".to_string(),
			slave_id: "15:ch1".to_string(),
			response_timeout_ms: None,
			enabled: true,
		};
		let config = DeviceConfig::from(raw);
		assert_eq!(config.slave_id, Some(15));
	}

	#[test]
	fn unparseable_slave_id_flags_non_wb()
	{
		let raw = RawDeviceConfig {
			device_type: "WB-MR6C".to_string(),
			slave_id: "not-a-number".to_string(),
			response_timeout_ms: None,
			enabled: true,
		};
		let config = DeviceConfig::from(raw);
		assert_eq!(config.slave_id, None);
	}
}
