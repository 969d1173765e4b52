// SPDX-License-Identifier: MIT OR Apache-2.0
//! Classifies each configured device as alive, in bootloader, disconnected,
//! too old to update, or foreign.

use std::time::Duration;

use crate::device::{Device, IdentityInfo};
use crate::driver_config::{DeviceConfig, DriverConfig};
use crate::error::{Error, ErrorKind};
use crate::identity_store::IdentityStore;
use crate::transport::{Parity, SerialSettings};

/// Minimum response timeout floor applied regardless of configuration, so a
/// misconfigured `response_timeout_ms: 0` can't make probing spin forever.
pub const MINIMUM_RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// A device, classified exactly once by the prober.
pub enum ProbeOutcome
{
	Alive { device: Device, identity: IdentityInfo },
	InBootloader { device: Device },
	Disconnected,
	TooOld,
	Foreign,
}

impl ProbeOutcome
{
	pub fn label(&self) -> &'static str
	{
		match self {
			ProbeOutcome::Alive { .. } => "alive",
			ProbeOutcome::InBootloader { .. } => "in_bootloader",
			ProbeOutcome::Disconnected => "disconnected",
			ProbeOutcome::TooOld => "too_old_to_update",
			ProbeOutcome::Foreign => "foreign",
		}
	}
}

/// A single resolved (port, device) pair with its computed timeout, ready to
/// be probed.
pub struct ProbeTarget
{
	pub port_path: String,
	pub device_name: String,
	pub slave_id: u8,
	pub settings: SerialSettings,
	pub response_timeout: Duration,
	pub foregoing_noise_cancelling: bool,
}

/// Flattens the enabled ports/devices of a [DriverConfig] into a list of
/// [ProbeTarget]s, applying the per-port/per-device/global-floor timeout
/// resolution rule and skipping devices whose slave id failed to parse.
pub fn resolve_targets(config: &DriverConfig, minimal_response_timeout: Duration) -> Result<Vec<ProbeTarget>, Error>
{
	let mut targets = Vec::new();

	for port in &config.ports {
		if !port.enabled {
			continue;
		}

		let port_timeout = port.response_timeout_ms.map(Duration::from_millis);
		let parity = crate::driver_config::parity_from_str(&port.parity).unwrap_or(Parity::None);
		let settings = SerialSettings::new(port.baud_rate, parity, port.stop_bits)?;

		for raw in &port.devices {
			let device: DeviceConfig = DeviceConfig::from(clone_raw(raw));
			if !device.enabled {
				continue;
			}
			let Some(slave_id) = device.slave_id else {
				log::warn!("device {} on {} has a non-integer slave id, skipping as non-WB", device.device_type, port.path);
				continue;
			};

			let device_timeout = device.response_timeout_ms.map(Duration::from_millis);
			let response_timeout = [port_timeout, device_timeout, Some(minimal_response_timeout)]
				.into_iter()
				.flatten()
				.max()
				.unwrap_or(minimal_response_timeout)
				.max(MINIMUM_RESPONSE_TIMEOUT);

			targets.push(ProbeTarget {
				port_path: port.path.clone(),
				device_name: device.device_type.clone(),
				slave_id,
				settings,
				response_timeout,
				foregoing_noise_cancelling: port.foregoing_noise_cancelling,
			});
		}
	}

	Ok(targets)
}

fn clone_raw(raw: &crate::driver_config::RawDeviceConfig) -> crate::driver_config::RawDeviceConfig
{
	crate::driver_config::RawDeviceConfig {
		device_type: raw.device_type.clone(),
		slave_id: raw.slave_id.clone(),
		response_timeout_ms: raw.response_timeout_ms,
		enabled: raw.enabled,
	}
}

/// Probes one target and buckets the result per §4.7:
/// - `ForeignDeviceError` -> foreign
/// - no response at configured settings, but a bootloader answers (at the
///   configured settings or 9600-N-2) -> in_bootloader
/// - no response and no bootloader answer -> disconnected
/// - success but too-old on fw_signature -> too_old_to_update
/// - otherwise -> alive, and the caller should persist `(port, slave_id, fw_signature)`.
pub fn probe_device(target: &ProbeTarget) -> Result<ProbeOutcome, Error>
{
	let mut device = Device::new(&target.port_path, target.slave_id, target.settings, target.response_timeout)?;
	device.instrument().set_foregoing_noise_cancelling(target.foregoing_noise_cancelling);

	match device.identity_check() {
		Ok(identity) => Ok(ProbeOutcome::Alive { device, identity }),
		Err(Error { kind: ErrorKind::ForeignDevice, .. }) => Ok(ProbeOutcome::Foreign),
		Err(Error { kind: ErrorKind::TooOldDevice, .. }) => Ok(ProbeOutcome::TooOld),
		Err(Error { kind: ErrorKind::NoResponse, .. }) => probe_for_bootloader(device),
		Err(e) => Err(e),
	}
}

fn probe_for_bootloader(mut device: Device) -> Result<ProbeOutcome, Error>
{
	match device.is_in_bootloader() {
		Ok(true) => Ok(ProbeOutcome::InBootloader { device }),
		Ok(false) => Ok(ProbeOutcome::Disconnected),
		Err(_) => Ok(ProbeOutcome::Disconnected),
	}
}

/// Probes every resolved target in configuration order (deterministic for
/// bulk operations) and persists alive devices' signatures to `identity_store`.
pub fn probe_all_devices(targets: &[ProbeTarget], identity_store: &mut IdentityStore) -> Vec<(String, ProbeOutcome)>
{
	let mut results = Vec::with_capacity(targets.len());

	for target in targets {
		log::info!("probing {} ({}, {})", target.device_name, target.slave_id, target.port_path);
		match probe_device(target) {
			Ok(outcome) => {
				if let ProbeOutcome::Alive { identity, .. } = &outcome {
					identity_store.save(target.slave_id, &target.port_path, &identity.fw_signature);
				}
				log::info!("{} ({}, {}) classified as {}", target.device_name, target.slave_id, target.port_path, outcome.label());
				results.push((target.device_name.clone(), outcome));
			},
			Err(e) => {
				log::error!("unexpected error probing {} ({}, {}): {}", target.device_name, target.slave_id, target.port_path, e);
				results.push((target.device_name.clone(), ProbeOutcome::Disconnected));
			},
		}
	}

	results
}
