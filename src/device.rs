// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wiren-Board-specific semantics layered on [crate::instrument::Instrument].

use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::instrument::Instrument;
use crate::transport::{Parity, SerialSettings, Transport, ALL_PARITIES, ALL_STOPBITS, DISCOVERY_BAUDRATES};

/// The fixed common-register map shared by all Wiren Board Modbus devices.
pub mod reg
{
	pub const UPTIME: u16 = 104;
	pub const BAUDRATE: u16 = 110;
	pub const PARITY: u16 = 111;
	pub const STOPBITS: u16 = 112;
	pub const REBOOT: u16 = 120;
	pub const V_IN: u16 = 121;
	pub const SLAVE_ID: u16 = 128;
	pub const REBOOT_TO_BOOTLOADER: u16 = 129;
	pub const DEVICE_SIGNATURE: u16 = 200;
	pub const FW_VERSION: u16 = 250;
	pub const SERIAL_NUMBER: u16 = 270;
	pub const FW_SIGNATURE: u16 = 290;
	pub const BOOTLOADER_VERSION: u16 = 330;
}

pub const DEVICE_SIGNATURE_LEN: u16 = 6;
pub const FW_VERSION_LEN: u16 = 16;
pub const FW_SIGNATURE_LEN: u16 = 12;
pub const BOOTLOADER_VERSION_LEN: u16 = 8;

/// The probe used during bootloader detection: a deliberately-invalid write
/// of 16 zero registers to the INFO block address.
const BOOTLOADER_PROBE_REG: u16 = 0x1000;
const BOOTLOADER_PROBE_LEN: usize = 16;

/// Roughly how long the device refuses normal reads after `reboot_to_bootloader`.
pub const BOOTLOADER_WINDOW: Duration = Duration::from_secs(120);

/// A logical addressable peripheral: a port, a slave id, and the Instrument
/// that currently owns that port's Transport.
pub struct Device
{
	instrument: Instrument,
}

impl Device
{
	pub fn new(port_path: &str, slave_id: u8, settings: SerialSettings, response_timeout: Duration) -> Result<Self, Error>
	{
		let transport = Transport::open(port_path, settings, response_timeout)?;
		Ok(Self { instrument: Instrument::new(transport, slave_id, response_timeout) })
	}

	pub fn from_instrument(instrument: Instrument) -> Self
	{
		Self { instrument }
	}

	pub fn instrument(&mut self) -> &mut Instrument
	{
		&mut self.instrument
	}

	pub fn slave_id(&self) -> u8
	{
		self.instrument.slave_id
	}

	pub fn port_path(&self) -> &str
	{
		self.instrument.port_path()
	}

	pub fn settings(&self) -> SerialSettings
	{
		self.instrument.settings()
	}

	pub fn response_timeout(&self) -> Duration
	{
		self.instrument.response_timeout
	}

	pub fn uptime(&mut self) -> Result<u32, Error>
	{
		self.instrument.read_u32_be(reg::UPTIME, false)
	}

	pub fn v_in(&mut self) -> Result<u16, Error>
	{
		self.instrument.read_u16(reg::V_IN)
	}

	pub fn device_signature(&mut self) -> Result<String, Error>
	{
		self.instrument.read_string(reg::DEVICE_SIGNATURE, DEVICE_SIGNATURE_LEN)
	}

	pub fn fw_version(&mut self) -> Result<String, Error>
	{
		self.instrument.read_string(reg::FW_VERSION, FW_VERSION_LEN)
	}

	pub fn fw_signature(&mut self) -> Result<String, Error>
	{
		self.instrument.read_string(reg::FW_SIGNATURE, FW_SIGNATURE_LEN)
	}

	pub fn bootloader_version(&mut self) -> Result<String, Error>
	{
		self.instrument.read_string(reg::BOOTLOADER_VERSION, BOOTLOADER_VERSION_LEN)
	}

	/// Reads serial_number, accounting for the WB-MAP dialect: if
	/// `device_signature` matches `*MAP\d+*`, two input registers are decoded
	/// as `((inputs[0] & 0xFF) << 16) | inputs[1]`; otherwise it's a plain
	/// big-endian u32 holding.
	pub fn serial_number(&mut self) -> Result<u32, Error>
	{
		let signature = self.device_signature()?;
		if is_wb_map_signature(&signature) {
			let inputs = self.instrument.read_inputs(reg::SERIAL_NUMBER, 2)?;
			Ok(((inputs[0] as u32 & 0xFF) << 16) | inputs[1] as u32)
		} else {
			self.instrument.read_u32_be(reg::SERIAL_NUMBER, false)
		}
	}

	pub fn set_slave_addr(&mut self, new_id: u8) -> Result<(), Error>
	{
		self.instrument.write_u16(reg::SLAVE_ID, new_id as u16)?;
		self.instrument.slave_id = new_id;
		Ok(())
	}

	pub fn set_baudrate(&mut self, baudrate: u32) -> Result<(), Error>
	{
		self.instrument.write_u16(reg::BAUDRATE, (baudrate / 100) as u16)
	}

	pub fn set_parity(&mut self, parity: Parity) -> Result<(), Error>
	{
		let code = match parity {
			Parity::None => 0,
			Parity::Odd => 1,
			Parity::Even => 2,
		};
		self.instrument.write_u16(reg::PARITY, code)
	}

	pub fn set_stopbits(&mut self, stopbits: u8) -> Result<(), Error>
	{
		self.instrument.write_u16(reg::STOPBITS, stopbits as u16)
	}

	pub fn reboot(&mut self) -> Result<(), Error>
	{
		// The device reboots without replying; a no-response here is expected, not an error.
		match self.instrument.write_u16(reg::REBOOT, 1) {
			Ok(()) | Err(Error { kind: ErrorKind::NoResponse, .. }) => Ok(()),
			Err(e) => Err(e),
		}
	}

	/// Writes 1 to `reboot_to_bootloader`. Expects no reply. After the fixed
	/// post-delay, the device must refuse a normal slave-id read for the
	/// bootloader window; if it still answers, it has no bootloader at all.
	pub fn reboot_to_bootloader(&mut self) -> Result<(), Error>
	{
		match self.instrument.write_u16(reg::REBOOT_TO_BOOTLOADER, 1) {
			Ok(()) | Err(Error { kind: ErrorKind::NoResponse, .. }) => {},
			Err(e) => return Err(e),
		}
		std::thread::sleep(Duration::from_millis(500));

		if self.instrument.read_u16(reg::SLAVE_ID).is_ok() {
			return Err(ErrorKind::TooOldDevice.error());
		}

		Ok(())
	}

	/// Tries a slave-id read; if it answers, the device is not in bootloader.
	/// Otherwise switches to 9600-N-2 and sends a deliberately-invalid
	/// INFO-block write; a Modbus exception 04 in response confirms the
	/// bootloader is present and listening.
	pub fn is_in_bootloader(&mut self) -> Result<bool, Error>
	{
		if self.instrument.read_u16(reg::SLAVE_ID).is_ok() {
			return Ok(false);
		}

		let original = self.instrument.settings();
		self.instrument.set_settings(SerialSettings::bootloader_default())?;

		let probe = vec![0u16; BOOTLOADER_PROBE_LEN];
		let result = self.instrument.write_block(BOOTLOADER_PROBE_REG, &probe);

		self.instrument.set_settings(original)?;

		match result {
			Err(Error { kind: ErrorKind::SlaveReported(0x04), .. }) => Ok(true),
			_ => Ok(false),
		}
	}

	/// Tries the Cartesian product of allowed `{baudrate, parity, stopbits}`
	/// in the preferred discovery order, executing a cheap probe (slave-id
	/// read) at each. The first setting that answers wins and the Instrument
	/// is left on that setting.
	pub fn discover_uart_settings(&mut self) -> Result<SerialSettings, Error>
	{
		for &baudrate in DISCOVERY_BAUDRATES {
			for &parity in ALL_PARITIES {
				for &stopbits in ALL_STOPBITS {
					let candidate = match SerialSettings::new(baudrate, parity, stopbits) {
						Ok(s) => s,
						Err(_) => continue,
					};
					if self.instrument.set_settings(candidate).is_err() {
						continue;
					}

					if self.instrument.read_u16(reg::SLAVE_ID).is_ok() {
						return Ok(candidate);
					}
				}
			}
		}

		Err(ErrorKind::UartSettingsNotFound.error())
	}

	/// Runs the full is-WB-device identity check from the device's current
	/// register state, per the four-step sequence: serial number (may
	/// disconnect), fw_signature (illegal request -> too old), then
	/// device_signature/fw_version/uptime (any modbus exception -> foreign).
	pub fn identity_check(&mut self) -> Result<IdentityInfo, Error>
	{
		self.serial_number()
			.map_err(|e| if matches!(e.kind, ErrorKind::NoResponse) { e } else { ErrorKind::ForeignDevice.error_from(e) })?;

		let fw_signature = match self.fw_signature() {
			Ok(sig) => sig,
			Err(Error { kind: ErrorKind::IllegalRequest, .. }) => return Err(ErrorKind::TooOldDevice.error()),
			Err(e) => return Err(ErrorKind::ForeignDevice.error_from(e)),
		};

		let device_signature = self.device_signature().map_err(|e| ErrorKind::ForeignDevice.error_from(e))?;
		let fw_version = self.fw_version().map_err(|e| ErrorKind::ForeignDevice.error_from(e))?;
		let uptime = self.uptime().map_err(|e| ErrorKind::ForeignDevice.error_from(e))?;

		Ok(IdentityInfo { device_signature, fw_version, fw_signature, uptime })
	}
}

#[derive(Debug, Clone)]
pub struct IdentityInfo
{
	pub device_signature: String,
	pub fw_version: String,
	pub fw_signature: String,
	pub uptime: u32,
}

fn is_wb_map_signature(signature: &str) -> bool
{
	let upper = signature.to_ascii_uppercase();
	if let Some(pos) = upper.find("MAP") {
		upper[pos + 3..].chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
	} else {
		false
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn wb_map_signature_detected()
	{
		assert!(is_wb_map_signature("WBMAP12E"));
		assert!(is_wb_map_signature("wbmap3h"));
		assert!(!is_wb_map_signature("WBMR6C"));
		assert!(!is_wb_map_signature("MAPLE"));
	}
}
