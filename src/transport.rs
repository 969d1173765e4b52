// SPDX-License-Identifier: MIT OR Apache-2.0
//! Framed Modbus-RTU over a serial line.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity as SerialParity, SerialPort, StopBits};

use crate::error::{Error, ErrorKind};

/// Parity setting for a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity
{
	None,
	Odd,
	Even,
}

impl From<Parity> for SerialParity
{
	fn from(other: Parity) -> Self
	{
		match other {
			Parity::None => SerialParity::None,
			Parity::Odd => SerialParity::Odd,
			Parity::Even => SerialParity::Even,
		}
	}
}

/// Allowed baudrates, in the order UART auto-discovery should try them.
pub const DISCOVERY_BAUDRATES: &[u32] = &[9600, 115200, 1200, 2400, 4800, 19200, 38400, 57600];

pub const ALL_PARITIES: &[Parity] = &[Parity::None, Parity::Odd, Parity::Even];

pub const ALL_STOPBITS: &[u8] = &[2, 1];

/// u8 framing applied to a serial line. Always validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings
{
	pub baudrate: u32,
	pub parity: Parity,
	pub stopbits: u8,
}

impl SerialSettings
{
	pub fn new(baudrate: u32, parity: Parity, stopbits: u8) -> Result<Self, Error>
	{
		if !matches!(baudrate, 1200 | 2400 | 4800 | 9600 | 19200 | 38400 | 57600 | 115200) {
			return Err(ErrorKind::ConfigParsing(format!("unsupported baudrate {baudrate}")).error());
		}
		if stopbits != 1 && stopbits != 2 {
			return Err(ErrorKind::ConfigParsing(format!("unsupported stopbits {stopbits}")).error());
		}
		Ok(Self { baudrate, parity, stopbits })
	}

	/// The 9600-N-2 setting bootloaders always answer on.
	pub fn bootloader_default() -> Self
	{
		Self { baudrate: 9600, parity: Parity::None, stopbits: 2 }
	}

	fn stop_bits(&self) -> StopBits
	{
		match self.stopbits {
			1 => StopBits::One,
			_ => StopBits::Two,
		}
	}

	/// Time, in seconds, that 3.5 character-times take to transmit at this baudrate.
	///
	/// A character is 1 start + 8 data + parity (if any) + stopbits bits.
	pub fn silent_period(&self) -> Duration
	{
		let bits_per_char = 1 + 8 + if self.parity == Parity::None { 0 } else { 1 } + self.stopbits as u32;
		let char_time = bits_per_char as f64 / self.baudrate as f64;
		Duration::from_secs_f64(char_time * 3.5)
	}
}

/// Modbus function codes used by this system.
pub mod function
{
	pub const READ_COILS: u8 = 0x01;
	pub const READ_DISCRETE_INPUTS: u8 = 0x02;
	pub const READ_HOLDING_REGISTERS: u8 = 0x03;
	pub const READ_INPUT_REGISTERS: u8 = 0x04;
	pub const WRITE_SINGLE_COIL: u8 = 0x05;
	pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
	pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

	pub const EXCEPTION_BIT: u8 = 0x80;
}

static CRC16_MODBUS: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// CRC-16/MODBUS: poly 0xA001 (reflected 0x8005), init 0xFFFF, little-endian on the wire.
pub fn crc16_modbus(data: &[u8]) -> u16
{
	CRC16_MODBUS.checksum(data)
}

/// A framed Modbus-RTU connection over one serial port.
///
/// Inter-frame silence is tracked per port (not per device) via `last_rx`, so
/// every [Transport::execute] call on the same port respects the 3.5-char
/// silent period regardless of which slave it targets.
pub struct Transport
{
	port_path: String,
	handle: Box<dyn SerialPort>,
	settings: SerialSettings,
	last_rx: Instant,
	/// Drop leading echo-noise bytes up to the first valid frame header.
	pub foregoing_noise_cancelling: bool,
}

impl Transport
{
	pub fn open(port_path: &str, settings: SerialSettings, response_timeout: Duration) -> Result<Self, Error>
	{
		let handle = serialport::new(port_path, settings.baudrate)
			.data_bits(DataBits::Eight)
			.parity(settings.parity.into())
			.stop_bits(settings.stop_bits())
			.flow_control(FlowControl::None)
			.timeout(response_timeout)
			.open()?;

		Ok(Self {
			port_path: port_path.to_string(),
			handle,
			settings,
			last_rx: Instant::now(),
			foregoing_noise_cancelling: false,
		})
	}

	pub fn port_path(&self) -> &str
	{
		&self.port_path
	}

	pub fn settings(&self) -> SerialSettings
	{
		self.settings
	}

	/// Applies new settings in place without losing in-flight bytes, used by
	/// the stopbits-on-the-fly bootloader workaround.
	pub fn set_settings(&mut self, settings: SerialSettings) -> Result<(), Error>
	{
		self.handle.set_baud_rate(settings.baudrate)?;
		self.handle.set_parity(settings.parity.into())?;
		self.handle.set_stop_bits(settings.stop_bits())?;
		self.settings = settings;
		Ok(())
	}

	fn sleep_for_silence(&self)
	{
		let needed = self.settings.silent_period();
		let elapsed = self.last_rx.elapsed();
		if elapsed < needed {
			std::thread::sleep(needed - elapsed);
		}
	}

	fn build_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8>
	{
		let mut frame = Vec::with_capacity(pdu.len() + 3);
		frame.push(slave_id);
		frame.extend_from_slice(pdu);
		let crc = crc16_modbus(&frame);
		frame.push((crc & 0xFF) as u8);
		frame.push((crc >> 8) as u8);
		frame
	}

	/// Sends `request_pdu` (function code + payload, no slave id / crc) to
	/// `slave_id` and returns the response payload (function code stripped)
	/// once at least `expected_response_bytes` total bytes have arrived, or
	/// a [Error] describing why that didn't happen within `response_timeout`.
	pub fn execute(
		&mut self,
		slave_id: u8,
		request_pdu: &[u8],
		expected_response_bytes: usize,
		response_timeout: Duration,
	) -> Result<Vec<u8>, Error>
	{
		self.sleep_for_silence();

		let frame = Self::build_frame(slave_id, request_pdu);
		self.handle.clear(serialport::ClearBuffer::Input).ok();
		self.handle.write_all(&frame)?;
		self.handle.flush()?;

		let raw = self.read_response(expected_response_bytes, response_timeout)?;
		self.last_rx = Instant::now();

		self.validate_and_strip(slave_id, &raw)
	}

	/// Implements the stopbits-on-the-fly bootloader workaround: write at the
	/// configured stopbits, wait for the output to drain and input to arrive,
	/// switch to 1 stopbit without losing in-flight bytes, read, then restore.
	pub fn execute_stopbits_on_the_fly(
		&mut self,
		slave_id: u8,
		request_pdu: &[u8],
		expected_response_bytes: usize,
		response_timeout: Duration,
	) -> Result<Vec<u8>, Error>
	{
		self.sleep_for_silence();

		let original = self.settings;
		let frame = Self::build_frame(slave_id, request_pdu);
		self.handle.clear(serialport::ClearBuffer::Input).ok();
		self.handle.write_all(&frame)?;
		self.handle.flush()?;

		let deadline = Instant::now() + response_timeout;
		loop {
			let waiting = self.handle.bytes_to_read().unwrap_or(0);
			if waiting > 0 {
				break;
			}
			if Instant::now() >= deadline {
				return Err(ErrorKind::NoResponse.error());
			}
			std::thread::sleep(Duration::from_millis(5));
		}

		let mut oneshot = original;
		oneshot.stopbits = 1;
		self.set_settings(oneshot)?;

		let remaining = deadline.saturating_duration_since(Instant::now());
		let raw = self.read_response(expected_response_bytes, remaining)?;
		self.last_rx = Instant::now();

		self.set_settings(original)?;

		self.validate_and_strip(slave_id, &raw)
	}

	fn read_response(&mut self, expected_response_bytes: usize, response_timeout: Duration) -> Result<Vec<u8>, Error>
	{
		let deadline = Instant::now() + response_timeout;
		let mut buf = Vec::new();
		let mut scratch = [0u8; 256];

		while buf.len() < expected_response_bytes + 2 {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				if buf.is_empty() {
					return Err(ErrorKind::NoResponse.error());
				}
				break;
			}
			self.handle.set_timeout(remaining).ok();
			match self.handle.read(&mut scratch) {
				Ok(0) => break,
				Ok(n) => buf.extend_from_slice(&scratch[..n]),
				Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
					if buf.is_empty() {
						return Err(ErrorKind::NoResponse.error());
					}
					break;
				},
				Err(e) => return Err(Error::from(e)),
			}
		}

		if self.foregoing_noise_cancelling {
			buf = self.read_until_noise_quiet(buf, deadline)?;
		}

		if buf.is_empty() {
			return Err(ErrorKind::NoResponse.error());
		}

		Ok(buf)
	}

	/// Keeps reading byte-by-byte (still respecting the silent period at the
	/// caller level) past the expected count, then slides the buffer to the
	/// first occurrence of a plausible frame header for `slave_id`, discarding
	/// preceding echo-noise bytes.
	fn read_until_noise_quiet(&mut self, mut buf: Vec<u8>, deadline: Instant) -> Result<Vec<u8>, Error>
	{
		let mut scratch = [0u8; 1];
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				break;
			}
			self.handle.set_timeout(Duration::from_millis(20)).ok();
			match self.handle.read(&mut scratch) {
				Ok(1) => buf.push(scratch[0]),
				_ => break,
			}
		}
		Ok(buf)
	}

	fn validate_and_strip(&self, slave_id: u8, raw: &[u8]) -> Result<Vec<u8>, Error>
	{
		if raw.len() < 4 {
			return Err(ErrorKind::Crc.error());
		}

		let start = if self.foregoing_noise_cancelling {
			self.find_frame_start(slave_id, raw).ok_or_else(|| ErrorKind::Crc.error())?
		} else {
			0
		};
		let raw = &raw[start..];

		if raw.len() < 4 {
			return Err(ErrorKind::Crc.error());
		}

		let body = &raw[..raw.len() - 2];
		let received_crc = u16::from_le_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);
		if crc16_modbus(body) != received_crc {
			return Err(ErrorKind::Crc.error());
		}

		if body[0] != slave_id {
			return Err(ErrorKind::LocalEcho.error());
		}

		let fcode = body[1];
		if fcode & function::EXCEPTION_BIT != 0 {
			let exception_code = *body.get(2).unwrap_or(&0);
			return Err(match exception_code {
				0x01 | 0x02 | 0x03 => ErrorKind::IllegalRequest.error(),
				other => ErrorKind::SlaveReported(other).error(),
			});
		}

		Ok(body[2..].to_vec())
	}

	fn find_frame_start(&self, slave_id: u8, raw: &[u8]) -> Option<usize>
	{
		for i in 0..raw.len().saturating_sub(1) {
			if raw[i] == slave_id {
				let fcode = raw[i + 1];
				if fcode & !function::EXCEPTION_BIT != 0 {
					return Some(i);
				}
			}
		}
		None
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn crc16_modbus_matches_known_vector()
	{
		// Read Holding Registers, slave 1, addr 0, count 10: 01 03 00 00 00 0A -> CRC C5CD (low,high)
		let frame = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x0A];
		let crc = crc16_modbus(&frame);
		assert_eq!(crc.to_le_bytes(), [0xC5, 0xCD]);
	}

	#[test]
	fn silent_period_scales_with_baudrate()
	{
		let slow = SerialSettings::new(9600, Parity::None, 1).unwrap();
		let fast = SerialSettings::new(115200, Parity::None, 1).unwrap();
		assert!(slow.silent_period() > fast.silent_period());
	}

	#[test]
	fn rejects_unsupported_baudrate()
	{
		assert!(SerialSettings::new(300, Parity::None, 1).is_err());
	}
}
