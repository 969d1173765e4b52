// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed Modbus operations built on [crate::transport::Transport].

use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::transport::{function, SerialSettings, Transport};

/// How many times a failed call is retried before the last error is surfaced.
pub const ALLOWED_UNSUCCESSFUL_TRIES: u32 = 2;

/// A retry policy: bounded tries over an error predicate, re-raising the last
/// error on exhaustion. Expressed as a function rather than a stateful
/// decorator object so every call site can see exactly what it retries on.
fn retry<T>(max_tries: u32, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error>
{
	let mut last_err = None;
	for attempt in 0..=max_tries {
		match op() {
			Ok(value) => return Ok(value),
			Err(e) => {
				if attempt < max_tries {
					log::debug!("modbus call failed (attempt {}/{}): {}", attempt + 1, max_tries + 1, e);
				}
				last_err = Some(e);
			},
		}
	}
	Err(last_err.expect("loop always runs at least once"))
}

/// Per-connection typed Modbus instrument: applies serial settings before
/// every call, wraps the call in the retry policy, and decodes register
/// payloads into Rust types.
pub struct Instrument
{
	transport: Transport,
	pub slave_id: u8,
	pub response_timeout: Duration,
	stopbits_on_the_fly: bool,
}

impl Instrument
{
	pub fn new(transport: Transport, slave_id: u8, response_timeout: Duration) -> Self
	{
		Self { transport, slave_id, response_timeout, stopbits_on_the_fly: false }
	}

	pub fn port_path(&self) -> &str
	{
		self.transport.port_path()
	}

	pub fn settings(&self) -> SerialSettings
	{
		self.transport.settings()
	}

	pub fn set_foregoing_noise_cancelling(&mut self, enabled: bool)
	{
		self.transport.foregoing_noise_cancelling = enabled;
	}

	pub fn set_stopbits_on_the_fly(&mut self, enabled: bool)
	{
		self.stopbits_on_the_fly = enabled;
	}

	/// Changes the line settings. Always goes through the Instrument; callers
	/// must never reach into the underlying Transport directly.
	pub fn set_settings(&mut self, settings: SerialSettings) -> Result<(), Error>
	{
		self.transport.set_settings(settings)
	}

	fn call(&mut self, request_pdu: &[u8], expected_response_bytes: usize, timeout: Duration) -> Result<Vec<u8>, Error>
	{
		// Applying current settings before every call is a cheap no-op when unchanged.
		let settings = self.transport.settings();
		self.transport.set_settings(settings)?;

		if self.stopbits_on_the_fly {
			self.transport.execute_stopbits_on_the_fly(self.slave_id, request_pdu, expected_response_bytes, timeout)
		} else {
			self.transport.execute(self.slave_id, request_pdu, expected_response_bytes, timeout)
		}
	}

	fn call_retried(&mut self, request_pdu: &[u8], expected_response_bytes: usize, timeout: Duration) -> Result<Vec<u8>, Error>
	{
		retry(ALLOWED_UNSUCCESSFUL_TRIES, || self.call(request_pdu, expected_response_bytes, timeout))
	}

	pub fn read_bit(&mut self, address: u16, discrete: bool) -> Result<bool, Error>
	{
		let fcode = if discrete { function::READ_DISCRETE_INPUTS } else { function::READ_COILS };
		let mut pdu = vec![fcode];
		pdu.extend_from_slice(&address.to_be_bytes());
		pdu.extend_from_slice(&1u16.to_be_bytes());

		let response = self.call_retried(&pdu, 2, self.response_timeout)?;
		let byte_count = *response.first().ok_or_else(|| ErrorKind::Crc.error())? as usize;
		let data = response.get(1..1 + byte_count).ok_or_else(|| ErrorKind::Crc.error())?;
		Ok(data.first().copied().unwrap_or(0) & 0x01 != 0)
	}

	pub fn write_bit(&mut self, address: u16, value: bool) -> Result<(), Error>
	{
		let mut pdu = vec![function::WRITE_SINGLE_COIL];
		pdu.extend_from_slice(&address.to_be_bytes());
		pdu.extend_from_slice(&(if value { 0xFF00u16 } else { 0x0000u16 }).to_be_bytes());
		self.call_retried(&pdu, 4, self.response_timeout)?;
		Ok(())
	}

	pub fn read_u16(&mut self, address: u16) -> Result<u16, Error>
	{
		Ok(self.read_holdings(address, 1)?[0])
	}

	pub fn write_u16(&mut self, address: u16, value: u16) -> Result<(), Error>
	{
		let mut pdu = vec![function::WRITE_SINGLE_REGISTER];
		pdu.extend_from_slice(&address.to_be_bytes());
		pdu.extend_from_slice(&value.to_be_bytes());
		self.call_retried(&pdu, 4, self.response_timeout)?;
		Ok(())
	}

	pub fn read_s16(&mut self, address: u16) -> Result<i16, Error>
	{
		Ok(self.read_u16(address)? as i16)
	}

	pub fn write_s16(&mut self, address: u16, value: i16) -> Result<(), Error>
	{
		self.write_u16(address, value as u16)
	}

	/// Reads `count` consecutive holding registers starting at `address`.
	pub fn read_holdings(&mut self, address: u16, count: u16) -> Result<Vec<u16>, Error>
	{
		self.read_block(function::READ_HOLDING_REGISTERS, address, count)
	}

	/// Reads `count` consecutive input registers starting at `address`.
	pub fn read_inputs(&mut self, address: u16, count: u16) -> Result<Vec<u16>, Error>
	{
		self.read_block(function::READ_INPUT_REGISTERS, address, count)
	}

	fn read_block(&mut self, fcode: u8, address: u16, count: u16) -> Result<Vec<u16>, Error>
	{
		let mut pdu = vec![fcode];
		pdu.extend_from_slice(&address.to_be_bytes());
		pdu.extend_from_slice(&count.to_be_bytes());

		let expected_bytes = 1 + (count as usize) * 2;
		let response = self.call_retried(&pdu, expected_bytes, self.response_timeout)?;

		let byte_count = *response.first().ok_or_else(|| ErrorKind::Crc.error())? as usize;
		let data = response.get(1..1 + byte_count).ok_or_else(|| ErrorKind::Crc.error())?;

		Ok(data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
	}

	/// Writes a u16 block to consecutive holding registers, starting at `address`.
	pub fn write_block(&mut self, address: u16, values: &[u16]) -> Result<(), Error>
	{
		let mut pdu = vec![function::WRITE_MULTIPLE_REGISTERS];
		pdu.extend_from_slice(&address.to_be_bytes());
		pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
		pdu.push((values.len() * 2) as u8);
		for v in values {
			pdu.extend_from_slice(&v.to_be_bytes());
		}
		self.call_retried(&pdu, 4, self.response_timeout)?;
		Ok(())
	}

	/// Like [Self::write_block], but uses a caller-supplied timeout (used by
	/// the flasher's INFO phase, which needs an extended timeout).
	pub fn write_block_with_timeout(&mut self, address: u16, values: &[u16], timeout: Duration) -> Result<(), Error>
	{
		let mut pdu = vec![function::WRITE_MULTIPLE_REGISTERS];
		pdu.extend_from_slice(&address.to_be_bytes());
		pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
		pdu.push((values.len() * 2) as u8);
		for v in values {
			pdu.extend_from_slice(&v.to_be_bytes());
		}
		self.call_retried(&pdu, 4, timeout)?;
		Ok(())
	}

	/// Reads a big-endian u32 from two consecutive holding registers, with
	/// optional word-swap.
	pub fn read_u32_be(&mut self, address: u16, byte_swap: bool) -> Result<u32, Error>
	{
		let regs = self.read_holdings(address, 2)?;
		let (hi, lo) = if byte_swap { (regs[1], regs[0]) } else { (regs[0], regs[1]) };
		Ok(((hi as u32) << 16) | lo as u32)
	}

	pub fn write_u32_be(&mut self, address: u16, value: u32, byte_swap: bool) -> Result<(), Error>
	{
		let hi = (value >> 16) as u16;
		let lo = (value & 0xFFFF) as u16;
		let regs = if byte_swap { [lo, hi] } else { [hi, lo] };
		self.write_block(address, &regs)
	}

	/// Reads a string from consecutive holding registers.
	///
	/// Each register carries up to two characters. Treat the whole block as
	/// hex pairs, drop every occurrence of `00`, `FF`, and ASCII space at any
	/// position, decode as UTF-8, then trim surrounding whitespace.
	pub fn read_string(&mut self, address: u16, reg_count: u16) -> Result<String, Error>
	{
		let regs = self.read_holdings(address, reg_count)?;
		let mut bytes = Vec::with_capacity(regs.len() * 2);
		for reg in regs {
			let [hi, lo] = reg.to_be_bytes();
			bytes.push(hi);
			bytes.push(lo);
		}
		let filtered: Vec<u8> = bytes.into_iter().filter(|&b| b != 0x00 && b != 0xFF && b != b' ').collect();
		let decoded = String::from_utf8(filtered).map_err(|e| ErrorKind::IncorrectFirmware(e.to_string()).error())?;
		Ok(decoded.trim().to_string())
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn retry_returns_ok_on_first_success()
	{
		let mut calls = 0;
		let result: Result<u32, Error> = retry(ALLOWED_UNSUCCESSFUL_TRIES, || {
			calls += 1;
			Ok(42)
		});
		assert_eq!(result.unwrap(), 42);
		assert_eq!(calls, 1);
	}

	#[test]
	fn retry_gives_up_after_max_tries_and_reraises_last_error()
	{
		let mut calls = 0;
		let result: Result<u32, Error> = retry(ALLOWED_UNSUCCESSFUL_TRIES, || {
			calls += 1;
			Err(ErrorKind::NoResponse.error())
		});
		assert!(result.is_err());
		assert_eq!(calls, ALLOWED_UNSUCCESSFUL_TRIES + 1);
	}

	#[test]
	fn retry_recovers_after_transient_failure()
	{
		let mut calls = 0;
		let result: Result<u32, Error> = retry(ALLOWED_UNSUCCESSFUL_TRIES, || {
			calls += 1;
			if calls < 2 {
				Err(ErrorKind::NoResponse.error())
			} else {
				Ok(7)
			}
		});
		assert_eq!(result.unwrap(), 7);
	}
}
