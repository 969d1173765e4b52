// SPDX-License-Identifier: MIT OR Apache-2.0
//! Drives a device sitting in its bootloader through the Modbus-in-bootloader
//! flashing protocol: INFO block, chunked DATA, and post-flash bookkeeping.

use std::time::Duration;

use crate::device::Device;
use crate::error::{Error, ErrorKind};
use crate::version::Version;
use crate::wbfw::Wbfw;

pub const INFO_BLOCK_START: u16 = 0x1000;
pub const DATA_BLOCK_START: u16 = 0x2000;
pub const UART_RESET_REG: u16 = 1000;
pub const EEPROM_ERASE_REG: u16 = 1001;
pub const FREE_SPACE_REG: u16 = 1003;

pub const INFOBLOCK_MAGIC_EXTRA_TIMEOUT: Duration = Duration::from_secs(1);

/// Progress of an ongoing DATA phase, pulled by the caller rather than pushed
/// to a specific UI — keeps protocol logic decoupled from any UI library.
#[derive(Debug, Clone, Copy)]
pub struct FlashProgress
{
	pub chunk_index: usize,
	pub total_chunks: usize,
}

/// Drives `device` (already rebooted into its bootloader) through the full
/// INFO + DATA flashing sequence for `artifact`.
///
/// States: `Ready -> InfoSent -> DataStreaming -> Done`; any failure routes
/// out through the returned `Result` rather than a `Failed` state, since the
/// caller (orchestrator) is what decides how to bucket the error.
pub fn flash(device: &mut Device, artifact: &Wbfw, mut on_progress: impl FnMut(FlashProgress)) -> Result<(), Error>
{
	write_info(device, &artifact.info)?;
	write_data_chunks(device, &artifact.data_chunks, &mut on_progress)?;
	Ok(())
}

/// INFO phase: writes the 16-reg INFO block to [INFO_BLOCK_START] with the
/// response timeout extended by [INFOBLOCK_MAGIC_EXTRA_TIMEOUT]. An illegal
/// request here means the device isn't actually in bootloader; any other
/// failure is a generic flashing failure. The original timeout is always
/// restored on exit, success or failure.
fn write_info(device: &mut Device, info: &[u16; crate::wbfw::INFO_BLOCK_LEN]) -> Result<(), Error>
{
	let original_timeout = device.instrument().response_timeout;
	let extended = original_timeout + INFOBLOCK_MAGIC_EXTRA_TIMEOUT;

	let result = device.instrument().write_block_with_timeout(INFO_BLOCK_START, info, extended);
	device.instrument().response_timeout = original_timeout;

	match result {
		Ok(()) => Ok(()),
		Err(Error { kind: ErrorKind::IllegalRequest, .. }) => Err(ErrorKind::NotInBootloader.error()),
		Err(e) => Err(ErrorKind::DataPhaseFailed(format!("INFO write failed: {e}")).error()),
	}
}

/// DATA phase: writes each chunk to [DATA_BLOCK_START] in turn. A single
/// chunk failure is tolerated (`pending_failure` is set); if the *next*
/// chunk succeeds, the flag clears and streaming continues. If the flag is
/// still set at the end of the loop, or two consecutive chunks fail, the
/// bootloader is re-probed: the failure is declared fatal with "device
/// remains in bootloader" only if the probe confirms the bootloader still
/// answers; otherwise the chunk failure is tolerated and streaming is
/// considered complete.
fn write_data_chunks(device: &mut Device, chunks: &[Vec<u16>], on_progress: &mut impl FnMut(FlashProgress)) -> Result<(), Error>
{
	let total = chunks.len();
	let mut pending_failure = false;

	for (index, chunk) in chunks.iter().enumerate() {
		match device.instrument().write_block(DATA_BLOCK_START, chunk) {
			Ok(()) => {
				pending_failure = false;
			},
			Err(e) => {
				if pending_failure {
					return fail_if_bootloader_alive(device, index, e);
				}
				pending_failure = true;
				log::warn!("DATA chunk {index}/{total} failed (tolerated once): {e}");
			},
		}

		on_progress(FlashProgress { chunk_index: index + 1, total_chunks: total });
	}

	if pending_failure {
		let cause = ErrorKind::DataPhaseFailed("trailing chunk failure".to_string()).error();
		return fail_if_bootloader_alive(device, total.saturating_sub(1), cause);
	}

	Ok(())
}

fn fail_if_bootloader_alive(device: &mut Device, chunk_index: usize, cause: Error) -> Result<(), Error>
{
	match device.is_in_bootloader() {
		Ok(true) => {
			Err(ErrorKind::DataPhaseFailed(format!("device remains in bootloader after chunk {chunk_index} ({cause})")).error())
		},
		_ => {
			log::debug!("chunk {chunk_index} failed ({cause}) but bootloader probe no longer confirms presence; tolerating");
			Ok(())
		},
	}
}

/// Writes 1 to [UART_RESET_REG]. `NotInBootloader` and `BootloaderCmd` are
/// distinguished by whether the failure was an illegal request or anything
/// else.
pub fn reset_uart(device: &mut Device) -> Result<(), Error>
{
	bootloader_command(device, UART_RESET_REG)
}

/// Writes 1 to [EEPROM_ERASE_REG].
pub fn reset_eeprom(device: &mut Device) -> Result<(), Error>
{
	bootloader_command(device, EEPROM_ERASE_REG)
}

fn bootloader_command(device: &mut Device, register: u16) -> Result<(), Error>
{
	match device.instrument().write_u16(register, 1) {
		Ok(()) => Ok(()),
		Err(Error { kind: ErrorKind::IllegalRequest, .. }) => Err(ErrorKind::NotInBootloader.error()),
		Err(_) => Err(ErrorKind::BootloaderCmd.error()),
	}
}

/// Checks whether flashing `data_chunk_count` chunks will preserve the
/// device's existing user data, by reading the free-space register — only
/// available starting with bootloader 1.2.0. Returns `None` when the
/// bootloader is too old to report this (caller should fall back to asking
/// the user).
pub fn will_preserve_user_data(device: &mut Device, bootloader_version: &Version, data_chunk_count: usize) -> Result<Option<bool>, Error>
{
	let min_version = Version::new(1, 2, 0);
	if *bootloader_version < min_version {
		return Ok(None);
	}

	let available_chunks = device.instrument().read_u16(FREE_SPACE_REG)? as usize;
	Ok(Some(available_chunks > data_chunk_count))
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn bootloader_1_2_0_is_the_free_space_cutoff()
	{
		assert!(Version::new(1, 1, 9) < Version::new(1, 2, 0));
		assert!(!(Version::new(1, 2, 0) < Version::new(1, 2, 0)));
	}
}
