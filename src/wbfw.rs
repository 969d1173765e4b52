// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parser for the `.wbfw` firmware/bootloader artifact format.

use crate::error::{Error, ErrorKind};

pub const INFO_BLOCK_LEN: usize = 16;
pub const DATA_CHUNK_LEN: usize = 68;

/// A parsed firmware artifact: a fixed-length INFO header followed by a
/// sequence of DATA chunks. The last chunk may be short; it is never padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wbfw
{
	pub info: [u16; INFO_BLOCK_LEN],
	pub data_chunks: Vec<Vec<u16>>,
}

impl Wbfw
{
	/// Parses a raw `.wbfw` byte buffer (big-endian-on-disk per-register would
	/// be unusual for this format; registers are encoded little-endian byte
	/// pairs on disk, matching how the bootloader's Modbus write expects them
	/// once swapped to network byte order by the Instrument layer).
	pub fn parse(bytes: &[u8]) -> Result<Self, Error>
	{
		if bytes.len() % 2 != 0 {
			return Err(ErrorKind::IncorrectFirmware(format!("file has odd length {}", bytes.len())).error());
		}

		let regs: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();

		if regs.len() < INFO_BLOCK_LEN {
			return Err(ErrorKind::IncorrectFirmware("file is shorter than the INFO block".to_string()).error());
		}

		let mut info = [0u16; INFO_BLOCK_LEN];
		info.copy_from_slice(&regs[..INFO_BLOCK_LEN]);

		let data_chunks = regs[INFO_BLOCK_LEN..]
			.chunks(DATA_CHUNK_LEN)
			.map(|c| c.to_vec())
			.collect();

		Ok(Self { info, data_chunks })
	}

	/// Serializes back to the on-disk byte representation. Round-trips
	/// `parse` exactly: `Wbfw::parse(&wbfw.serialize()) == Ok(wbfw)`.
	pub fn serialize(&self) -> Vec<u8>
	{
		let mut bytes = Vec::with_capacity((INFO_BLOCK_LEN + self.data_chunks.iter().map(Vec::len).sum::<usize>()) * 2);
		for reg in self.info.iter() {
			bytes.extend_from_slice(&reg.to_le_bytes());
		}
		for chunk in &self.data_chunks {
			for reg in chunk {
				bytes.extend_from_slice(&reg.to_le_bytes());
			}
		}
		bytes
	}

	pub fn num_chunks(&self) -> usize
	{
		self.data_chunks.len()
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn regs_to_bytes(regs: &[u16]) -> Vec<u8>
	{
		regs.iter().flat_map(|r| r.to_le_bytes()).collect()
	}

	#[test]
	fn parse_and_chunk_344_bytes()
	{
		let info: Vec<u16> = (0..16).collect();
		let chunk1: Vec<u16> = (0..68).collect();
		let chunk2: Vec<u16> = (100..168).collect();
		let chunk3: Vec<u16> = (200..220).collect();

		let mut all = info.clone();
		all.extend(&chunk1);
		all.extend(&chunk2);
		all.extend(&chunk3);
		let bytes = regs_to_bytes(&all);
		assert_eq!(bytes.len(), 344);

		let wbfw = Wbfw::parse(&bytes).unwrap();
		assert_eq!(wbfw.info.len(), 16);
		assert_eq!(wbfw.data_chunks.len(), 3);
		assert_eq!(wbfw.data_chunks[0].len(), 68);
		assert_eq!(wbfw.data_chunks[1].len(), 68);
		assert_eq!(wbfw.data_chunks[2].len(), 20);
	}

	#[test]
	fn rejects_odd_length_file()
	{
		let bytes = vec![0u8; 33];
		assert!(Wbfw::parse(&bytes).is_err());
	}

	#[test]
	fn roundtrips_through_serialize()
	{
		let info: Vec<u16> = (0..16).collect();
		let chunk: Vec<u16> = (0..40).collect();
		let mut all = info;
		all.extend(&chunk);
		let bytes = regs_to_bytes(&all);

		let wbfw = Wbfw::parse(&bytes).unwrap();
		assert_eq!(wbfw.serialize(), bytes);
	}
}
