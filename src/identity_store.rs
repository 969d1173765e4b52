// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistent bounded `(port, slave_id) -> firmware_signature` mapping, used
//! to recover devices stuck in bootloader that can no longer report their
//! own identity.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_MAX_RECORDS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord
{
	#[serde(rename = "slaveid")]
	pub slave_id: u8,
	pub port: String,
	pub fw_signature: String,
}

/// A FIFO-bounded list of [IdentityRecord]s persisted as JSON to a fixed
/// path. `save` is idempotent per `(port, slave_id)`: the prior record for
/// that key is dropped before the new one is appended, so newest-for-a-key
/// is always last in the list.
pub struct IdentityStore
{
	path: PathBuf,
	max_records: usize,
	records: Vec<IdentityRecord>,
}

impl IdentityStore
{
	pub fn new(path: impl AsRef<Path>, max_records: usize) -> Self
	{
		Self { path: path.as_ref().to_path_buf(), max_records, records: Vec::new() }
	}

	/// Loads records from `path`. A missing file starts empty; a permission
	/// error is logged and swallowed, since this is a best-effort cache.
	pub fn load(path: impl AsRef<Path>, max_records: usize) -> Self
	{
		let path = path.as_ref().to_path_buf();
		let records = match std::fs::read(&path) {
			Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
				log::warn!("identity store at {} failed to parse, starting empty: {}", path.display(), e);
				Vec::new()
			}),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
			Err(e) => {
				log::warn!("identity store at {} could not be read, starting empty: {}", path.display(), e);
				Vec::new()
			},
		};

		Self { path, max_records, records }
	}

	/// Atomically persists the store to its path: write to a sibling
	/// temporary file then rename over the destination.
	pub fn dump(&self) -> Result<(), Error>
	{
		let bytes = serde_json::to_vec_pretty(&self.records)?;
		let tmp_path = self.path.with_extension("json.tmp");

		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}

		match std::fs::write(&tmp_path, &bytes) {
			Ok(()) => {},
			Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
				log::warn!("could not persist identity store to {}: {}", self.path.display(), e);
				return Ok(());
			},
			Err(e) => return Err(e.into()),
		}

		std::fs::rename(&tmp_path, &self.path)?;
		Ok(())
	}

	pub fn save(&mut self, slave_id: u8, port: &str, fw_signature: &str)
	{
		self.records.retain(|r| !(r.slave_id == slave_id && r.port == port));
		self.records.push(IdentityRecord { slave_id, port: port.to_string(), fw_signature: fw_signature.to_string() });

		while self.records.len() > self.max_records {
			self.records.remove(0);
		}
	}

	/// Searches newest-first and returns the firmware signature for
	/// `(slave_id, port)`, if any record exists.
	pub fn get_fw_signature(&self, slave_id: u8, port: &str) -> Option<&str>
	{
		self.records
			.iter()
			.rev()
			.find(|r| r.slave_id == slave_id && r.port == port)
			.map(|r| r.fw_signature.as_str())
	}

	pub fn len(&self) -> usize
	{
		self.records.len()
	}

	pub fn is_empty(&self) -> bool
	{
		self.records.is_empty()
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn fifo_eviction_caps_at_max_records_and_dedups_by_key()
	{
		let mut store = IdentityStore::new("/tmp/unused-in-test.json", 3);
		store.save(1, "A", "S1");
		store.save(2, "A", "S2");
		store.save(3, "A", "S3");
		store.save(1, "A", "S1b");

		assert_eq!(store.len(), 3);
		assert_eq!(store.get_fw_signature(1, "A"), Some("S1b"));
		assert_eq!(store.get_fw_signature(2, "A"), Some("S2"));
		assert_eq!(store.get_fw_signature(3, "A"), Some("S3"));
		assert_eq!(store.get_fw_signature(4, "A"), None);

		let keys: Vec<(u8, &str)> = store.records.iter().map(|r| (r.slave_id, r.port.as_str())).collect();
		assert_eq!(keys, vec![(2, "A"), (3, "A"), (1, "A")]);
	}

	#[test]
	fn get_returns_most_recent_save_for_a_key()
	{
		let mut store = IdentityStore::new("/tmp/unused-in-test.json", 100);
		store.save(5, "/dev/ttyRS485-1", "old-sig");
		store.save(5, "/dev/ttyRS485-1", "new-sig");
		assert_eq!(store.get_fw_signature(5, "/dev/ttyRS485-1"), Some("new-sig"));
		assert_eq!(store.len(), 1);
	}
}
