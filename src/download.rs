// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resolves a `(firmware_signature, mode, branch, version)` request to a
//! local file path, downloading from the remote firmware store and caching
//! by URL so that parallel per-port workers don't race on the same fetch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::error::Error;

pub const ROOT_URL: &str = "http://fw-releases.wirenboard.com/";
const EXTENSION: &str = ".wbfw";
const LATEST_FW_VERSION_FILE: &str = "latest.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode
{
	Firmware,
	Bootloader,
	Components,
}

impl Mode
{
	fn segment(self) -> &'static str
	{
		match self {
			Mode::Firmware => "fw",
			Mode::Bootloader => "bootloader",
			Mode::Components => "components",
		}
	}
}

/// `ROOT_URL / fw|bootloader|components / by-signature / <signature> / (stable|unstable/<branch>) / <file>`.
fn build_url(mode: Mode, fw_signature: &str, branch: Option<&str>, file_name: &str) -> String
{
	let source = match branch {
		Some(branch) => format!("unstable/{branch}"),
		None => "stable".to_string(),
	};

	format!("{}{}/by-signature/{}/{}/{}", ROOT_URL, mode.segment(), fw_signature, source, file_name)
}

/// A downloaded artifact: the on-disk path of the retrieved file, tagged with
/// the mode it came from.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact
{
	pub mode: Mode,
	pub local_path: PathBuf,
}

/// A download cache keyed by URL, with at-most-one in-flight fetch per key
/// shared across concurrent per-port workers.
pub struct DownloadCache
{
	cache_dir: PathBuf,
	client: reqwest::blocking::Client,
	in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DownloadCache
{
	pub fn new(cache_dir: impl AsRef<Path>) -> Self
	{
		Self {
			cache_dir: cache_dir.as_ref().to_path_buf(),
			client: reqwest::blocking::Client::new(),
			in_flight: Mutex::new(HashMap::new()),
		}
	}

	/// Returns the latest version string published for `fw_signature` under
	/// `mode`/`branch`, by fetching `latest.txt`.
	pub fn get_latest_version_number(&self, mode: Mode, fw_signature: &str, branch: Option<&str>) -> Result<String, Error>
	{
		let url = build_url(mode, fw_signature, branch, LATEST_FW_VERSION_FILE);
		let text = self.fetch_text(&url)?;
		Ok(text.trim().to_string())
	}

	/// Downloads `<version>.wbfw` for `fw_signature` under `mode`/`branch`,
	/// deduped by URL, and returns the path of the cached local file.
	pub fn download(&self, mode: Mode, fw_signature: &str, version: &str, branch: Option<&str>) -> Result<DownloadedArtifact, Error>
	{
		let file_name = format!("{version}{EXTENSION}");
		let url = build_url(mode, fw_signature, branch, &file_name);

		let lock = self.lock_for_url(&url);
		let _guard = lock.lock().expect("in-flight download lock poisoned");

		let local_path = self.cache_path_for_url(&url);
		if !local_path.exists() {
			log::info!("downloading {url} to {}", local_path.display());
			let bytes = self.fetch_bytes(&url)?;
			if let Some(parent) = local_path.parent() {
				std::fs::create_dir_all(parent)?;
			}
			std::fs::write(&local_path, bytes)?;
		} else {
			log::debug!("using cached download for {url}");
		}

		Ok(DownloadedArtifact { mode, local_path })
	}

	fn lock_for_url(&self, url: &str) -> Arc<Mutex<()>>
	{
		let mut in_flight = self.in_flight.lock().expect("in-flight map lock poisoned");
		in_flight.entry(url.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
	}

	fn cache_path_for_url(&self, url: &str) -> PathBuf
	{
		let mut hasher = Sha256::new();
		hasher.update(url.as_bytes());
		let digest = hasher.finalize();
		let key = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();

		let extension = if url.ends_with(EXTENSION) { EXTENSION } else { "" };
		self.cache_dir.join(format!("{key}{extension}"))
	}

	fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, Error>
	{
		let response = self.client.get(url).send()?.error_for_status()?;
		Ok(response.bytes()?.to_vec())
	}

	fn fetch_text(&self, url: &str) -> Result<String, Error>
	{
		let response = self.client.get(url).send()?.error_for_status()?;
		Ok(response.text()?)
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn url_layout_matches_remote_store_convention()
	{
		let url = build_url(Mode::Firmware, "WBMR6C12345", None, "1.8.3.wbfw");
		assert_eq!(url, "http://fw-releases.wirenboard.com/fw/by-signature/WBMR6C12345/stable/1.8.3.wbfw");
	}

	#[test]
	fn branch_selects_unstable_source()
	{
		let url = build_url(Mode::Bootloader, "SIG", Some("feature-x"), "latest.txt");
		assert_eq!(url, "http://fw-releases.wirenboard.com/bootloader/by-signature/SIG/unstable/feature-x/latest.txt");
	}

	#[test]
	fn cache_path_is_stable_for_same_url()
	{
		let cache = DownloadCache::new("/tmp/wb-fw-updater-test-cache");
		let a = cache.cache_path_for_url("http://example.com/x.wbfw");
		let b = cache.cache_path_for_url("http://example.com/x.wbfw");
		assert_eq!(a, b);
	}
}
