// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resolves the release manifest to find "the released" firmware version for
//! a given firmware signature and suite.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, ErrorKind};
use crate::version::Version;

/// Orchestration context carried through `main` into the orchestrator,
/// replacing what used to be a module-level mutable singleton.
#[derive(Debug, Clone)]
pub struct ReleaseContext
{
	pub release_name: String,
	pub suite: String,
	pub target: String,
	pub repo_prefix: Option<String>,
}

/// `releases: { <fw_signature>: { <suite>: <endpoint_path> } }`.
#[derive(Debug, Deserialize)]
pub struct ReleaseManifest
{
	pub releases: HashMap<String, HashMap<String, String>>,
}

impl ReleaseManifest
{
	pub fn parse(yaml: &str) -> Result<Self, Error>
	{
		serde_yaml::from_str(yaml).map_err(Error::from)
	}

	/// Looks up the endpoint path for `fw_signature` under `suite`, and
	/// extracts the version string baked into it (`…/<version>.wbfw` or
	/// `…/<version>.compfw`, optionally URL-encoded).
	pub fn resolve(&self, fw_signature: &str, suite: &str) -> Result<ReleasedEndpoint, Error>
	{
		let endpoint = self
			.releases
			.get(fw_signature)
			.and_then(|suites| suites.get(suite))
			.ok_or_else(|| ErrorKind::NoReleasedFirmware.error())?;

		let version = extract_version(endpoint)?;

		Ok(ReleasedEndpoint { path: endpoint.clone(), version })
	}
}

#[derive(Debug, Clone)]
pub struct ReleasedEndpoint
{
	pub path: String,
	pub version: Version,
}

fn version_regex() -> Regex
{
	Regex::new(r"([0-9]+(?:%2E|\.)[0-9]+(?:%2E|\.)[0-9]+(?:-[0-9A-Za-z.]+)?)\.(?:wbfw|compfw)$")
		.expect("static regex is valid")
}

fn extract_version(endpoint: &str) -> Result<Version, Error>
{
	let re = version_regex();
	let captures = re
		.captures(endpoint)
		.ok_or_else(|| ErrorKind::VersionParse(endpoint.to_string()).error())?;

	let raw = captures.get(1).expect("capture group 1 always present on match").as_str();
	let decoded = raw.replace("%2E", ".");

	decoded.parse()
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn resolves_plain_wbfw_endpoint()
	{
		let yaml = "releases:\n  WBMR6C12345:\n    stable: /fw/by-signature/WBMR6C12345/main/1.8.3.wbfw\n";
		let manifest = ReleaseManifest::parse(yaml).unwrap();
		let endpoint = manifest.resolve("WBMR6C12345", "stable").unwrap();
		assert_eq!(endpoint.version, Version::new(1, 8, 3));
	}

	#[test]
	fn resolves_url_encoded_version()
	{
		let yaml = "releases:\n  SIG:\n    stable: /fw/by-signature/SIG/main/2%2E0%2E0.compfw\n";
		let manifest = ReleaseManifest::parse(yaml).unwrap();
		let endpoint = manifest.resolve("SIG", "stable").unwrap();
		assert_eq!(endpoint.version, Version::new(2, 0, 0));
	}

	#[test]
	fn missing_signature_or_suite_is_no_released_firmware()
	{
		let yaml = "releases:\n  SIG:\n    stable: /x/1.0.0.wbfw\n";
		let manifest = ReleaseManifest::parse(yaml).unwrap();
		assert!(manifest.resolve("OTHER", "stable").is_err());
		assert!(manifest.resolve("SIG", "testing").is_err());
	}
}
