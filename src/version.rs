// SPDX-License-Identifier: MIT OR Apache-2.0
//! Firmware/bootloader version parsing and ordering.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::{Error, ErrorKind};

/// A parsed `major.minor.patch[-prerelease]` firmware version string.
///
/// Ordering is total: `(major, minor, patch)` dominate, and a version with no
/// pre-release suffix is considered newer than one with the same
/// `major.minor.patch` and a pre-release suffix (release > release candidate),
/// matching semver precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version
{
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
	pub prerelease: Option<String>,
}

impl Version
{
	pub fn new(major: u32, minor: u32, patch: u32) -> Self
	{
		Self { major, minor, patch, prerelease: None }
	}

	/// True if `other` differs in the major component (breaking change per
	/// firmware versioning convention; triggers the interactive confirmation
	/// prompt during update).
	pub fn is_major_bump_from(&self, other: &Version) -> bool
	{
		self.major != other.major
	}
}

impl FromStr for Version
{
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self, Self::Err>
	{
		let s = raw.trim().trim_start_matches('v');
		let (core, prerelease) = match s.split_once('-') {
			Some((core, pre)) => (core, Some(pre.to_string())),
			None => (s, None),
		};

		let mut parts = core.split('.');
		let mut next = || -> Result<u32, Error> {
			parts
				.next()
				.ok_or_else(|| ErrorKind::VersionParse(raw.to_string()).error())?
				.parse::<u32>()
				.map_err(|e| ErrorKind::VersionParse(raw.to_string()).error_from(e))
		};

		let major = next()?;
		let minor = next()?;
		let patch = next()?;

		if parts.next().is_some() {
			return Err(ErrorKind::VersionParse(raw.to_string()).error());
		}

		Ok(Self { major, minor, patch, prerelease })
	}
}

impl Display for Version
{
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
	{
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
		if let Some(pre) = &self.prerelease {
			write!(f, "-{}", pre)?;
		}
		Ok(())
	}
}

impl PartialOrd for Version
{
	fn partial_cmp(&self, other: &Self) -> Option<Ordering>
	{
		Some(self.cmp(other))
	}
}

impl Ord for Version
{
	fn cmp(&self, other: &Self) -> Ordering
	{
		(self.major, self.minor, self.patch)
			.cmp(&(other.major, other.minor, other.patch))
			.then_with(|| match (&self.prerelease, &other.prerelease) {
				(None, None) => Ordering::Equal,
				(None, Some(_)) => Ordering::Greater,
				(Some(_), None) => Ordering::Less,
				(Some(a), Some(b)) => a.cmp(b),
			})
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parses_plain_version()
	{
		let v: Version = "1.8.3".parse().unwrap();
		assert_eq!(v, Version::new(1, 8, 3));
	}

	#[test]
	fn parses_v_prefixed_and_prerelease()
	{
		let v: Version = "v2.0.0-rc1".parse().unwrap();
		assert_eq!(v.major, 2);
		assert_eq!(v.minor, 0);
		assert_eq!(v.patch, 0);
		assert_eq!(v.prerelease.as_deref(), Some("rc1"));
	}

	#[test]
	fn rejects_malformed_version()
	{
		assert!("1.8".parse::<Version>().is_err());
		assert!("a.b.c".parse::<Version>().is_err());
	}

	#[test]
	fn release_outranks_prerelease_of_same_core()
	{
		let release: Version = "1.2.0".parse().unwrap();
		let rc: Version = "1.2.0-rc1".parse().unwrap();
		assert!(release > rc);
	}

	#[test]
	fn major_bump_detected()
	{
		let old: Version = "1.9.0".parse().unwrap();
		let new: Version = "2.0.0".parse().unwrap();
		assert!(new.is_major_bump_from(&old));
		assert!(!old.is_major_bump_from(&old));
	}

	#[test]
	fn orders_by_numeric_component_not_lexicographic()
	{
		let a: Version = "1.9.0".parse().unwrap();
		let b: Version = "1.10.0".parse().unwrap();
		assert!(b > a);
	}
}
