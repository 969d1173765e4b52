// SPDX-License-Identifier: MIT OR Apache-2.0
//! Top-level state machine combining Prober, Release resolver, Download
//! cache, Device, and Flasher to reach a goal: single-device update,
//! single-device recover, or their bulk counterparts.

use std::time::Duration;

use crate::device::Device;
use crate::download::{DownloadCache, DownloadedArtifact, Mode};
use crate::error::{Error, ErrorKind};
use crate::flasher;
use crate::identity_store::IdentityStore;
use crate::release::ReleaseManifest;
use crate::transport::SerialSettings;
use crate::version::Version;
use crate::wbfw::Wbfw;

/// Why `is_reflash_necessary` decided to skip flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason
{
	/// `provided == actual` and `force` was not set.
	IsActual,
	/// `provided < actual` and `allow_downgrade` was not set.
	GoneAhead,
}

#[derive(Debug, Clone, Copy)]
pub struct ReflashDecision
{
	pub do_flash: bool,
	pub skip_reason: Option<SkipReason>,
	/// Set when flashing would cross a major-version boundary; the caller
	/// must obtain explicit user confirmation before proceeding, unless
	/// `force` was given (force bypasses only this confirmation, never the
	/// bootloader-downgrade gate below).
	pub needs_major_bump_confirmation: bool,
}

/// Depends only on `(sign(actual vs provided), force, allow_downgrade)` and
/// major-version equality — no other state.
pub fn is_reflash_necessary(actual: &Version, provided: &Version, force: bool, allow_downgrade: bool) -> ReflashDecision
{
	let do_flash;
	let mut skip_reason = None;

	if provided == actual {
		do_flash = force;
		if !force {
			skip_reason = Some(SkipReason::IsActual);
		}
	} else if provided > actual {
		do_flash = true;
	} else if allow_downgrade {
		do_flash = true;
	} else {
		do_flash = false;
		skip_reason = Some(SkipReason::GoneAhead);
	}

	let needs_major_bump_confirmation = do_flash && provided.is_major_bump_from(actual) && !force;

	ReflashDecision { do_flash, skip_reason, needs_major_bump_confirmation }
}

/// A bootloader downgrade is forbidden outright, with no `allow_downgrade`
/// override — a bad bootloader write can brick the device with no recovery
/// path, unlike firmware which can always be re-flashed from bootloader.
pub fn is_bootloader_downgrade_allowed(actual: &Version, provided: &Version) -> bool
{
	provided >= actual
}

/// What version label the caller asked for.
#[derive(Debug, Clone)]
pub enum VersionRequest
{
	/// `"release"` with no branch: consult the release manifest.
	Release,
	/// `"release"` with a branch: treated as `latest` on that branch.
	ReleaseOnBranch(String),
	/// `"latest"`: ask the download source for the newest version on the
	/// (optional) branch, then download it.
	Latest(Option<String>),
	/// An explicit version string: download it directly.
	Explicit(String),
}

/// Resolves a `(fw_signature, version_request, mode)` request into a
/// [DownloadedArtifact].
pub fn do_download(
	cache: &DownloadCache,
	manifest: Option<&ReleaseManifest>,
	suite: &str,
	fw_signature: &str,
	mode: Mode,
	request: &VersionRequest,
) -> Result<DownloadedArtifact, Error>
{
	match request {
		VersionRequest::Release => {
			let manifest = manifest.ok_or_else(|| ErrorKind::NoReleasedFirmware.error())?;
			let endpoint = manifest.resolve(fw_signature, suite)?;
			cache.download(mode, fw_signature, &endpoint.version.to_string(), None)
		},
		VersionRequest::ReleaseOnBranch(branch) => {
			let version = cache.get_latest_version_number(mode, fw_signature, Some(branch))?;
			cache.download(mode, fw_signature, &version, Some(branch))
		},
		VersionRequest::Latest(branch) => {
			let version = cache.get_latest_version_number(mode, fw_signature, branch.as_deref())?;
			cache.download(mode, fw_signature, &version, branch.as_deref())
		},
		VersionRequest::Explicit(version) => cache.download(mode, fw_signature, version, None),
	}
}

/// What is being updated: firmware, or the bootloader itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget
{
	Firmware,
	Bootloader,
}

/// Decides, given a live connection to the device's bootloader, whether
/// updating is safe with respect to user data, asking the caller (which may
/// prompt interactively) when unknown.
pub trait UserDataConfirm
{
	/// Called when flashing would NOT provably preserve user data (bootloader
	/// too old to report free space, or free space is insufficient). Returns
	/// whether to proceed anyway.
	fn confirm_may_erase_user_data(&mut self) -> bool;

	/// Called when flashing would cross a major version boundary.
	fn confirm_major_bump(&mut self, actual: &Version, provided: &Version) -> bool;
}

/// Parameters threaded through [do_flash] that come from CLI flags / config
/// rather than device state.
pub struct FlashRequest<'a>
{
	pub target: UpdateTarget,
	pub artifact: &'a Wbfw,
	pub force: bool,
}

/// Drives a single device through the full update executor sequence:
/// 1. capture initial settings/timeout,
/// 2. (firmware target only) flash a newer bootloader first if one exists,
/// 3. reboot to bootloader,
/// 4. confirm the in-bootloader line speed (falls back to 9600-N-2),
/// 5. check user-data preservation and flash the artifact,
/// 6. (bootloader target only) chain-flash the released firmware afterwards,
/// 7. restore the original settings/timeout.
///
/// `bootloader_artifact` is consulted only when `request.target` is
/// `Firmware`; `firmware_artifact` only when it is `Bootloader`, to chain the
/// second flash. Both may be `None` when no newer companion image is
/// available.
pub fn do_flash(
	device: &mut Device,
	request: &FlashRequest,
	companion_artifact: Option<&Wbfw>,
	confirm: &mut impl UserDataConfirm,
	on_progress: &mut dyn FnMut(flasher::FlashProgress),
) -> Result<(), Error>
{
	let original_settings = device.settings();
	let original_timeout = device.response_timeout();

	let result = do_flash_inner(device, request, companion_artifact, confirm, on_progress);

	device.instrument().set_settings(original_settings).ok();
	device.instrument().response_timeout = original_timeout;

	result
}

fn do_flash_inner(
	device: &mut Device,
	request: &FlashRequest,
	companion_artifact: Option<&Wbfw>,
	confirm: &mut impl UserDataConfirm,
	on_progress: &mut dyn FnMut(flasher::FlashProgress),
) -> Result<(), Error>
{
	if request.target == UpdateTarget::Firmware {
		if let Some(bootloader_artifact) = companion_artifact {
			log::info!("flashing newer bootloader before firmware (no user-data check needed for a bootloader image)");
			device.reboot_to_bootloader()?;
			settle_bootloader_speed(device)?;
			flasher::flash(device, bootloader_artifact, |_| {})?;
			flasher::reset_uart(device)?;
		}
	}

	device.reboot_to_bootloader()?;
	settle_bootloader_speed(device)?;

	let bootloader_version: Version = device
		.bootloader_version()
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or_else(|| Version::new(0, 0, 0));

	match flasher::will_preserve_user_data(device, &bootloader_version, request.artifact.num_chunks())? {
		Some(true) | None => {},
		Some(false) => {
			if !confirm.confirm_may_erase_user_data() {
				return Err(ErrorKind::UserCancelled.error());
			}
		},
	}

	flasher::flash(device, request.artifact, |progress| on_progress(progress))?;
	flasher::reset_uart(device)?;

	if request.target == UpdateTarget::Bootloader {
		if let Some(firmware_artifact) = companion_artifact {
			log::info!("chain-flashing released firmware after bootloader update");
			device.reboot_to_bootloader()?;
			settle_bootloader_speed(device)?;
			flasher::flash(device, firmware_artifact, |_| {})?;
			flasher::reset_uart(device)?;
		}
	}

	Ok(())
}

/// Verifies the in-bootloader line speed: if the device answers
/// `bootloader_version` at its current settings, keep them; otherwise fall
/// back to 9600-N-2.
fn settle_bootloader_speed(device: &mut Device) -> Result<(), Error>
{
	if device.bootloader_version().is_ok() {
		return Ok(());
	}
	device.instrument().set_settings(SerialSettings::bootloader_default())
}

/// Scans slave ids `0..247` at 9600-N-2 for a device that answers the
/// bootloader probe, for the `recover` verb when no slave id is known at all.
pub fn find_slaveid_in_bootloader(port_path: &str, response_timeout: Duration) -> Result<Option<u8>, Error>
{
	for slave_id in 0u8..=247 {
		let mut device = match Device::new(port_path, slave_id, SerialSettings::bootloader_default(), response_timeout) {
			Ok(d) => d,
			Err(_) => continue,
		};

		if matches!(device.is_in_bootloader(), Ok(true)) {
			return Ok(Some(slave_id));
		}
	}

	Ok(None)
}

/// Recovery outcome for a single device already classified `in_bootloader`.
#[derive(Debug)]
pub enum RecoverOutcome
{
	Flashed,
	UnknownSignature,
}

/// For a device in bootloader: try to read its own fw_signature (newer
/// bootloaders expose this); fall back to the identity store; if still
/// absent, skip with [RecoverOutcome::UnknownSignature].
pub fn recover_device_iteration(
	device: &mut Device,
	port_path: &str,
	identity_store: &IdentityStore,
	cache: &DownloadCache,
	manifest: Option<&ReleaseManifest>,
	suite: &str,
	on_progress: &mut dyn FnMut(flasher::FlashProgress),
) -> Result<RecoverOutcome, Error>
{
	let fw_signature = device
		.instrument()
		.read_string(crate::device::reg::FW_SIGNATURE, crate::device::FW_SIGNATURE_LEN)
		.ok()
		.filter(|s| !s.is_empty())
		.or_else(|| identity_store.get_fw_signature(device.slave_id(), port_path).map(str::to_string));

	let Some(fw_signature) = fw_signature else {
		return Ok(RecoverOutcome::UnknownSignature);
	};

	let request = if manifest.is_some() {
		VersionRequest::Release
	} else {
		VersionRequest::Latest(Some("master".to_string()))
	};

	let artifact = do_download(cache, manifest, suite, &fw_signature, Mode::Firmware, &request)?;
	let wbfw_bytes = std::fs::read(&artifact.local_path)?;
	let wbfw = Wbfw::parse(&wbfw_bytes)?;

	let mut confirm = AlwaysAllow;
	let flash_request = FlashRequest { target: UpdateTarget::Firmware, artifact: &wbfw, force: true };
	do_flash(device, &flash_request, None, &mut confirm, on_progress)?;

	Ok(RecoverOutcome::Flashed)
}

struct AlwaysAllow;

impl UserDataConfirm for AlwaysAllow
{
	fn confirm_may_erase_user_data(&mut self) -> bool
	{
		true
	}

	fn confirm_major_bump(&mut self, _actual: &Version, _provided: &Version) -> bool
	{
		true
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn v(major: u32, minor: u32, patch: u32) -> Version
	{
		Version::new(major, minor, patch)
	}

	#[test]
	fn equal_without_force_skips_as_is_actual()
	{
		let decision = is_reflash_necessary(&v(1, 2, 3), &v(1, 2, 3), false, false);
		assert!(!decision.do_flash);
		assert_eq!(decision.skip_reason, Some(SkipReason::IsActual));
	}

	#[test]
	fn equal_with_force_flashes_with_no_skip_reason()
	{
		let decision = is_reflash_necessary(&v(1, 2, 3), &v(1, 2, 3), true, false);
		assert!(decision.do_flash);
		assert_eq!(decision.skip_reason, None);
	}

	#[test]
	fn newer_provided_flashes()
	{
		let decision = is_reflash_necessary(&v(1, 2, 3), &v(1, 2, 4), false, false);
		assert!(decision.do_flash);
	}

	#[test]
	fn older_provided_without_allow_downgrade_skips_gone_ahead()
	{
		let decision = is_reflash_necessary(&v(1, 2, 4), &v(1, 2, 3), false, false);
		assert!(!decision.do_flash);
		assert_eq!(decision.skip_reason, Some(SkipReason::GoneAhead));
	}

	#[test]
	fn older_provided_with_allow_downgrade_flashes()
	{
		let decision = is_reflash_necessary(&v(1, 2, 4), &v(1, 2, 3), false, true);
		assert!(decision.do_flash);
		assert_eq!(decision.skip_reason, None);
	}

	#[test]
	fn major_bump_requires_confirmation_unless_forced()
	{
		let decision = is_reflash_necessary(&v(1, 9, 9), &v(2, 0, 0), false, false);
		assert!(decision.do_flash);
		assert!(decision.needs_major_bump_confirmation);

		let forced = is_reflash_necessary(&v(1, 9, 9), &v(2, 0, 0), true, false);
		assert!(forced.do_flash);
		assert!(!forced.needs_major_bump_confirmation);
	}

	#[test]
	fn bootloader_downgrade_is_never_allowed()
	{
		assert!(!is_bootloader_downgrade_allowed(&v(1, 2, 4), &v(1, 2, 3)));
		assert!(is_bootloader_downgrade_allowed(&v(1, 2, 3), &v(1, 2, 4)));
		assert!(is_bootloader_downgrade_allowed(&v(1, 2, 3), &v(1, 2, 3)));
	}
}
