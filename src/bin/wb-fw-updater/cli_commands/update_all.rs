// SPDX-License-Identifier: MIT OR Apache-2.0
//! `update-all` subcommand: scan the driver configuration and update every
//! eligible device in turn.

use std::process::ExitCode;

use color_eyre::eyre::{eyre, Result};
use dialoguer::Confirm;

use wb_fw_updater::device::Device;
use wb_fw_updater::download::DownloadCache;
use wb_fw_updater::driver_config;
use wb_fw_updater::identity_store::IdentityStore;
use wb_fw_updater::orchestrator::{self, FlashRequest, UpdateTarget, UserDataConfirm, VersionRequest};
use wb_fw_updater::port_arbiter::PortArbiter;
use wb_fw_updater::prober::{self, ProbeOutcome};
use wb_fw_updater::release::ReleaseManifest;
use wb_fw_updater::wbfw::Wbfw;

use super::UpdateAllParams;
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
		Confirm::new().with_prompt("This update may erase existing user data on the device. Continue?").default(false).interact().unwrap_or(false)
	}

	fn confirm_major_bump(&mut self, actual: &wb_fw_updater::version::Version, provided: &wb_fw_updater::version::Version) -> bool
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

fn load_manifest_best_effort(_suite: &str) -> Option<ReleaseManifest>
{
	None
}

pub fn run(config: &Config, params: UpdateAllParams) -> Result<ExitCode>
{
	let driver_config = driver_config::load(&config.driver_config_path).map_err(|e| eyre!(e))?;
	let targets = prober::resolve_targets(&driver_config, params.minimal_response_timeout()).map_err(|e| eyre!(e))?;

	let mut identity_store = IdentityStore::load(&config.identity_store_path, wb_fw_updater::identity_store::DEFAULT_MAX_RECORDS);
	let outcomes = prober::probe_all_devices(&targets, &mut identity_store);
	if let Err(e) = identity_store.dump() {
		log::warn!("failed to persist identity store: {e}");
	}

	let cache = DownloadCache::new(&config.cache_dir);
	let manifest = load_manifest_best_effort(&config.suite);

	let mut updated = 0usize;
	let mut skipped = 0usize;
	let mut failed = 0usize;

	for (target, (device_name, outcome)) in targets.iter().zip(outcomes.into_iter()) {
		let ProbeOutcome::Alive { mut device, identity } = outcome else {
			log::info!("{} ({}, {}) is {}, skipping", device_name, target.slave_id, target.port_path, outcome.label());
			skipped += 1;
			continue;
		};

		match update_one(config, &mut device, &identity.fw_signature, manifest.as_ref(), &cache, params.force, params.allow_downgrade) {
			Ok(true) => updated += 1,
			Ok(false) => skipped += 1,
			Err(e) => {
				log::error!("failed to update {} ({}, {}): {}", device_name, target.slave_id, target.port_path, e);
				failed += 1;
			},
		}
	}

	log::info!("update-all complete: {updated} updated, {skipped} skipped, {failed} failed");
	Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn update_one(
	config: &Config,
	device: &mut Device,
	fw_signature: &str,
	manifest: Option<&ReleaseManifest>,
	cache: &DownloadCache,
	force: bool,
	allow_downgrade: bool,
) -> Result<bool>
{
	let port_path = device.port_path().to_string();
	let _arbiter = PortArbiter::acquire(std::path::Path::new(&port_path), force, |_| force).map_err(|e| eyre!(e))?;

	let actual_version: wb_fw_updater::version::Version = device.fw_version().map_err(|e| eyre!(e))?.parse().map_err(|e| eyre!(e))?;

	let request = if manifest.is_some() { VersionRequest::Release } else { VersionRequest::Latest(None) };
	let artifact =
		orchestrator::do_download(cache, manifest, &config.suite, fw_signature, wb_fw_updater::download::Mode::Firmware, &request)
			.map_err(|e| eyre!(e))?;

	let wbfw_bytes = std::fs::read(&artifact.local_path)?;
	let wbfw = Wbfw::parse(&wbfw_bytes).map_err(|e| eyre!(e))?;
	let provided_version: wb_fw_updater::version::Version = artifact
		.local_path
		.file_stem()
		.and_then(|s| s.to_str())
		.and_then(|s| s.parse().ok())
		.unwrap_or_else(|| actual_version.clone());

	let decision = orchestrator::is_reflash_necessary(&actual_version, &provided_version, force, allow_downgrade);
	if !decision.do_flash {
		log::info!("slave {} on {}: {:?}, skipping", device.slave_id(), port_path, decision.skip_reason);
		return Ok(false);
	}

	let mut confirm = InteractiveConfirm { interactive: config.interactive };
	if decision.needs_major_bump_confirmation && !confirm.confirm_major_bump(&actual_version, &provided_version) {
		log::warn!("slave {} on {}: major bump declined, skipping", device.slave_id(), port_path);
		return Ok(false);
	}

	let flash_request = FlashRequest { target: UpdateTarget::Firmware, artifact: &wbfw, force };
	let bar = crate::cli_commands::new_flash_progress_bar();
	let mut on_progress = crate::cli_commands::flash_progress_callback(bar.clone());
	orchestrator::do_flash(device, &flash_request, None, &mut confirm, &mut on_progress).map_err(|e| eyre!(e))?;
	bar.finish_and_clear();

	log::info!("updated slave {} on {} to {}", device.slave_id(), port_path, provided_version);
	Ok(true)
}
