// SPDX-License-Identifier: MIT OR Apache-2.0
//! `recover-all` subcommand: scan the driver configuration and recover every
//! device found stuck in bootloader.

use std::path::Path;
use std::process::ExitCode;

use color_eyre::eyre::{eyre, Result};

use wb_fw_updater::download::DownloadCache;
use wb_fw_updater::driver_config;
use wb_fw_updater::identity_store::IdentityStore;
use wb_fw_updater::orchestrator::{self, RecoverOutcome};
use wb_fw_updater::port_arbiter::PortArbiter;
use wb_fw_updater::prober::{self, ProbeOutcome};

use super::UpdateAllParams;
use wb_fw_updater::config::Config;

pub fn run(config: &Config, params: UpdateAllParams) -> Result<ExitCode>
{
	let driver_config = driver_config::load(&config.driver_config_path).map_err(|e| eyre!(e))?;
	let targets = prober::resolve_targets(&driver_config, params.minimal_response_timeout()).map_err(|e| eyre!(e))?;

	let mut identity_store = IdentityStore::load(&config.identity_store_path, wb_fw_updater::identity_store::DEFAULT_MAX_RECORDS);
	let outcomes = prober::probe_all_devices(&targets, &mut identity_store);

	let cache = DownloadCache::new(&config.cache_dir);

	let mut recovered = 0usize;
	let mut unknown = 0usize;
	let mut failed = 0usize;

	for (target, (device_name, outcome)) in targets.iter().zip(outcomes.into_iter()) {
		let ProbeOutcome::InBootloader { mut device } = outcome else {
			continue;
		};

		let _arbiter = match PortArbiter::acquire(Path::new(&target.port_path), params.force, |_| params.force) {
			Ok(a) => a,
			Err(e) => {
				log::error!("could not arbitrate {} to recover {}: {}", target.port_path, device_name, e);
				failed += 1;
				continue;
			},
		};

		let bar = crate::cli_commands::new_flash_progress_bar();
		let mut on_progress = crate::cli_commands::flash_progress_callback(bar.clone());
		let result = orchestrator::recover_device_iteration(
			&mut device,
			&target.port_path,
			&identity_store,
			&cache,
			None,
			&config.suite,
			&mut on_progress,
		);
		bar.finish_and_clear();

		match result {
			Ok(RecoverOutcome::Flashed) => {
				log::info!("recovered {} (slave {}, {})", device_name, target.slave_id, target.port_path);
				recovered += 1;
			},
			Ok(RecoverOutcome::UnknownSignature) => {
				log::warn!("{} (slave {}, {}) is in bootloader with no known firmware signature", device_name, target.slave_id, target.port_path);
				unknown += 1;
			},
			Err(e) => {
				log::error!("failed to recover {} (slave {}, {}): {}", device_name, target.slave_id, target.port_path, e);
				failed += 1;
			},
		}
	}

	if let Err(e) = identity_store.dump() {
		log::warn!("failed to persist identity store: {e}");
	}

	log::info!("recover-all complete: {recovered} recovered, {unknown} unknown signature, {failed} failed");
	Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
