// SPDX-License-Identifier: MIT OR Apache-2.0
//! `recover` subcommand: recover a single device stuck in bootloader.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};

use wb_fw_updater::device::Device;
use wb_fw_updater::download::DownloadCache;
use wb_fw_updater::identity_store::IdentityStore;
use wb_fw_updater::orchestrator::{self, RecoverOutcome};
use wb_fw_updater::port_arbiter::PortArbiter;
use wb_fw_updater::transport::SerialSettings;

use super::{exit_code, parse_uart_settings, RecoverParams};
use wb_fw_updater::config::Config;

pub fn run(config: &Config, params: RecoverParams) -> Result<ExitCode>
{
	let response_timeout = Duration::from_millis(2000).max(config.minimal_response_timeout);
	let port_path = Path::new(&params.update.port);

	let _arbiter = PortArbiter::acquire(port_path, params.update.force, |_| params.update.force).map_err(|e| eyre!(e))?;

	let settings = match &params.update.uart_settings {
		Some(raw) => parse_uart_settings(raw).map_err(|e| eyre!(e))?,
		None => SerialSettings::bootloader_default(),
	};

	let mut device = Device::new(&params.update.port, params.update.slave_id, settings, response_timeout).map_err(|e| eyre!(e))?;
	device.instrument().set_foregoing_noise_cancelling(params.update.foregoing_noise_cancelling);

	if !matches!(device.is_in_bootloader(), Ok(true)) {
		log::error!("device {} on {} does not appear to be in bootloader", params.update.slave_id, params.update.port);
		return Ok(exit_code::GENERIC_FAILURE);
	}

	let mut identity_store = IdentityStore::load(&config.identity_store_path, wb_fw_updater::identity_store::DEFAULT_MAX_RECORDS);
	let cache = DownloadCache::new(&config.cache_dir);

	// `--fw-sig`/`--model` bypass the device's own (absent, since it's in
	// bootloader) signature report by seeding the identity store, which
	// `recover_device_iteration` already consults as its fallback source.
	if let Some(fw_sig) = &params.fw_sig {
		identity_store.save(params.update.slave_id, &params.update.port, fw_sig);
	} else if let Some(model) = &params.model {
		log::warn!("--model {model} given but no model-to-signature table is wired up; falling back to the identity store");
	}

	let bar = crate::cli_commands::new_flash_progress_bar();
	let mut on_progress = crate::cli_commands::flash_progress_callback(bar.clone());
	let outcome = orchestrator::recover_device_iteration(
		&mut device,
		&params.update.port,
		&identity_store,
		&cache,
		None,
		&config.suite,
		&mut on_progress,
	)
	.map_err(|e| eyre!(e))?;
	bar.finish_and_clear();

	if let Err(e) = identity_store.dump() {
		log::warn!("failed to persist identity store: {e}");
	}

	match outcome {
		RecoverOutcome::Flashed => {
			log::info!("recovered slave {} on {}", params.update.slave_id, params.update.port);
			Ok(ExitCode::SUCCESS)
		},
		RecoverOutcome::UnknownSignature => {
			log::error!(
				"could not determine a firmware signature for slave {} on {} (no bootloader-reported signature, no identity-store record, and no --fw-sig/--model given)",
				params.update.slave_id,
				params.update.port
			);
			Ok(exit_code::GENERIC_FAILURE)
		},
	}
}

