// SPDX-License-Identifier: MIT OR Apache-2.0
//! `update-bl` subcommand: explicitly update just one device's bootloader.

use std::process::ExitCode;

use color_eyre::eyre::Result;

use super::{ModeArg, UpdateBlParams, UpdateParams};
use wb_fw_updater::config::Config;

/// `update-bl` is `update --mode bootloader` with its own flag surface (no
/// `--allow-downgrade`/`--erase-*`, since a bootloader downgrade is never
/// permitted and erasing settings is a firmware-side concept).
pub fn run(config: &Config, params: UpdateBlParams) -> Result<ExitCode>
{
	let update_params = UpdateParams {
		port: params.port,
		slave_id: params.slave_id,
		uart_settings: params.uart_settings,
		version: params.version,
		branch: params.branch,
		mode: ModeArg::Bootloader,
		force: params.force,
		allow_downgrade: false,
		erase_settings: false,
		erase_uart_only: false,
		foregoing_noise_cancelling: params.foregoing_noise_cancelling,
	};

	super::update::run(config, update_params)
}
