// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command-line entry point for the field firmware/bootloader update
//! orchestrator.

mod cli_commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use cli_commands::{CliArguments, ToplevelCommands};
use wb_fw_updater::config::Config;

fn install_logger(verbosity: u8)
{
	let default_level = match verbosity {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	};

	env_logger::Builder::new().filter_level(default_level.parse().unwrap_or(log::LevelFilter::Warn)).parse_default_env().init();
}

fn main() -> Result<ExitCode>
{
	color_eyre::install()?;

	let args = CliArguments::parse();
	install_logger(args.verbose);

	let mut config = Config::resolve();
	if let Some(path) = &args.driver_config {
		config = config.with_driver_config_path(path.clone());
	}
	if let Some(cache_dir) = &args.cache_dir {
		config = config.with_cache_dir(cache_dir.clone());
	}

	let outcome = match args.command {
		ToplevelCommands::Update(params) => cli_commands::update::run(&config, params),
		ToplevelCommands::Recover(params) => cli_commands::recover::run(&config, params),
		ToplevelCommands::UpdateAll(params) => cli_commands::update_all::run(&config, params),
		ToplevelCommands::RecoverAll(params) => cli_commands::recover_all::run(&config, params),
		ToplevelCommands::UpdateBl(params) => cli_commands::update_bl::run(&config, params),
		ToplevelCommands::Completions { shell } => cli_commands::completions::run(shell),
	};

	match outcome {
		Ok(code) => Ok(code),
		Err(e) => {
			log::error!("{}", e);
			Ok(ExitCode::FAILURE)
		},
	}
}
