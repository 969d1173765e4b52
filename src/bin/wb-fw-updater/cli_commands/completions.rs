// SPDX-License-Identifier: MIT OR Apache-2.0
//! `completions` subcommand: emit a shell completion script to stdout.

use std::io;
use std::process::ExitCode;

use clap::CommandFactory;
use clap_complete::{generate, Shell};
use color_eyre::eyre::Result;

use super::CliArguments;

pub fn run(shell: Shell) -> Result<ExitCode>
{
	let mut command = CliArguments::command();
	let name = command.get_name().to_string();
	generate(shell, &mut command, name, &mut io::stdout());
	Ok(ExitCode::SUCCESS)
}
