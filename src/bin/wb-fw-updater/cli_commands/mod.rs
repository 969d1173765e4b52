// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI argument definitions and per-subcommand entry points.

pub mod completions;
pub mod recover;
pub mod recover_all;
pub mod update;
pub mod update_all;
pub mod update_bl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Exit codes reserved for classified per-device outcomes, per a
/// single-device command landing on a bucket the prober assigned.
pub mod exit_code
{
	use std::process::ExitCode;

	pub const SUCCESS: ExitCode = ExitCode::SUCCESS;
	pub const GENERIC_FAILURE: ExitCode = ExitCode::FAILURE;
	pub const DISCONNECTED: ExitCode = ExitCode::from(2);
	pub const IN_BOOTLOADER: ExitCode = ExitCode::from(3);
	pub const FOREIGN: ExitCode = ExitCode::from(4);
	pub const TOO_OLD: ExitCode = ExitCode::from(5);
}

#[derive(Debug, Parser)]
#[command(
	name = "wb-fw-updater",
	about = "Field firmware/bootloader update orchestrator for Wiren Board Modbus-RTU devices",
	version,
	styles(style())
)]
pub struct CliArguments
{
	#[command(subcommand)]
	pub command: ToplevelCommands,

	/// Path to the driver configuration JSON (default: /etc/wb-mqtt-serial.conf).
	#[arg(long, global = true)]
	pub driver_config: Option<PathBuf>,

	/// Override the download cache / identity store directory.
	#[arg(long, global = true)]
	pub cache_dir: Option<PathBuf>,

	/// Increase log verbosity; repeat for more (-v info, -vv debug, -vvv trace).
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum ToplevelCommands
{
	/// Update a single device's firmware or bootloader.
	Update(UpdateParams),
	/// Recover a single device stuck in bootloader.
	Recover(RecoverParams),
	/// Scan the driver config and update every eligible device.
	UpdateAll(UpdateAllParams),
	/// Scan the driver config and recover every device stuck in bootloader.
	RecoverAll(UpdateAllParams),
	/// Explicitly update just the bootloader for one device.
	UpdateBl(UpdateBlParams),
	/// Generate shell completion scripts.
	Completions
	{
		shell: Shell,
	},
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ModeArg
{
	Fw,
	Bootloader,
}

impl From<ModeArg> for wb_fw_updater::download::Mode
{
	fn from(other: ModeArg) -> Self
	{
		match other {
			ModeArg::Fw => wb_fw_updater::download::Mode::Firmware,
			ModeArg::Bootloader => wb_fw_updater::download::Mode::Bootloader,
		}
	}
}

#[derive(Debug, clap::Args)]
pub struct UpdateParams
{
	/// Serial port device node, e.g. /dev/ttyRS485-1.
	#[arg(long)]
	pub port: String,

	/// Modbus slave id of the target device.
	#[arg(long)]
	pub slave_id: u8,

	/// Known UART settings, e.g. 9600N2. Skips auto-discovery when given.
	#[arg(long)]
	pub uart_settings: Option<String>,

	/// Version to flash: "release", "latest", or an explicit version string.
	#[arg(long, default_value = "release")]
	pub version: String,

	/// Unstable branch to resolve "release"/"latest" against.
	#[arg(long)]
	pub branch: Option<String>,

	#[arg(long, value_enum, default_value = "fw")]
	pub mode: ModeArg,

	/// Flash even if the device already reports the requested version, and
	/// bypass the major-version-bump confirmation.
	#[arg(long)]
	pub force: bool,

	/// Allow flashing an older firmware version than the device currently runs.
	#[arg(long)]
	pub allow_downgrade: bool,

	/// Erase all device settings (UART and beyond) after flashing.
	#[arg(long)]
	pub erase_settings: bool,

	/// Erase only UART settings after flashing.
	#[arg(long)]
	pub erase_uart_only: bool,

	/// Forego the bus-noise-cancelling delay `wb_modbus` normally inserts
	/// before reading a response.
	#[arg(long)]
	pub foregoing_noise_cancelling: bool,
}

#[derive(Debug, clap::Args)]
pub struct RecoverParams
{
	#[command(flatten)]
	pub update: UpdateParams,

	/// Bypass the identity store with an explicit firmware signature.
	#[arg(long)]
	pub fw_sig: Option<String>,

	/// Resolve a firmware signature from a device model name instead.
	#[arg(long)]
	pub model: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct UpdateAllParams
{
	/// Flash even if a device already reports the requested version.
	#[arg(long)]
	pub force: bool,

	/// Allow flashing an older firmware version than a device currently runs.
	#[arg(long)]
	pub allow_downgrade: bool,

	/// Minimum per-device response timeout floor, in milliseconds.
	#[arg(long, default_value_t = 500)]
	pub minimal_response_timeout_ms: u64,
}

impl UpdateAllParams
{
	pub fn minimal_response_timeout(&self) -> Duration
	{
		Duration::from_millis(self.minimal_response_timeout_ms)
	}
}

#[derive(Debug, clap::Args)]
pub struct UpdateBlParams
{
	#[arg(long)]
	pub port: String,

	#[arg(long)]
	pub slave_id: u8,

	#[arg(long)]
	pub uart_settings: Option<String>,

	#[arg(long, default_value = "release")]
	pub version: String,

	#[arg(long)]
	pub branch: Option<String>,

	#[arg(long)]
	pub force: bool,

	/// Forego the bus-noise-cancelling delay `wb_modbus` normally inserts
	/// before reading a response.
	#[arg(long)]
	pub foregoing_noise_cancelling: bool,
}

/// Clap v3 style (approximate)
/// See https://stackoverflow.com/a/75343828
fn style() -> clap::builder::Styles
{
	clap::builder::Styles::styled()
		.usage(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))).bold())
		.header(anstyle::Style::new().bold().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))))
		.literal(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))))
}

/// A DATA-chunk progress bar, styled like a `wide_bar` download indicator.
/// Length is set from the first [wb_fw_updater::flasher::FlashProgress]
/// callback, since the chunk count isn't known until flashing starts.
pub fn new_flash_progress_bar() -> indicatif::ProgressBar
{
	let bar = indicatif::ProgressBar::new(0);
	bar.set_style(
		indicatif::ProgressStyle::default_bar()
			.template(" {percent:>3}% |{bar:40}| chunk {pos}/{len} [{elapsed}]")
			.expect("static template is valid"),
	);
	bar
}

/// Builds an `on_progress` callback for [wb_fw_updater::orchestrator::do_flash]
/// that drives `bar`.
pub fn flash_progress_callback(bar: indicatif::ProgressBar) -> impl FnMut(wb_fw_updater::flasher::FlashProgress)
{
	move |progress| {
		if bar.length() != Some(progress.total_chunks as u64) {
			bar.set_length(progress.total_chunks as u64);
		}
		bar.set_position(progress.chunk_index as u64);
	}
}

/// Parses a compact UART settings string like `9600N2` into its components.
pub fn parse_uart_settings(raw: &str) -> Result<wb_fw_updater::transport::SerialSettings, wb_fw_updater::error::Error>
{
	use wb_fw_updater::error::ErrorKind;
	use wb_fw_updater::transport::{Parity, SerialSettings};

	let parity_index = raw
		.find(|c: char| matches!(c, 'N' | 'O' | 'E'))
		.ok_or_else(|| ErrorKind::ConfigParsing(format!("malformed uart settings {raw:?}")).error())?;

	let baudrate: u32 = raw[..parity_index]
		.parse()
		.map_err(|_| ErrorKind::ConfigParsing(format!("malformed uart settings {raw:?}")).error())?;

	let parity = match raw.as_bytes()[parity_index] {
		b'N' => Parity::None,
		b'O' => Parity::Odd,
		b'E' => Parity::Even,
		_ => unreachable!("matched by find() above"),
	};

	let stopbits: u8 = raw[parity_index + 1..]
		.parse()
		.map_err(|_| ErrorKind::ConfigParsing(format!("malformed uart settings {raw:?}")).error())?;

	SerialSettings::new(baudrate, parity, stopbits)
}

pub(crate) fn exit_for_probe_outcome(label: &str) -> ExitCode
{
	match label {
		"disconnected" => exit_code::DISCONNECTED,
		"in_bootloader" => exit_code::IN_BOOTLOADER,
		"foreign" => exit_code::FOREIGN,
		"too_old_to_update" => exit_code::TOO_OLD,
		_ => exit_code::GENERIC_FAILURE,
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parses_compact_uart_settings()
	{
		let settings = parse_uart_settings("9600N2").unwrap();
		assert_eq!(settings.baudrate, 9600);
		assert_eq!(settings.stopbits, 2);
	}

	#[test]
	fn rejects_malformed_uart_settings()
	{
		assert!(parse_uart_settings("garbage").is_err());
	}
}
