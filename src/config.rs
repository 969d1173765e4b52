// SPDX-License-Identifier: MIT OR Apache-2.0
//! Explicit immutable configuration, resolved once at startup from defaults,
//! environment variables, and CLI flags. No global mutable state.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

/// Non-empty `WBGSM_INTERACTIVE` means treat stdin as interactive for
/// bootloader-update prompts, regardless of whether it's actually a tty —
/// useful for forcing prompts on in scripted-but-attended sessions.
const INTERACTIVE_ENV_VAR: &str = "WBGSM_INTERACTIVE";

pub const DEFAULT_DRIVER_CONFIG_PATH: &str = "/etc/wb-mqtt-serial.conf";
pub const DEFAULT_SUITE: &str = "stable";

/// Process-wide configuration, built once in `main` and threaded through
/// every constructor that needs it — replaces what used to be a global
/// configuration dictionary.
#[derive(Debug, Clone)]
pub struct Config
{
	pub driver_config_path: PathBuf,
	pub cache_dir: PathBuf,
	pub identity_store_path: PathBuf,
	pub suite: String,
	pub interactive: bool,
	pub minimal_response_timeout: Duration,
}

impl Config
{
	/// Resolves defaults (via [ProjectDirs]), then environment overrides.
	/// CLI flags are applied afterwards by the binary, via [Config::with_*]
	/// builder methods, so flag parsing never has to know about env vars.
	pub fn resolve() -> Self
	{
		let project_dirs = ProjectDirs::from("com", "wirenboard", "wb-fw-updater");
		let cache_dir = project_dirs
			.as_ref()
			.map(|d| d.cache_dir().to_path_buf())
			.unwrap_or_else(|| PathBuf::from("/var/cache/wb-fw-updater"));

		let interactive = is_stdin_tty() || std::env::var_os(INTERACTIVE_ENV_VAR).map(|v| !v.is_empty()).unwrap_or(false);

		Self {
			driver_config_path: PathBuf::from(DEFAULT_DRIVER_CONFIG_PATH),
			identity_store_path: cache_dir.join("identity_store.json"),
			cache_dir,
			suite: DEFAULT_SUITE.to_string(),
			interactive,
			minimal_response_timeout: Duration::from_millis(500),
		}
	}

	pub fn with_driver_config_path(mut self, path: PathBuf) -> Self
	{
		self.driver_config_path = path;
		self
	}

	pub fn with_cache_dir(mut self, path: PathBuf) -> Self
	{
		self.identity_store_path = path.join("identity_store.json");
		self.cache_dir = path;
		self
	}

	pub fn with_minimal_response_timeout(mut self, timeout: Duration) -> Self
	{
		self.minimal_response_timeout = timeout;
		self
	}

	pub fn with_force_interactive(mut self, interactive: bool) -> Self
	{
		self.interactive = interactive;
		self
	}
}

#[cfg(unix)]
fn is_stdin_tty() -> bool
{
	// SAFETY: isatty(3) on a standard, always-open file descriptor (stdin)
	// has no preconditions beyond the fd being valid, which 0 always is.
	unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

#[cfg(not(unix))]
fn is_stdin_tty() -> bool
{
	false
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn resolve_sets_identity_store_path_inside_cache_dir()
	{
		let config = Config::resolve();
		assert_eq!(config.identity_store_path, config.cache_dir.join("identity_store.json"));
	}

	#[test]
	fn with_cache_dir_moves_identity_store_path_too()
	{
		let config = Config::resolve().with_cache_dir(PathBuf::from("/tmp/some-other-cache"));
		assert_eq!(config.identity_store_path, PathBuf::from("/tmp/some-other-cache/identity_store.json"));
	}
}
