// SPDX-License-Identifier: MIT OR Apache-2.0
//! Serial-port arbitration: discovers and temporarily suspends co-resident
//! processes holding the port, captures and restores kernel termios, and
//! guarantees release of both even on panic via scoped acquisition.

use std::path::Path;

use crate::error::{Error, ErrorKind};

/// The default driver process name, excluded from the "unexpected holder" set.
pub const DEFAULT_DRIVER_PROCESS_NAME: &str = "wb-mqtt-serial";

/// A process holding the serial device node open.
#[derive(Debug, Clone)]
pub struct PortHolder
{
	pub pid: i32,
	pub process_name: String,
}

/// Enumerates processes with a file descriptor open on `port_path`, the way
/// `fuser` does: scan `/proc/*/fd` for symlinks resolving to the device node.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn find_holders(port_path: &Path) -> Result<Vec<PortHolder>, Error>
{
	let target = std::fs::canonicalize(port_path).unwrap_or_else(|_| port_path.to_path_buf());
	let mut holders = Vec::new();

	let proc_entries = match std::fs::read_dir("/proc") {
		Ok(entries) => entries,
		Err(e) => {
			log::warn!("could not enumerate /proc to find port holders: {e}");
			return Ok(holders);
		},
	};

	for entry in proc_entries.flatten() {
		let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
			continue;
		};

		let fd_dir = entry.path().join("fd");
		let Ok(fds) = std::fs::read_dir(&fd_dir) else {
			continue;
		};

		for fd in fds.flatten() {
			if std::fs::read_link(fd.path()).map(|link| link == target).unwrap_or(false) {
				let process_name = std::fs::read_to_string(entry.path().join("comm"))
					.unwrap_or_default()
					.trim()
					.to_string();
				holders.push(PortHolder { pid, process_name });
				break;
			}
		}
	}

	Ok(holders)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn find_holders(_port_path: &Path) -> Result<Vec<PortHolder>, Error>
{
	// /proc-based fd scanning is Linux/Android-specific; other platforms have
	// no equivalent wired up here.
	Ok(Vec::new())
}

fn signal_all(holders: &[PortHolder], signal: libc::c_int)
{
	for holder in holders {
		// SAFETY: kill() with a process-suspend/resume signal on a pid we just
		// enumerated from /proc is the same hazard `kill(1)` accepts: the pid
		// may have already exited, in which case this is a harmless ESRCH.
		let result = unsafe { libc::kill(holder.pid, signal) };
		if result != 0 {
			log::debug!("signal {signal} to pid {} ({}) failed: {}", holder.pid, holder.process_name, std::io::Error::last_os_error());
		}
	}
}

/// Captured termios state of a device node, restored on drop of the guard
/// that captured it.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
struct TermiosSnapshot
{
	fd: std::os::unix::io::RawFd,
	original: termios::Termios,
	_file: std::fs::File,
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
impl TermiosSnapshot
{
	fn capture(port_path: &Path) -> Result<Self, Error>
	{
		use std::os::unix::io::AsRawFd;

		let file = std::fs::OpenOptions::new().read(true).write(true).open(port_path)?;
		let fd = file.as_raw_fd();
		let original = termios::Termios::from_fd(fd).map_err(Error::from)?;

		Ok(Self { fd, original, _file: file })
	}

	fn restore(&self)
	{
		if let Err(e) = termios::tcsetattr(self.fd, termios::TCSANOW, &self.original) {
			log::warn!("failed to restore termios for serial port: {e}");
		}
	}
}

/// Scoped guard over an arbitrated serial port: on drop, restores termios
/// and resumes every suspended holder, regardless of how the scope was
/// exited (including panic/early return via `?`).
pub struct PortArbiter
{
	holders: Vec<PortHolder>,
	#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
	termios: Option<TermiosSnapshot>,
}

impl PortArbiter
{
	/// Acquires exclusive use of `port_path`:
	/// 1. enumerates holders, filtering out [DEFAULT_DRIVER_PROCESS_NAME],
	/// 2. if any unexpected holder remains and `force` is false, asks
	///    `confirm` (bypassable with `force`); declining aborts,
	/// 3. sends a stop-like signal (`SIGSTOP`) to every holder,
	/// 4. captures kernel termios of the device node.
	pub fn acquire(port_path: &Path, force: bool, mut confirm: impl FnMut(&[PortHolder]) -> bool) -> Result<Self, Error>
	{
		let all_holders = find_holders(port_path)?;
		let unexpected: Vec<PortHolder> =
			all_holders.into_iter().filter(|h| h.process_name != DEFAULT_DRIVER_PROCESS_NAME).collect();

		if !unexpected.is_empty() && !force && !confirm(&unexpected) {
			let names: Vec<String> = unexpected.iter().map(|h| format!("{} (pid {})", h.process_name, h.pid)).collect();
			return Err(ErrorKind::ConfigParsing(format!("port is held by: {}", names.join(", "))).error());
		}

		signal_all(&unexpected, libc::SIGSTOP);

		#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
		let termios = match TermiosSnapshot::capture(port_path) {
			Ok(snapshot) => Some(snapshot),
			Err(e) => {
				log::warn!("could not capture termios for {}: {}", port_path.display(), e);
				None
			},
		};

		Ok(Self {
			holders: unexpected,
			#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
			termios,
		})
	}
}

impl Drop for PortArbiter
{
	fn drop(&mut self)
	{
		#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
		if let Some(termios) = &self.termios {
			termios.restore();
		}

		signal_all(&self.holders, libc::SIGCONT);
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn default_driver_process_is_filtered_from_unexpected_set()
	{
		let holders = vec![
			PortHolder { pid: 1, process_name: DEFAULT_DRIVER_PROCESS_NAME.to_string() },
			PortHolder { pid: 2, process_name: "minicom".to_string() },
		];
		let unexpected: Vec<_> = holders.into_iter().filter(|h| h.process_name != DEFAULT_DRIVER_PROCESS_NAME).collect();
		assert_eq!(unexpected.len(), 1);
		assert_eq!(unexpected[0].process_name, "minicom");
	}
}
