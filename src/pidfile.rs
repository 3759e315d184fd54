//! Process-identity file.
//!
//! The file holds the daemon's PID as plain text. "Running" means the file
//! exists and names a live process.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use tracing::warn;

pub fn write(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {}", parent.display()))?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Failed to write PID file: {}", path.display()))
}

/// PID recorded in `path`, or `None` when the file is absent.
pub fn read(path: &Path) -> Result<Option<i32>> {
    let Some(content) = read_content(path)? else {
        return Ok(None);
    };
    let pid = content
        .trim()
        .parse()
        .with_context(|| format!("PID file {} is malformed", path.display()))?;
    Ok(Some(pid))
}

fn read_content(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read PID file: {}", path.display())),
    }
}

/// Remove the PID file. A missing file is not an error.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove PID file: {}", path.display())),
    }
}

/// Liveness check: signal 0 to `pid`. `EPERM` means the process exists but
/// belongs to someone else.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// PID of the running daemon, if the file names a live process.
///
/// A file that does not hold a PID (empty or truncated after a crash) is
/// stale, the same as one naming a dead process.
pub fn running_pid(path: &Path) -> Result<Option<i32>> {
    let Some(content) = read_content(path)? else {
        return Ok(None);
    };
    match content.trim().parse::<i32>() {
        Ok(pid) => Ok(Some(pid).filter(|&pid| is_alive(pid))),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed PID file");
            Ok(None)
        }
    }
}

/// Ask the daemon named in `path` to shut down gracefully.
pub fn signal_stop(path: &Path) -> Result<i32> {
    let pid = running_pid(path)?.context("daemon is not running")?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("Failed to send SIGTERM to {pid}"))?;
    Ok(pid)
}
