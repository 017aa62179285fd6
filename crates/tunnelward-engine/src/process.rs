//! Low-level process helpers: liveness, signals, PID files, binary lookup

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::store::{remove_if_exists, write_atomic};

/// Signals the supervisor sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to exit
    Terminate,
    /// Force the process to exit
    Kill,
}

/// Check if a process exists
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks permission/existence; EPERM still means "exists"
    let rc = unsafe { libc::kill(pid, 0) };
    let exists = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

/// An exited child nobody has reaped yet still answers signal 0
#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // state follows the parenthesized command name
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .map(|state| state == 'Z' || state == 'X')
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: i32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Send a signal; a process that is already gone is not an error
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| EngineError::Process(format!("invalid pid {}", pid)))?;

    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };

    let rc = unsafe { libc::kill(pid, signo) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("Process {} already gone", pid);
        return Ok(());
    }
    Err(EngineError::Process(format!(
        "failed to send {:?} to {}: {}",
        signal, pid, err
    )))
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    Err(EngineError::Process(format!(
        "sending {:?} to {} is not supported on this platform",
        signal, pid
    )))
}

/// Read a PID record; unparsable content counts as no record
pub fn read_pid_file(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!("Ignoring malformed PID file {:?}", path);
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::storage(path, e)),
    }
}

pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    write_atomic(path, pid.to_string().as_bytes())
}

pub fn remove_pid_file(path: &Path) -> Result<()> {
    remove_if_exists(path)
}

/// First existing executable in the ordered search path
pub fn locate_binary(search_paths: &[PathBuf]) -> Result<PathBuf> {
    for path in search_paths {
        if is_executable(path) {
            debug!("Found tunnel client binary at {:?}", path);
            return Ok(path.clone());
        }
    }

    Err(EngineError::BinaryNotFound {
        searched: search_paths.to_vec(),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Arguments of a running process, read from `/proc/<pid>/cmdline`
#[cfg(target_os = "linux")]
fn command_line(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect(),
    )
}

fn has_config_arg(args: &[String], config_path: &Path) -> bool {
    let config = config_path.to_string_lossy();
    args.windows(2)
        .any(|pair| pair[0] == "-c" && pair[1] == config.as_ref())
}

/// Whether `pid` is a tunnel client launched as `<bin> -c <config_path>`
#[cfg(target_os = "linux")]
pub fn runs_with_config(pid: u32, config_path: &Path) -> bool {
    command_line(pid)
        .map(|args| has_config_arg(&args, config_path))
        .unwrap_or(false)
}

/// Without `/proc` there is no command line to check, so any live PID passes
#[cfg(not(target_os = "linux"))]
pub fn runs_with_config(_pid: u32, _config_path: &Path) -> bool {
    true
}

/// PIDs of tunnel clients running with `-c <config_path>` (Linux `/proc` scan)
///
/// Used to sweep tunnel clients orphaned by an earlier engine instance.
#[cfg(target_os = "linux")]
pub fn find_client_processes(config_path: &Path) -> Vec<u32> {
    let own_pid = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own_pid)
        .filter(|pid| process_exists(*pid) && runs_with_config(*pid, config_path))
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn find_client_processes(_config_path: &Path) -> Vec<u32> {
    Vec::new()
}
