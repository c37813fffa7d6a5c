//! PID file management for ensuring a single daemon instance.
//!
//! A PID file naming a live process blocks startup. A file naming a dead
//! process, or holding garbage, is treated as stale and replaced.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("another daemon instance is already running with PID {pid} (PID file: {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },
    #[error("failed to write PID file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove PID file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Manages PID file operations for single-instance enforcement.
///
/// The file is removed on drop, but only by the manager that created it.
pub struct PidManager {
    pid_file_path: PathBuf,
    held: AtomicBool,
}

impl PidManager {
    pub fn new<P: AsRef<Path>>(pid_file_path: P) -> Self {
        Self {
            pid_file_path: pid_file_path.as_ref().to_path_buf(),
            held: AtomicBool::new(false),
        }
    }

    /// Writes the current process ID to the PID file.
    /// Fails if the file names another process that is still alive.
    pub fn acquire_lock(&self) -> Result<(), PidFileError> {
        if self.pid_file_path.exists() {
            match self.read_existing_pid() {
                Some(pid) if is_process_running(pid) => {
                    return Err(PidFileError::AlreadyRunning {
                        pid,
                        path: self.pid_file_path.clone(),
                    });
                }
                Some(pid) => {
                    info!("Found stale PID file for non-running process {}. Cleaning up...", pid);
                    self.cleanup_stale_pid()?;
                }
                None => {
                    warn!(
                        "Could not read PID from {}. Treating it as stale.",
                        self.pid_file_path.display()
                    );
                    self.cleanup_stale_pid()?;
                }
            }
        }

        let write_err = |source| PidFileError::Write {
            path: self.pid_file_path.clone(),
            source,
        };

        if let Some(parent) = self.pid_file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let current_pid = process::id();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.pid_file_path)
            .map_err(write_err)?;
        write!(file, "{}", current_pid).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        self.held.store(true, Ordering::SeqCst);
        info!(
            "PID file created: {} (PID: {})",
            self.pid_file_path.display(),
            current_pid
        );
        Ok(())
    }

    /// Removes the PID file if this manager created it.
    pub fn release_lock(&self) -> Result<(), PidFileError> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match fs::remove_file(&self.pid_file_path) {
            Ok(()) => {
                info!("PID file removed: {}", self.pid_file_path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Remove {
                path: self.pid_file_path.clone(),
                source,
            }),
        }
    }

    /// True if the PID file names a live process.
    pub fn is_running(&self) -> bool {
        self.read_existing_pid().is_some_and(is_process_running)
    }

    fn cleanup_stale_pid(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.pid_file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Remove {
                path: self.pid_file_path.clone(),
                source,
            }),
        }
    }

    fn read_existing_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid_file_path)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn pid_file_path(&self) -> &Path {
        &self.pid_file_path
    }
}

/// Probes with signal 0. Anything but ESRCH means the process exists.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

impl Drop for PidManager {
    fn drop(&mut self) {
        if let Err(e) = self.release_lock() {
            warn!("Failed to release PID lock during cleanup: {}", e);
        }
    }
}
