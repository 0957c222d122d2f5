// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Data-directory pidfile and socket-file lifetime.
//!
//! The pidfile is the cluster's mutual-exclusion point: it is locked
//! before anything else touches the data directory, rewritten in full
//! only at supervisor start, and status updates are appended so readers
//! can take the last status line. A once-a-minute recheck detects
//! external deletion or takeover and self-signals an immediate shutdown.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use thiserror::Error;
use tracing::warn;

use crate::config::Config;

/// Status word recorded in the pidfile's last line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFileStatus {
    Starting,
    Ready,
    Stopping,
}

impl PidFileStatus {
    pub fn label(self) -> &'static str {
        match self {
            PidFileStatus::Starting => "starting",
            PidFileStatus::Ready => "ready",
            PidFileStatus::Stopping => "stopping",
        }
    }
}

/// Outcome of the periodic pidfile revalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recheck {
    Valid,
    /// File is gone; someone swept the data directory.
    Missing,
    /// File exists but names another pid; someone took the directory over.
    Foreign { pid_line: String },
}

/// Pidfile errors. Acquisition failures surface before any child is
/// launched.
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock on {path} is held; supervisor already running (pid {pid})")]
    AlreadyRunning { path: PathBuf, pid: String },
}

/// Held pidfile: the lock lives as long as this value.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
    pid: u32,
}

impl PidFile {
    /// Acquire the lock without touching existing content, so a failed
    /// acquisition never wipes the running supervisor's pidfile.
    pub fn acquire(path: PathBuf) -> Result<PidFile, PidFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            let pid = std::fs::read_to_string(&path)
                .unwrap_or_default()
                .lines()
                .next()
                .unwrap_or("unknown")
                .to_string();
            return Err(PidFileError::AlreadyRunning { path, pid });
        }
        Ok(PidFile {
            path,
            file,
            pid: std::process::id(),
        })
    }

    /// Rewrite the whole file; done exactly once, at supervisor start.
    ///
    /// Eight lines: pid, data directory, start time (epoch seconds),
    /// port, socket directory or empty, listen address or empty,
    /// shared-segment key, status word.
    pub fn write_initial(
        &mut self,
        config: &Config,
        start_epoch: u64,
        segment_key: &str,
    ) -> Result<(), PidFileError> {
        self.file.set_len(0)?;
        let socket_dir = config
            .unix_socket_directories
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let listen_addr = config.listen_addresses.first().cloned().unwrap_or_default();
        let content = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.pid,
            config.data_dir.display(),
            start_epoch,
            config.port,
            socket_dir,
            listen_addr,
            segment_key,
            PidFileStatus::Starting.label(),
        );
        write_at_start(&mut self.file, content.as_bytes())?;
        Ok(())
    }

    /// Append an updated status line; readers take the last line.
    pub fn append_status(&mut self, status: PidFileStatus) -> Result<(), PidFileError> {
        writeln!(self.file, "{}", status.label())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Revalidate against the on-disk file.
    pub fn recheck(&self) -> Recheck {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Recheck::Missing,
            Err(e) => {
                warn!(error = %e, "pidfile recheck read failed");
                return Recheck::Valid;
            }
        };
        let first = content.lines().next().unwrap_or_default();
        if first != self.pid.to_string() {
            return Recheck::Foreign {
                pid_line: first.to_string(),
            };
        }
        Recheck::Valid
    }

    /// Remove the file. Last step of exit cleanup, after listening
    /// sockets and socket files are gone.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove pidfile");
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_at_start(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.sync_data()?;
    Ok(())
}

/// Re-touch a file's mtime so /tmp sweepers leave it alone.
pub fn touch(path: &Path) {
    let Ok(file) = File::options().write(true).open(path) else {
        return;
    };
    if let Err(e) = file.set_modified(SystemTime::now()) {
        warn!(path = %path.display(), error = %e, "touch failed");
    }
}

#[cfg(test)]
#[path = "pidfile_tests.rs"]
mod tests;
