// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Data-directory layout and control file.
//!
//! `bootstrap` lays out a fresh cluster directory; `check` validates one
//! before the supervisor touches anything else. The control file records
//! the cluster's identity and last known state word; the startup worker
//! reads it during recovery and the checkpointer rewrites it at the
//! shutdown checkpoint.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Control file location relative to the data directory.
pub const CONTROL_FILE: &str = "global/control.json";

/// Control-file format version.
pub const CONTROL_VERSION: u32 = 1;

/// Cluster state word in the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Bootstrapped,
    InProduction,
    InRecovery,
    ShutDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFile {
    pub system_id: String,
    pub version: u32,
    pub cluster_state: ClusterState,
    pub updated_epoch: u64,
}

/// Data-directory errors; these map to exit code 2 in the CLI.
#[derive(Debug, Error)]
pub enum DataDirError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data directory {0} does not exist")]
    Missing(PathBuf),

    #[error("{0} is not a reef data directory (no control file)")]
    NotBootstrapped(PathBuf),

    #[error("data directory {0} is already bootstrapped")]
    AlreadyBootstrapped(PathBuf),

    #[error("control file is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("control file version {found} does not match supervisor version {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

/// Create the skeleton of a new cluster directory.
pub fn bootstrap(data_dir: &Path, now_epoch: u64) -> Result<ControlFile, DataDirError> {
    let control_path = data_dir.join(CONTROL_FILE);
    if control_path.exists() {
        return Err(DataDirError::AlreadyBootstrapped(data_dir.to_path_buf()));
    }

    for sub in ["global", "wal", "log", "spawn"] {
        std::fs::create_dir_all(data_dir.join(sub))?;
    }

    let control = ControlFile {
        system_id: Uuid::new_v4().to_string(),
        version: CONTROL_VERSION,
        cluster_state: ClusterState::Bootstrapped,
        updated_epoch: now_epoch,
    };
    write_control(data_dir, &control)?;

    // Seed config file so operators have something to edit.
    let config_path = data_dir.join(crate::config::CONFIG_FILE_NAME);
    if !config_path.exists() {
        std::fs::write(
            &config_path,
            "# reef supervisor configuration\n\
             # port = 5470\n\
             # listen_addresses = [\"127.0.0.1\"]\n\
             # max_sessions = 100\n",
        )?;
    }
    Ok(control)
}

/// Validate an existing data directory.
pub fn check(data_dir: &Path) -> Result<ControlFile, DataDirError> {
    if !data_dir.is_dir() {
        return Err(DataDirError::Missing(data_dir.to_path_buf()));
    }
    let control_path = data_dir.join(CONTROL_FILE);
    if !control_path.exists() {
        return Err(DataDirError::NotBootstrapped(data_dir.to_path_buf()));
    }
    let control = read_control(data_dir)?;
    if control.version != CONTROL_VERSION {
        return Err(DataDirError::VersionMismatch {
            found: control.version,
            expected: CONTROL_VERSION,
        });
    }
    Ok(control)
}

pub fn read_control(data_dir: &Path) -> Result<ControlFile, DataDirError> {
    let bytes = std::fs::read(data_dir.join(CONTROL_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn write_control(data_dir: &Path, control: &ControlFile) -> Result<(), DataDirError> {
    let path = data_dir.join(CONTROL_FILE);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(control)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
#[path = "datadir_tests.rs"]
mod tests;
