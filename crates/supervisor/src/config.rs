// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor configuration.
//!
//! Resolution order: built-in defaults, `<datadir>/reef.toml`, `REEF_*`
//! environment variables, then `-c name=value` command-line options.
//! Background workers register through `[[bgworker]]` file entries only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use reef_shmem::SizingConfig;

use crate::bgworker::BgwStartTime;

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "reef.toml";

/// Upper bound on listening sockets across all addresses and directories.
pub const MAX_LISTEN_SOCKETS: usize = 64;

/// Configuration errors. These surface before any child is launched and
/// map to exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no data directory: pass -D <dir> or set REEF_DATA_DIR")]
    NoDataDir,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("unrecognized configuration variable {0:?}")]
    UnknownVariable(String),

    #[error("invalid value {value:?} for configuration variable {name:?}")]
    InvalidValue { name: String, value: String },

    #[error("too many listen sockets configured: {0} (max {MAX_LISTEN_SOCKETS})")]
    TooManySockets(usize),
}

/// A registered background worker, from a `[[bgworker]]` file entry.
#[derive(Debug, Clone, Deserialize)]
pub struct BgWorkerConfig {
    pub name: String,
    #[serde(default)]
    pub start_time: BgwStartTime,
    /// Seconds between restart attempts after a crash; absent = never
    /// restart.
    #[serde(default)]
    pub restart_secs: Option<u64>,
}

impl BgWorkerConfig {
    pub fn restart_interval(&self) -> Option<Duration> {
        self.restart_secs.map(Duration::from_secs)
    }
}

/// Resolved supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub port: u16,
    pub listen_addresses: Vec<String>,
    pub unix_socket_directories: Vec<PathBuf>,
    pub max_sessions: u32,
    pub max_autovac_workers: u32,
    pub max_walsenders: u32,
    pub max_bgworkers: u32,
    pub shared_buffer_pages: u32,
    pub wal_buffer_pages: u32,
    pub max_replication_slots: u32,
    pub autovacuum: bool,
    pub archive_mode: bool,
    pub logging_collector: bool,
    pub summarize_wal: bool,
    pub sync_replication_slots: bool,
    pub hot_standby: bool,
    /// Run as a standby cluster: startup enters recovery and stays there.
    pub standby_mode: bool,
    pub restart_after_crash: bool,
    /// Crash cascade sends SIGABRT instead of SIGQUIT.
    pub send_abort_for_crash: bool,
    /// Kill escalation sends SIGABRT instead of SIGKILL.
    pub send_abort_for_kill: bool,
    pub locale_collate: String,
    pub locale_ctype: String,
    pub locale_messages: String,
    pub bgworkers: Vec<BgWorkerConfig>,
}

/// Serde mirror of the config file: everything optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    port: Option<u16>,
    listen_addresses: Option<Vec<String>>,
    unix_socket_directories: Option<Vec<PathBuf>>,
    max_sessions: Option<u32>,
    max_autovac_workers: Option<u32>,
    max_walsenders: Option<u32>,
    max_bgworkers: Option<u32>,
    shared_buffer_pages: Option<u32>,
    wal_buffer_pages: Option<u32>,
    max_replication_slots: Option<u32>,
    autovacuum: Option<bool>,
    archive_mode: Option<bool>,
    logging_collector: Option<bool>,
    summarize_wal: Option<bool>,
    sync_replication_slots: Option<bool>,
    hot_standby: Option<bool>,
    standby_mode: Option<bool>,
    restart_after_crash: Option<bool>,
    send_abort_for_crash: Option<bool>,
    send_abort_for_kill: Option<bool>,
    locale_collate: Option<String>,
    locale_ctype: Option<String>,
    locale_messages: Option<String>,
    #[serde(default, rename = "bgworker")]
    bgworkers: Vec<BgWorkerConfig>,
}

impl Config {
    /// Built-in defaults for the given data directory.
    pub fn defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            port: 5470,
            listen_addresses: vec!["127.0.0.1".to_string()],
            unix_socket_directories: vec![PathBuf::from("/tmp")],
            max_sessions: 100,
            max_autovac_workers: 3,
            max_walsenders: 10,
            max_bgworkers: 8,
            shared_buffer_pages: 1024,
            wal_buffer_pages: 64,
            max_replication_slots: 10,
            autovacuum: true,
            archive_mode: false,
            logging_collector: false,
            summarize_wal: false,
            sync_replication_slots: false,
            hot_standby: true,
            standby_mode: false,
            restart_after_crash: true,
            send_abort_for_crash: false,
            send_abort_for_kill: false,
            locale_collate: "C".to_string(),
            locale_ctype: "C".to_string(),
            locale_messages: "C".to_string(),
            bgworkers: Vec::new(),
        }
    }

    /// Load configuration: defaults < file < environment < `-c` options.
    pub fn load(data_dir: PathBuf, options: &[(String, String)]) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(data_dir);

        let path = config.data_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let file: ConfigFile =
                toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
            config.apply_file(file);
        }

        for (name, value) in crate::env::config_overrides() {
            config.apply(&name, &value)?;
        }
        for (name, value) in options {
            config.apply(name, value)?;
        }

        let sockets = config.listen_addresses.len() + config.unix_socket_directories.len();
        if sockets > MAX_LISTEN_SOCKETS {
            return Err(ConfigError::TooManySockets(sockets));
        }

        // The locale triple falls back to the all-locales variable.
        if let Some(all) = crate::env::take_all_locales() {
            for slot in [
                &mut config.locale_collate,
                &mut config.locale_ctype,
                &mut config.locale_messages,
            ] {
                if slot == "C" {
                    *slot = all.clone();
                }
            }
        }

        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        macro_rules! take {
            ($config:ident, $file:ident, $($field:ident),* $(,)?) => {
                $(if let Some(value) = $file.$field {
                    $config.$field = value;
                })*
            };
        }
        take!(
            self,
            file,
            port,
            listen_addresses,
            unix_socket_directories,
            max_sessions,
            max_autovac_workers,
            max_walsenders,
            max_bgworkers,
            shared_buffer_pages,
            wal_buffer_pages,
            max_replication_slots,
            autovacuum,
            archive_mode,
            logging_collector,
            summarize_wal,
            sync_replication_slots,
            hot_standby,
            standby_mode,
            restart_after_crash,
            send_abort_for_crash,
            send_abort_for_kill,
            locale_collate,
            locale_ctype,
            locale_messages,
        );
        if !file.bgworkers.is_empty() {
            self.bgworkers = file.bgworkers;
        }
    }

    /// Apply one `name=value` option (from `-c` or the environment).
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: value.to_string(),
            })
        }
        fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
            match value {
                "true" | "on" | "yes" | "1" => Ok(true),
                "false" | "off" | "no" | "0" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                }),
            }
        }

        match name {
            "port" => self.port = parse(name, value)?,
            "listen_addresses" => {
                self.listen_addresses = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "unix_socket_directories" => {
                self.unix_socket_directories = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            "max_sessions" => self.max_sessions = parse(name, value)?,
            "max_autovac_workers" => self.max_autovac_workers = parse(name, value)?,
            "max_walsenders" => self.max_walsenders = parse(name, value)?,
            "max_bgworkers" => self.max_bgworkers = parse(name, value)?,
            "shared_buffer_pages" => self.shared_buffer_pages = parse(name, value)?,
            "wal_buffer_pages" => self.wal_buffer_pages = parse(name, value)?,
            "max_replication_slots" => self.max_replication_slots = parse(name, value)?,
            "autovacuum" => self.autovacuum = parse_bool(name, value)?,
            "archive_mode" => self.archive_mode = parse_bool(name, value)?,
            "logging_collector" => self.logging_collector = parse_bool(name, value)?,
            "summarize_wal" => self.summarize_wal = parse_bool(name, value)?,
            "sync_replication_slots" => self.sync_replication_slots = parse_bool(name, value)?,
            "hot_standby" => self.hot_standby = parse_bool(name, value)?,
            "standby_mode" => self.standby_mode = parse_bool(name, value)?,
            "restart_after_crash" => self.restart_after_crash = parse_bool(name, value)?,
            "send_abort_for_crash" => self.send_abort_for_crash = parse_bool(name, value)?,
            "send_abort_for_kill" => self.send_abort_for_kill = parse_bool(name, value)?,
            "locale_collate" => self.locale_collate = value.to_string(),
            "locale_ctype" => self.locale_ctype = value.to_string(),
            "locale_messages" => self.locale_messages = value.to_string(),
            _ => return Err(ConfigError::UnknownVariable(name.to_string())),
        }
        Ok(())
    }

    /// Every variable with its resolved value and a one-line description,
    /// for `describe-config` and `print-config-variable`.
    pub fn describe(&self) -> Vec<(&'static str, String, &'static str)> {
        vec![
            ("port", self.port.to_string(), "TCP port to listen on"),
            (
                "listen_addresses",
                self.listen_addresses.join(","),
                "comma-separated TCP listen addresses",
            ),
            (
                "unix_socket_directories",
                self.unix_socket_directories
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                "directories for unix-domain sockets",
            ),
            (
                "max_sessions",
                self.max_sessions.to_string(),
                "maximum concurrent session workers",
            ),
            (
                "max_autovac_workers",
                self.max_autovac_workers.to_string(),
                "maximum concurrent autovacuum workers",
            ),
            (
                "max_walsenders",
                self.max_walsenders.to_string(),
                "maximum concurrent walsenders",
            ),
            (
                "max_bgworkers",
                self.max_bgworkers.to_string(),
                "maximum concurrent background workers",
            ),
            (
                "shared_buffer_pages",
                self.shared_buffer_pages.to_string(),
                "shared buffer pool size in 8KiB pages",
            ),
            (
                "wal_buffer_pages",
                self.wal_buffer_pages.to_string(),
                "WAL buffer size in 8KiB pages",
            ),
            (
                "max_replication_slots",
                self.max_replication_slots.to_string(),
                "replication slot capacity",
            ),
            (
                "autovacuum",
                self.autovacuum.to_string(),
                "run the autovacuum launcher",
            ),
            (
                "archive_mode",
                self.archive_mode.to_string(),
                "run the WAL archiver",
            ),
            (
                "logging_collector",
                self.logging_collector.to_string(),
                "run the log collector child",
            ),
            (
                "summarize_wal",
                self.summarize_wal.to_string(),
                "run the WAL summarizer",
            ),
            (
                "sync_replication_slots",
                self.sync_replication_slots.to_string(),
                "run the replication slot synchronizer on a standby",
            ),
            (
                "hot_standby",
                self.hot_standby.to_string(),
                "admit read-only sessions during recovery",
            ),
            (
                "standby_mode",
                self.standby_mode.to_string(),
                "run as a standby cluster",
            ),
            (
                "restart_after_crash",
                self.restart_after_crash.to_string(),
                "re-provision and restart after a child crash",
            ),
            (
                "send_abort_for_crash",
                self.send_abort_for_crash.to_string(),
                "crash cascade uses SIGABRT instead of SIGQUIT",
            ),
            (
                "send_abort_for_kill",
                self.send_abort_for_kill.to_string(),
                "kill escalation uses SIGABRT instead of SIGKILL",
            ),
            (
                "locale_collate",
                self.locale_collate.clone(),
                "collation locale",
            ),
            (
                "locale_ctype",
                self.locale_ctype.clone(),
                "character-class locale",
            ),
            (
                "locale_messages",
                self.locale_messages.clone(),
                "message locale",
            ),
        ]
    }

    /// Shared-memory sizing inputs.
    pub fn sizing(&self) -> SizingConfig {
        SizingConfig {
            max_sessions: self.max_sessions,
            max_autovac_workers: self.max_autovac_workers,
            max_walsenders: self.max_walsenders,
            max_bgworkers: self.max_bgworkers,
            shared_buffer_pages: self.shared_buffer_pages,
            wal_buffer_pages: self.wal_buffer_pages,
            max_replication_slots: self.max_replication_slots,
        }
    }

    /// Admission ceiling on simultaneously live children.
    pub fn child_ceiling(&self) -> u32 {
        2 * (self.max_sessions + self.max_autovac_workers + self.max_walsenders + self.max_bgworkers
            + 1)
    }

    pub fn pidfile_path(&self) -> PathBuf {
        self.data_dir.join("reef.pid")
    }

    pub fn segment_dir(&self) -> PathBuf {
        self.data_dir.join("global")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir().join("reefd.log")
    }

    /// Unix socket path inside one socket directory.
    pub fn socket_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!(".s.reef.{}", self.port))
    }

    /// Sibling lock file touched to defeat /tmp sweepers.
    pub fn socket_lock_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!(".s.reef.{}.lock", self.port))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
