// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the supervisor crate.

use std::path::PathBuf;

/// Data directory: `REEF_DATA_DIR`, if set.
pub fn data_dir() -> Option<PathBuf> {
    std::env::var_os("REEF_DATA_DIR").map(PathBuf::from)
}

/// Log filter: `REEF_LOG` (tracing env-filter syntax), defaulting to
/// `info` in the subscriber setup.
pub const LOG_FILTER_VAR: &str = "REEF_LOG";

/// Locale triple applied to collate/ctype/messages when none of them is
/// configured individually. Unset after consumption.
pub const ALL_LOCALES_VAR: &str = "REEF_ALL_LOCALES";

/// Take (read and unset) the all-locales variable.
pub fn take_all_locales() -> Option<String> {
    let value = std::env::var(ALL_LOCALES_VAR).ok();
    if value.is_some() {
        std::env::remove_var(ALL_LOCALES_VAR);
    }
    value
}

/// Configuration overlay: every `REEF_<NAME>` variable whose lowercased
/// name matches a config variable.
pub fn config_overrides() -> Vec<(String, String)> {
    std::env::vars()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix("REEF_")?;
            // Reserved names that are not config variables.
            if matches!(name, "DATA_DIR" | "LOG" | "ALL_LOCALES") {
                return None;
            }
            Some((name.to_ascii_lowercase(), value))
        })
        .collect()
}
