//! Help, version, and argument-error surface.

use crate::prelude::*;

#[test]
fn help_describes_every_mode() {
    let out = reefd().args(&["help"]).passes();
    let stdout = out.stdout();
    for mode in [
        "supervise",
        "check",
        "bootstrap",
        "describe-config",
        "print-config-variable",
        "single-user",
        "spawn-child",
    ] {
        assert!(stdout.contains(mode), "help misses {mode}");
    }
}

#[test]
fn version_prints_the_crate_version() {
    reefd().args(&["version"]).passes().stdout_has("reefd ");
}

#[test]
fn help_flag_matches_help_mode() {
    reefd().args(&["--help"]).passes().stdout_has("USAGE:");
}

#[test]
fn unknown_mode_exits_with_config_error() {
    reefd().args(&["defrag"]).exits(2).stderr_has("defrag");
}

#[test]
fn unknown_flag_exits_with_config_error() {
    reefd().args(&["--wat"]).exits(2).stderr_has("--wat");
}

#[test]
fn check_without_a_data_directory_exits_with_config_error() {
    reefd().args(&["check"]).exits(2).stderr_has("data directory");
}
