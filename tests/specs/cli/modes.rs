//! Bootstrap, check, config-introspection, and single-user modes.

use crate::prelude::*;
use tempfile::tempdir;

#[test]
fn bootstrap_then_check_round_trips() {
    let dir = tempdir().unwrap();
    if is_root() {
        reefd()
            .args(&["bootstrap"])
            .data_dir(dir.path())
            .exits(2)
            .stderr_has("root");
        return;
    }

    bootstrap(dir.path());
    assert!(dir.path().join("global/control.json").exists());
    assert!(dir.path().join("reef.toml").exists());

    reefd()
        .args(&["check"])
        .data_dir(dir.path())
        .passes()
        .stdout_has("is valid");
}

#[test]
fn bootstrap_twice_is_refused() {
    if is_root() {
        return;
    }
    let dir = tempdir().unwrap();
    bootstrap(dir.path());
    reefd()
        .args(&["bootstrap"])
        .data_dir(dir.path())
        .exits(2)
        .stderr_has("already bootstrapped");
}

#[test]
fn check_rejects_an_unbootstrapped_directory() {
    let dir = tempdir().unwrap();
    reefd()
        .args(&["check"])
        .data_dir(dir.path())
        .exits(2)
        .stderr_has("not a reef data directory");
}

#[test]
fn describe_config_lists_variables_with_docs() {
    reefd()
        .args(&["describe-config"])
        .passes()
        .stdout_has("port")
        .stdout_has("max_sessions")
        .stdout_has("restart_after_crash");
}

#[test]
fn print_config_variable_resolves_defaults_and_overrides() {
    reefd()
        .args(&["print-config-variable", "port"])
        .passes()
        .stdout_has("5470");

    reefd()
        .args(&["print-config-variable", "port", "-c", "port=6001"])
        .passes()
        .stdout_has("6001");
}

#[test]
fn print_config_variable_rejects_unknown_names() {
    reefd()
        .args(&["print-config-variable", "wal_compression"])
        .exits(2)
        .stderr_has("wal_compression");
}

#[test]
fn config_file_values_reach_print_config_variable() {
    if is_root() {
        return;
    }
    let dir = tempdir().unwrap();
    bootstrap(dir.path());
    std::fs::write(dir.path().join("reef.toml"), "max_sessions = 42\n").unwrap();

    reefd()
        .args(&["print-config-variable", "max_sessions"])
        .data_dir(dir.path())
        .passes()
        .stdout_has("42");
}

#[test]
fn single_user_runs_recovery_inline() {
    let dir = tempdir().unwrap();
    if is_root() {
        reefd()
            .args(&["single-user"])
            .data_dir(dir.path())
            .exits(2)
            .stderr_has("root");
        return;
    }
    bootstrap(dir.path());

    reefd()
        .args(&["single-user"])
        .data_dir(dir.path())
        .passes()
        .stdout_has("recovery complete");

    let control = std::fs::read_to_string(dir.path().join("global/control.json")).unwrap();
    assert!(control.contains("in_production"), "{control}");
}

#[test]
fn malformed_config_option_exits_with_config_error() {
    if is_root() {
        return;
    }
    let dir = tempdir().unwrap();
    bootstrap(dir.path());
    reefd()
        .args(&["check", "-c", "port=zero"])
        .data_dir(dir.path())
        .exits(2)
        .stderr_has("port");
}
