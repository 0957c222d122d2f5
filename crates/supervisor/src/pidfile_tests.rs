// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::Config;
use tempfile::tempdir;

fn test_config(dir: &Path) -> Config {
    Config::defaults(dir.to_path_buf())
}

#[test]
fn initial_write_has_the_eight_line_format() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let mut pidfile = PidFile::acquire(config.pidfile_path()).unwrap();
    pidfile
        .write_initial(&config, 1_700_000_000, "deadbeef")
        .unwrap();

    let content = std::fs::read_to_string(config.pidfile_path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 8);
    assert_eq!(lines[0], std::process::id().to_string());
    assert_eq!(lines[1], dir.path().display().to_string());
    assert_eq!(lines[2], "1700000000");
    assert_eq!(lines[3], "5470");
    assert_eq!(lines[4], "/tmp");
    assert_eq!(lines[5], "127.0.0.1");
    assert_eq!(lines[6], "deadbeef");
    assert_eq!(lines[7], "starting");
}

#[test]
fn status_updates_append_and_readers_take_the_last_line() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let mut pidfile = PidFile::acquire(config.pidfile_path()).unwrap();
    pidfile.write_initial(&config, 1, "00").unwrap();
    pidfile.append_status(PidFileStatus::Ready).unwrap();
    pidfile.append_status(PidFileStatus::Stopping).unwrap();

    let content = std::fs::read_to_string(config.pidfile_path()).unwrap();
    assert_eq!(content.lines().last(), Some("stopping"));
    // The initial eight lines are still intact above the appended ones.
    assert_eq!(content.lines().count(), 10);
    assert_eq!(content.lines().nth(7), Some("starting"));
}

#[test]
fn acquire_does_not_clobber_a_held_pidfile() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let mut held = PidFile::acquire(config.pidfile_path()).unwrap();
    held.write_initial(&config, 1, "key").unwrap();

    let err = PidFile::acquire(config.pidfile_path()).unwrap_err();
    match err {
        PidFileError::AlreadyRunning { pid, .. } => {
            assert_eq!(pid, std::process::id().to_string());
        }
        other => panic!("unexpected error: {other}"),
    }

    // The running supervisor's content is untouched.
    let content = std::fs::read_to_string(config.pidfile_path()).unwrap();
    assert_eq!(content.lines().count(), 8);
}

#[test]
fn recheck_detects_deletion_and_takeover() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let mut pidfile = PidFile::acquire(config.pidfile_path()).unwrap();
    pidfile.write_initial(&config, 1, "key").unwrap();
    assert_eq!(pidfile.recheck(), Recheck::Valid);

    std::fs::write(config.pidfile_path(), "99999\n").unwrap();
    assert_eq!(
        pidfile.recheck(),
        Recheck::Foreign {
            pid_line: "99999".to_string()
        }
    );

    std::fs::remove_file(config.pidfile_path()).unwrap();
    assert_eq!(pidfile.recheck(), Recheck::Missing);
}

#[test]
fn unlink_is_idempotent() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let mut pidfile = PidFile::acquire(config.pidfile_path()).unwrap();
    pidfile.write_initial(&config, 1, "key").unwrap();

    pidfile.unlink();
    assert!(!config.pidfile_path().exists());
    pidfile.unlink();
}

#[test]
fn touch_updates_mtime() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(".s.reef.5470.lock");
    std::fs::write(&path, "x").unwrap();

    let old = SystemTime::UNIX_EPOCH;
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(old)
        .unwrap();

    touch(&path);
    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert!(mtime > old);
}
