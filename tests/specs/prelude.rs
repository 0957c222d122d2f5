//! Test helpers for behavioral specifications.
//!
//! Provides a small DSL for invoking the reefd binary and asserting on
//! its output and exit code.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

/// Path to the built `reefd` binary.
///
/// The test binary lives at `target/debug/deps/specs-<hash>`, so its
/// grandparent is `target/debug/` where reefd is built. Checking the
/// environment-provided path first keeps coverage runs working.
pub fn reefd_path() -> PathBuf {
    if let Some(path) = std::env::var_os("CARGO_BIN_EXE_reefd") {
        return PathBuf::from(path);
    }
    let mut path = std::env::current_exe().expect("test binary path");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("reefd");
    assert!(path.exists(), "reefd not built at {}", path.display());
    path
}

/// Fresh `reefd` invocation builder.
pub fn reefd() -> Spec {
    let mut cmd = Command::new(reefd_path());
    cmd.env_remove("REEF_DATA_DIR");
    Spec { cmd }
}

pub struct Spec {
    cmd: Command,
}

impl Spec {
    pub fn args(mut self, args: &[&str]) -> Self {
        self.cmd.args(args);
        self
    }

    pub fn data_dir(mut self, dir: &Path) -> Self {
        self.cmd.arg("-D").arg(dir);
        self
    }

    pub fn run(mut self) -> SpecOutput {
        let output = self.cmd.output().expect("reefd failed to spawn");
        SpecOutput { output }
    }

    pub fn passes(self) -> SpecOutput {
        let out = self.run();
        assert!(
            out.output.status.success(),
            "expected success, got {:?}\nstderr: {}",
            out.output.status.code(),
            out.stderr()
        );
        out
    }

    pub fn exits(self, code: i32) -> SpecOutput {
        let out = self.run();
        assert_eq!(
            out.output.status.code(),
            Some(code),
            "stderr: {}",
            out.stderr()
        );
        out
    }
}

pub struct SpecOutput {
    output: Output,
}

impl SpecOutput {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output.stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.output.stderr).into_owned()
    }

    pub fn stdout_has(self, needle: &str) -> Self {
        assert!(
            self.stdout().contains(needle),
            "stdout missing {needle:?}:\n{}",
            self.stdout()
        );
        self
    }

    pub fn stderr_has(self, needle: &str) -> Self {
        assert!(
            self.stderr().contains(needle),
            "stderr missing {needle:?}:\n{}",
            self.stderr()
        );
        self
    }
}

/// Whether the suite itself runs as root; root-refusing modes flip to
/// asserting the refusal in that case.
pub fn is_root() -> bool {
    Command::new("id")
        .arg("-u")
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "0")
        .unwrap_or(false)
}

/// Bootstrap a cluster in `dir`; panics unless it succeeds.
pub fn bootstrap(dir: &Path) {
    reefd().args(&["bootstrap"]).data_dir(dir).passes();
}

/// Poll `predicate` until it holds or the deadline passes.
pub fn wait_for(what: &str, deadline: Duration, mut predicate: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}
