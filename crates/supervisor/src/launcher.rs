// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child launching: the seam between the state machine and the OS.
//!
//! Production launches are spawn-and-reattach: the supervisor serializes
//! the segment identity plus kind-specific payload to a private file and
//! re-executes itself as `reefd spawn-child`. The trait keeps launching,
//! signaling, and reaping behind one vtable so lifecycle logic can be
//! driven by the fake in tests.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use reef_core::{ChildExitStatus, ChildKind, ChildSignal};

/// Launch errors. A failed launch is treated like an immediate crash of
/// the would-be child, except for Startup where it is fatal.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("signal delivery to pid {pid} failed: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },
}

/// An accepted client socket, handed to the child as stdin.
#[derive(Debug)]
pub enum ClientSocket {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl ClientSocket {
    /// Duplicate the socket into the child's stdin and stdout; the
    /// session worker reads the wire on one and answers on the other.
    fn into_stdio_pair(self) -> std::io::Result<(Stdio, Stdio)> {
        use std::os::fd::OwnedFd;
        match self {
            ClientSocket::Tcp(stream) => Ok((
                Stdio::from(OwnedFd::from(stream.try_clone()?)),
                Stdio::from(OwnedFd::from(stream)),
            )),
            ClientSocket::Unix(stream) => Ok((
                Stdio::from(OwnedFd::from(stream.try_clone()?)),
                Stdio::from(OwnedFd::from(stream)),
            )),
        }
    }
}

/// Everything the supervisor decides about one launch.
#[derive(Debug)]
pub struct LaunchSpec {
    pub kind: ChildKind,
    pub slot: Option<usize>,
    pub cancel_token: u32,
    pub dead_end: bool,
    /// Rejection message a dead-end child delivers before exiting.
    pub reject_reason: Option<String>,
    /// Registered worker name, for `ChildKind::BgWorker`.
    pub bgworker_name: Option<String>,
    pub socket: Option<ClientSocket>,
}

impl LaunchSpec {
    pub fn of(kind: ChildKind) -> Self {
        Self {
            kind,
            slot: None,
            cancel_token: 0,
            dead_end: false,
            reject_reason: None,
            bgworker_name: None,
            socket: None,
        }
    }
}

/// Serialized to the private payload file for spawn-and-reattach.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub kind: ChildKind,
    pub data_dir: PathBuf,
    /// Absent for children that do not attach (syslogger).
    pub segment_path: Option<PathBuf>,
    /// Hex key the child checks against the segment header after attach.
    pub segment_key: Option<String>,
    pub slot: Option<usize>,
    pub cancel_token: u32,
    pub dead_end: bool,
    pub reject_reason: Option<String>,
    pub bgworker_name: Option<String>,
    pub standby_mode: bool,
}

/// A reaped child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: u32,
    pub status: ChildExitStatus,
}

/// Launching, signaling, and reaping behind one seam.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, spec: LaunchSpec) -> Result<u32, LaunchError>;

    /// Deliver a signal to a child (and, in production, its process
    /// group).
    fn signal(&self, pid: u32, signal: ChildSignal) -> Result<(), LaunchError>;

    /// Drain every already-exited child, non-blocking.
    fn drain_exits(&self) -> Vec<ChildExit>;

    /// The segment was (re-)provisioned; future payloads must carry the
    /// new identity.
    fn segment_changed(&self, path: &Path, key_hex: &str) {
        let _ = (path, key_hex);
    }
}

struct SpawnedChild {
    child: Child,
    payload_path: PathBuf,
    // Held so supervisor death closes the child's stdin pipe.
    _death_pipe: Option<std::io::PipeWriter>,
}

/// Spawn-and-reattach launcher re-executing the supervisor binary.
pub struct ProcessLauncher {
    exe: PathBuf,
    data_dir: PathBuf,
    payload_dir: PathBuf,
    standby_mode: bool,
    segment: Mutex<Option<(PathBuf, String)>>,
    children: Mutex<HashMap<u32, SpawnedChild>>,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, data_dir: PathBuf, standby_mode: bool) -> Self {
        let payload_dir = data_dir.join("spawn");
        Self {
            exe,
            data_dir,
            payload_dir,
            standby_mode,
            segment: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Record the current segment identity; refreshed on re-provision
    /// through `Launcher::segment_changed`.
    pub fn set_segment(&self, path: PathBuf, key_hex: String) {
        *self.segment.lock() = Some((path, key_hex));
    }

    fn write_payload(&self, spec: &LaunchSpec) -> Result<PathBuf, LaunchError> {
        std::fs::create_dir_all(&self.payload_dir)?;
        let kind = spec.kind;
        let (segment_path, segment_key) = if kind.attaches_to_segment() {
            let segment = self.segment.lock();
            match segment.as_ref() {
                Some((path, key)) => (Some(path.clone()), Some(key.clone())),
                None => (None, None),
            }
        } else {
            (None, None)
        };
        let payload = SpawnPayload {
            kind,
            data_dir: self.data_dir.clone(),
            segment_path,
            segment_key,
            slot: spec.slot,
            cancel_token: spec.cancel_token,
            dead_end: spec.dead_end,
            reject_reason: spec.reject_reason.clone(),
            bgworker_name: spec.bgworker_name.clone(),
            standby_mode: self.standby_mode,
        };

        let path = self
            .payload_dir
            .join(format!("child-{}.json", Uuid::new_v4()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(&serde_json::to_vec(&payload)?)?;
        Ok(path)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn segment_changed(&self, path: &Path, key_hex: &str) {
        self.set_segment(path.to_path_buf(), key_hex.to_string());
    }

    async fn launch(&self, mut spec: LaunchSpec) -> Result<u32, LaunchError> {
        let payload_path = self.write_payload(&spec)?;
        let kind = spec.kind;

        let mut command = Command::new(&self.exe);
        command
            .arg("spawn-child")
            .arg(kind.label())
            .arg("--payload")
            .arg(&payload_path);

        // Sessions and dead-ends serve the accepted socket on
        // stdin/stdout; every other kind watches supervisor death as EOF
        // on its stdin pipe.
        let mut death_pipe = None;
        match spec.socket.take() {
            Some(socket) => {
                let (stdin, stdout) = socket.into_stdio_pair().inspect_err(|_| {
                    let _ = std::fs::remove_file(&payload_path);
                })?;
                command.stdin(stdin);
                command.stdout(stdout);
            }
            None => {
                let (reader, writer) = std::io::pipe().inspect_err(|_| {
                    let _ = std::fs::remove_file(&payload_path);
                })?;
                command.stdin(Stdio::from(reader));
                death_pipe = Some(writer);
            }
        }

        let child = command.spawn().inspect_err(|_| {
            let _ = std::fs::remove_file(&payload_path);
        })?;
        let pid = child.id();
        debug!(pid, kind = %kind, "child launched");

        self.children.lock().insert(
            pid,
            SpawnedChild {
                child,
                payload_path,
                _death_pipe: death_pipe,
            },
        );
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: ChildSignal) -> Result<(), LaunchError> {
        let sig = os_signal(signal);
        let target = Pid::from_raw(pid as i32);
        kill(target, sig).map_err(|errno| LaunchError::Signal { pid, errno })?;
        // The child may not have become a process-group leader yet, so
        // the direct signal above is load-bearing; the group signal
        // catches grandchildren once setsid has happened.
        if let Err(errno) = kill(Pid::from_raw(-(pid as i32)), sig) {
            if errno != nix::errno::Errno::ESRCH {
                warn!(pid, %errno, "process-group signal failed");
            }
        }
        Ok(())
    }

    fn drain_exits(&self) -> Vec<ChildExit> {
        let mut children = self.children.lock();
        let mut exits = Vec::new();
        let mut reaped = Vec::new();
        for (pid, entry) in children.iter_mut() {
            match entry.child.try_wait() {
                Ok(Some(status)) => {
                    let status = match status.code() {
                        Some(code) => ChildExitStatus::Code(code),
                        None => ChildExitStatus::Signaled(status.signal().unwrap_or(0)),
                    };
                    exits.push(ChildExit { pid: *pid, status });
                    reaped.push(*pid);
                }
                Ok(None) => {}
                Err(e) => warn!(pid, error = %e, "try_wait failed"),
            }
        }
        for pid in reaped {
            if let Some(entry) = children.remove(&pid) {
                let _ = std::fs::remove_file(&entry.payload_path);
            }
        }
        exits
    }
}

fn os_signal(signal: ChildSignal) -> Signal {
    match signal {
        ChildSignal::Terminate => Signal::SIGTERM,
        ChildSignal::Quit => Signal::SIGQUIT,
        ChildSignal::Abort => Signal::SIGABRT,
        ChildSignal::Kill => Signal::SIGKILL,
        ChildSignal::Interrupt => Signal::SIGINT,
        ChildSignal::Reload => Signal::SIGHUP,
        ChildSignal::Notify => Signal::SIGUSR1,
        ChildSignal::FinishUp => Signal::SIGUSR2,
    }
}

/// Read a payload file back; the child side of spawn-and-reattach.
pub fn read_payload(path: &Path) -> Result<SpawnPayload, LaunchError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeLaunch, FakeLauncher};

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// One recorded launch.
    #[derive(Debug, Clone)]
    pub struct FakeLaunch {
        pub pid: u32,
        pub kind: ChildKind,
        pub dead_end: bool,
        pub reject_reason: Option<String>,
        pub bgworker_name: Option<String>,
        pub had_socket: bool,
    }

    #[derive(Default)]
    struct FakeState {
        launches: Vec<FakeLaunch>,
        signals: Vec<(u32, ChildSignal)>,
        exits: Vec<ChildExit>,
        fail_next: bool,
    }

    /// Recording launcher for lifecycle tests: allocates fake pids,
    /// remembers signals, and replays injected exits on drain.
    #[derive(Default)]
    pub struct FakeLauncher {
        next_pid: AtomicU32,
        state: Mutex<FakeState>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self {
                next_pid: AtomicU32::new(100),
                state: Mutex::default(),
            }
        }

        pub fn launches(&self) -> Vec<FakeLaunch> {
            self.state.lock().launches.clone()
        }

        pub fn last_launch_of(&self, kind: ChildKind) -> Option<FakeLaunch> {
            self.state
                .lock()
                .launches
                .iter()
                .rev()
                .find(|l| l.kind == kind)
                .cloned()
        }

        pub fn signals(&self) -> Vec<(u32, ChildSignal)> {
            self.state.lock().signals.clone()
        }

        pub fn signals_for(&self, pid: u32) -> Vec<ChildSignal> {
            self.state
                .lock()
                .signals
                .iter()
                .filter(|(p, _)| *p == pid)
                .map(|(_, s)| *s)
                .collect()
        }

        pub fn clear_signals(&self) {
            self.state.lock().signals.clear();
        }

        /// Queue an exit for the next `drain_exits`.
        pub fn inject_exit(&self, pid: u32, status: ChildExitStatus) {
            self.state.lock().exits.push(ChildExit { pid, status });
        }

        pub fn fail_next_launch(&self) {
            self.state.lock().fail_next = true;
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, spec: LaunchSpec) -> Result<u32, LaunchError> {
            let mut state = self.state.lock();
            if state.fail_next {
                state.fail_next = false;
                return Err(LaunchError::Io(std::io::Error::other("injected failure")));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::Relaxed) + 1;
            state.launches.push(FakeLaunch {
                pid,
                kind: spec.kind,
                dead_end: spec.dead_end,
                reject_reason: spec.reject_reason.clone(),
                bgworker_name: spec.bgworker_name.clone(),
                had_socket: spec.socket.is_some(),
            });
            Ok(pid)
        }

        fn signal(&self, pid: u32, signal: ChildSignal) -> Result<(), LaunchError> {
            self.state.lock().signals.push((pid, signal));
            Ok(())
        }

        fn drain_exits(&self) -> Vec<ChildExit> {
            std::mem::take(&mut self.state.lock().exits)
        }
    }
}

#[cfg(test)]
#[path = "launcher_tests.rs"]
mod tests;
