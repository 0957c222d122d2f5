// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! reef-supervisor: the cluster's parent process.
//!
//! One long-lived supervisor owns the shared segment, the listening
//! sockets, the pidfile, and the child registry, and drives the global
//! lifecycle state machine. It never touches the shared data pages it
//! provisions; it arbitrates processes only.

pub mod admission;
pub mod bgworker;
pub mod config;
pub mod datadir;
pub mod env;
pub mod latch;
pub mod launcher;
pub mod logging;
pub mod machine;
pub mod pidfile;
pub mod protocol;
pub mod registry;
pub mod runloop;
pub mod signals;
pub mod worker;

pub use admission::RejectReason;
pub use config::{Config, ConfigError};
pub use launcher::{ClientSocket, LaunchSpec, Launcher, ProcessLauncher, SpawnPayload};
pub use machine::{Supervisor, SupervisorError};
pub use pidfile::{PidFile, PidFileStatus};
pub use registry::{ChildRecord, ChildRegistry};
pub use runloop::Listeners;
pub use signals::{PendingSignals, SignalIntake};

#[cfg(any(test, feature = "test-support"))]
pub use launcher::FakeLauncher;
