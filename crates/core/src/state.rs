// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Global lifecycle states and shutdown severity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The supervisor's global lifecycle state.
///
/// The state machine never skips a state: every transition is one of the
/// edges implemented in the supervisor crate, and observers only ever see
/// values of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Before shared memory exists.
    Init,
    /// Startup worker launched, outcome unknown.
    Startup,
    /// Startup reported that WAL redo has begun.
    Recovery,
    /// Standby is consistent; read-only sessions admitted.
    HotStandby,
    /// Normal operation.
    Run,
    /// Shutdown or crash: terminating live children.
    StopBackends,
    /// Waiting for terminated children to drain.
    WaitBackends,
    /// Shutdown checkpoint in progress.
    Shutdown,
    /// Waiting for walsenders and the archiver to finish.
    Shutdown2,
    /// No longer accepting sockets; draining dead-end children.
    WaitDeadEnd,
    /// Registry is empty; exit or crash-restart.
    NoChildren,
}

impl LifecycleState {
    /// States in which client connections may be admitted at all.
    ///
    /// Admission additionally requires the `conns_allowed` sub-flag.
    pub fn accepts_connections(self) -> bool {
        matches!(self, LifecycleState::Run | LifecycleState::HotStandby)
    }

    /// True once the machine has left normal operation for good.
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            LifecycleState::StopBackends
                | LifecycleState::WaitBackends
                | LifecycleState::Shutdown
                | LifecycleState::Shutdown2
                | LifecycleState::WaitDeadEnd
                | LifecycleState::NoChildren
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            LifecycleState::Init => "init",
            LifecycleState::Startup => "startup",
            LifecycleState::Recovery => "recovery",
            LifecycleState::HotStandby => "hot-standby",
            LifecycleState::Run => "run",
            LifecycleState::StopBackends => "stop-backends",
            LifecycleState::WaitBackends => "wait-backends",
            LifecycleState::Shutdown => "shutdown",
            LifecycleState::Shutdown2 => "shutdown2",
            LifecycleState::WaitDeadEnd => "wait-dead-end",
            LifecycleState::NoChildren => "no-children",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Most severe shutdown request received so far.
///
/// Ordering is severity: `None < Smart < Fast < Immediate`. A request of
/// lower severity never downgrades one already latched.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    #[default]
    None,
    /// Forbid new connections, wait for sessions to end naturally.
    Smart,
    /// Terminate live sessions (rolls back open transactions).
    Fast,
    /// Quit-with-core everything; rely on crash recovery at next boot.
    Immediate,
}

impl ShutdownMode {
    /// Latch `requested`, keeping whichever request is more severe.
    pub fn escalate(&mut self, requested: ShutdownMode) {
        if requested > *self {
            *self = requested;
        }
    }

    pub fn is_requested(self) -> bool {
        self != ShutdownMode::None
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
