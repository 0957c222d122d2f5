// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Signal names used between the supervisor and its children.

use serde::{Deserialize, Serialize};

/// Signals the supervisor delivers to children.
///
/// Named by intent rather than by OS number so the launcher seam stays
/// the only place that knows about `libc` signal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildSignal {
    /// SIGTERM: finish current work and exit cleanly.
    Terminate,
    /// SIGQUIT: quit immediately, dumping core if configured.
    Quit,
    /// SIGABRT: quit-with-core alternative selected by configuration.
    Abort,
    /// SIGKILL: last-resort escalation for recalcitrant children.
    Kill,
    /// SIGINT: query-cancel interrupt for a session.
    Interrupt,
    /// SIGHUP: re-read configuration.
    Reload,
    /// SIGUSR1: generic notification (logfile rotation, bgworker removal).
    Notify,
    /// SIGUSR2: finish-up request (shutdown checkpoint, walsender and
    /// archiver drain).
    FinishUp,
}

/// Single-shot events a child raises toward the supervisor through the
/// shared cross-signal table, paired with a SIGUSR1 to wake the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossSignal {
    RecoveryStarted,
    BeginHotStandby,
    StartWalReceiver,
    StartAutovacWorker,
    BgworkerStateChanged,
    AdvanceStateMachine,
    RotateLogfile,
}

impl CrossSignal {
    pub const COUNT: usize = 7;

    pub const ALL: [CrossSignal; CrossSignal::COUNT] = [
        CrossSignal::RecoveryStarted,
        CrossSignal::BeginHotStandby,
        CrossSignal::StartWalReceiver,
        CrossSignal::StartAutovacWorker,
        CrossSignal::BgworkerStateChanged,
        CrossSignal::AdvanceStateMachine,
        CrossSignal::RotateLogfile,
    ];

    /// Stable slot index in the shared cross-signal table.
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_signal_indexes_are_dense_and_stable() {
        for (i, sig) in CrossSignal::ALL.into_iter().enumerate() {
            assert_eq!(sig.index(), i);
        }
        assert_eq!(CrossSignal::ALL.len(), CrossSignal::COUNT);
    }
}
