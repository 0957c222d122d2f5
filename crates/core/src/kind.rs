// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process kinds and kind sets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a supervised child process.
///
/// Every child the supervisor launches has exactly one kind. Most kinds
/// are singletons (at most one live instance); sessions, autovacuum
/// workers, and background workers are multiplicities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    /// Crash/startup recovery driver; runs first, exits when the cluster
    /// is consistent.
    Startup,
    BgWriter,
    Checkpointer,
    WalWriter,
    WalReceiver,
    WalSummarizer,
    AutoVacLauncher,
    AutoVacWorker,
    Archiver,
    /// Log collector. The only kind that never attaches to the shared
    /// segment, so it is tracked outside the child registry.
    SysLogger,
    SlotSync,
    /// Per-connection session worker.
    Session,
    /// Registered long-lived background worker.
    BgWorker,
}

impl ChildKind {
    pub const ALL: [ChildKind; 13] = [
        ChildKind::Startup,
        ChildKind::BgWriter,
        ChildKind::Checkpointer,
        ChildKind::WalWriter,
        ChildKind::WalReceiver,
        ChildKind::WalSummarizer,
        ChildKind::AutoVacLauncher,
        ChildKind::AutoVacWorker,
        ChildKind::Archiver,
        ChildKind::SysLogger,
        ChildKind::SlotSync,
        ChildKind::Session,
        ChildKind::BgWorker,
    ];

    /// Kinds with at most one live instance at any moment.
    pub fn is_singleton(self) -> bool {
        !matches!(
            self,
            ChildKind::Session | ChildKind::AutoVacWorker | ChildKind::BgWorker
        )
    }

    /// Whether children of this kind attach to the shared segment.
    ///
    /// A child appears in the registry if and only if it is attached.
    pub fn attaches_to_segment(self) -> bool {
        !matches!(self, ChildKind::SysLogger)
    }

    /// Stable lowercase label, used in argv, payload files, and logs.
    pub fn label(self) -> &'static str {
        match self {
            ChildKind::Startup => "startup",
            ChildKind::BgWriter => "bgwriter",
            ChildKind::Checkpointer => "checkpointer",
            ChildKind::WalWriter => "walwriter",
            ChildKind::WalReceiver => "walreceiver",
            ChildKind::WalSummarizer => "walsummarizer",
            ChildKind::AutoVacLauncher => "autovac-launcher",
            ChildKind::AutoVacWorker => "autovac-worker",
            ChildKind::Archiver => "archiver",
            ChildKind::SysLogger => "syslogger",
            ChildKind::SlotSync => "slotsync",
            ChildKind::Session => "session",
            ChildKind::BgWorker => "bgworker",
        }
    }

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error returned when parsing an unrecognized kind label.
#[derive(Debug, Error)]
#[error("unrecognized child kind: {0}")]
pub struct UnknownKindError(pub String);

impl FromStr for ChildKind {
    type Err = UnknownKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChildKind::ALL
            .into_iter()
            .find(|k| k.label() == s)
            .ok_or_else(|| UnknownKindError(s.to_string()))
    }
}

/// Set of child kinds, used to filter registry scans and signal fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u16);

impl KindSet {
    pub const EMPTY: KindSet = KindSet(0);
    pub const ALL: KindSet = KindSet((1 << 13) - 1);

    pub const fn single(kind: ChildKind) -> Self {
        KindSet(kind.bit())
    }

    pub const fn of(kinds: &[ChildKind]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < kinds.len() {
            bits |= kinds[i].bit();
            i += 1;
        }
        KindSet(bits)
    }

    pub const fn with(self, kind: ChildKind) -> Self {
        KindSet(self.0 | kind.bit())
    }

    pub const fn without(self, kind: ChildKind) -> Self {
        KindSet(self.0 & !kind.bit())
    }

    pub const fn union(self, other: KindSet) -> Self {
        KindSet(self.0 | other.0)
    }

    pub fn contains(self, kind: ChildKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
#[path = "kind_tests.rs"]
mod tests;
