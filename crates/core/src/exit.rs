// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exit-status classification for reaped children.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildExitStatus {
    Code(i32),
    Signaled(i32),
}

impl ChildExitStatus {
    /// Exit status 0: the child finished its job.
    pub fn is_clean(self) -> bool {
        self == ChildExitStatus::Code(0)
    }

    /// Exit status 1: the child failed but shut down in an orderly way
    /// (shared state is intact, no cascade needed).
    pub fn is_clean_fatal(self) -> bool {
        self == ChildExitStatus::Code(1)
    }

    /// Anything that is neither 0 nor 1 — including death by signal —
    /// counts as a crash and triggers the crash cascade.
    pub fn is_crash(self) -> bool {
        !self.is_clean() && !self.is_clean_fatal()
    }
}

impl fmt::Display for ChildExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExitStatus::Code(code) => write!(f, "exit code {code}"),
            ChildExitStatus::Signaled(sig) => write!(f, "signal {sig}"),
        }
    }
}
