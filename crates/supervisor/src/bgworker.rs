// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background-worker scheduling with interval-based restart throttling.
//!
//! The scheduler is pure over `Clock` time: a pass computes which
//! registered workers to launch in the current lifecycle state, the
//! supervisor performs the launches, and exits are reported back. At most
//! 100 launches happen per pass; a truncated pass re-arms the pending
//! flag so the event loop runs again without sleeping.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use reef_core::{ChildExitStatus, LifecycleState};

use crate::config::BgWorkerConfig;

/// Maximum launches per scheduling pass.
pub const MAX_STARTS_PER_PASS: usize = 100;

/// When a registered worker may first be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BgwStartTime {
    /// As soon as the supervisor is past Init.
    #[default]
    SupervisorStart,
    /// Once the cluster is consistent (hot standby or normal operation).
    ConsistentState,
    /// Only after recovery has fully finished.
    RecoveryFinished,
}

impl BgwStartTime {
    pub fn satisfied_by(self, state: LifecycleState) -> bool {
        match self {
            BgwStartTime::SupervisorStart => matches!(
                state,
                LifecycleState::Startup
                    | LifecycleState::Recovery
                    | LifecycleState::HotStandby
                    | LifecycleState::Run
            ),
            BgwStartTime::ConsistentState => {
                matches!(state, LifecycleState::HotStandby | LifecycleState::Run)
            }
            BgwStartTime::RecoveryFinished => state == LifecycleState::Run,
        }
    }
}

/// One registered worker and its runtime bookkeeping.
#[derive(Debug, Clone)]
pub struct BgWorkerEntry {
    pub name: String,
    pub start_time: BgwStartTime,
    /// Restart throttle; `None` means never restart after a crash.
    pub restart_interval: Option<Duration>,
    pub pid: Option<u32>,
    /// Marked for removal; cleaned up on the next pass.
    pub terminate: bool,
    /// Pid to `Notify` when a never-restart entry is removed.
    pub notify_pid: Option<u32>,
    crashed_at: Option<Instant>,
}

impl BgWorkerEntry {
    fn from_config(config: &BgWorkerConfig) -> Self {
        Self {
            name: config.name.clone(),
            start_time: config.start_time,
            restart_interval: config.restart_interval(),
            pid: None,
            terminate: false,
            notify_pid: None,
            crashed_at: None,
        }
    }
}

/// Result of one scheduling pass.
#[derive(Debug, Default)]
pub struct SchedulerPass {
    /// Worker names to launch now, in registration order.
    pub start: Vec<String>,
    /// Entries removed this pass: (name, registrant pid to notify).
    pub removed: Vec<(String, Option<u32>)>,
}

pub struct BgWorkerScheduler {
    entries: Vec<BgWorkerEntry>,
    pending: bool,
}

impl BgWorkerScheduler {
    pub fn from_config(workers: &[BgWorkerConfig]) -> Self {
        Self {
            entries: workers.iter().map(BgWorkerEntry::from_config).collect(),
            // Arm the first pass so startup launches happen promptly.
            pending: true,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Arm another pass (bgworker-state-changed cross-signal).
    pub fn set_pending(&mut self) {
        self.pending = true;
    }

    pub fn entries(&self) -> &[BgWorkerEntry] {
        &self.entries
    }

    /// Track a dynamically-attached worker that is already running.
    ///
    /// Dynamic workers never restart; when the entry is removed the
    /// registrant is told via the removal report.
    pub fn register_dynamic(&mut self, name: String, pid: u32, notify_pid: Option<u32>) {
        self.entries.push(BgWorkerEntry {
            name,
            start_time: BgwStartTime::SupervisorStart,
            restart_interval: None,
            pid: Some(pid),
            terminate: false,
            notify_pid,
            crashed_at: None,
        });
    }

    /// One scheduling pass. The caller launches the returned names and
    /// reports pids via `record_launch`.
    pub fn pass(&mut self, state: LifecycleState, now: Instant) -> SchedulerPass {
        self.pending = false;
        let mut result = SchedulerPass::default();

        let mut remove = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.pid.is_some() {
                continue;
            }
            if entry.terminate {
                remove.push(index);
                result.removed.push((entry.name.clone(), entry.notify_pid));
                continue;
            }
            if let Some(crashed_at) = entry.crashed_at {
                let Some(interval) = entry.restart_interval else {
                    remove.push(index);
                    result
                        .removed
                        .push((entry.name.clone(), entry.notify_pid));
                    continue;
                };
                if now < crashed_at + interval {
                    continue;
                }
            }
            if !entry.start_time.satisfied_by(state) {
                continue;
            }
            if result.start.len() == MAX_STARTS_PER_PASS {
                // Ceiling hit: schedule another pass instead of looping here.
                self.pending = true;
                break;
            }
            result.start.push(entry.name.clone());
        }

        for index in remove.into_iter().rev() {
            let entry = self.entries.remove(index);
            info!(worker = %entry.name, "background worker unregistered");
        }

        result
    }

    /// Record a successful launch from the last pass.
    pub fn record_launch(&mut self, name: &str, pid: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.pid = Some(pid);
            entry.crashed_at = None;
        }
    }

    /// Record a launch failure; throttled exactly like a crash.
    pub fn record_launch_failure(&mut self, name: &str, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.crashed_at = Some(now);
        }
    }

    /// Report a reaped worker exit. Returns the entry name when the pid
    /// belonged to a registered worker.
    pub fn on_exit(
        &mut self,
        pid: u32,
        status: ChildExitStatus,
        now: Instant,
    ) -> Option<&BgWorkerEntry> {
        let entry = self.entries.iter_mut().find(|e| e.pid == Some(pid))?;
        entry.pid = None;
        if status.is_clean() {
            // Finished its job; gone on the next pass.
            entry.terminate = true;
            debug!(worker = %entry.name, "background worker finished");
        } else {
            entry.crashed_at = Some(now);
        }
        self.pending = true;
        Some(entry)
    }

    /// Time until the earliest throttled restart becomes due, for the
    /// event loop's sleep budget. `None` when nothing is waiting.
    pub fn next_start_in(&self, state: LifecycleState, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .filter(|e| e.pid.is_none() && !e.terminate && e.start_time.satisfied_by(state))
            .filter_map(|e| {
                let crashed_at = e.crashed_at?;
                let interval = e.restart_interval?;
                Some((crashed_at + interval).saturating_duration_since(now))
            })
            .min()
    }

    /// Count of currently running registered workers.
    pub fn running(&self) -> usize {
        self.entries.iter().filter(|e| e.pid.is_some()).count()
    }
}

#[cfg(test)]
#[path = "bgworker_tests.rs"]
mod tests;
