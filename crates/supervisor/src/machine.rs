// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The global lifecycle state machine.
//!
//! All transitions run on the single supervisor thread; the event loop
//! wakes on pending bits and calls `service`, which dispatches in
//! priority order (shutdown, reload, child exits, cross-signals) and then
//! opportunistically restarts singletons and advances the machine. The
//! machine never calls `process::exit` itself: it records the requested
//! status and the loop performs the ordered cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use reef_core::{
    ChildExitStatus, ChildKind, ChildSignal, Clock, CrossSignal, KindSet, LifecycleState,
    ShutdownMode,
};
use reef_shmem::{ChildSlots, CrossSignalTable, Segment, SegmentError, SubsystemRegistry,
    FLAG_WALSENDER};

use crate::bgworker::BgWorkerScheduler;
use crate::config::Config;
use crate::latch::Latch;
use crate::launcher::{LaunchError, LaunchSpec, Launcher};
use crate::pidfile::{PidFile, PidFileError, PidFileStatus};
use crate::registry::{ChildRecord, ChildRegistry};
use crate::signals::PendingSignals;

/// How long recalcitrant children get before the SIGKILL escalation.
pub const KILL_ESCALATION: Duration = Duration::from_secs(5);

/// Longest the event loop may sleep.
pub const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Fatal supervisor errors: resource acquisition and launch of the first
/// startup worker. Everything else is handled inside the machine.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("shared memory provisioning failed: {0}")]
    Segment(#[from] SegmentError),

    #[error("pidfile error: {0}")]
    PidFile(#[from] PidFileError),

    #[error("failed to launch startup worker: {0}")]
    StartupLaunch(#[from] LaunchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Supervisor<L: Launcher, C: Clock> {
    pub(crate) config: Config,
    cli_options: Vec<(String, String)>,
    clock: C,
    pub(crate) launcher: Arc<L>,
    pending: Arc<PendingSignals>,
    latch: Arc<Latch>,

    state: LifecycleState,
    shutdown_mode: ShutdownMode,
    fatal_error: bool,
    pub(crate) conns_allowed: bool,

    pub(crate) registry: ChildRegistry,
    /// Singleton pids, indexed by `ChildKind as usize`.
    singletons: [Option<u32>; ChildKind::ALL.len()],
    scheduler: BgWorkerScheduler,

    segment: Option<Segment>,
    pub(crate) slots: Option<ChildSlots>,
    pub(crate) sigtable: Option<CrossSignalTable>,
    segment_provisions: u32,

    pidfile: Option<PidFile>,
    kill_deadline: Option<Instant>,
    pending_exit: Option<i32>,
    /// Archiver may be relaunched at most once per reap event.
    archiver_budget: bool,
}

impl<L: Launcher, C: Clock> Supervisor<L, C> {
    pub fn new(
        config: Config,
        cli_options: Vec<(String, String)>,
        clock: C,
        launcher: Arc<L>,
        pending: Arc<PendingSignals>,
        latch: Arc<Latch>,
    ) -> Self {
        let scheduler = BgWorkerScheduler::from_config(&config.bgworkers);
        Self {
            config,
            cli_options,
            clock,
            launcher,
            pending,
            latch,
            state: LifecycleState::Init,
            shutdown_mode: ShutdownMode::None,
            fatal_error: false,
            conns_allowed: true,
            registry: ChildRegistry::new(),
            singletons: [None; ChildKind::ALL.len()],
            scheduler,
            segment: None,
            slots: None,
            sigtable: None,
            segment_provisions: 0,
            pidfile: None,
            kill_deadline: None,
            pending_exit: None,
            archiver_budget: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.shutdown_mode
    }

    pub fn fatal_error(&self) -> bool {
        self.fatal_error
    }

    pub fn pending(&self) -> &Arc<PendingSignals> {
        &self.pending
    }

    pub fn latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    pub fn registry(&self) -> &ChildRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &BgWorkerScheduler {
        &self.scheduler
    }

    pub fn singleton(&self, kind: ChildKind) -> Option<u32> {
        self.singletons[kind as usize]
    }

    /// Exit status requested by the machine, once reached.
    pub fn wants_exit(&self) -> Option<i32> {
        self.pending_exit
    }

    /// Times the segment was provisioned this incarnation (boot plus one
    /// per crash-restart).
    pub fn segment_provisions(&self) -> u32 {
        self.segment_provisions
    }

    /// Whether the loop should still poll the listening sockets.
    pub fn accepting_sockets(&self) -> bool {
        !matches!(
            self.state,
            LifecycleState::WaitDeadEnd | LifecycleState::NoChildren
        ) && self.pending_exit.is_none()
    }

    pub fn take_pidfile(&mut self) -> Option<PidFile> {
        self.pidfile.take()
    }

    pub fn pidfile_ref(&self) -> Option<&PidFile> {
        self.pidfile.as_ref()
    }

    /// Tear down the segment views and remove the file; exit cleanup.
    pub fn destroy_segment(&mut self) {
        self.slots = None;
        self.sigtable = None;
        if let Some(segment) = self.segment.take() {
            if let Err(e) = segment.destroy() {
                warn!(error = %e, "failed to remove shared segment");
            }
        }
    }

    // ---- boot ----------------------------------------------------------

    /// Provision shared memory, write the pidfile, and launch Startup.
    pub async fn boot(&mut self, pidfile: Option<PidFile>) -> Result<(), SupervisorError> {
        debug_assert_eq!(self.state, LifecycleState::Init);

        self.provision_segment()?;
        self.pidfile = pidfile;
        if let Some(pidfile) = &mut self.pidfile {
            let key = self
                .segment
                .as_ref()
                .map(Segment::key_hex)
                .unwrap_or_default();
            pidfile.write_initial(&self.config, self.clock.epoch_secs(), &key)?;
        }

        if self.config.logging_collector {
            if let Err(e) = self.launch_child(LaunchSpec::of(ChildKind::SysLogger)).await {
                warn!(error = %e, "log collector failed to start");
            }
        }

        self.launch_child(LaunchSpec::of(ChildKind::Startup))
            .await
            .map_err(SupervisorError::StartupLaunch)?;
        self.set_state(LifecycleState::Startup);
        Ok(())
    }

    fn provision_segment(&mut self) -> Result<(), SegmentError> {
        debug_assert!(
            self.registry.is_empty(),
            "segment provisioned while children live"
        );
        let dir = self.config.segment_dir();
        std::fs::create_dir_all(&dir).map_err(SegmentError::Io)?;
        let mut registry = SubsystemRegistry::builtin();
        let segment = Segment::create(&dir, &mut registry, &self.config.sizing())?;
        self.slots = Some(segment.child_slots()?);
        self.sigtable = Some(segment.cross_signals()?);
        self.launcher
            .segment_changed(segment.path(), &segment.key_hex());
        self.segment = Some(segment);
        self.segment_provisions += 1;
        Ok(())
    }

    // ---- service: the per-wakeup dispatch ------------------------------

    /// Service pending work in priority order, then advance the machine.
    ///
    /// Called unconditionally after every loop wakeup, whatever woke us.
    pub async fn service(&mut self) {
        let mode = self.pending.take_shutdown();
        if mode.is_requested() {
            self.handle_shutdown_request(mode);
        }
        if self.pending.take_reload() {
            self.handle_reload();
        }
        if self.pending.take_child_exit() {
            self.drain_child_exits().await;
        }
        if self.pending.take_cross_signal() {
            self.consume_cross_signals().await;
        }

        self.escalate_kill_if_due();
        self.advance().await;
        if self.pending_exit.is_none() && !self.state.is_stopping() {
            self.start_missing_singletons().await;
            let throttle_due = self
                .scheduler
                .next_start_in(self.state, self.clock.now())
                .is_some_and(|wait| wait.is_zero());
            if self.scheduler.is_pending() || throttle_due {
                self.run_bgworker_pass().await;
            }
        }
    }

    /// Sleep budget for the next multiplexed wait.
    pub fn sleep_budget(&self) -> Duration {
        if self.pending.any_pending() {
            return Duration::ZERO;
        }
        if let Some(deadline) = self.kill_deadline {
            return deadline
                .saturating_duration_since(self.clock.now())
                .min(MAX_SLEEP);
        }
        if self.state.is_stopping() {
            // No worker scheduling happens while draining.
            return MAX_SLEEP;
        }
        if self.scheduler.is_pending() {
            return Duration::ZERO;
        }
        self.scheduler
            .next_start_in(self.state, self.clock.now())
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP)
    }

    // ---- shutdown ------------------------------------------------------

    fn handle_shutdown_request(&mut self, mode: ShutdownMode) {
        let before = self.shutdown_mode;
        self.shutdown_mode.escalate(mode);
        if self.shutdown_mode == before && before.is_requested() {
            return;
        }
        info!(mode = ?self.shutdown_mode, "shutdown requested");
        self.set_pidfile_status(PidFileStatus::Stopping);

        match self.shutdown_mode {
            ShutdownMode::None => {}
            ShutdownMode::Smart => {
                // Forbid new connections; sessions drain naturally.
                self.conns_allowed = false;
            }
            ShutdownMode::Fast => {
                self.conns_allowed = false;
                if !self.state.is_stopping() {
                    self.begin_stop_backends();
                }
            }
            ShutdownMode::Immediate => {
                self.conns_allowed = false;
                // Quit-with-core everything, skip the shutdown checkpoint.
                self.signal_many(KindSet::ALL, self.crash_signal());
                self.kill_deadline = Some(self.clock.now() + KILL_ESCALATION);
                if !matches!(
                    self.state,
                    LifecycleState::WaitDeadEnd | LifecycleState::NoChildren
                ) {
                    self.set_state(LifecycleState::StopBackends);
                    self.set_state(LifecycleState::WaitBackends);
                }
            }
        }
    }

    /// Begin the orderly teardown: terminate everything except the
    /// walsender class and the archiver (which drain on their own signal
    /// later) and wait for the registry to thin out.
    fn begin_stop_backends(&mut self) {
        self.set_state(LifecycleState::StopBackends);
        let walsenders = self.walsender_pids();
        for record in self.registry.iter(KindSet::ALL.without(ChildKind::Archiver)) {
            if walsenders.contains(&record.pid) {
                continue;
            }
            self.launcher_signal(record.pid, ChildSignal::Terminate);
        }
        self.set_state(LifecycleState::WaitBackends);
    }

    // ---- reload --------------------------------------------------------

    fn handle_reload(&mut self) {
        info!("reload requested, re-reading configuration");
        match Config::load(self.config.data_dir.clone(), &self.cli_options) {
            Ok(new_config) => {
                let bgworkers = new_config.bgworkers.clone();
                self.config = new_config;
                self.merge_bgworkers(&bgworkers);
            }
            Err(e) => {
                warn!(error = %e, "configuration reload failed; keeping current values");
            }
        }
        self.signal_many(KindSet::ALL, ChildSignal::Reload);
        if let Some(pid) = self.singleton(ChildKind::SysLogger) {
            self.signal_child(pid, ChildSignal::Reload);
        }
    }

    /// Deliver one signal to every live registry child of the given kinds.
    pub fn signal_many(&self, kinds: KindSet, sig: ChildSignal) {
        for pid in self.registry.pids(kinds) {
            self.signal_child(pid, sig);
        }
    }

    /// Track a dynamically-attached worker under the scheduler, flagging
    /// the registrant for removal notification.
    pub(crate) fn register_dynamic_worker(&mut self, pid: u32, registrant: Option<u32>) {
        let registrant = registrant.filter(|pid| self.registry.contains(*pid));
        if let Some(reg) = registrant {
            if let Some(record) = self.registry.get_mut(reg) {
                record.bgworker_notify = true;
            }
        }
        self.scheduler
            .register_dynamic(format!("dynamic-{pid}"), pid, registrant);
    }

    fn merge_bgworkers(&mut self, workers: &[crate::config::BgWorkerConfig]) {
        // Rebuilding would orphan running pids; merge names instead.
        let mut next = BgWorkerScheduler::from_config(workers);
        for entry in self.scheduler.entries() {
            if let Some(pid) = entry.pid {
                next.record_launch(&entry.name, pid);
            }
        }
        self.scheduler = next;
    }

    // ---- child exits ---------------------------------------------------

    async fn drain_child_exits(&mut self) {
        // Reaping drains to completion before the machine advances, so no
        // stale pid can be mistaken for a live child.
        self.archiver_budget = true;
        loop {
            let exits = self.launcher.drain_exits();
            if exits.is_empty() {
                break;
            }
            for exit in exits {
                self.process_child_exit(exit.pid, exit.status).await;
                if self.pending_exit.is_some() {
                    return;
                }
            }
        }
    }

    async fn process_child_exit(&mut self, pid: u32, status: ChildExitStatus) {
        // The log collector is respawned before any other reaping work so
        // messages about subsequent exits are not lost.
        if self.singleton(ChildKind::SysLogger) == Some(pid) {
            self.singletons[ChildKind::SysLogger as usize] = None;
            debug!(pid, %status, "log collector exited");
            if self.config.logging_collector && !self.state.is_stopping() {
                if let Err(e) = self.launch_child(LaunchSpec::of(ChildKind::SysLogger)).await {
                    warn!(error = %e, "log collector respawn failed");
                }
            }
            return;
        }

        let Some(record) = self.registry.remove(pid) else {
            debug!(pid, %status, "exit from unregistered pid ignored");
            return;
        };
        if let (Some(slot), Some(slots)) = (record.slot, &self.slots) {
            if let Err(e) = slots.clear(slot) {
                warn!(slot, error = %e, "failed to clear child slot");
            }
        }
        if record.kind.is_singleton() && self.singletons[record.kind as usize] == Some(pid) {
            self.singletons[record.kind as usize] = None;
        }
        if record.kind == ChildKind::BgWorker {
            self.scheduler.on_exit(pid, status, self.clock.now());
        }

        debug!(pid, kind = %record.kind, %status, "child exited");

        match record.kind {
            ChildKind::Startup => self.handle_startup_exit(status),
            ChildKind::Checkpointer
                if self.state == LifecycleState::Shutdown && status.is_clean() =>
            {
                // Shutdown checkpoint done; let the walsender class and
                // the archiver finish their backlog.
                for pid in self.walsender_pids() {
                    self.signal_child(pid, ChildSignal::FinishUp);
                }
                if let Some(pid) = self.singleton(ChildKind::Archiver) {
                    self.signal_child(pid, ChildSignal::FinishUp);
                }
                self.set_state(LifecycleState::Shutdown2);
            }
            ChildKind::Archiver if !status.is_crash() => {
                self.maybe_relaunch_archiver().await;
            }
            _ => {}
        }

        if status.is_crash() && !self.exit_expected(status) && record.kind != ChildKind::Startup {
            self.handle_child_crash(pid, record.kind, status);
        }
    }

    /// Whether an unclean exit is the expected outcome of our own
    /// signals rather than a fresh crash. Once a cascade or an immediate
    /// shutdown is underway, every further death is part of it.
    fn exit_expected(&self, status: ChildExitStatus) -> bool {
        if self.fatal_error || self.shutdown_mode == ShutdownMode::Immediate {
            return true;
        }
        self.state.is_stopping() && status == ChildExitStatus::Signaled(15)
    }

    fn handle_startup_exit(&mut self, status: ChildExitStatus) {
        if status.is_clean() {
            match self.state {
                LifecycleState::Startup | LifecycleState::Recovery | LifecycleState::HotStandby => {
                    self.enter_run();
                }
                _ => {}
            }
            return;
        }
        if self.state.is_stopping() && self.exit_expected(status) {
            return;
        }
        match self.state {
            LifecycleState::Startup => {
                // A startup failure before any recovery progress is
                // catastrophic; restarting would loop on the same error.
                error!(%status, "startup worker failed during startup; aborting");
                self.request_exit(1);
            }
            LifecycleState::Recovery | LifecycleState::HotStandby => {
                self.handle_child_crash(0, ChildKind::Startup, status);
            }
            _ => {
                if status.is_crash() {
                    self.handle_child_crash(0, ChildKind::Startup, status);
                }
            }
        }
    }

    /// The crash cascade: one routine, whatever kind died.
    fn handle_child_crash(&mut self, pid: u32, kind: ChildKind, status: ChildExitStatus) {
        error!(pid, %kind, %status, "child crashed; terminating all other children");
        if self.shutdown_mode != ShutdownMode::Immediate {
            self.fatal_error = true;
        }

        let sig = self.crash_signal();
        for other in self.registry.pids_except(pid) {
            self.signal_child(other, sig);
        }
        self.kill_deadline = Some(self.clock.now() + KILL_ESCALATION);

        if !matches!(
            self.state,
            LifecycleState::WaitDeadEnd | LifecycleState::NoChildren
        ) {
            self.set_state(LifecycleState::WaitBackends);
        }
    }

    fn crash_signal(&self) -> ChildSignal {
        if self.config.send_abort_for_crash {
            ChildSignal::Abort
        } else {
            ChildSignal::Quit
        }
    }

    fn escalate_kill_if_due(&mut self) {
        let Some(deadline) = self.kill_deadline else {
            return;
        };
        if self.clock.now() < deadline {
            return;
        }
        self.kill_deadline = None;
        let sig = if self.config.send_abort_for_kill {
            ChildSignal::Abort
        } else {
            ChildSignal::Kill
        };
        let survivors = self.registry.pids(KindSet::ALL);
        if !survivors.is_empty() {
            warn!(count = survivors.len(), "children still alive; escalating");
            for pid in survivors {
                self.signal_child(pid, sig);
            }
        }
    }

    // ---- cross-signals -------------------------------------------------

    async fn consume_cross_signals(&mut self) {
        let pending = match &self.sigtable {
            Some(table) => match table.drain() {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "cross-signal drain failed");
                    return;
                }
            },
            None => return,
        };

        for signal in pending {
            debug!(?signal, "cross-signal received");
            match signal {
                CrossSignal::RecoveryStarted => {
                    if self.state == LifecycleState::Startup {
                        self.set_state(LifecycleState::Recovery);
                    }
                }
                CrossSignal::BeginHotStandby => {
                    if self.state == LifecycleState::Recovery && self.config.hot_standby {
                        self.set_state(LifecycleState::HotStandby);
                        self.set_pidfile_status(PidFileStatus::Ready);
                        info!("database system is ready to accept read-only connections");
                        self.scheduler.set_pending();
                    }
                }
                CrossSignal::StartWalReceiver => {
                    if self.singleton(ChildKind::WalReceiver).is_none()
                        && !self.state.is_stopping()
                        && self.state != LifecycleState::Init
                    {
                        if let Err(e) = self
                            .launch_child(LaunchSpec::of(ChildKind::WalReceiver))
                            .await
                        {
                            warn!(error = %e, "walreceiver launch failed");
                        }
                    }
                }
                CrossSignal::StartAutovacWorker => {
                    self.maybe_start_autovac_worker().await;
                }
                CrossSignal::BgworkerStateChanged => {
                    self.scheduler.set_pending();
                }
                CrossSignal::AdvanceStateMachine => {
                    // Advance runs at the end of every service pass.
                }
                CrossSignal::RotateLogfile => {
                    if let Some(pid) = self.singleton(ChildKind::SysLogger) {
                        self.signal_child(pid, ChildSignal::Notify);
                    }
                }
            }
        }
    }

    async fn maybe_start_autovac_worker(&mut self) {
        if self.state != LifecycleState::Run || !self.config.autovacuum {
            return;
        }
        let live = self.registry.count(KindSet::single(ChildKind::AutoVacWorker));
        if live >= self.config.max_autovac_workers as usize {
            return;
        }
        if let Err(e) = self
            .launch_child(LaunchSpec::of(ChildKind::AutoVacWorker))
            .await
        {
            warn!(error = %e, "autovacuum worker launch failed");
        }
    }

    // ---- state progression ---------------------------------------------

    fn enter_run(&mut self) {
        self.set_state(LifecycleState::Run);
        self.fatal_error = false;
        self.conns_allowed = !self.shutdown_mode.is_requested();
        self.set_pidfile_status(PidFileStatus::Ready);
        info!("database system is ready to accept connections");
        self.scheduler.set_pending();
    }

    /// Advance through waiting states until a fixpoint.
    async fn advance(&mut self) {
        loop {
            let before = self.state;
            self.advance_once().await;
            if self.state == before || self.pending_exit.is_some() {
                return;
            }
        }
    }

    async fn advance_once(&mut self) {
        match self.state {
            LifecycleState::Run | LifecycleState::HotStandby => {
                if self.shutdown_mode == ShutdownMode::Smart && self.session_count() == 0 {
                    self.begin_stop_backends();
                }
            }
            LifecycleState::Init
            | LifecycleState::Startup
            | LifecycleState::Recovery => {
                // A smart request with no sessions to drain behaves like
                // an orderly stop of the recovery chain.
                if self.shutdown_mode.is_requested()
                    && self.shutdown_mode != ShutdownMode::Immediate
                {
                    self.begin_stop_backends();
                }
            }
            LifecycleState::WaitBackends => self.advance_wait_backends(),
            LifecycleState::Shutdown2 => {
                if self.walsender_pids().is_empty()
                    && self.singleton(ChildKind::Archiver).is_none()
                {
                    self.set_state(LifecycleState::WaitDeadEnd);
                }
            }
            LifecycleState::WaitDeadEnd => {
                if self.registry.is_empty() {
                    self.set_state(LifecycleState::NoChildren);
                }
            }
            LifecycleState::NoChildren => self.finish_no_children().await,
            LifecycleState::StopBackends | LifecycleState::Shutdown => {}
        }
    }

    fn advance_wait_backends(&mut self) {
        let crash_path = self.fatal_error || self.shutdown_mode == ShutdownMode::Immediate;
        let walsenders = self.walsender_pids();

        let remaining = self
            .registry
            .iter(KindSet::ALL)
            .filter(|record| !record.dead_end)
            .filter(|record| {
                if crash_path {
                    return true;
                }
                record.kind != ChildKind::Checkpointer
                    && record.kind != ChildKind::Archiver
                    && !walsenders.contains(&record.pid)
            })
            .count();
        if remaining > 0 {
            return;
        }

        if crash_path {
            self.set_state(LifecycleState::WaitDeadEnd);
            return;
        }

        match self.singleton(ChildKind::Checkpointer) {
            Some(pid) => {
                self.set_state(LifecycleState::Shutdown);
                // Ask for the shutdown checkpoint; Shutdown2 follows its
                // clean exit.
                self.signal_child(pid, ChildSignal::FinishUp);
            }
            None => {
                // Never got far enough to need a checkpoint.
                for pid in self.walsender_pids() {
                    self.signal_child(pid, ChildSignal::FinishUp);
                }
                if let Some(pid) = self.singleton(ChildKind::Archiver) {
                    self.signal_child(pid, ChildSignal::FinishUp);
                }
                self.set_state(LifecycleState::Shutdown2);
            }
        }
    }

    async fn finish_no_children(&mut self) {
        if self.shutdown_mode.is_requested() {
            let code = if self.fatal_error { 1 } else { 0 };
            info!(code, "database system is shut down");
            self.request_exit(code);
            return;
        }
        if self.fatal_error && self.config.restart_after_crash {
            info!("all children exited; re-initializing shared memory");
            if let Err(e) = self.provision_segment() {
                error!(error = %e, "shared memory re-initialization failed");
                self.request_exit(1);
                return;
            }
            self.set_pidfile_status(PidFileStatus::Starting);
            self.kill_deadline = None;
            // fatal_error stays set until recovery completes, so clients
            // are told the system is in recovery mode.
            match self.launch_child(LaunchSpec::of(ChildKind::Startup)).await {
                Ok(_) => self.set_state(LifecycleState::Startup),
                Err(e) => {
                    error!(error = %e, "startup relaunch failed");
                    self.request_exit(1);
                }
            }
            return;
        }
        self.request_exit(1);
    }

    // ---- singletons and bgworkers --------------------------------------

    async fn start_missing_singletons(&mut self) {
        let mut wanted: Vec<ChildKind> = Vec::new();
        match self.state {
            LifecycleState::Recovery | LifecycleState::HotStandby => {
                wanted.push(ChildKind::BgWriter);
                wanted.push(ChildKind::Checkpointer);
                if self.config.summarize_wal {
                    wanted.push(ChildKind::WalSummarizer);
                }
                if self.config.sync_replication_slots && self.config.standby_mode {
                    wanted.push(ChildKind::SlotSync);
                }
            }
            LifecycleState::Run => {
                wanted.push(ChildKind::BgWriter);
                wanted.push(ChildKind::Checkpointer);
                wanted.push(ChildKind::WalWriter);
                if self.config.autovacuum {
                    wanted.push(ChildKind::AutoVacLauncher);
                }
                if self.config.archive_mode {
                    wanted.push(ChildKind::Archiver);
                }
                if self.config.summarize_wal {
                    wanted.push(ChildKind::WalSummarizer);
                }
            }
            _ => {}
        }
        if self.config.logging_collector && !self.state.is_stopping() {
            wanted.push(ChildKind::SysLogger);
        }

        for kind in wanted {
            if self.singleton(kind).is_none() {
                if let Err(e) = self.launch_child(LaunchSpec::of(kind)).await {
                    warn!(%kind, error = %e, "singleton launch failed; will retry");
                }
            }
        }
    }

    async fn maybe_relaunch_archiver(&mut self) {
        if !self.archiver_budget
            || !self.config.archive_mode
            || self.state.is_stopping()
            || self.singleton(ChildKind::Archiver).is_some()
        {
            return;
        }
        self.archiver_budget = false;
        if let Err(e) = self.launch_child(LaunchSpec::of(ChildKind::Archiver)).await {
            warn!(error = %e, "archiver relaunch failed");
        }
    }

    async fn run_bgworker_pass(&mut self) {
        let pass = self.scheduler.pass(self.state, self.clock.now());
        for (name, notify_pid) in pass.removed {
            info!(worker = %name, "background worker removed");
            // Only a registrant that is still alive (and still flagged)
            // gets the notification; the pid may have been recycled.
            let registrant = notify_pid.filter(|pid| {
                self.registry
                    .get(*pid)
                    .is_some_and(|record| record.bgworker_notify)
            });
            if let Some(pid) = registrant {
                self.signal_child(pid, ChildSignal::Notify);
            }
        }
        for name in pass.start {
            let spec = LaunchSpec {
                bgworker_name: Some(name.clone()),
                ..LaunchSpec::of(ChildKind::BgWorker)
            };
            match self.launch_child(spec).await {
                Ok(pid) => self.scheduler.record_launch(&name, pid),
                Err(e) => {
                    warn!(worker = %name, error = %e, "background worker launch failed");
                    self.scheduler.record_launch_failure(&name, self.clock.now());
                }
            }
        }
    }

    // ---- launching -----------------------------------------------------

    /// Launch one child and account for it.
    pub(crate) async fn launch_child(&mut self, mut spec: LaunchSpec) -> Result<u32, LaunchError> {
        let kind = spec.kind;
        if kind.is_singleton() && self.singleton(kind).is_some() {
            // Never two live instances of a singleton kind.
            self.invariant_violated(&format!("duplicate launch of singleton {kind}"));
            return Err(LaunchError::Io(std::io::Error::other(
                "singleton already running",
            )));
        }

        let mut slot = None;
        if kind.attaches_to_segment() && !spec.dead_end {
            if let Some(slots) = &self.slots {
                slot = slots.first_free().unwrap_or(None);
            }
        }
        if spec.cancel_token == 0 {
            spec.cancel_token = fresh_cancel_token();
        }
        let cancel_token = spec.cancel_token;
        spec.slot = slot;

        let dead_end = spec.dead_end;
        let pid = self.launcher.launch(spec).await?;

        if kind.attaches_to_segment() {
            self.registry.add(ChildRecord {
                pid,
                kind,
                slot,
                cancel_token,
                dead_end,
                bgworker_notify: false,
            });
            if let (Some(slot), Some(slots)) = (slot, &self.slots) {
                if let Err(e) = slots.publish(slot, pid, cancel_token) {
                    warn!(slot, error = %e, "failed to publish child slot");
                }
            }
        }
        if kind.is_singleton() {
            self.singletons[kind as usize] = Some(pid);
        }
        Ok(pid)
    }

    // ---- helpers -------------------------------------------------------

    fn set_state(&mut self, state: LifecycleState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "lifecycle transition");
            self.state = state;
        }
    }

    pub(crate) fn signal_child(&self, pid: u32, sig: ChildSignal) {
        self.launcher_signal(pid, sig);
    }

    fn launcher_signal(&self, pid: u32, sig: ChildSignal) {
        if let Err(e) = self.launcher.signal(pid, sig) {
            warn!(pid, ?sig, error = %e, "signal delivery failed");
        }
    }

    /// Sessions that still count toward the smart-shutdown drain: live,
    /// not dead-end, not reclassified as walsenders.
    fn session_count(&self) -> usize {
        let walsenders = self.walsender_pids();
        self.registry
            .iter(KindSet::single(ChildKind::Session))
            .filter(|record| !record.dead_end && !walsenders.contains(&record.pid))
            .count()
    }

    /// Pids of sessions whose shared slot carries the walsender flag.
    fn walsender_pids(&self) -> Vec<u32> {
        let Some(slots) = &self.slots else {
            return Vec::new();
        };
        self.registry
            .iter(KindSet::single(ChildKind::Session))
            .filter_map(|record| {
                let slot = record.slot?;
                let entry = slots.read(slot).ok()?;
                (entry.pid == record.pid && entry.flags & FLAG_WALSENDER != 0)
                    .then_some(record.pid)
            })
            .collect()
    }

    fn set_pidfile_status(&mut self, status: PidFileStatus) {
        if let Some(pidfile) = &mut self.pidfile {
            if let Err(e) = pidfile.append_status(status) {
                warn!(error = %e, "pidfile status update failed");
            }
        }
    }

    fn invariant_violated(&mut self, message: &str) {
        // Never attempt to continue past a broken invariant.
        error!(message, "supervisor invariant violated");
        self.request_exit(1);
    }

    fn request_exit(&mut self, code: i32) {
        if self.pending_exit.is_none() {
            self.pending_exit = Some(code);
            self.latch.set();
        }
    }
}

/// Cryptographically strong 32-bit cancel token; never zero so a free
/// slot can't be confused with a live one.
pub(crate) fn fresh_cancel_token() -> u32 {
    loop {
        let token = OsRng.next_u32();
        if token != 0 {
            return token;
        }
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
