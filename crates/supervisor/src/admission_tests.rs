// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::Config;
use crate::latch::Latch;
use crate::launcher::FakeLauncher;
use crate::signals::PendingSignals;
use reef_core::{ChildExitStatus, FakeClock};
use std::sync::Arc;
use tempfile::tempdir;

struct Harness {
    _dir: tempfile::TempDir,
    launcher: Arc<FakeLauncher>,
    sup: Supervisor<FakeLauncher, FakeClock>,
}

fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempdir().unwrap();
    let mut config = Config::defaults(dir.path().to_path_buf());
    config.max_sessions = 3;
    config.max_autovac_workers = 1;
    config.max_walsenders = 1;
    config.max_bgworkers = 1;
    config.shared_buffer_pages = 2;
    config.wal_buffer_pages = 1;
    config.max_replication_slots = 1;
    tweak(&mut config);

    let launcher = Arc::new(FakeLauncher::new());
    let sup = Supervisor::new(
        config,
        Vec::new(),
        FakeClock::new(),
        Arc::clone(&launcher),
        Arc::new(PendingSignals::new()),
        Arc::new(Latch::new()),
    );
    Harness {
        _dir: dir,
        launcher,
        sup,
    }
}

fn socket() -> ClientSocket {
    let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
    ClientSocket::Unix(a)
}

impl Harness {
    async fn to_run(&mut self) {
        self.sup.boot(None).await.unwrap();
        let startup = self.launcher.last_launch_of(ChildKind::Startup).unwrap().pid;
        self.launcher.inject_exit(startup, ChildExitStatus::Code(0));
        self.sup.pending().set_child_exit();
        self.sup.service().await;
        assert_eq!(self.sup.state(), LifecycleState::Run);
    }

    async fn connect(&mut self) {
        self.sup
            .handle_startup_packet(
                StartupPacket::Connect {
                    kind: ConnectKind::Session,
                },
                socket(),
            )
            .await;
    }

    fn last_launch(&self) -> crate::launcher::FakeLaunch {
        self.launcher.launches().last().cloned().unwrap()
    }
}

#[tokio::test]
async fn startup_state_rejects_with_starting_up() {
    let mut h = harness_with(|_| {});
    h.sup.boot(None).await.unwrap();

    assert_eq!(
        h.sup.admission_decision(ConnectKind::Session),
        Err(RejectReason::StartingUp)
    );

    let live_before = h.sup.registry().len();
    h.connect().await;

    let launch = h.last_launch();
    assert!(launch.dead_end);
    assert_eq!(
        launch.reject_reason.as_deref(),
        Some("the database system is starting up")
    );
    assert!(launch.had_socket);

    // The dead-end is registered (it is attached) and the count returns
    // to its pre-attempt value once it drains.
    assert_eq!(h.sup.registry().len(), live_before + 1);
    h.launcher.inject_exit(launch.pid, ChildExitStatus::Code(0));
    h.sup.pending().set_child_exit();
    h.sup.service().await;
    assert_eq!(h.sup.registry().len(), live_before);
}

#[tokio::test]
async fn run_state_admits_sessions_with_fresh_tokens() {
    let mut h = harness_with(|_| {});
    h.to_run().await;

    h.connect().await;
    let launch = h.last_launch();
    assert!(!launch.dead_end);
    assert!(launch.had_socket);

    let record = h.sup.registry().get(launch.pid).unwrap();
    assert_eq!(record.kind, ChildKind::Session);
    assert_ne!(record.cancel_token, 0);
    assert!(record.slot.is_some());
}

#[tokio::test]
async fn recovery_rejections_name_the_phase() {
    let mut h = harness_with(|_| {});
    h.sup.boot(None).await.unwrap();

    h.sup
        .sigtable
        .as_ref()
        .unwrap()
        .raise(reef_core::CrossSignal::RecoveryStarted)
        .unwrap();
    h.sup.pending().set_cross_signal();
    h.sup.service().await;
    assert_eq!(h.sup.state(), LifecycleState::Recovery);
    assert_eq!(
        h.sup.admission_decision(ConnectKind::Session),
        Err(RejectReason::NotYetConsistent)
    );
}

#[tokio::test]
async fn crash_recovery_rejects_with_recovery_mode() {
    let mut h = harness_with(|_| {});
    h.to_run().await;
    h.connect().await;
    let session = h.last_launch().pid;

    // Crash the session and drain the cascade back to Startup.
    h.launcher.inject_exit(session, ChildExitStatus::Signaled(11));
    h.sup.pending().set_child_exit();
    h.sup.service().await;
    for pid in h.sup.registry().pids(reef_core::KindSet::ALL) {
        h.launcher.inject_exit(pid, ChildExitStatus::Signaled(3));
    }
    h.sup.pending().set_child_exit();
    h.sup.service().await;
    assert_eq!(h.sup.state(), LifecycleState::Startup);

    assert_eq!(
        h.sup.admission_decision(ConnectKind::Session),
        Err(RejectReason::InRecovery)
    );
}

#[tokio::test]
async fn hot_standby_admits_sessions() {
    let mut h = harness_with(|_| {});
    h.sup.boot(None).await.unwrap();
    for signal in [
        reef_core::CrossSignal::RecoveryStarted,
        reef_core::CrossSignal::BeginHotStandby,
    ] {
        h.sup.sigtable.as_ref().unwrap().raise(signal).unwrap();
        h.sup.pending().set_cross_signal();
        h.sup.service().await;
    }
    assert_eq!(h.sup.state(), LifecycleState::HotStandby);
    assert_eq!(h.sup.admission_decision(ConnectKind::Session), Ok(()));
}

#[tokio::test]
async fn the_child_ceiling_rejects_with_too_many() {
    let mut h = harness_with(|_| {});
    h.to_run().await;

    // ceiling = 2*(3+1+1+1+1) = 14 live children. Fill with sessions
    // regardless of kind: the ceiling counts every live child.
    while h.sup.registry().len() < h.sup.config.child_ceiling() as usize {
        let pid = 9000 + h.sup.registry().len() as u32;
        h.sup.registry.add(crate::registry::ChildRecord {
            pid,
            kind: ChildKind::Session,
            slot: None,
            cancel_token: 1,
            dead_end: false,
            bgworker_notify: false,
        });
    }

    assert_eq!(
        h.sup.admission_decision(ConnectKind::Session),
        Err(RejectReason::TooManyClients)
    );
    // The ceiling applies to bgworker attachments too.
    assert_eq!(
        h.sup
            .admission_decision(ConnectKind::BgWorker { registrant: None }),
        Err(RejectReason::TooManyClients)
    );
}

#[tokio::test]
async fn smart_drain_rejects_sessions_but_admits_bgworkers() {
    let mut h = harness_with(|_| {});
    h.to_run().await;
    h.connect().await;

    h.sup.pending().request_shutdown(ShutdownMode::Smart);
    h.sup.service().await;
    assert!(h.sup.draining());

    assert_eq!(
        h.sup.admission_decision(ConnectKind::Session),
        Err(RejectReason::ShuttingDown)
    );
    assert_eq!(
        h.sup
            .admission_decision(ConnectKind::BgWorker { registrant: None }),
        Ok(())
    );
}

#[tokio::test]
async fn bgworker_connects_launch_tracked_dynamic_workers() {
    let mut h = harness_with(|_| {});
    h.to_run().await;
    h.connect().await;
    let registrant = h.last_launch().pid;

    h.sup
        .handle_startup_packet(
            StartupPacket::Connect {
                kind: ConnectKind::BgWorker {
                    registrant: Some(registrant),
                },
            },
            socket(),
        )
        .await;

    let launch = h.last_launch();
    assert_eq!(launch.kind, ChildKind::BgWorker);
    assert!(!launch.dead_end);
    assert!(launch.had_socket);

    // Tracked as a never-restart entry bound to its registrant, and the
    // registrant's record carries the notify flag.
    let entries = h.sup.scheduler().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pid, Some(launch.pid));
    assert_eq!(entries[0].restart_interval, None);
    assert_eq!(entries[0].notify_pid, Some(registrant));
    assert!(h.sup.registry().get(registrant).unwrap().bgworker_notify);
}

#[tokio::test]
async fn cancel_with_matching_token_interrupts_exactly_once() {
    let mut h = harness_with(|_| {});
    h.to_run().await;
    h.connect().await;
    let launch = h.last_launch();
    let token = h.sup.registry().get(launch.pid).unwrap().cancel_token;

    h.sup
        .handle_startup_packet(
            StartupPacket::Cancel {
                pid: launch.pid,
                token,
            },
            socket(),
        )
        .await;

    assert_eq!(
        h.launcher.signals_for(launch.pid),
        vec![ChildSignal::Interrupt]
    );
}

#[tokio::test]
async fn cancel_with_wrong_token_is_dropped() {
    let mut h = harness_with(|_| {});
    h.to_run().await;
    h.connect().await;
    let launch = h.last_launch();
    let token = h.sup.registry().get(launch.pid).unwrap().cancel_token;

    h.sup
        .handle_startup_packet(
            StartupPacket::Cancel {
                pid: launch.pid,
                token: token.wrapping_add(1),
            },
            socket(),
        )
        .await;
    h.sup
        .handle_startup_packet(
            StartupPacket::Cancel {
                pid: launch.pid + 1000,
                token,
            },
            socket(),
        )
        .await;

    // Target session unaffected, nobody else signaled.
    assert!(h.launcher.signals().is_empty());
}

#[tokio::test]
async fn sockets_stop_being_polled_in_wait_dead_end() {
    let mut h = harness_with(|_| {});
    h.to_run().await;
    assert!(h.sup.accepting_sockets());

    h.sup.pending().request_shutdown(ShutdownMode::Immediate);
    h.sup.service().await;

    // Children are still draining, but dead-end territory is close:
    // drain everything so the machine reaches WaitDeadEnd or further.
    loop {
        let pids = h.sup.registry().pids(reef_core::KindSet::ALL);
        if pids.is_empty() {
            break;
        }
        for pid in pids {
            h.launcher.inject_exit(pid, ChildExitStatus::Signaled(9));
        }
        h.sup.pending().set_child_exit();
        h.sup.service().await;
    }
    assert!(!h.sup.accepting_sockets());
}
