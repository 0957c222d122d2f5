// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-side entry for `reefd spawn-child`.
//!
//! Worker internals (SQL, WAL redo, vacuum) live outside the supervisor;
//! what lives here is the contract surface the supervisor consumes:
//! reattach-and-verify, cross-signals paired with SIGUSR1, the control
//! file state word, exit codes, and the signal dispositions. Sessions and
//! dead-end children serve the accepted socket on stdin/stdout; every
//! other kind holds the death-watch pipe on stdin and exits when it
//! closes.

use std::io::ErrorKind;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tracing::{debug, error, info};

use reef_core::{ChildKind, CrossSignal};
use reef_shmem::Segment;

use crate::datadir::{self, ClusterState};
use crate::launcher::SpawnPayload;
use crate::protocol;

/// Exit status a worker uses for quit-with-core requests; anything other
/// than 0 or 1 reads as a crash to the supervisor, which is exactly what
/// an immediate-quit must look like.
const EXIT_QUIT: i32 = 2;

/// Exit status when the supervisor dies under us (death pipe EOF).
const EXIT_ORPHANED: i32 = 1;

struct WorkerSignals {
    terminate: SignalStream,
    quit: SignalStream,
    interrupt: SignalStream,
    reload: SignalStream,
    notify: SignalStream,
    finish_up: SignalStream,
}

impl WorkerSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            interrupt: signal(SignalKind::interrupt())?,
            reload: signal(SignalKind::hangup())?,
            notify: signal(SignalKind::user_defined1())?,
            finish_up: signal(SignalKind::user_defined2())?,
        })
    }
}

/// Run one spawned child to completion; returns the process exit code.
pub async fn run(payload: SpawnPayload) -> i32 {
    let segment = match attach(&payload) {
        Ok(segment) => segment,
        Err(code) => return code,
    };

    let signals = match WorkerSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "signal setup failed");
            return 1;
        }
    };

    match payload.kind {
        ChildKind::Startup => run_startup(&payload, segment.as_ref(), signals).await,
        ChildKind::Checkpointer => run_checkpointer(&payload, signals).await,
        ChildKind::Session => run_session(&payload, signals).await,
        _ => run_auxiliary(payload.kind, signals).await,
    }
}

/// Reattach to the shared segment and verify it is the one the
/// supervisor provisioned for us.
fn attach(payload: &SpawnPayload) -> Result<Option<Segment>, i32> {
    let Some(path) = &payload.segment_path else {
        return Ok(None);
    };
    let segment = match Segment::attach(path) {
        Ok(segment) => segment,
        Err(e) => {
            error!(error = %e, "shared segment reattach failed");
            return Err(1);
        }
    };
    if let Some(expected) = &payload.segment_key {
        if segment.key_hex() != *expected {
            error!("shared segment key mismatch; refusing to run");
            return Err(1);
        }
    }
    Ok(Some(segment))
}

/// Raise a cross-signal and wake the supervisor with SIGUSR1.
fn raise(segment: Option<&Segment>, signal: CrossSignal) {
    let Some(segment) = segment else { return };
    match segment.cross_signals() {
        Ok(table) => {
            if let Err(e) = table.raise(signal) {
                error!(error = %e, "cross-signal raise failed");
                return;
            }
        }
        Err(e) => {
            error!(error = %e, "cross-signal table unavailable");
            return;
        }
    }
    let supervisor = Pid::from_raw(std::os::unix::process::parent_id() as i32);
    if let Err(e) = kill(supervisor, Signal::SIGUSR1) {
        error!(error = %e, "failed to signal supervisor");
    }
}

/// Recovery driver: walk the control file, report recovery milestones,
/// exit 0 once the cluster is consistent.
async fn run_startup(
    payload: &SpawnPayload,
    segment: Option<&Segment>,
    mut signals: WorkerSignals,
) -> i32 {
    let control = match datadir::read_control(&payload.data_dir) {
        Ok(control) => control,
        Err(e) => {
            error!(error = %e, "control file unreadable");
            return EXIT_QUIT;
        }
    };

    let crashed = !matches!(
        control.cluster_state,
        ClusterState::ShutDown | ClusterState::Bootstrapped
    );
    if crashed {
        info!("database system was not shut down cleanly; running recovery");
    }
    raise(segment, CrossSignal::RecoveryStarted);

    let mut control = control;
    control.cluster_state = ClusterState::InRecovery;
    if let Err(e) = datadir::write_control(&payload.data_dir, &control) {
        error!(error = %e, "control file update failed");
        return EXIT_QUIT;
    }

    if payload.standby_mode {
        // A standby stays in recovery, serving read-only sessions, until
        // told to stop. Promotion is not part of the supervisor contract.
        raise(segment, CrossSignal::BeginHotStandby);
        loop {
            tokio::select! {
                _ = signals.terminate.recv() => return 0,
                _ = signals.quit.recv() => return EXIT_QUIT,
                _ = signals.reload.recv() => debug!("configuration reloaded"),
            }
        }
    }

    control.cluster_state = ClusterState::InProduction;
    if let Err(e) = datadir::write_control(&payload.data_dir, &control) {
        error!(error = %e, "control file update failed");
        return EXIT_QUIT;
    }
    info!("recovery complete");
    0
}

/// Parks until the shutdown-checkpoint request, then marks the cluster
/// cleanly shut down.
async fn run_checkpointer(payload: &SpawnPayload, mut signals: WorkerSignals) -> i32 {
    let mut stdin = tokio::io::stdin();
    let mut unused = [0u8; 1];
    loop {
        tokio::select! {
            _ = signals.finish_up.recv() => {
                let mut control = match datadir::read_control(&payload.data_dir) {
                    Ok(control) => control,
                    Err(e) => {
                        error!(error = %e, "control file unreadable at shutdown checkpoint");
                        return EXIT_QUIT;
                    }
                };
                control.cluster_state = ClusterState::ShutDown;
                if let Err(e) = datadir::write_control(&payload.data_dir, &control) {
                    error!(error = %e, "shutdown checkpoint failed");
                    return EXIT_QUIT;
                }
                info!("shutdown checkpoint complete");
                return 0;
            }
            _ = signals.terminate.recv() => {
                // The blanket termination sweep reaches us too, but the
                // job is not over until the shutdown checkpoint request.
                debug!("termination deferred until the shutdown checkpoint");
            }
            _ = signals.quit.recv() => return EXIT_QUIT,
            _ = signals.reload.recv() => debug!("configuration reloaded"),
            read = stdin.read(&mut unused) => {
                if matches!(read, Ok(0)) {
                    return EXIT_ORPHANED;
                }
            }
        }
    }
}

/// Session worker; stdin/stdout are the client socket. Dead-end sessions
/// deliver their one rejection line and exit.
async fn run_session(payload: &SpawnPayload, mut signals: WorkerSignals) -> i32 {
    let mut stdout = tokio::io::stdout();
    if payload.dead_end {
        let reason = payload
            .reject_reason
            .as_deref()
            .unwrap_or("connection refused");
        if let Err(e) = protocol::write_rejection(&mut stdout, reason).await {
            debug!(error = %e, "client went away before the rejection");
        }
        return 0;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(_)) => {
                        // The SQL engine is not the supervisor's business.
                        if let Err(e) = protocol::write_rejection(
                            &mut stdout,
                            "session worker built without a query engine",
                        )
                        .await
                        {
                            if e_is_disconnect(&e) {
                                return 0;
                            }
                        }
                    }
                    Ok(None) => return 0,
                    Err(_) => return 0,
                }
            }
            _ = signals.interrupt.recv() => info!("query canceled by request"),
            _ = signals.terminate.recv() => return 0,
            _ = signals.quit.recv() => return EXIT_QUIT,
            _ = signals.reload.recv() => debug!("configuration reloaded"),
        }
    }
}

fn e_is_disconnect(e: &protocol::ProtocolError) -> bool {
    matches!(
        e,
        protocol::ProtocolError::Io(io) if matches!(io.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset)
    )
}

/// Every other kind: park on the death-watch pipe and the signal set.
async fn run_auxiliary(kind: ChildKind, mut signals: WorkerSignals) -> i32 {
    let mut stdin = tokio::io::stdin();
    let mut unused = [0u8; 1];
    loop {
        tokio::select! {
            _ = signals.terminate.recv() => return 0,
            _ = signals.quit.recv() => return EXIT_QUIT,
            _ = signals.finish_up.recv() => {
                // Archiver and walsender-class drain request.
                return 0;
            }
            _ = signals.notify.recv() => {
                if kind == ChildKind::SysLogger {
                    info!("rotating log file");
                }
            }
            _ = signals.reload.recv() => debug!("configuration reloaded"),
            read = stdin.read(&mut unused) => {
                if matches!(read, Ok(0)) {
                    // Supervisor died; the pipe's write end is gone.
                    return EXIT_ORPHANED;
                }
            }
        }
    }
}
