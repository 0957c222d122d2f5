// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The supervisor's event loop.
//!
//! Single-threaded and cooperative: the loop blocks in exactly one
//! multiplexed wait over the latch, the signal intake, accept-readiness
//! of every listening socket, the sleep budget, and two housekeeping
//! ticks. After every wake it services pending work in priority order
//! through `Supervisor::service` and loops until the machine requests an
//! exit, then performs the ordered cleanup: listeners, socket files,
//! pidfile.

use std::future::poll_fn;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info, warn};

use reef_core::{Clock, ShutdownMode};

use crate::config::Config;
use crate::launcher::{ClientSocket, Launcher};
use crate::machine::Supervisor;
use crate::pidfile::{self, Recheck};
use crate::protocol;
use crate::signals::SignalIntake;

/// Pidfile revalidation period.
const PIDFILE_RECHECK: Duration = Duration::from_secs(60);

/// Socket-file touch period, under the common 1-hour /tmp sweep horizon.
const SOCKET_TOUCH: Duration = Duration::from_secs(58 * 60);

/// Everything the supervisor listens on.
pub struct Listeners {
    tcp: Vec<TcpListener>,
    unix: Vec<UnixListener>,
    /// Unix socket files plus their lock files, removed at exit and
    /// re-touched periodically.
    socket_files: Vec<PathBuf>,
}

/// One accepted client stream.
enum Accepted {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

impl Listeners {
    /// Bind every configured TCP address and unix socket directory.
    /// Any bind failure is fatal before the loop starts.
    pub async fn bind(config: &Config) -> io::Result<Listeners> {
        let mut tcp = Vec::new();
        for addr in &config.listen_addresses {
            let listener = TcpListener::bind((addr.as_str(), config.port)).await?;
            info!(%addr, port = config.port, "listening");
            tcp.push(listener);
        }

        let mut unix = Vec::new();
        let mut socket_files = Vec::new();
        for dir in &config.unix_socket_directories {
            let path = config.socket_path(dir);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            info!(path = %path.display(), "listening");

            let lock_path = config.socket_lock_path(dir);
            std::fs::write(&lock_path, format!("{}\n", std::process::id()))?;
            socket_files.push(path);
            socket_files.push(lock_path);
            unix.push(listener);
        }

        Ok(Listeners {
            tcp,
            unix,
            socket_files,
        })
    }

    /// Readiness-multiplexed accept over every listening socket.
    async fn accept(&self) -> io::Result<Accepted> {
        poll_fn(|cx| {
            for listener in &self.tcp {
                if let Poll::Ready(result) = listener.poll_accept(cx) {
                    return Poll::Ready(result.map(|(stream, _)| Accepted::Tcp(stream)));
                }
            }
            for listener in &self.unix {
                if let Poll::Ready(result) = listener.poll_accept(cx) {
                    return Poll::Ready(result.map(|(stream, _)| Accepted::Unix(stream)));
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Re-touch socket and lock files so /tmp sweepers leave them alone.
    fn touch_socket_files(&self) {
        for path in &self.socket_files {
            pidfile::touch(path);
        }
    }

    /// Ordered teardown: close the listening sockets, then remove the
    /// socket and lock files.
    pub fn shutdown(self) {
        drop(self.tcp);
        drop(self.unix);
        for path in &self.socket_files {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "socket file removal failed");
                }
            }
        }
    }
}

enum Wake {
    Latch,
    Signal,
    Accepted(io::Result<Accepted>),
    SleepExpired,
    PidfileTick,
    TouchTick,
}

/// Drive the supervisor until it requests an exit; returns the status.
pub async fn run<L: Launcher, C: Clock>(
    mut sup: Supervisor<L, C>,
    mut intake: SignalIntake,
    listeners: Listeners,
) -> i32 {
    let latch = Arc::clone(sup.latch());
    let pending = Arc::clone(sup.pending());

    let period = |d: Duration| {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick
    };
    let mut pidfile_tick = period(PIDFILE_RECHECK);
    let mut touch_tick = period(SOCKET_TOUCH);

    let code = loop {
        if let Some(code) = sup.wants_exit() {
            break code;
        }

        let budget = sup.sleep_budget();
        let accepting = sup.accepting_sockets();

        let wake = tokio::select! {
            _ = latch.wait() => Wake::Latch,
            _ = intake.recv() => Wake::Signal,
            accepted = listeners.accept(), if accepting => Wake::Accepted(accepted),
            _ = tokio::time::sleep(budget) => Wake::SleepExpired,
            _ = pidfile_tick.tick() => Wake::PidfileTick,
            _ = touch_tick.tick() => Wake::TouchTick,
        };

        // A signal that was already delivered must not lose the wakeup
        // race to lower-priority work: fold everything pending into bits
        // before dispatching, whatever woke us.
        intake.drain_ready().await;

        match wake {
            Wake::Latch | Wake::Signal | Wake::SleepExpired => {}
            Wake::Accepted(Ok(accepted)) => {
                // Shutdown, reload, child exits, and cross-signals come
                // ahead of the accept, so admission never runs under
                // stale pre-shutdown state.
                sup.service().await;
                if sup.wants_exit().is_none() {
                    handle_accept(&mut sup, accepted).await;
                }
            }
            Wake::Accepted(Err(e)) => error!(error = %e, "accept failed"),
            Wake::PidfileTick => {
                if let Some(pidfile) = sup.pidfile_ref() {
                    match pidfile.recheck() {
                        Recheck::Valid => {}
                        Recheck::Missing => {
                            error!("pidfile disappeared; shutting down immediately");
                            pending.request_shutdown(ShutdownMode::Immediate);
                        }
                        Recheck::Foreign { pid_line } => {
                            error!(
                                %pid_line,
                                "pidfile taken over by another process; shutting down immediately"
                            );
                            pending.request_shutdown(ShutdownMode::Immediate);
                        }
                    }
                }
            }
            Wake::TouchTick => listeners.touch_socket_files(),
        }

        // Regardless of what woke us, service everything pending.
        sup.service().await;
    };

    // Ordered exit cleanup: stop accepting, then socket files, then the
    // pidfile, so a successor never observes a half-removed state.
    listeners.shutdown();
    sup.destroy_segment();
    if let Some(pidfile) = sup.take_pidfile() {
        pidfile.unlink();
    }
    info!(code, "supervisor exiting");
    code
}

async fn handle_accept<L: Launcher, C: Clock>(sup: &mut Supervisor<L, C>, accepted: Accepted) {
    match accepted {
        Accepted::Tcp(mut stream) => {
            let packet = match protocol::read_startup_packet(&mut stream).await {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "dropping connection without a startup packet");
                    return;
                }
            };
            let socket = match stream.into_std().and_then(|s| {
                s.set_nonblocking(false)?;
                Ok(s)
            }) {
                Ok(socket) => ClientSocket::Tcp(socket),
                Err(e) => {
                    warn!(error = %e, "socket handoff failed");
                    return;
                }
            };
            sup.handle_startup_packet(packet, socket).await;
        }
        Accepted::Unix(mut stream) => {
            let packet = match protocol::read_startup_packet(&mut stream).await {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "dropping connection without a startup packet");
                    return;
                }
            };
            let socket = match stream.into_std().and_then(|s| {
                s.set_nonblocking(false)?;
                Ok(s)
            }) {
                Ok(socket) => ClientSocket::Unix(socket),
                Err(e) => {
                    warn!(error = %e, "socket handoff failed");
                    return;
                }
            };
            sup.handle_startup_packet(packet, socket).await;
        }
    }
}
