// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection admission and cancel-request handling.
//!
//! Every accepted socket either becomes a session worker or a dead-end
//! child that delivers one protocol-clean rejection line and exits. The
//! client never sees a silently dropped connection.

use tracing::{info, warn};

use reef_core::{ChildKind, ChildSignal, Clock, KindSet, LifecycleState, ShutdownMode};

use crate::launcher::{ClientSocket, LaunchSpec, Launcher};
use crate::machine::{fresh_cancel_token, Supervisor};
use crate::protocol::{ConnectKind, StartupPacket};

/// Why a connection was refused; each reason carries the message the
/// dead-end child delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    StartingUp,
    NotYetConsistent,
    InRecovery,
    ShuttingDown,
    TooManyClients,
}

impl RejectReason {
    pub fn message(self) -> &'static str {
        match self {
            RejectReason::StartingUp => "the database system is starting up",
            RejectReason::NotYetConsistent => "the database system is not yet consistent",
            RejectReason::InRecovery => "the database system is in recovery mode",
            RejectReason::ShuttingDown => "the database system is shutting down",
            RejectReason::TooManyClients => "sorry, too many clients already",
        }
    }
}

impl<L: Launcher, C: Clock> Supervisor<L, C> {
    /// Admission policy for one startup request.
    pub fn admission_decision(&self, kind: ConnectKind) -> Result<(), RejectReason> {
        let state = self.state();
        if !state.accepts_connections() && !matches!(kind, ConnectKind::BgWorker { .. }) {
            return Err(if self.shutdown_mode().is_requested() {
                RejectReason::ShuttingDown
            } else if self.fatal_error() {
                // Crash cascade or the recovery cycle that follows it.
                RejectReason::InRecovery
            } else if state == LifecycleState::Recovery {
                RejectReason::NotYetConsistent
            } else if state.is_stopping() {
                RejectReason::ShuttingDown
            } else {
                RejectReason::StartingUp
            });
        }
        if self.registry().len() >= self.config.child_ceiling() as usize {
            return Err(RejectReason::TooManyClients);
        }
        if !self.conns_allowed && kind == ConnectKind::Session {
            // Smart shutdown drains; only bgworker attachments get in.
            return Err(RejectReason::ShuttingDown);
        }
        Ok(())
    }

    /// Route one decoded startup packet.
    pub async fn handle_startup_packet(&mut self, packet: StartupPacket, socket: ClientSocket) {
        match packet {
            StartupPacket::Connect { kind } => self.admit_connect(kind, socket).await,
            StartupPacket::Cancel { pid, token } => {
                // The cancel socket carries no session; it is closed as
                // soon as the request has been judged.
                drop(socket);
                self.handle_cancel_request(pid, token);
            }
        }
    }

    async fn admit_connect(&mut self, kind: ConnectKind, socket: ClientSocket) {
        match self.admission_decision(kind) {
            Ok(()) => match kind {
                ConnectKind::Session => {
                    let spec = LaunchSpec {
                        cancel_token: fresh_cancel_token(),
                        socket: Some(socket),
                        ..LaunchSpec::of(ChildKind::Session)
                    };
                    if let Err(e) = self.launch_child(spec).await {
                        // Accept pressure is transient; the client retries.
                        warn!(error = %e, "session launch failed");
                    }
                }
                ConnectKind::BgWorker { registrant } => {
                    let spec = LaunchSpec {
                        cancel_token: fresh_cancel_token(),
                        socket: Some(socket),
                        ..LaunchSpec::of(ChildKind::BgWorker)
                    };
                    match self.launch_child(spec).await {
                        Ok(pid) => {
                            // Dynamic workers never restart; track the
                            // entry so its removal reaches the registrant.
                            self.register_dynamic_worker(pid, registrant);
                        }
                        Err(e) => warn!(error = %e, "background worker launch failed"),
                    }
                }
            },
            Err(reason) => self.launch_dead_end(reason, socket).await,
        }
    }

    /// Launch a rejection worker so the client sees a clean error.
    async fn launch_dead_end(&mut self, reason: RejectReason, socket: ClientSocket) {
        info!(reason = reason.message(), "connection rejected");
        let spec = LaunchSpec {
            dead_end: true,
            reject_reason: Some(reason.message().to_string()),
            socket: Some(socket),
            ..LaunchSpec::of(ChildKind::Session)
        };
        if let Err(e) = self.launch_child(spec).await {
            warn!(error = %e, "dead-end launch failed; client sees a dropped connection");
        }
    }

    /// Deliver a query-cancel interrupt iff pid and token both match.
    pub fn handle_cancel_request(&mut self, pid: u32, token: u32) {
        let Some(record) = self
            .registry
            .iter(KindSet::single(ChildKind::Session))
            .find(|record| record.pid == pid && !record.dead_end)
        else {
            info!(pid, "cancel request for unknown pid dropped");
            return;
        };
        if record.cancel_token != token {
            info!(pid, "cancel request with wrong token dropped");
            return;
        }
        self.signal_child(pid, ChildSignal::Interrupt);
    }

    /// True when a smart shutdown is draining sessions.
    pub fn draining(&self) -> bool {
        self.shutdown_mode() == ShutdownMode::Smart && !self.conns_allowed
    }
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod tests;
