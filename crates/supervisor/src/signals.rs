// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Signal intake: translate OS signals into pending work bits.
//!
//! Intake does no work beyond setting an atomic flag and touching the
//! latch; the event loop services the bits in priority order on its next
//! iteration. Shutdown severity latches as a monotonic max so a smart
//! request can never override a pending immediate one.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};

use reef_core::ShutdownMode;

use crate::latch::Latch;

/// Pending work bits shared between intake and the event loop.
#[derive(Default)]
pub struct PendingSignals {
    reload: AtomicBool,
    child_exit: AtomicBool,
    cross_signal: AtomicBool,
    /// 0 = none; otherwise `ShutdownMode` severity.
    shutdown: AtomicU8,
}

impl PendingSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self, mode: ShutdownMode) {
        self.shutdown.fetch_max(mode as u8, Ordering::AcqRel);
    }

    /// Consume the pending shutdown request, most severe wins.
    pub fn take_shutdown(&self) -> ShutdownMode {
        match self.shutdown.swap(0, Ordering::AcqRel) {
            1 => ShutdownMode::Smart,
            2 => ShutdownMode::Fast,
            3 => ShutdownMode::Immediate,
            _ => ShutdownMode::None,
        }
    }

    pub fn set_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }

    pub fn set_child_exit(&self) {
        self.child_exit.store(true, Ordering::Release);
    }

    pub fn take_child_exit(&self) -> bool {
        self.child_exit.swap(false, Ordering::AcqRel)
    }

    pub fn set_cross_signal(&self) {
        self.cross_signal.store(true, Ordering::Release);
    }

    pub fn take_cross_signal(&self) -> bool {
        self.cross_signal.swap(false, Ordering::AcqRel)
    }

    /// Anything outstanding? Used to skip sleeping entirely.
    pub fn any_pending(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) != 0
            || self.reload.load(Ordering::Acquire)
            || self.child_exit.load(Ordering::Acquire)
            || self.cross_signal.load(Ordering::Acquire)
    }
}

/// Installed signal streams, folded into pending bits.
///
/// SIGUSR2 is accepted and reserved; broken-pipe, terminal, and ulimit
/// signals are left at their default dispositions (the runtime already
/// ignores SIGPIPE).
pub struct SignalIntake {
    hangup: Signal,
    interrupt: Signal,
    quit: Signal,
    terminate: Signal,
    user1: Signal,
    user2: Signal,
    child: Signal,
    pending: Arc<PendingSignals>,
    latch: Arc<Latch>,
}

impl SignalIntake {
    pub fn install(pending: Arc<PendingSignals>, latch: Arc<Latch>) -> io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
            user1: signal(SignalKind::user_defined1())?,
            user2: signal(SignalKind::user_defined2())?,
            child: signal(SignalKind::child())?,
            pending,
            latch,
        })
    }

    /// Wait for any accepted signal, set its pending bit, touch the latch.
    ///
    /// This is one arm of the event loop's multiplexed wait.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.hangup.recv() => self.pending.set_reload(),
            _ = self.interrupt.recv() => {
                self.pending.request_shutdown(ShutdownMode::Fast);
            }
            _ = self.quit.recv() => {
                self.pending.request_shutdown(ShutdownMode::Immediate);
            }
            _ = self.terminate.recv() => {
                self.pending.request_shutdown(ShutdownMode::Smart);
            }
            _ = self.user1.recv() => self.pending.set_cross_signal(),
            _ = self.user2.recv() => {
                // Reserved.
            }
            _ = self.child.recv() => self.pending.set_child_exit(),
        }
        self.latch.set();
    }

    /// Fold every already-delivered signal into pending bits without
    /// blocking.
    ///
    /// The event loop calls this after each wakeup, whatever woke it, so
    /// a signal that lost the wakeup race to a lower-priority event (a
    /// socket accept, a tick) is still serviced ahead of that event.
    pub async fn drain_ready(&mut self) {
        let mut any = false;
        std::future::poll_fn(|cx| {
            use std::task::Poll;

            while let Poll::Ready(Some(())) = self.hangup.poll_recv(cx) {
                self.pending.set_reload();
                any = true;
            }
            while let Poll::Ready(Some(())) = self.interrupt.poll_recv(cx) {
                self.pending.request_shutdown(ShutdownMode::Fast);
                any = true;
            }
            while let Poll::Ready(Some(())) = self.quit.poll_recv(cx) {
                self.pending.request_shutdown(ShutdownMode::Immediate);
                any = true;
            }
            while let Poll::Ready(Some(())) = self.terminate.poll_recv(cx) {
                self.pending.request_shutdown(ShutdownMode::Smart);
                any = true;
            }
            while let Poll::Ready(Some(())) = self.user1.poll_recv(cx) {
                self.pending.set_cross_signal();
                any = true;
            }
            while let Poll::Ready(Some(())) = self.user2.poll_recv(cx) {
                // Reserved; drained so it cannot pin readiness.
            }
            while let Poll::Ready(Some(())) = self.child.poll_recv(cx) {
                self.pending.set_child_exit();
                any = true;
            }
            Poll::Ready(())
        })
        .await;
        if any {
            self.latch.set();
        }
    }
}

#[cfg(test)]
#[path = "signals_tests.rs"]
mod tests;
