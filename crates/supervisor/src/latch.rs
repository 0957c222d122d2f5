// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Self-wake latch.
//!
//! A flag plus a wakeable primitive: signal intake sets it to break the
//! event loop out of its multiplexed wait, and the loop consumes it on
//! wake. Setting an already-set latch is free, so intake paths never
//! block or allocate.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Default)]
pub struct Latch {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake a waiter if one is parked.
    pub fn set(&self) {
        if !self.set.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Wait until the latch is set, consuming it.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking, so a set() between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            if self.set.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }

    /// Non-blocking consume, for post-wake bookkeeping.
    pub fn take(&self) -> bool {
        self.set.swap(false, Ordering::AcqRel)
    }
}
