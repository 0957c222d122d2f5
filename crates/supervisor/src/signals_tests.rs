// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn shutdown_severity_is_a_monotonic_max() {
    let pending = PendingSignals::new();

    pending.request_shutdown(ShutdownMode::Smart);
    pending.request_shutdown(ShutdownMode::Immediate);
    // A later, less severe request must not downgrade the latched one.
    pending.request_shutdown(ShutdownMode::Fast);

    assert_eq!(pending.take_shutdown(), ShutdownMode::Immediate);
    assert_eq!(pending.take_shutdown(), ShutdownMode::None);
}

#[test]
fn take_consumes_each_bit_once() {
    let pending = PendingSignals::new();

    pending.set_reload();
    pending.set_child_exit();
    pending.set_cross_signal();
    assert!(pending.any_pending());

    assert!(pending.take_reload());
    assert!(pending.take_child_exit());
    assert!(pending.take_cross_signal());

    assert!(!pending.take_reload());
    assert!(!pending.take_child_exit());
    assert!(!pending.take_cross_signal());
    assert!(!pending.any_pending());
}

#[test]
fn shutdown_request_counts_as_pending() {
    let pending = PendingSignals::new();
    assert!(!pending.any_pending());
    pending.request_shutdown(ShutdownMode::Smart);
    assert!(pending.any_pending());
    let _ = pending.take_shutdown();
    assert!(!pending.any_pending());
}
