// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::BgWorkerConfig;
use reef_core::{ChildExitStatus, Clock, FakeClock};
use yare::parameterized;

fn worker(name: &str, start_time: BgwStartTime, restart_secs: Option<u64>) -> BgWorkerConfig {
    BgWorkerConfig {
        name: name.to_string(),
        start_time,
        restart_secs,
    }
}

#[test]
fn first_pass_is_armed_and_launches_eligible_workers() {
    let clock = FakeClock::new();
    let mut sched = BgWorkerScheduler::from_config(&[
        worker("early", BgwStartTime::SupervisorStart, Some(10)),
        worker("late", BgwStartTime::RecoveryFinished, Some(10)),
    ]);

    assert!(sched.is_pending());
    let pass = sched.pass(LifecycleState::Startup, clock.now());
    assert_eq!(pass.start, vec!["early".to_string()]);
    assert!(!sched.is_pending());

    sched.record_launch("early", 901);
    // Running workers are skipped on the next pass.
    let pass = sched.pass(LifecycleState::Startup, clock.now());
    assert!(pass.start.is_empty());
}

#[parameterized(
    supervisor_start_in_startup = { BgwStartTime::SupervisorStart, LifecycleState::Startup, true },
    supervisor_start_in_init = { BgwStartTime::SupervisorStart, LifecycleState::Init, false },
    consistent_in_recovery = { BgwStartTime::ConsistentState, LifecycleState::Recovery, false },
    consistent_in_hot_standby = { BgwStartTime::ConsistentState, LifecycleState::HotStandby, true },
    recovery_finished_in_hot_standby = { BgwStartTime::RecoveryFinished, LifecycleState::HotStandby, false },
    recovery_finished_in_run = { BgwStartTime::RecoveryFinished, LifecycleState::Run, true },
)]
fn start_time_predicates(start: BgwStartTime, state: LifecycleState, satisfied: bool) {
    assert_eq!(start.satisfied_by(state), satisfied);
}

#[test]
fn crash_restart_waits_for_the_interval() {
    let clock = FakeClock::new();
    let mut sched = BgWorkerScheduler::from_config(&[worker(
        "throttled",
        BgwStartTime::RecoveryFinished,
        Some(10),
    )]);

    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert_eq!(pass.start.len(), 1);
    sched.record_launch("throttled", 42);

    // Crash at t: no relaunch before t + 10s.
    sched.on_exit(42, ChildExitStatus::Signaled(11), clock.now());
    assert!(sched.is_pending());

    clock.advance(Duration::from_secs(9));
    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert!(pass.start.is_empty(), "relaunched before the interval");
    assert_eq!(
        sched.next_start_in(LifecycleState::Run, clock.now()),
        Some(Duration::from_secs(1))
    );

    clock.advance(Duration::from_secs(1));
    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert_eq!(pass.start, vec!["throttled".to_string()]);
}

#[test]
fn never_restart_workers_are_removed_after_a_crash() {
    let clock = FakeClock::new();
    let mut sched =
        BgWorkerScheduler::from_config(&[worker("one-shot", BgwStartTime::RecoveryFinished, None)]);

    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert_eq!(pass.start.len(), 1);
    sched.record_launch("one-shot", 7);
    sched.on_exit(7, ChildExitStatus::Code(3), clock.now());

    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert!(pass.start.is_empty());
    assert_eq!(pass.removed, vec![("one-shot".to_string(), None)]);
    assert!(sched.entries().is_empty());
}

#[test]
fn clean_exit_unregisters_without_restart() {
    let clock = FakeClock::new();
    let mut sched = BgWorkerScheduler::from_config(&[worker(
        "finishes",
        BgwStartTime::RecoveryFinished,
        Some(1),
    )]);

    sched.pass(LifecycleState::Run, clock.now());
    sched.record_launch("finishes", 11);
    sched.on_exit(11, ChildExitStatus::Code(0), clock.now());

    clock.advance(Duration::from_secs(60));
    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert!(pass.start.is_empty());
    assert_eq!(pass.removed, vec![("finishes".to_string(), None)]);
    assert!(sched.entries().is_empty());
}

#[test]
fn dynamic_workers_never_restart_and_report_their_registrant() {
    let clock = FakeClock::new();
    let mut sched = BgWorkerScheduler::from_config(&[]);
    sched.register_dynamic("dynamic-77".to_string(), 77, Some(42));
    assert_eq!(sched.running(), 1);

    sched.on_exit(77, ChildExitStatus::Signaled(11), clock.now());
    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert!(pass.start.is_empty());
    assert_eq!(pass.removed, vec![("dynamic-77".to_string(), Some(42))]);
    assert!(sched.entries().is_empty());
}

#[test]
fn pass_caps_at_one_hundred_and_rearms() {
    let clock = FakeClock::new();
    let workers: Vec<BgWorkerConfig> = (0..150)
        .map(|i| worker(&format!("w{i}"), BgwStartTime::RecoveryFinished, Some(10)))
        .collect();
    let mut sched = BgWorkerScheduler::from_config(&workers);

    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert_eq!(pass.start.len(), MAX_STARTS_PER_PASS);
    assert!(sched.is_pending(), "truncated pass must re-arm");

    for name in &pass.start {
        sched.record_launch(name, 1000 + name.len() as u32);
    }
}

#[test]
fn launch_failure_is_throttled_like_a_crash() {
    let clock = FakeClock::new();
    let mut sched = BgWorkerScheduler::from_config(&[worker(
        "flaky",
        BgwStartTime::RecoveryFinished,
        Some(30),
    )]);

    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert_eq!(pass.start.len(), 1);
    sched.record_launch_failure("flaky", clock.now());

    let pass = sched.pass(LifecycleState::Run, clock.now());
    assert!(pass.start.is_empty());
    assert_eq!(
        sched.next_start_in(LifecycleState::Run, clock.now()),
        Some(Duration::from_secs(30))
    );
}
