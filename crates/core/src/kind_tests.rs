// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[test]
fn labels_round_trip_through_from_str() {
    for kind in ChildKind::ALL {
        let parsed: ChildKind = kind.label().parse().unwrap();
        assert_eq!(parsed, kind);
    }
}

#[test]
fn unknown_label_is_an_error() {
    let err = "walreciever".parse::<ChildKind>().unwrap_err();
    assert!(err.to_string().contains("walreciever"));
}

#[parameterized(
    session = { ChildKind::Session },
    autovac_worker = { ChildKind::AutoVacWorker },
    bgworker = { ChildKind::BgWorker },
)]
fn multiplicities_are_not_singletons(kind: ChildKind) {
    assert!(!kind.is_singleton());
}

#[test]
fn every_other_kind_is_a_singleton() {
    let singletons = ChildKind::ALL
        .into_iter()
        .filter(|k| k.is_singleton())
        .count();
    assert_eq!(singletons, 10);
}

#[test]
fn only_the_syslogger_skips_the_segment() {
    for kind in ChildKind::ALL {
        assert_eq!(
            kind.attaches_to_segment(),
            kind != ChildKind::SysLogger,
            "{kind}"
        );
    }
}

#[test]
fn kind_set_membership() {
    let set = KindSet::of(&[ChildKind::Session, ChildKind::Archiver]);
    assert!(set.contains(ChildKind::Session));
    assert!(set.contains(ChildKind::Archiver));
    assert!(!set.contains(ChildKind::Startup));

    let set = set.without(ChildKind::Session).with(ChildKind::Startup);
    assert!(!set.contains(ChildKind::Session));
    assert!(set.contains(ChildKind::Startup));
}

#[test]
fn all_contains_every_kind() {
    for kind in ChildKind::ALL {
        assert!(KindSet::ALL.contains(kind), "{kind}");
    }
    assert!(KindSet::EMPTY.is_empty());
}
