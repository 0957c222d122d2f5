// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process accounting.
//!
//! The registry tracks every live child that is attached to the shared
//! segment. It is private to the supervisor process; peers use the
//! shared slot mirror instead. Insertion order is preserved so signal
//! fan-out and draining walk children oldest-first.

use indexmap::IndexMap;

use reef_core::{ChildKind, KindSet};

/// Bookkeeping for one live child.
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub pid: u32,
    pub kind: ChildKind,
    /// Index into the shared slot mirror, for kinds that hold one.
    pub slot: Option<usize>,
    /// Random token authorizing cancel requests against this child.
    pub cancel_token: u32,
    /// Short-lived rejection worker; drained during WaitDeadEnd.
    pub dead_end: bool,
    /// This child registered a background worker and is notified when
    /// that worker's entry is removed.
    pub bgworker_notify: bool,
}

/// Registry of live children keyed by pid.
#[derive(Default)]
pub struct ChildRegistry {
    children: IndexMap<u32, ChildRecord>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: ChildRecord) {
        debug_assert!(
            record.kind.attaches_to_segment(),
            "only attached children are registered"
        );
        self.children.insert(record.pid, record);
    }

    pub fn remove(&mut self, pid: u32) -> Option<ChildRecord> {
        self.children.shift_remove(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<&ChildRecord> {
        self.children.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut ChildRecord> {
        self.children.get_mut(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.children.contains_key(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn count(&self, kinds: KindSet) -> usize {
        self.iter(kinds).count()
    }

    pub fn iter(&self, kinds: KindSet) -> impl Iterator<Item = &ChildRecord> {
        self.children
            .values()
            .filter(move |record| kinds.contains(record.kind))
    }

    pub fn pids(&self, kinds: KindSet) -> Vec<u32> {
        self.iter(kinds).map(|record| record.pid).collect()
    }

    /// All live pids except one (the crasher, during a cascade).
    pub fn pids_except(&self, excluded: u32) -> Vec<u32> {
        self.children
            .values()
            .filter(|record| record.pid != excluded)
            .map(|record| record.pid)
            .collect()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
