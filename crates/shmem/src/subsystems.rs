// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subsystem sizing and shared-init registry.
//!
//! Every subsystem that lives in the shared segment registers a size
//! request and an init callback. The registry is sealed before sizing so
//! preload registrations cannot arrive after the segment exists.

use thiserror::Error;

/// Inputs to the sizing formulas, derived from supervisor configuration.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub max_sessions: u32,
    pub max_autovac_workers: u32,
    pub max_walsenders: u32,
    pub max_bgworkers: u32,
    pub shared_buffer_pages: u32,
    pub wal_buffer_pages: u32,
    pub max_replication_slots: u32,
}

impl SizingConfig {
    /// Number of child-slot mirror entries: every process class that can
    /// attach, plus headroom for the fixed auxiliary singletons.
    pub fn backend_slot_capacity(&self) -> u32 {
        self.max_sessions
            + self.max_autovac_workers
            + self.max_walsenders
            + self.max_bgworkers
            + AUX_SLOT_HEADROOM
    }

    /// Semaphore pool size: one per attachable process plus aux slack.
    pub fn semaphore_count(&self) -> u32 {
        self.backend_slot_capacity()
    }
}

/// Fixed slots reserved for auxiliary singletons in the mirror table.
const AUX_SLOT_HEADROOM: u32 = 16;

/// Size of one entry in the child-slot mirror (see `slots`).
pub(crate) const SLOT_ENTRY_SIZE: u64 = 16;

/// A subsystem that owns a region of the shared segment.
///
/// `init` runs once at create/reinit time, in registration order, over a
/// zeroed region. Children recompute their local pointers from the TOC,
/// so init only has to write what peers read before any child has run.
pub trait SharedSubsystem: Send {
    fn name(&self) -> &'static str;
    fn size_request(&self, sizing: &SizingConfig) -> u64;
    fn init(&self, region: &mut [u8]) {
        // Most regions start life all-zeroes.
        let _ = region;
    }
}

/// Registration error: the registry was already sealed.
#[derive(Debug, Error)]
#[error("shared-memory registry is sealed; preload registration arrived too late")]
pub struct RegistrySealedError;

/// Ordered collection of subsystems, sealed before sizing.
///
/// Order is a dependency order: the lock table precedes everything that
/// takes locks, and the process array precedes everything that registers
/// a slot.
pub struct SubsystemRegistry {
    entries: Vec<Box<dyn SharedSubsystem>>,
    sealed: bool,
}

impl SubsystemRegistry {
    /// Registry with the built-in subsystems in dependency order.
    pub fn builtin() -> Self {
        let entries: Vec<Box<dyn SharedSubsystem>> = vec![
            Box::new(LockTable),
            Box::new(ProcArray),
            Box::new(CrossSignalSlots),
            Box::new(XactStatusRings),
            Box::new(BufferPool),
            Box::new(WalBuffers),
            Box::new(ReplicationSlots),
            Box::new(Statistics),
            Box::new(SemaphorePool),
        ];
        Self {
            entries,
            sealed: false,
        }
    }

    /// One-shot hook for preload-library requests; refused once sealed.
    pub fn register_preload(
        &mut self,
        subsystem: Box<dyn SharedSubsystem>,
    ) -> Result<(), RegistrySealedError> {
        if self.sealed {
            return Err(RegistrySealedError);
        }
        self.entries.push(subsystem);
        Ok(())
    }

    /// Seal the registry; called by the provisioner before sizing.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn entries(&self) -> &[Box<dyn SharedSubsystem>] {
        &self.entries
    }
}

// Built-in subsystems. Sizes are per-entry formulas over the sizing
// config; the constants are entry footprints in bytes.

pub(crate) const NAME_LOCKS: &str = "locks";
pub(crate) const NAME_PROC_ARRAY: &str = "proc_array";
pub(crate) const NAME_CROSS_SIGNALS: &str = "cross_signals";
pub(crate) const NAME_SEMAPHORES: &str = "semaphores";

struct LockTable;

impl SharedSubsystem for LockTable {
    fn name(&self) -> &'static str {
        NAME_LOCKS
    }

    fn size_request(&self, sizing: &SizingConfig) -> u64 {
        // 64 lock-table entries of 64 bytes per attachable process.
        u64::from(sizing.backend_slot_capacity()) * 64 * 64
    }
}

struct ProcArray;

impl SharedSubsystem for ProcArray {
    fn name(&self) -> &'static str {
        NAME_PROC_ARRAY
    }

    fn size_request(&self, sizing: &SizingConfig) -> u64 {
        8 + u64::from(sizing.backend_slot_capacity()) * SLOT_ENTRY_SIZE
    }

    fn init(&self, region: &mut [u8]) {
        // Peers read the capacity word before any slot is published.
        let capacity = (region.len() as u64 - 8) / SLOT_ENTRY_SIZE;
        region[0..4].copy_from_slice(&(capacity as u32).to_le_bytes());
        region[4..8].copy_from_slice(&(SLOT_ENTRY_SIZE as u32).to_le_bytes());
    }
}

struct CrossSignalSlots;

impl SharedSubsystem for CrossSignalSlots {
    fn name(&self) -> &'static str {
        NAME_CROSS_SIGNALS
    }

    fn size_request(&self, _sizing: &SizingConfig) -> u64 {
        reef_core::CrossSignal::COUNT as u64
    }
}

struct XactStatusRings;

impl SharedSubsystem for XactStatusRings {
    fn name(&self) -> &'static str {
        "xact_status"
    }

    fn size_request(&self, _sizing: &SizingConfig) -> u64 {
        // Eight fixed 8 KiB status pages per ring, two rings.
        2 * 8 * 8192
    }
}

struct BufferPool;

impl SharedSubsystem for BufferPool {
    fn name(&self) -> &'static str {
        "buffers"
    }

    fn size_request(&self, sizing: &SizingConfig) -> u64 {
        // Page plus a 64-byte descriptor per buffer.
        u64::from(sizing.shared_buffer_pages) * (8192 + 64)
    }
}

struct WalBuffers;

impl SharedSubsystem for WalBuffers {
    fn name(&self) -> &'static str {
        "wal_buffers"
    }

    fn size_request(&self, sizing: &SizingConfig) -> u64 {
        u64::from(sizing.wal_buffer_pages) * 8192
    }
}

struct ReplicationSlots;

impl SharedSubsystem for ReplicationSlots {
    fn name(&self) -> &'static str {
        "replication_slots"
    }

    fn size_request(&self, sizing: &SizingConfig) -> u64 {
        u64::from(sizing.max_replication_slots) * 512
    }
}

struct Statistics;

impl SharedSubsystem for Statistics {
    fn name(&self) -> &'static str {
        "statistics"
    }

    fn size_request(&self, sizing: &SizingConfig) -> u64 {
        64 * 1024 + u64::from(sizing.backend_slot_capacity()) * 256
    }
}

struct SemaphorePool;

impl SharedSubsystem for SemaphorePool {
    fn name(&self) -> &'static str {
        NAME_SEMAPHORES
    }

    fn size_request(&self, sizing: &SizingConfig) -> u64 {
        u64::from(sizing.semaphore_count()) * 8
    }
}

#[cfg(test)]
#[path = "subsystems_tests.rs"]
mod tests;
