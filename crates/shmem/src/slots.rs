// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-slot mirror inside the process-array region.
//!
//! Peers look a child up here without consulting the supervisor's private
//! registry: in spawn-and-reattach mode a process has not inherited that
//! registry at all. The supervisor writes entries at launch and reap
//! time; the one field a child writes is its own flags word (walsender
//! reclassification).

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::segment::SegmentError;
use crate::subsystems::SLOT_ENTRY_SIZE;

/// Flags word bit: this session has become a walsender.
pub const FLAG_WALSENDER: u32 = 1 << 0;

const SLOTS_HEADER: u64 = 8;

/// One mirror entry. A zero pid marks a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    pub pid: u32,
    pub cancel_token: u32,
    pub flags: u32,
}

/// Offset-addressed view of the slot table.
pub struct ChildSlots {
    file: File,
    offset: u64,
    capacity: u32,
}

impl ChildSlots {
    pub(crate) fn open(file: File, offset: u64, len: u64) -> Result<Self, SegmentError> {
        let mut header = [0u8; SLOTS_HEADER as usize];
        file.read_exact_at(&mut header, offset)?;
        let capacity = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let entry_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if u64::from(entry_size) != SLOT_ENTRY_SIZE
            || SLOTS_HEADER + u64::from(capacity) * SLOT_ENTRY_SIZE > len
        {
            return Err(SegmentError::Truncated {
                expected: SLOTS_HEADER + u64::from(capacity) * SLOT_ENTRY_SIZE,
                found: len,
            });
        }
        Ok(Self {
            file,
            offset,
            capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Lowest-numbered free slot, if any.
    pub fn first_free(&self) -> Result<Option<usize>, SegmentError> {
        for slot in 0..self.capacity as usize {
            if self.read(slot)?.pid == 0 {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Publish a launched child so peers can find it.
    pub fn publish(&self, slot: usize, pid: u32, cancel_token: u32) -> Result<(), SegmentError> {
        self.write(
            slot,
            SlotEntry {
                pid,
                cancel_token,
                flags: 0,
            },
        )
    }

    /// Clear a reaped child's slot.
    pub fn clear(&self, slot: usize) -> Result<(), SegmentError> {
        self.write(
            slot,
            SlotEntry {
                pid: 0,
                cancel_token: 0,
                flags: 0,
            },
        )
    }

    /// Find a live entry by pid. This is the cancel-request lookup path.
    pub fn find_pid(&self, pid: u32) -> Result<Option<(usize, SlotEntry)>, SegmentError> {
        if pid == 0 {
            return Ok(None);
        }
        for slot in 0..self.capacity as usize {
            let entry = self.read(slot)?;
            if entry.pid == pid {
                return Ok(Some((slot, entry)));
            }
        }
        Ok(None)
    }

    pub fn read(&self, slot: usize) -> Result<SlotEntry, SegmentError> {
        let mut buf = [0u8; SLOT_ENTRY_SIZE as usize];
        self.file.read_exact_at(&mut buf, self.entry_offset(slot))?;
        Ok(SlotEntry {
            pid: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            cancel_token: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            flags: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Rewrite a slot's flags word. Children call this on their own slot.
    pub fn set_flags(&self, slot: usize, flags: u32) -> Result<(), SegmentError> {
        self.file
            .write_all_at(&flags.to_le_bytes(), self.entry_offset(slot) + 8)?;
        Ok(())
    }

    fn write(&self, slot: usize, entry: SlotEntry) -> Result<(), SegmentError> {
        let mut buf = [0u8; SLOT_ENTRY_SIZE as usize];
        buf[0..4].copy_from_slice(&entry.pid.to_le_bytes());
        buf[4..8].copy_from_slice(&entry.cancel_token.to_le_bytes());
        buf[8..12].copy_from_slice(&entry.flags.to_le_bytes());
        self.file.write_all_at(&buf, self.entry_offset(slot))?;
        Ok(())
    }

    fn entry_offset(&self, slot: usize) -> u64 {
        self.offset + SLOTS_HEADER + slot as u64 * SLOT_ENTRY_SIZE
    }
}

#[cfg(test)]
#[path = "slots_tests.rs"]
mod tests;
