// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::subsystems::{SharedSubsystem, SizingConfig, SubsystemRegistry};
use std::os::unix::fs::PermissionsExt;
use tempfile::tempdir;

fn sizing() -> SizingConfig {
    SizingConfig {
        max_sessions: 10,
        max_autovac_workers: 3,
        max_walsenders: 4,
        max_bgworkers: 8,
        shared_buffer_pages: 16,
        wal_buffer_pages: 8,
        max_replication_slots: 4,
    }
}

#[test]
fn create_then_attach_round_trips_header_and_toc() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    let seg = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();

    let attached = Segment::attach(seg.path()).unwrap();
    assert_eq!(attached.key(), seg.key());
    assert_eq!(attached.total_size(), seg.total_size());
    assert_eq!(attached.sem_count(), seg.sem_count());
    assert_eq!(attached.toc().len(), seg.toc().len());
    for (a, b) in attached.toc().iter().zip(seg.toc()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.offset, b.offset);
        assert_eq!(a.len, b.len);
    }
}

#[test]
fn regions_are_page_aligned_and_disjoint() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    let seg = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();

    let mut prev_end = 0u64;
    for entry in seg.toc() {
        assert_eq!(entry.offset % 8192, 0, "{} not page aligned", entry.name);
        assert!(entry.offset >= prev_end, "{} overlaps", entry.name);
        prev_end = entry.offset + entry.len;
    }
    assert!(seg.total_size() >= prev_end);
    assert_eq!(seg.total_size() % 8192, 0);
}

#[test]
fn segment_file_mode_is_owner_only() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    let seg = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();

    let mode = std::fs::metadata(seg.path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn attach_rejects_a_corrupted_header() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    let seg = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();
    let path = seg.path().to_path_buf();

    // Flip a byte inside the key field; the checksum must catch it.
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, 40).unwrap();
    file.write_all_at(&[!byte[0]], 40).unwrap();
    drop(file);

    assert!(matches!(
        Segment::attach(&path),
        Err(SegmentError::ChecksumMismatch)
    ));
}

#[test]
fn attach_rejects_a_foreign_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(SEGMENT_FILE_NAME);
    std::fs::write(&path, vec![0u8; 256]).unwrap();

    assert!(matches!(
        Segment::attach(&path),
        Err(SegmentError::BadMagic)
    ));
}

#[test]
fn attach_rejects_a_truncated_segment() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    let seg = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();
    let path = seg.path().to_path_buf();
    let total = seg.total_size();
    drop(seg);

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(total / 2).unwrap();
    drop(file);

    assert!(matches!(
        Segment::attach(&path),
        Err(SegmentError::Truncated { .. })
    ));
}

#[test]
fn reprovisioning_rotates_the_key() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    let first = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();
    let first_key = first.key();
    drop(first);

    // Crash-restart path: create again over the same directory.
    let mut registry = SubsystemRegistry::builtin();
    let second = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();
    assert_ne!(second.key(), first_key);
    assert_eq!(second.key_hex().len(), 32);
}

#[test]
fn destroy_removes_the_file() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    let seg = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();
    let path = seg.path().to_path_buf();

    seg.destroy().unwrap();
    assert!(!path.exists());
}

struct PreloadRegion;

impl SharedSubsystem for PreloadRegion {
    fn name(&self) -> &'static str {
        "preload_extra"
    }

    fn size_request(&self, _sizing: &SizingConfig) -> u64 {
        1024
    }
}

#[test]
fn preload_registration_lands_in_the_toc() {
    let dir = tempdir().unwrap();
    let mut registry = SubsystemRegistry::builtin();
    registry.register_preload(Box::new(PreloadRegion)).unwrap();

    let seg = Segment::create(dir.path(), &mut registry, &sizing()).unwrap();
    let entry = seg.region("preload_extra").unwrap();
    assert_eq!(entry.len, 1024);
}

#[test]
fn registration_after_seal_is_refused() {
    let mut registry = SubsystemRegistry::builtin();
    registry.seal();
    assert!(registry.register_preload(Box::new(PreloadRegion)).is_err());
}
