// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared-segment file: header, table of contents, create/attach/destroy.
//!
//! Layout: a 128-byte header (magic, version tag, sizes, 128-bit key,
//! SHA-256 self-checksum), a table of contents naming every subsystem
//! region, then the page-aligned regions themselves. `create` zeroes the
//! regions and runs each subsystem's init callback in dependency order;
//! `attach` is the spawn-and-reattach verification path.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::sigslots::CrossSignalTable;
use crate::slots::ChildSlots;
use crate::subsystems::{SizingConfig, SubsystemRegistry, NAME_CROSS_SIGNALS, NAME_PROC_ARRAY};

/// File name of the segment inside the data directory's `global/`.
pub const SEGMENT_FILE_NAME: &str = "reef.seg";

pub(crate) const PAGE_SIZE: u64 = 8192;

const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"REEFSEG\0");
const SEGMENT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 128;
const TOC_ENTRY_SIZE: u64 = 40;
const TOC_NAME_LEN: usize = 24;

/// Errors from segment provisioning and verification.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("not a reef segment (bad magic)")]
    BadMagic,

    #[error("segment version {found} does not match supervisor version {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("segment header checksum mismatch")]
    ChecksumMismatch,

    #[error("segment truncated: header claims {expected} bytes, file has {found}")]
    Truncated { expected: u64, found: u64 },

    #[error("segment has no region named {0:?}")]
    RegionMissing(String),

    #[error("subsystem name {0:?} exceeds {TOC_NAME_LEN} bytes")]
    NameTooLong(String),

    #[error("duplicate subsystem name {0:?}")]
    DuplicateName(String),
}

/// One table-of-contents entry: a named, page-aligned region.
#[derive(Debug, Clone)]
pub struct TocEntry {
    pub name: String,
    pub offset: u64,
    pub len: u64,
}

/// Handle to a provisioned or attached segment.
pub struct Segment {
    path: PathBuf,
    file: File,
    key: u128,
    total_size: u64,
    sem_count: u32,
    toc: Vec<TocEntry>,
}

impl Segment {
    /// Size, allocate, and initialize the segment under `dir`.
    ///
    /// Seals the registry, sums every size request rounded up to the page
    /// size, writes the header and TOC, and runs the init callbacks in
    /// registration order. Only valid when no child is attached: callers
    /// re-provision exactly at boot and at crash-restart entry, after the
    /// registry of children has drained.
    pub fn create(
        dir: &Path,
        registry: &mut SubsystemRegistry,
        sizing: &SizingConfig,
    ) -> Result<Segment, SegmentError> {
        registry.seal();

        // Size every region, page-aligned, after the header + TOC block.
        let toc_len = registry.entries().len() as u64 * TOC_ENTRY_SIZE;
        let mut next_offset = round_up(HEADER_SIZE + toc_len, PAGE_SIZE);
        let mut toc = Vec::with_capacity(registry.entries().len());
        for subsystem in registry.entries() {
            let name = subsystem.name();
            if name.len() > TOC_NAME_LEN {
                return Err(SegmentError::NameTooLong(name.to_string()));
            }
            if toc.iter().any(|e: &TocEntry| e.name == name) {
                return Err(SegmentError::DuplicateName(name.to_string()));
            }
            let len = subsystem.size_request(sizing);
            toc.push(TocEntry {
                name: name.to_string(),
                offset: next_offset,
                len,
            });
            next_offset = round_up(next_offset + len, PAGE_SIZE);
        }
        let total_size = next_offset;

        let path = dir.join(SEGMENT_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        // set_len zero-fills, which is the initial state of every region.
        file.set_len(total_size)?;

        let key = Uuid::new_v4().as_u128();
        let sem_count = sizing.semaphore_count();

        let toc_bytes = encode_toc(&toc);
        let header = encode_header(key, total_size, sem_count, &toc, &toc_bytes);
        file.write_all_at(&header, 0)?;
        file.write_all_at(&toc_bytes, HEADER_SIZE)?;

        // Init callbacks, in the registration (dependency) order.
        for (subsystem, entry) in registry.entries().iter().zip(&toc) {
            let mut region = vec![0u8; entry.len as usize];
            subsystem.init(&mut region);
            file.write_all_at(&region, entry.offset)?;
        }
        file.sync_all()?;

        info!(
            path = %path.display(),
            total_size,
            sem_count,
            subsystems = toc.len(),
            "shared segment provisioned"
        );

        Ok(Segment {
            path,
            file,
            key,
            total_size,
            sem_count,
            toc,
        })
    }

    /// Reattach to an existing segment, verifying header and checksum.
    ///
    /// This is the child side of spawn-and-reattach: each subsystem
    /// recomputes its local pointers from the returned TOC.
    pub fn attach(path: &Path) -> Result<Segment, SegmentError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;

        let magic = u64::from_le_bytes(slice8(&header, 0));
        if magic != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic);
        }
        let version = u32::from_le_bytes(slice4(&header, 8));
        if version != SEGMENT_VERSION {
            return Err(SegmentError::VersionMismatch {
                found: version,
                expected: SEGMENT_VERSION,
            });
        }
        let total_size = u64::from_le_bytes(slice8(&header, 16));
        let file_len = file.metadata()?.len();
        if file_len < total_size {
            return Err(SegmentError::Truncated {
                expected: total_size,
                found: file_len,
            });
        }
        let sem_count = u32::from_le_bytes(slice4(&header, 24));
        let subsystem_count = u32::from_le_bytes(slice4(&header, 28));
        let key = u128::from_le_bytes(slice16(&header, 32));

        let mut toc_bytes = vec![0u8; subsystem_count as usize * TOC_ENTRY_SIZE as usize];
        file.read_exact_at(&mut toc_bytes, HEADER_SIZE)?;
        let toc = decode_toc(&toc_bytes);

        let mut expected = header;
        expected[48..80].fill(0);
        if checksum(&expected, &toc_bytes)[..] != header[48..80] {
            return Err(SegmentError::ChecksumMismatch);
        }

        Ok(Segment {
            path: path.to_path_buf(),
            file,
            key,
            total_size,
            sem_count,
            toc,
        })
    }

    /// Remove the segment file. Valid only once every child has exited.
    pub fn destroy(self) -> Result<(), SegmentError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> u128 {
        self.key
    }

    /// Key formatted for the pidfile's shared-segment line.
    pub fn key_hex(&self) -> String {
        format!("{:032x}", self.key)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn sem_count(&self) -> u32 {
        self.sem_count
    }

    pub fn toc(&self) -> &[TocEntry] {
        &self.toc
    }

    pub fn region(&self, name: &str) -> Result<&TocEntry, SegmentError> {
        self.toc
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| SegmentError::RegionMissing(name.to_string()))
    }

    /// View of the child-slot mirror inside the process-array region.
    pub fn child_slots(&self) -> Result<ChildSlots, SegmentError> {
        let entry = self.region(NAME_PROC_ARRAY)?;
        ChildSlots::open(self.file.try_clone()?, entry.offset, entry.len)
    }

    /// View of the cross-signal table.
    pub fn cross_signals(&self) -> Result<CrossSignalTable, SegmentError> {
        let entry = self.region(NAME_CROSS_SIGNALS)?;
        Ok(CrossSignalTable::open(
            self.file.try_clone()?,
            entry.offset,
            entry.len,
        ))
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn encode_header(
    key: u128,
    total_size: u64,
    sem_count: u32,
    toc: &[TocEntry],
    toc_bytes: &[u8],
) -> [u8; HEADER_SIZE as usize] {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    header[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
    header[16..24].copy_from_slice(&total_size.to_le_bytes());
    header[24..28].copy_from_slice(&sem_count.to_le_bytes());
    header[28..32].copy_from_slice(&(toc.len() as u32).to_le_bytes());
    header[32..48].copy_from_slice(&key.to_le_bytes());
    let sum = checksum(&header, toc_bytes);
    header[48..80].copy_from_slice(&sum);
    header
}

/// SHA-256 over the header (checksum field zeroed) and the TOC.
fn checksum(header: &[u8; HEADER_SIZE as usize], toc_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&header[0..48]);
    hasher.update(&header[80..]);
    hasher.update(toc_bytes);
    hasher.finalize().into()
}

fn encode_toc(toc: &[TocEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(toc.len() * TOC_ENTRY_SIZE as usize);
    for entry in toc {
        let mut name = [0u8; TOC_NAME_LEN];
        name[..entry.name.len()].copy_from_slice(entry.name.as_bytes());
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&entry.offset.to_le_bytes());
        bytes.extend_from_slice(&entry.len.to_le_bytes());
    }
    bytes
}

fn decode_toc(bytes: &[u8]) -> Vec<TocEntry> {
    bytes
        .chunks_exact(TOC_ENTRY_SIZE as usize)
        .map(|chunk| {
            let name_end = chunk[..TOC_NAME_LEN]
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(TOC_NAME_LEN);
            TocEntry {
                name: String::from_utf8_lossy(&chunk[..name_end]).into_owned(),
                offset: u64::from_le_bytes(slice8(chunk, TOC_NAME_LEN)),
                len: u64::from_le_bytes(slice8(chunk, TOC_NAME_LEN + 8)),
            }
        })
        .collect()
}

fn slice4(bytes: &[u8], at: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[at..at + 4]);
    out
}

fn slice8(bytes: &[u8], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[at..at + 8]);
    out
}

fn slice16(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[at..at + 16]);
    out
}

#[cfg(test)]
#[path = "segment_tests.rs"]
mod tests;
