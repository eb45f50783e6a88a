//! Term Segment Files
//!
//! A term segment (`TERM.<n>`) is a contiguous run of fixed-size
//! records. Writers pre-allocate space ahead of the append position, so
//! a segment's valid length is the prefix of records whose first two
//! bytes carry the populated-marker — found by binary search rather
//! than by dividing the file size.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::replication::protocol::{FileId, FopKind};

/// Fixed on-disk record size in bytes
pub const RECORD_SIZE: usize = 64;

/// Marker in the first two bytes of every fully written record
pub const RECORD_MARKER: u16 = 0xA55A;

/// Record flag: this record is a rollback signal, not an applied fop
pub const FLAG_ROLLBACK: u32 = 1;

// Record layout, little-endian:
//   [0..2)   populated marker
//   [2..4)   fop kind code
//   [4..8)   flags
//   [8..16)  term
//   [16..24) index
//   [24..40) target file id
//   [40..48) blob offset into DATA.<n>
//   [48..52) metadata map length
//   [52..56) payload length
//   [56..60) crc32 of bytes [0..56)
//   [60..64) reserved

fn kind_code(kind: FopKind) -> u16 {
    match kind {
        FopKind::Write => 1,
        FopKind::Truncate => 2,
        FopKind::Fallocate => 3,
        FopKind::Discard => 4,
        FopKind::Zerofill => 5,
        FopKind::SetAttr => 6,
        FopKind::SetXattr => 7,
        FopKind::RemoveXattr => 8,
        FopKind::Create => 9,
        FopKind::Mkdir => 10,
        FopKind::Symlink => 11,
        FopKind::Link => 12,
        FopKind::Rename => 13,
        FopKind::Unlink => 14,
        FopKind::Rmdir => 15,
        FopKind::Fsync => 16,
    }
}

fn kind_from_code(code: u16) -> Option<FopKind> {
    Some(match code {
        1 => FopKind::Write,
        2 => FopKind::Truncate,
        3 => FopKind::Fallocate,
        4 => FopKind::Discard,
        5 => FopKind::Zerofill,
        6 => FopKind::SetAttr,
        7 => FopKind::SetXattr,
        8 => FopKind::RemoveXattr,
        9 => FopKind::Create,
        10 => FopKind::Mkdir,
        11 => FopKind::Symlink,
        12 => FopKind::Link,
        13 => FopKind::Rename,
        14 => FopKind::Unlink,
        15 => FopKind::Rmdir,
        16 => FopKind::Fsync,
        _ => return None,
    })
}

/// Fixed-size header of one journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: FopKind,
    pub flags: u32,
    pub term: u64,
    pub index: u64,
    pub target: FileId,
    /// Offset of the record's blob in the companion data file
    pub blob_offset: u64,
    /// Length of the metadata map within the blob
    pub meta_len: u32,
    /// Length of the payload within the blob, following the map
    pub data_len: u32,
}

impl RecordHeader {
    /// Serialize to one on-disk record
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..2].copy_from_slice(&RECORD_MARKER.to_le_bytes());
        bytes[2..4].copy_from_slice(&kind_code(self.kind).to_le_bytes());
        bytes[4..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.term.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.index.to_le_bytes());
        bytes[24..40].copy_from_slice(self.target.as_bytes());
        bytes[40..48].copy_from_slice(&self.blob_offset.to_le_bytes());
        bytes[48..52].copy_from_slice(&self.meta_len.to_le_bytes());
        bytes[52..56].copy_from_slice(&self.data_len.to_le_bytes());
        let crc = crc32fast::hash(&bytes[0..56]);
        bytes[56..60].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Parse one on-disk record
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Result<Self> {
        let term = read_u64(bytes, 8);
        let index = read_u64(bytes, 16);

        let corrupt = |reason: &str| Error::RecordCorrupted {
            term,
            index,
            reason: reason.to_string(),
        };

        let marker = read_u16(bytes, 0);
        if marker != RECORD_MARKER {
            return Err(corrupt("bad populated-marker"));
        }

        let stored_crc = read_u32(bytes, 56);
        if stored_crc != crc32fast::hash(&bytes[0..56]) {
            return Err(corrupt("checksum mismatch"));
        }

        let kind = kind_from_code(read_u16(bytes, 2)).ok_or_else(|| corrupt("unknown fop kind"))?;

        let mut target = [0u8; 16];
        target.copy_from_slice(&bytes[24..40]);

        Ok(Self {
            kind,
            flags: read_u32(bytes, 4),
            term,
            index,
            target: FileId::from_bytes(target),
            blob_offset: read_u64(bytes, 40),
            meta_len: read_u32(bytes, 48),
            data_len: read_u32(bytes, 52),
        })
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Path of the record file for `term`
pub fn term_path(dir: &Path, term: u64) -> PathBuf {
    dir.join(format!("TERM.{}", term))
}

/// Path of the companion blob file for `term`
pub fn data_path(dir: &Path, term: u64) -> PathBuf {
    dir.join(format!("DATA.{}", term))
}

/// An open term segment positioned for sequential record reads
pub struct TermSegment {
    term: u64,
    file: File,
    file_len: u64,
    valid_records: u64,
    cursor: u64,
}

impl TermSegment {
    /// Open the segment for `term` and locate its valid tail.
    ///
    /// The valid record count is found by binary search over the
    /// populated-markers: the boundary between fully written records
    /// and pre-allocated (or partially written) space.
    pub fn open(dir: &Path, term: u64) -> Result<Self> {
        let path = term_path(dir, term);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SegmentUnavailable(term));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.seek(SeekFrom::End(0))?;

        let mut segment = Self {
            term,
            file,
            file_len,
            valid_records: 0,
            cursor: 0,
        };
        segment.valid_records = segment.find_valid_boundary()?;
        Ok(segment)
    }

    /// Binary search for the first unpopulated record slot.
    ///
    /// The slot count rounds up: a populated record whose trailing bytes
    /// are missing still occupies a slot, so it counts as valid here and
    /// surfaces as `TruncatedRecord` when read, not as a clean end.
    fn find_valid_boundary(&mut self) -> Result<u64> {
        let slots = self.file_len.div_ceil(RECORD_SIZE as u64);
        let mut lo = 0u64;
        let mut hi = slots;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.slot_populated(mid)? {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn slot_populated(&mut self, slot: u64) -> Result<bool> {
        let offset = slot * RECORD_SIZE as u64;
        if offset + 2 > self.file_len {
            return Ok(false);
        }
        let mut marker = [0u8; 2];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut marker)?;
        Ok(u16::from_le_bytes(marker) == RECORD_MARKER)
    }

    /// Term this segment belongs to
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Count of fully written records
    pub fn valid_records(&self) -> u64 {
        self.valid_records
    }

    /// Read the next record, or `None` at the end of the segment.
    ///
    /// A populated record that cannot be read in full is a
    /// `TruncatedRecord` error, distinct from the clean end boundary.
    pub fn next_entry(&mut self) -> Result<Option<RecordHeader>> {
        if self.cursor >= self.valid_records {
            return Ok(None);
        }

        let offset = self.cursor * RECORD_SIZE as u64;
        if offset + RECORD_SIZE as u64 > self.file_len {
            return Err(Error::TruncatedRecord {
                term: self.term,
                index: self.cursor,
            });
        }

        let mut bytes = [0u8; RECORD_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut bytes)?;
        let header = RecordHeader::from_bytes(&bytes)?;
        self.cursor += 1;
        Ok(Some(header))
    }
}
