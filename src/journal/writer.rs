//! Term Writer
//!
//! Append side of the term journal. Each record's blob (metadata map
//! plus payload) is written to the companion data file before its
//! fixed-size record, so a populated marker always points at a blob
//! that exists on disk.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::Result;
use crate::replication::protocol::{FileId, FopKind, OpMeta, Operation};

use super::replay::encode_xdata;
use super::segment::{data_path, term_path, RecordHeader, FLAG_ROLLBACK};

/// Appends records to one term's segment pair
pub struct TermWriter {
    term: u64,
    records: File,
    data: File,
    blob_offset: u64,
}

impl TermWriter {
    /// Open the segment pair for `term`, creating it if absent, and
    /// position for appending
    pub fn open(dir: &Path, term: u64) -> Result<Self> {
        let records = OpenOptions::new()
            .create(true)
            .append(true)
            .open(term_path(dir, term))?;
        let data = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_path(dir, term))?;
        let blob_offset = data.metadata()?.len();
        Ok(Self {
            term,
            records,
            data,
            blob_offset,
        })
    }

    /// Term this writer appends to
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Journal one applied operation
    pub fn append_op(
        &mut self,
        meta: OpMeta,
        op: &Operation,
        xdata: &[(String, Vec<u8>)],
    ) -> Result<()> {
        let payload = bincode::serialize(&op.args)?;
        self.append_record(op.kind(), 0, meta, op.target, xdata, &payload)
    }

    /// Journal a rollback signal. It marks the failed operation's term
    /// and index for the reconciliation pass and carries no replayable
    /// payload.
    pub fn append_rollback(
        &mut self,
        meta: OpMeta,
        failed_kind: FopKind,
        target: FileId,
    ) -> Result<()> {
        self.append_record(failed_kind, FLAG_ROLLBACK, meta, target, &[], &[])
    }

    fn append_record(
        &mut self,
        kind: FopKind,
        flags: u32,
        meta: OpMeta,
        target: FileId,
        xdata: &[(String, Vec<u8>)],
        payload: &[u8],
    ) -> Result<()> {
        let meta_bytes = encode_xdata(xdata);
        let header = RecordHeader {
            kind,
            flags,
            term: meta.term,
            index: meta.index,
            target,
            blob_offset: self.blob_offset,
            meta_len: meta_bytes.len() as u32,
            data_len: payload.len() as u32,
        };

        // Blob first, record second: the populated marker must never be
        // visible before the bytes it references
        self.data.write_all(&meta_bytes)?;
        self.data.write_all(payload)?;
        self.blob_offset += (meta_bytes.len() + payload.len()) as u64;
        self.records.write_all(&header.to_bytes())?;
        Ok(())
    }

    /// Force both files of the segment pair durable
    pub fn sync(&mut self) -> Result<()> {
        self.data.sync_data()?;
        self.records.sync_data()?;
        Ok(())
    }
}
