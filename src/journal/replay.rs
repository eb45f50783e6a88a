//! Journal Replay
//!
//! Decodes full journal records (fixed header plus companion blob) and
//! drives them back through a replica transport. Replay runs with the
//! reconciling flag set so the receiving side accepts the calls without
//! a live leader fan-out.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::replication::protocol::{FileId, OpArgs, OpMeta, Operation, Replica};

use super::segment::{data_path, RecordHeader, TermSegment, FLAG_ROLLBACK};

/// Encode a flat key/value metadata map.
///
/// Layout per pair: key length, key bytes, value length, value bytes,
/// with lengths as little-endian u32. A zero key length terminates the
/// map, so a key may never be empty.
pub fn encode_xdata(pairs: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Decode a flat key/value metadata map written by [`encode_xdata`]
pub fn decode_xdata(mut bytes: &[u8]) -> Option<Vec<(String, Vec<u8>)>> {
    fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
        if bytes.len() < n {
            return None;
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Some(head)
    }

    let mut pairs = Vec::new();
    loop {
        let key_len = u32::from_le_bytes(take(&mut bytes, 4)?.try_into().ok()?) as usize;
        if key_len == 0 {
            return Some(pairs);
        }
        let key = String::from_utf8(take(&mut bytes, key_len)?.to_vec()).ok()?;
        let val_len = u32::from_le_bytes(take(&mut bytes, 4)?.try_into().ok()?) as usize;
        let value = take(&mut bytes, val_len)?.to_vec();
        pairs.push((key, value));
    }
}

/// One fully decoded journal record
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub header: RecordHeader,
    /// Metadata map captured with the original call
    pub xdata: Vec<(String, Vec<u8>)>,
    /// The recorded operation; absent on rollback records, which carry
    /// no replayable payload
    pub op: Option<Operation>,
}

impl JournalRecord {
    /// This record is a rollback signal rather than an applied fop
    pub fn is_rollback(&self) -> bool {
        self.header.flags & FLAG_ROLLBACK != 0
    }
}

/// Sequential reader over one term's records and their blobs
pub struct ReplayCursor {
    segment: TermSegment,
    data: File,
}

impl ReplayCursor {
    /// Open the cursor for one term. Both the record file and the
    /// companion blob file must be present.
    pub fn open(dir: &Path, term: u64) -> Result<Self> {
        let segment = TermSegment::open(dir, term)?;
        let data = match File::open(data_path(dir, term)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SegmentUnavailable(term));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { segment, data })
    }

    /// Term this cursor replays
    pub fn term(&self) -> u64 {
        self.segment.term()
    }

    /// Decode the next record, or `None` at the end of the term
    pub fn decode_next(&mut self) -> Result<Option<JournalRecord>> {
        let header = match self.segment.next_entry()? {
            Some(h) => h,
            None => return Ok(None),
        };

        let corrupt = |reason: &str| Error::RecordCorrupted {
            term: header.term,
            index: header.index,
            reason: reason.to_string(),
        };

        let mut blob = vec![0u8; header.meta_len as usize + header.data_len as usize];
        self.data.seek(SeekFrom::Start(header.blob_offset))?;
        self.data
            .read_exact(&mut blob)
            .map_err(|_| Error::TruncatedRecord {
                term: header.term,
                index: header.index,
            })?;

        let (meta_bytes, payload) = blob.split_at(header.meta_len as usize);
        let xdata = decode_xdata(meta_bytes).ok_or_else(|| corrupt("bad metadata map"))?;

        let op = if header.flags & FLAG_ROLLBACK != 0 {
            None
        } else {
            let args: OpArgs = bincode::deserialize(payload)?;
            if args.kind() != header.kind {
                return Err(corrupt("payload kind disagrees with header"));
            }
            Some(Operation {
                target: header.target,
                args,
            })
        };

        Ok(Some(JournalRecord { op, header, xdata }))
    }
}

/// Resolves file identities the replay target has never seen.
///
/// The target side materializes a placeholder for an unknown identity;
/// the source side only needs to confirm the file exists before the
/// first operation against it is replayed.
#[async_trait::async_trait]
pub trait LookupSource: Send + Sync {
    /// Confirm `target` exists, returning its attribute map
    async fn lookup(&self, target: FileId) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Caches first-reference lookups across a replay pass
pub struct Resolver {
    source: Arc<dyn LookupSource>,
    resolved: Mutex<HashSet<FileId>>,
}

impl Resolver {
    pub fn new(source: Arc<dyn LookupSource>) -> Self {
        Self {
            source,
            resolved: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve `target` once per replay pass; later references are free
    pub async fn resolve(&self, target: FileId) -> Result<()> {
        if self.resolved.lock().unwrap().contains(&target) {
            return Ok(());
        }
        let attrs = self.source.lookup(target).await?;
        tracing::debug!(file = %target, attrs = attrs.len(), "resolved replay target");
        self.resolved.lock().unwrap().insert(target);
        Ok(())
    }

    /// Number of identities resolved so far
    pub fn resolved_count(&self) -> usize {
        self.resolved.lock().unwrap().len()
    }
}

/// Apply one decoded record to `replica` with the reconciling flag set.
///
/// Rollback records carry no operation to reapply; they are skipped
/// here, having already steered which records the scan selected.
pub async fn apply(replica: &Arc<dyn Replica>, record: &JournalRecord) -> Result<()> {
    if record.is_rollback() {
        tracing::debug!(
            term = record.header.term,
            index = record.header.index,
            "skipping rollback record during replay"
        );
        return Ok(());
    }

    let op = record.op.as_ref().ok_or_else(|| Error::RecordCorrupted {
        term: record.header.term,
        index: record.header.index,
        reason: "record has no replayable payload".to_string(),
    })?;

    let meta = OpMeta {
        term: record.header.term,
        index: record.header.index,
        from_leader: false,
        reconciling: true,
    };

    let reply = replica.send(meta, op).await?;
    if !reply.success {
        return Err(Error::Replication(format!(
            "replay of term {} index {} rejected with errno {}",
            record.header.term, record.header.index, reply.op_errno
        )));
    }
    Ok(())
}

/// Replay every remaining record in `cursor` against `replica`,
/// resolving each target identity on first reference. Returns the count
/// of applied records.
pub async fn replay_term(
    cursor: &mut ReplayCursor,
    replica: &Arc<dyn Replica>,
    resolver: &Resolver,
) -> Result<u64> {
    let mut applied = 0;
    while let Some(record) = cursor.decode_next()? {
        if record.is_rollback() {
            continue;
        }
        resolver.resolve(record.header.target).await?;
        apply(replica, &record).await?;
        applied += 1;
    }
    tracing::info!(term = cursor.term(), applied, "term replay finished");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::super::segment::test_support;
    use super::*;
    use crate::replication::protocol::{FopKind, Message, ReplicaReply};
    use bytes::Bytes;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use uuid::Uuid;

    /// Write a full term (records plus blob file) from operations
    fn write_term(dir: &Path, term: u64, ops: &[(Operation, Vec<(String, Vec<u8>)>)]) {
        let mut headers = Vec::new();
        let mut blob = Vec::new();
        for (index, (op, xdata)) in ops.iter().enumerate() {
            let meta_bytes = encode_xdata(xdata);
            let payload = bincode::serialize(&op.args).unwrap();
            headers.push(RecordHeader {
                kind: op.kind(),
                flags: 0,
                term,
                index: index as u64,
                target: op.target,
                blob_offset: blob.len() as u64,
                meta_len: meta_bytes.len() as u32,
                data_len: payload.len() as u32,
            });
            blob.extend_from_slice(&meta_bytes);
            blob.extend_from_slice(&payload);
        }
        test_support::write_segment(dir, term, &headers, 0);
        let mut data = File::create(data_path(dir, term)).unwrap();
        data.write_all(&blob).unwrap();
    }

    fn write_op(target: FileId, offset: u64, data: &'static [u8]) -> Operation {
        Operation {
            target,
            args: OpArgs::Write {
                offset,
                data: Bytes::from_static(data),
            },
        }
    }

    #[test]
    fn test_xdata_round_trip() {
        let pairs = vec![
            ("trusted.jbr.term".to_string(), vec![0, 0, 0, 3]),
            ("mode".to_string(), vec![]),
        ];
        let bytes = encode_xdata(&pairs);
        assert_eq!(decode_xdata(&bytes).unwrap(), pairs);

        assert_eq!(decode_xdata(&encode_xdata(&[])).unwrap(), vec![]);
    }

    #[test]
    fn test_xdata_short_buffer_rejected() {
        let bytes = encode_xdata(&[("key".to_string(), vec![1, 2, 3])]);
        assert!(decode_xdata(&bytes[..bytes.len() - 6]).is_none());
    }

    #[test]
    fn test_cursor_decodes_records_in_order() {
        let dir = tempdir().unwrap();
        let target = Uuid::new_v4();
        let ops = vec![
            (write_op(target, 0, b"hello"), vec![("k".to_string(), vec![1])]),
            (write_op(target, 5, b"world"), vec![]),
        ];
        write_term(dir.path(), 2, &ops);

        let mut cursor = ReplayCursor::open(dir.path(), 2).unwrap();
        let first = cursor.decode_next().unwrap().unwrap();
        assert_eq!(first.header.index, 0);
        assert_eq!(first.op.as_ref().unwrap().kind(), FopKind::Write);
        assert_eq!(first.xdata, vec![("k".to_string(), vec![1])]);

        let second = cursor.decode_next().unwrap().unwrap();
        assert_eq!(second.header.index, 1);
        assert!(cursor.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_kind_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let target = Uuid::new_v4();
        let op = write_op(target, 0, b"x");
        let payload = bincode::serialize(&op.args).unwrap();
        let meta_bytes = encode_xdata(&[]);

        // Header claims Truncate but the payload is a Write
        let header = RecordHeader {
            kind: FopKind::Truncate,
            flags: 0,
            term: 1,
            index: 0,
            target,
            blob_offset: 0,
            meta_len: meta_bytes.len() as u32,
            data_len: payload.len() as u32,
        };
        test_support::write_segment(dir.path(), 1, &[header], 0);
        let mut data = File::create(data_path(dir.path(), 1)).unwrap();
        data.write_all(&meta_bytes).unwrap();
        data.write_all(&payload).unwrap();

        let mut cursor = ReplayCursor::open(dir.path(), 1).unwrap();
        assert!(matches!(
            cursor.decode_next(),
            Err(Error::RecordCorrupted { .. })
        ));
    }

    #[test]
    fn test_missing_blob_bytes_are_truncation() {
        let dir = tempdir().unwrap();
        let target = Uuid::new_v4();
        write_term(dir.path(), 1, &[(write_op(target, 0, b"hello"), vec![])]);

        // Chop the blob file so the record's payload cannot be read
        let path = data_path(dir.path(), 1);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let mut cursor = ReplayCursor::open(dir.path(), 1).unwrap();
        assert!(matches!(
            cursor.decode_next(),
            Err(Error::TruncatedRecord { term: 1, index: 0 })
        ));
    }

    #[test]
    fn test_missing_data_file_is_unavailable() {
        let dir = tempdir().unwrap();
        test_support::write_segment(dir.path(), 3, &[], 0);
        assert!(matches!(
            ReplayCursor::open(dir.path(), 3),
            Err(Error::SegmentUnavailable(3))
        ));
    }

    struct RecordingReplica {
        sent: Mutex<Vec<OpMeta>>,
    }

    #[async_trait::async_trait]
    impl Replica for RecordingReplica {
        fn name(&self) -> &str {
            "replay-target"
        }

        async fn send(&self, meta: OpMeta, _op: &Operation) -> Result<ReplicaReply> {
            self.sent.lock().unwrap().push(meta);
            Ok(ReplicaReply::ok(0))
        }

        async fn send_control(&self, _msg: &Message) -> Result<()> {
            Ok(())
        }

        async fn flush(&self, _target: FileId) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_apply_skips_rollback_records() {
        let inner = Arc::new(RecordingReplica {
            sent: Mutex::new(Vec::new()),
        });
        let replica: Arc<dyn Replica> = inner.clone();
        let target = Uuid::new_v4();
        let mut record = JournalRecord {
            header: RecordHeader {
                kind: FopKind::Write,
                flags: FLAG_ROLLBACK,
                term: 4,
                index: 9,
                target,
                blob_offset: 0,
                meta_len: 0,
                data_len: 0,
            },
            xdata: vec![],
            op: Some(write_op(target, 0, b"abc")),
        };

        apply(&replica, &record).await.unwrap();
        assert!(inner.sent.lock().unwrap().is_empty());

        record.header.flags = 0;
        apply(&replica, &record).await.unwrap();
        let sent = inner.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].reconciling);
        assert!(!sent[0].from_leader);
        assert_eq!(sent[0].term, 4);
        assert_eq!(sent[0].index, 9);
    }

    struct CountingLookup {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LookupSource for CountingLookup {
        async fn lookup(&self, _target: FileId) -> Result<Vec<(String, Vec<u8>)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_resolver_looks_up_each_identity_once() {
        let source = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
        });
        let resolver = Resolver::new(source.clone());

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        resolver.resolve(a).await.unwrap();
        resolver.resolve(a).await.unwrap();
        resolver.resolve(b).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.resolved_count(), 2);
    }

    #[tokio::test]
    async fn test_replay_term_resolves_and_applies() {
        use super::super::writer::TermWriter;

        let dir = tempdir().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let meta = |index| OpMeta {
            term: 5,
            index,
            from_leader: true,
            reconciling: false,
        };

        let mut writer = TermWriter::open(dir.path(), 5).unwrap();
        writer.append_op(meta(1), &write_op(a, 0, b"one"), &[]).unwrap();
        writer.append_op(meta(2), &write_op(a, 3, b"two"), &[]).unwrap();
        writer.append_rollback(meta(3), FopKind::Write, b).unwrap();
        writer.append_op(meta(4), &write_op(b, 0, b"three"), &[]).unwrap();

        let inner = Arc::new(RecordingReplica {
            sent: Mutex::new(Vec::new()),
        });
        let replica: Arc<dyn Replica> = inner.clone();
        let source = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
        });
        let resolver = Resolver::new(source.clone());

        let mut cursor = ReplayCursor::open(dir.path(), 5).unwrap();
        let applied = replay_term(&mut cursor, &replica, &resolver).await.unwrap();
        assert_eq!(applied, 3);

        // The rollback record was skipped; everything else replayed in
        // journal order with the reconciling marker set
        let sent = inner.sent.lock().unwrap();
        assert_eq!(
            sent.iter().map(|m| m.index).collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
        assert!(sent.iter().all(|m| m.reconciling));
        drop(sent);

        // Two distinct targets, each resolved exactly once
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
