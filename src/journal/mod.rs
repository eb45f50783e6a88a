//! Term Journal Module
//!
//! On-disk replay log consumed by the reconciliation pass. Each term
//! owns one `TERM.<n>` segment of fixed-size records plus a companion
//! `DATA.<n>` blob file holding the record's metadata map and payload.
//! The scanner runs as a maintenance operation, independent of the
//! live-replication locks.

pub mod replay;
mod scanner;
mod segment;
mod writer;

pub use replay::{apply, replay_term, JournalRecord, LookupSource, ReplayCursor, Resolver};
pub use scanner::{open_term, term_range, TermRange};
pub use segment::{RecordHeader, TermSegment, FLAG_ROLLBACK, RECORD_MARKER, RECORD_SIZE};
pub use writer::TermWriter;
