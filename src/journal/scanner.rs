//! Term Scanner
//!
//! Discovers the term segments present in a journal directory and works
//! out how far back replay can reach. Terms need not be contiguous: a
//! node that was down for several terms has holes, and replay must not
//! walk across one.

use std::path::Path;

use crate::error::{Error, Result};

use super::segment::TermSegment;

/// The set of terms found in a journal directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermRange {
    /// Oldest term on disk
    pub first: u64,
    /// Newest term on disk
    pub last: u64,
    /// Oldest term reachable from `last` without a hole. Replay starts
    /// here; older segments exist but are separated by missing terms.
    pub contiguous_from: u64,
}

/// Scan `dir` for term segments and compute the replayable range.
///
/// Record files are named `TERM.<n>`. Companion `DATA.<n>` blobs and
/// unrelated files are ignored, but a `TERM.` file whose suffix is not a
/// number means the directory is damaged and the scan stops.
pub fn term_range(dir: &Path) -> Result<TermRange> {
    let mut terms = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix("TERM.") {
            match suffix.parse::<u64>() {
                Ok(term) => terms.push(term),
                Err(_) => return Err(Error::InvalidSegmentName(name.into_owned())),
            }
        }
    }

    if terms.is_empty() {
        return Err(Error::NoSegments);
    }
    terms.sort_unstable();

    let first = terms[0];
    let last = *terms.last().unwrap_or(&first);

    // Walk backward from the newest term until the run breaks
    let mut contiguous_from = last;
    for window in terms.windows(2).rev() {
        if window[1] == contiguous_from && window[1] == window[0] + 1 {
            contiguous_from = window[0];
        } else if window[1] == contiguous_from {
            break;
        }
    }

    tracing::debug!(first, last, contiguous_from, "scanned term segments");

    Ok(TermRange {
        first,
        last,
        contiguous_from,
    })
}

/// Open the segment for one term
pub fn open_term(dir: &Path, term: u64) -> Result<TermSegment> {
    TermSegment::open(dir, term)
}
