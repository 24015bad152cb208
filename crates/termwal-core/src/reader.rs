//! Fault-tolerant sequential reader over a WAL directory
//!
//! Reading rules:
//! 1. Resolve the segment chain; a sequence gap (missing, unreadable or
//!    mislabeled segment) ends the chain and marks the result incomplete
//! 2. Per segment, skip the header, surface mint records, verify the summary
//! 3. Stop at the first structural fault, keeping everything decoded so far
//! 4. A compressed segment without a summary marks the result incomplete
//! 5. An unknown value kind is a hard error, never a silent stop
//!
//! `scan()` and `iter()` produce the same records and the same verdict for
//! the same directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::config::WalConfig;
use crate::error::WalResult;
use crate::format::{Lsn, WalRecord, NO_LSN};
use crate::segment::{resolve_chain, SegmentCursor, SegmentEntry, SegmentFault, SegmentStep};

/// Everything a full pass over the log produced
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub records: Vec<WalRecord>,
    /// Highest LSN among surfaced records (NO_LSN if none)
    pub last_valid_lsn: Lsn,
    /// False if anything was cut short by a gap, fault or missing summary
    pub complete: bool,
}

/// Reader bound to one WAL directory. Every call re-resolves the directory.
#[derive(Debug, Clone)]
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn open(config: &WalConfig) -> Self {
        Self::from_directory(&config.wal_directory)
    }

    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Read every record eagerly.
    pub fn scan(&self) -> WalResult<ScanResult> {
        let mut iter = self.iter();
        let mut records = Vec::new();
        for record in iter.by_ref() {
            records.push(record?);
        }
        Ok(ScanResult {
            records,
            last_valid_lsn: iter.last_valid_lsn(),
            complete: iter.is_complete(),
        })
    }

    /// Lazy record iterator.
    ///
    /// If the directory cannot be listed the iterator yields that error once.
    pub fn iter(&self) -> RecordIter {
        match resolve_chain(&self.dir) {
            Ok(chain) => RecordIter::new(chain.segments.into(), chain.gap),
            Err(err) => {
                let mut iter = RecordIter::new(VecDeque::new(), false);
                iter.pending_error = Some(err);
                iter
            }
        }
    }
}

impl IntoIterator for &WalReader {
    type Item = WalResult<WalRecord>;
    type IntoIter = RecordIter;

    fn into_iter(self) -> RecordIter {
        self.iter()
    }
}

/// Lazy iterator over WAL records.
///
/// `last_valid_lsn()` and `is_complete()` describe only what has been
/// consumed so far; `is_complete()` stays false until the iterator is
/// exhausted.
pub struct RecordIter {
    segments: VecDeque<SegmentEntry>,
    current: Option<SegmentCursor>,
    gap: bool,
    stopped: bool,
    summary_missing: bool,
    exhausted: bool,
    pending_error: Option<crate::error::WalError>,
    last_valid_lsn: Lsn,
}

impl RecordIter {
    fn new(segments: VecDeque<SegmentEntry>, gap: bool) -> Self {
        Self {
            segments,
            current: None,
            gap,
            stopped: false,
            summary_missing: false,
            exhausted: false,
            pending_error: None,
            last_valid_lsn: NO_LSN,
        }
    }

    /// Highest LSN yielded so far
    pub fn last_valid_lsn(&self) -> Lsn {
        self.last_valid_lsn
    }

    /// True once exhausted with no gap, fault or missing summary on the way
    pub fn is_complete(&self) -> bool {
        self.exhausted && !self.gap && !self.stopped && !self.summary_missing
    }

    fn finish(&mut self) {
        self.exhausted = true;
        self.current = None;
        self.segments.clear();
    }
}

impl Iterator for RecordIter {
    type Item = WalResult<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            self.stopped = true;
            self.finish();
            return Some(Err(err));
        }
        if self.exhausted {
            return None;
        }

        loop {
            if self.current.is_none() {
                match self.segments.pop_front() {
                    Some(entry) => self.current = Some(SegmentCursor::open(&entry)),
                    None => {
                        self.finish();
                        return None;
                    }
                }
            }
            let Some(cursor) = self.current.as_mut() else { continue };

            match cursor.next_step() {
                Ok(SegmentStep::Record(record)) => {
                    self.last_valid_lsn = self.last_valid_lsn.max(record.lsn);
                    return Some(Ok(record));
                }
                Ok(SegmentStep::End(summary)) => {
                    if cursor.is_compressed() && summary.is_none() {
                        self.summary_missing = true;
                    }
                    self.current = None;
                }
                Ok(SegmentStep::Stop(fault)) => {
                    log_fault(&fault);
                    self.stopped = true;
                    self.finish();
                    return None;
                }
                Err(err) => {
                    self.stopped = true;
                    self.finish();
                    return Some(Err(err));
                }
            }
        }
    }
}

impl std::iter::FusedIterator for RecordIter {}

fn log_fault(fault: &SegmentFault) {
    match fault {
        SegmentFault::Frame { offset, reason } => {
            tracing::warn!(offset, reason = ?reason, "WAL read stopped at invalid frame");
        }
        SegmentFault::SummaryMismatch { expected, actual } => {
            tracing::warn!(expected, actual, "WAL segment summary CRC32 mismatch");
        }
        SegmentFault::Unopenable(kind) => {
            tracing::warn!(kind = ?kind, "WAL segment could not be opened");
        }
    }
}
