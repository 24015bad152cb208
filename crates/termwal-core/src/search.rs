//! Point lookup of a minted record by id
//!
//! Producers log concurrently, so ids inside a segment are not sorted and a
//! segment's ids can overlap its neighbours'. A segment's first id says
//! nothing about where a later id lives. Instead, each sealed segment's
//! `[min, max]` id range is learned on its first full read and cached. Later
//! lookups only open sealed segments whose range covers the id. Segments
//! without a verified summary (the live one, a crash tail) are always read.
//!
//! The chain is resolved afresh on every call, so rotation and compression
//! between calls are invisible. A cached range is keyed by the file's
//! sequence, form, length and mtime, and is dropped once that file leaves
//! the chain.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::config::WalConfig;
use crate::error::WalResult;
use crate::format::WalRecord;
use crate::segment::{resolve_chain, SegmentCursor, SegmentEntry, SegmentStep};

/// Identity of one immutable segment file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SegmentIdentity {
    sequence: u64,
    compressed: bool,
    bytes: u64,
    modified: SystemTime,
}

impl SegmentIdentity {
    fn of(entry: &SegmentEntry) -> Option<Self> {
        let meta = fs::metadata(&entry.path).ok()?;
        Some(Self {
            sequence: entry.sequence,
            compressed: entry.compressed,
            bytes: meta.len(),
            modified: meta.modified().ok()?,
        })
    }
}

/// Lowest and highest id minted into a sealed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IdRange {
    min: u32,
    max: u32,
}

impl IdRange {
    fn covers(&self, id: u32) -> bool {
        self.min <= id && id <= self.max
    }

    fn include(range: Option<Self>, id: u32) -> Option<Self> {
        Some(match range {
            Some(r) => IdRange { min: r.min.min(id), max: r.max.max(id) },
            None => IdRange { min: id, max: id },
        })
    }
}

/// Cached id range per sealed segment; None for a sealed segment with no mint
type RangeCache = HashMap<SegmentIdentity, Option<IdRange>>;

enum SegmentScan {
    Found(WalRecord),
    /// Read to a verified summary without finding the id
    Sealed(Option<IdRange>),
    /// Read to EOF or a fault without a summary
    Unsealed,
}

#[derive(Debug, Clone)]
pub struct WalSearch {
    dir: PathBuf,
    ranges: Arc<Mutex<RangeCache>>,
}

impl WalSearch {
    pub fn open(config: &WalConfig) -> Self {
        Self::from_directory(&config.wal_directory)
    }

    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ranges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// First record minted for `id` in chain order, or None if the WAL never saw it.
    pub fn find_value_by_id(&self, id: u32) -> WalResult<Option<WalRecord>> {
        let chain = resolve_chain(&self.dir)?;
        let segments: Vec<(SegmentEntry, Option<SegmentIdentity>)> = chain
            .segments
            .into_iter()
            .map(|entry| {
                let identity = SegmentIdentity::of(&entry);
                (entry, identity)
            })
            .collect();

        {
            let present: HashSet<SegmentIdentity> =
                segments.iter().filter_map(|(_, identity)| *identity).collect();
            self.ranges.lock().retain(|identity, _| present.contains(identity));
        }

        for (entry, identity) in &segments {
            let identity = *identity;
            let cached = identity.and_then(|i| self.ranges.lock().get(&i).copied());
            if let Some(range) = cached {
                if !range.map_or(false, |r| r.covers(id)) {
                    continue;
                }
            }

            match scan_segment(entry, id)? {
                SegmentScan::Found(record) => return Ok(Some(record)),
                SegmentScan::Sealed(range) => {
                    if let Some(identity) = identity {
                        self.ranges.lock().insert(identity, range);
                    }
                }
                SegmentScan::Unsealed => {}
            }
        }
        Ok(None)
    }
}

fn scan_segment(entry: &SegmentEntry, id: u32) -> WalResult<SegmentScan> {
    let mut cursor = SegmentCursor::open(entry);
    let mut range = None;
    loop {
        match cursor.next_step()? {
            SegmentStep::Record(record) if record.id == id => {
                return Ok(SegmentScan::Found(record));
            }
            SegmentStep::Record(record) => range = IdRange::include(range, record.id),
            SegmentStep::End(Some(_)) => return Ok(SegmentScan::Sealed(range)),
            SegmentStep::End(None) | SegmentStep::Stop(_) => return Ok(SegmentScan::Unsealed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{
        encode_frame, value_hash, Frame, Lsn, SegmentHeader, SegmentSummary, ValueKind,
    };
    use crate::segment::bare_file_name;
    use tempfile::TempDir;

    fn write_segment(
        dir: &Path,
        sequence: u64,
        first_id: u32,
        mints: &[(Lsn, u32, &str)],
        seal: bool,
    ) {
        let mut buf = Vec::new();
        let header = SegmentHeader::new("store", sequence, first_id);
        encode_frame(&Frame::Header(header), &mut buf).unwrap();
        for &(lsn, id, lexical) in mints {
            let record = WalRecord {
                lsn,
                id,
                kind: ValueKind::BNode,
                lexical: lexical.to_string(),
                datatype: String::new(),
                language: String::new(),
                hash: value_hash(ValueKind::BNode, lexical, "", ""),
            };
            encode_frame(&Frame::Mint(record), &mut buf).unwrap();
        }
        if seal {
            let last_id = mints.iter().map(|m| m.1).max().unwrap_or(0);
            let summary = SegmentSummary { last_id, crc32: crc32fast::hash(&buf) };
            encode_frame(&Frame::Summary(summary), &mut buf).unwrap();
        }
        fs::write(dir.join(bare_file_name(sequence)), buf).unwrap();
    }

    fn cached_ranges(search: &WalSearch) -> Vec<Option<IdRange>> {
        let mut ranges: Vec<_> =
            search.ranges.lock().iter().map(|(k, v)| (k.sequence, *v)).collect();
        ranges.sort_by_key(|(sequence, _)| *sequence);
        ranges.into_iter().map(|(_, range)| range).collect()
    }

    #[test]
    fn test_finds_ids_across_segments() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, 0, &[(1, 1, "b1"), (2, 2, "b2")], true);
        write_segment(dir.path(), 2, 3, &[(3, 3, "b3"), (4, 4, "b4")], true);
        write_segment(dir.path(), 3, 0, &[], true);
        write_segment(dir.path(), 4, 0, &[(5, 5, "b5")], false);

        let search = WalSearch::from_directory(dir.path());
        for (id, lexical) in [(1, "b1"), (2, "b2"), (3, "b3"), (4, "b4"), (5, "b5")] {
            let found = search.find_value_by_id(id).unwrap().unwrap();
            assert_eq!(found.lexical, lexical);
        }
    }

    #[test]
    fn test_finds_ids_logged_out_of_order() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, 1, &[(1, 1, "one"), (2, 3, "three")], true);
        write_segment(dir.path(), 2, 2, &[(3, 2, "two"), (4, 4, "four")], true);
        write_segment(dir.path(), 3, 6, &[(5, 6, "six"), (6, 5, "five")], false);

        let search = WalSearch::from_directory(dir.path());
        // Twice: the second pass runs against cached ranges.
        for _ in 0..2 {
            let expected =
                [(1, "one"), (2, "two"), (3, "three"), (4, "four"), (5, "five"), (6, "six")];
            for (id, lexical) in expected {
                let found = search.find_value_by_id(id).unwrap().unwrap();
                assert_eq!(found.lexical, lexical, "id {}", id);
            }
            assert!(search.find_value_by_id(7).unwrap().is_none());
        }
        assert_eq!(
            cached_ranges(&search),
            vec![Some(IdRange { min: 1, max: 3 }), Some(IdRange { min: 2, max: 4 })]
        );
    }

    #[test]
    fn test_rewritten_segment_drops_cached_range() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, 1, &[(1, 1, "a"), (2, 2, "b")], true);

        let search = WalSearch::from_directory(dir.path());
        assert!(search.find_value_by_id(10).unwrap().is_none());
        assert_eq!(cached_ranges(&search), vec![Some(IdRange { min: 1, max: 2 })]);

        // Same sequence, different content, as after a purge.
        let rewritten = [(1, 10, "after purge"), (2, 11, "more"), (3, 12, "x")];
        write_segment(dir.path(), 1, 10, &rewritten, true);
        let found = search.find_value_by_id(10).unwrap().unwrap();
        assert_eq!(found.lexical, "after purge");
        assert!(search.find_value_by_id(1).unwrap().is_none());
        assert_eq!(cached_ranges(&search), vec![Some(IdRange { min: 10, max: 12 })]);
    }

    #[test]
    fn test_out_of_range_is_none() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, 10, &[(1, 10, "a"), (2, 11, "b")], true);

        let search = WalSearch::from_directory(dir.path());
        assert!(search.find_value_by_id(9).unwrap().is_none());
        assert!(search.find_value_by_id(12).unwrap().is_none());
        assert!(search.find_value_by_id(u32::MAX).unwrap().is_none());
    }

    #[test]
    fn test_first_occurrence_returned() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, 1, &[(1, 1, "a"), (2, 2, "original")], true);
        write_segment(dir.path(), 2, 2, &[(3, 2, "stale"), (4, 3, "c")], false);

        let found = WalSearch::from_directory(dir.path()).find_value_by_id(2).unwrap().unwrap();
        assert_eq!(found.lexical, "original");
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        assert!(WalSearch::from_directory(dir.path()).find_value_by_id(1).unwrap().is_none());
    }
}
