//! Segment files: naming, discovery and sequential decoding
//!
//! A WAL directory holds `wal-<seq>.v1` (bare, possibly still being written)
//! and `wal-<seq>.v1.gz` (sealed and compressed). Sequence numbers come from
//! each segment's header frame; a file whose header is unreadable or disagrees
//! with its name is treated exactly like a missing segment.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::{WalError, WalResult};
use crate::format::{
    CorruptReason, Frame, FrameRead, FrameReader, SegmentHeader, SegmentSummary, WalRecord,
};

pub const SEGMENT_PREFIX: &str = "wal-";
pub const BARE_SUFFIX: &str = ".v1";
pub const COMPRESSED_SUFFIX: &str = ".v1.gz";
pub const LOCK_FILE: &str = "lock";

/// File name of a bare segment
pub fn bare_file_name(sequence: u64) -> String {
    format!("{}{:08}{}", SEGMENT_PREFIX, sequence, BARE_SUFFIX)
}

/// File name of a compressed segment
pub fn compressed_file_name(sequence: u64) -> String {
    format!("{}{:08}{}", SEGMENT_PREFIX, sequence, COMPRESSED_SUFFIX)
}

/// Parse `wal-<digits>.v1` or `wal-<digits>.v1.gz` into (sequence, compressed).
pub fn parse_segment_file_name(name: &str) -> Option<(u64, bool)> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?;
    let (digits, compressed) = if let Some(d) = rest.strip_suffix(COMPRESSED_SUFFIX) {
        (d, true)
    } else {
        (rest.strip_suffix(BARE_SUFFIX)?, false)
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|seq| (seq, compressed))
}

/// A segment file found on disk, before its header is consulted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    /// Sequence from the file name
    pub name_sequence: u64,
    pub compressed: bool,
}

/// Every segment file in `dir`, in name-sequence order. A missing directory is empty.
pub fn list_segment_files(dir: &Path) -> WalResult<Vec<SegmentFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(WalError::io_at(dir, "Failed to read WAL directory")(e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(WalError::io_at(dir, "Failed to read directory entry"))?;
        let path = entry.path();
        let parsed = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_file_name);
        if let Some((name_sequence, compressed)) = parsed {
            files.push(SegmentFile { path, name_sequence, compressed });
        }
    }
    files.sort_by_key(|f| (f.name_sequence, f.compressed));
    Ok(files)
}

/// Open a segment for sequential reading, decompressing `.gz` transparently.
pub fn open_segment_stream(path: &Path, compressed: bool) -> std::io::Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    if compressed {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn is_compressed_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.ends_with(COMPRESSED_SUFFIX))
}

/// Header frame of a segment, or None if the file is empty, truncated or not a segment.
pub fn read_segment_header(path: &Path) -> Option<SegmentHeader> {
    let stream = open_segment_stream(path, is_compressed_path(path)).ok()?;
    match FrameReader::new(stream).next_frame() {
        Ok(FrameRead::Frame(Frame::Header(header))) => Some(header),
        _ => None,
    }
}

/// Sequence number stored in a segment header; 0 when the file is unreadable.
pub fn read_segment_sequence(path: &Path) -> u64 {
    read_segment_header(path).map_or(0, |h| h.sequence)
}

/// Highest sequence visible in `dir`, from names or headers, across both forms.
pub fn max_observed_sequence(dir: &Path) -> WalResult<u64> {
    let mut max_seq = 0;
    for file in list_segment_files(dir)? {
        max_seq = max_seq.max(file.name_sequence).max(read_segment_sequence(&file.path));
    }
    Ok(max_seq)
}

/// A readable segment in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub path: PathBuf,
    pub sequence: u64,
    pub first_id: u32,
    pub compressed: bool,
}

/// Contiguous run of readable segments starting at the lowest sequence present
#[derive(Debug, Clone, Default)]
pub struct SegmentChain {
    pub segments: Vec<SegmentEntry>,
    /// True when a missing, unreadable or mislabeled segment cut the chain short
    pub gap: bool,
}

/// Resolve the segment chain of `dir`.
///
/// When a bare and a compressed file share a sequence, compression is still in
/// flight and the bare file is authoritative.
pub fn resolve_chain(dir: &Path) -> WalResult<SegmentChain> {
    let mut by_sequence: BTreeMap<u64, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
    for file in list_segment_files(dir)? {
        let slot = by_sequence.entry(file.name_sequence).or_default();
        if file.compressed {
            slot.1 = Some(file.path);
        } else {
            slot.0 = Some(file.path);
        }
    }

    let mut chain = SegmentChain::default();
    let mut expected = None;
    for (sequence, (bare, gz)) in by_sequence {
        if expected.map_or(false, |e| e != sequence) {
            chain.gap = true;
            break;
        }

        // The compressed sibling is probed even if unlisted: compression may
        // have replaced the bare file since the directory was read.
        let gz = gz.unwrap_or_else(|| dir.join(compressed_file_name(sequence)));
        let candidates = bare.into_iter().map(|p| (p, false)).chain(std::iter::once((gz, true)));
        let mut resolved = None;
        for (path, compressed) in candidates {
            if let Some(header) = read_segment_header(&path) {
                if header.sequence == sequence {
                    let first_id = header.first_id;
                    resolved = Some(SegmentEntry { path, sequence, first_id, compressed });
                    break;
                }
            }
        }

        match resolved {
            Some(entry) => chain.segments.push(entry),
            None => {
                tracing::warn!(dir = %dir.display(), sequence, "unreadable WAL segment header");
                chain.gap = true;
                break;
            }
        }
        expected = Some(sequence + 1);
    }
    Ok(chain)
}

/// Remove every segment file, including compression leftovers. Returns the count removed.
pub fn delete_all_segment_files(dir: &Path) -> WalResult<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(WalError::io_at(dir, "Failed to read WAL directory")(e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(WalError::io_at(dir, "Failed to read directory entry"))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let is_segment = parse_segment_file_name(name).is_some()
            || name.strip_suffix(".tmp").map_or(false, |n| parse_segment_file_name(n).is_some());
        if is_segment {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(WalError::io_at(&path, "Failed to delete segment")(e)),
            }
        }
    }
    Ok(removed)
}

/// Why a segment stopped yielding records before its clean end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentFault {
    /// Structural frame fault at a byte offset of the decompressed stream
    Frame { offset: u64, reason: CorruptReason },
    /// Summary CRC32 disagrees with the bytes preceding it
    SummaryMismatch { expected: u32, actual: u32 },
    /// Neither the file nor its compressed sibling could be opened
    Unopenable(ErrorKind),
}

/// One step of a segment cursor
#[derive(Debug)]
pub enum SegmentStep {
    Record(WalRecord),
    /// Clean end of segment; carries the verified summary if one was present
    End(Option<SegmentSummary>),
    Stop(SegmentFault),
}

/// Sequential record decoder for a single segment.
///
/// Keeps a running CRC32 over every frame before the summary so the summary
/// can be checked once it is reached.
pub struct SegmentCursor {
    frames: Option<FrameReader<Box<dyn Read + Send>>>,
    open_error: Option<ErrorKind>,
    crc: crc32fast::Hasher,
    summary: Option<SegmentSummary>,
    compressed: bool,
}

impl SegmentCursor {
    /// Open a segment. If a bare file vanished because compression finished
    /// in the meantime, its `.gz` sibling is read instead.
    pub fn open(entry: &SegmentEntry) -> Self {
        let mut compressed = entry.compressed;
        let mut opened = open_segment_stream(&entry.path, compressed);

        if let Err(e) = &opened {
            if e.kind() == ErrorKind::NotFound && !compressed {
                let sibling = entry.path.with_file_name(compressed_file_name(entry.sequence));
                compressed = true;
                opened = open_segment_stream(&sibling, true);
            }
        }

        let (frames, open_error) = match opened {
            Ok(stream) => (Some(FrameReader::new(stream)), None),
            Err(e) => (None, Some(e.kind())),
        };
        Self { frames, open_error, crc: crc32fast::Hasher::new(), summary: None, compressed }
    }

    /// Whether the data actually being read is the compressed form
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Advance to the next mint record.
    ///
    /// Returns `Err` only for an unknown value kind.
    pub fn next_step(&mut self) -> WalResult<SegmentStep> {
        let Some(frames) = self.frames.as_mut() else {
            let kind = self.open_error.unwrap_or(ErrorKind::NotFound);
            return Ok(SegmentStep::Stop(SegmentFault::Unopenable(kind)));
        };

        loop {
            match frames.next_frame()? {
                FrameRead::Frame(Frame::Header(_)) => {
                    self.crc.update(frames.raw_frame());
                }
                FrameRead::Frame(Frame::Mint(record)) => {
                    self.crc.update(frames.raw_frame());
                    return Ok(SegmentStep::Record(record));
                }
                FrameRead::Frame(Frame::Summary(summary)) => {
                    let actual = self.crc.clone().finalize();
                    if actual != summary.crc32 {
                        return Ok(SegmentStep::Stop(SegmentFault::SummaryMismatch {
                            expected: summary.crc32,
                            actual,
                        }));
                    }
                    self.summary = Some(summary);
                }
                FrameRead::End => return Ok(SegmentStep::End(self.summary)),
                FrameRead::Corrupt { offset, reason } => {
                    return Ok(SegmentStep::Stop(SegmentFault::Frame { offset, reason }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_frame, value_hash, ValueKind};
    use tempfile::TempDir;

    fn mint(lsn: u64, id: u32) -> Frame {
        let lexical = format!("v{}", id);
        Frame::Mint(WalRecord {
            lsn,
            id,
            kind: ValueKind::Literal,
            hash: value_hash(ValueKind::Literal, &lexical, "", ""),
            lexical,
            datatype: String::new(),
            language: String::new(),
        })
    }

    /// Segment bytes with a header, `ids` as mints and optionally a correct summary.
    fn segment_bytes(sequence: u64, ids: &[u32], with_summary: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        let first_id = ids.first().copied().unwrap_or(0);
        encode_frame(&Frame::Header(SegmentHeader::new("store", sequence, first_id)), &mut buf)
            .unwrap();
        for (i, id) in ids.iter().enumerate() {
            encode_frame(&mint(i as u64 + 1, *id), &mut buf).unwrap();
        }
        if with_summary {
            let crc32 = crc32fast::hash(&buf);
            let last_id = ids.last().copied().unwrap_or(0);
            encode_frame(&Frame::Summary(SegmentSummary { last_id, crc32 }), &mut buf).unwrap();
        }
        buf
    }

    fn drain(cursor: &mut SegmentCursor) -> (Vec<u32>, SegmentStep) {
        let mut ids = Vec::new();
        loop {
            match cursor.next_step().unwrap() {
                SegmentStep::Record(r) => ids.push(r.id),
                other => return (ids, other),
            }
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(bare_file_name(3), "wal-00000003.v1");
        assert_eq!(compressed_file_name(12), "wal-00000012.v1.gz");
        assert_eq!(parse_segment_file_name("wal-00000003.v1"), Some((3, false)));
        assert_eq!(parse_segment_file_name("wal-00000012.v1.gz"), Some((12, true)));
        assert_eq!(parse_segment_file_name("wal-00000012.v1.gz.tmp"), None);
        assert_eq!(parse_segment_file_name("wal-.v1"), None);
        assert_eq!(parse_segment_file_name("store.uuid"), None);
        assert_eq!(parse_segment_file_name("wal-1a.v1"), None);
    }

    #[test]
    fn test_read_segment_sequence_tolerant() {
        let dir = TempDir::new().unwrap();

        let good = dir.path().join(bare_file_name(4));
        fs::write(&good, segment_bytes(4, &[1], false)).unwrap();
        assert_eq!(read_segment_sequence(&good), 4);

        let empty = dir.path().join(bare_file_name(5));
        fs::write(&empty, b"").unwrap();
        assert_eq!(read_segment_sequence(&empty), 0);

        let truncated = dir.path().join(bare_file_name(6));
        fs::write(&truncated, &segment_bytes(6, &[], false)[..7]).unwrap();
        assert_eq!(read_segment_sequence(&truncated), 0);

        let garbage = dir.path().join(bare_file_name(7));
        fs::write(&garbage, b"not a wal segment at all").unwrap();
        assert_eq!(read_segment_sequence(&garbage), 0);

        assert_eq!(read_segment_sequence(&dir.path().join("missing.v1")), 0);
    }

    #[test]
    fn test_chain_stops_at_gap() {
        let dir = TempDir::new().unwrap();
        for seq in [1u64, 2, 4] {
            let bytes = segment_bytes(seq, &[seq as u32], true);
            fs::write(dir.path().join(bare_file_name(seq)), bytes).unwrap();
        }
        fs::write(dir.path().join("store.uuid"), "store").unwrap();

        let chain = resolve_chain(dir.path()).unwrap();
        assert!(chain.gap);
        assert_eq!(chain.segments.iter().map(|s| s.sequence).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_chain_mislabeled_header_is_gap() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(bare_file_name(1)), segment_bytes(1, &[1], true)).unwrap();
        fs::write(dir.path().join(bare_file_name(2)), segment_bytes(9, &[2], true)).unwrap();

        let chain = resolve_chain(dir.path()).unwrap();
        assert!(chain.gap);
        assert_eq!(chain.segments.len(), 1);
    }

    #[test]
    fn test_chain_prefers_bare_over_inflight_gz() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(bare_file_name(1)), segment_bytes(1, &[1], true)).unwrap();
        fs::write(dir.path().join(compressed_file_name(1)), b"partial gzip").unwrap();

        let chain = resolve_chain(dir.path()).unwrap();
        assert!(!chain.gap);
        assert_eq!(chain.segments.len(), 1);
        assert!(!chain.segments[0].compressed);
        assert_eq!(chain.segments[0].first_id, 1);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let chain = resolve_chain(&dir.path().join("nope")).unwrap();
        assert!(chain.segments.is_empty());
        assert!(!chain.gap);
        assert_eq!(max_observed_sequence(&dir.path().join("nope")).unwrap(), 0);
    }

    #[test]
    fn test_cursor_verifies_summary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(bare_file_name(1));
        fs::write(&path, segment_bytes(1, &[10, 11, 12], true)).unwrap();

        let entry = resolve_chain(dir.path()).unwrap().segments.remove(0);
        let (ids, end) = drain(&mut SegmentCursor::open(&entry));
        assert_eq!(ids, vec![10, 11, 12]);
        assert!(matches!(end, SegmentStep::End(Some(SegmentSummary { last_id: 12, .. }))));
    }

    #[test]
    fn test_cursor_rejects_wrong_summary() {
        let dir = TempDir::new().unwrap();
        let mut bytes = segment_bytes(1, &[10, 11], false);
        let forged = SegmentSummary { last_id: 11, crc32: 1 };
        encode_frame(&Frame::Summary(forged), &mut bytes).unwrap();
        fs::write(dir.path().join(bare_file_name(1)), bytes).unwrap();

        let entry = resolve_chain(dir.path()).unwrap().segments.remove(0);
        let (ids, end) = drain(&mut SegmentCursor::open(&entry));
        assert_eq!(ids, vec![10, 11]);
        assert!(matches!(
            end,
            SegmentStep::Stop(SegmentFault::SummaryMismatch { expected: 1, .. })
        ));
    }

    #[test]
    fn test_cursor_falls_back_to_gz() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let bytes = segment_bytes(1, &[5, 6], true);
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&bytes).unwrap();
        fs::write(dir.path().join(compressed_file_name(1)), encoder.finish().unwrap()).unwrap();

        // Entry still pointing at the bare file that compression already removed.
        let entry = SegmentEntry {
            path: dir.path().join(bare_file_name(1)),
            sequence: 1,
            first_id: 5,
            compressed: false,
        };
        let mut cursor = SegmentCursor::open(&entry);
        let (ids, end) = drain(&mut cursor);
        assert!(cursor.is_compressed());
        assert_eq!(ids, vec![5, 6]);
        assert!(matches!(end, SegmentStep::End(Some(_))));
    }

    #[test]
    fn test_delete_all_segment_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(bare_file_name(1)), b"a").unwrap();
        fs::write(dir.path().join(compressed_file_name(2)), b"b").unwrap();
        fs::write(dir.path().join(format!("{}.tmp", compressed_file_name(3))), b"c").unwrap();
        fs::write(dir.path().join("store.uuid"), b"id").unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"").unwrap();

        assert_eq!(delete_all_segment_files(dir.path()).unwrap(), 3);
        assert!(dir.path().join("store.uuid").exists());
        assert!(dir.path().join(LOCK_FILE).exists());
        assert!(list_segment_files(dir.path()).unwrap().is_empty());
    }
}
