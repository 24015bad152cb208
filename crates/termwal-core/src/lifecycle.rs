//! Segment lifecycle: OPEN → SEALED → COMPRESSED
//!
//! Each state is its own type and each transition consumes the previous one,
//! so a segment can never be written after sealing or compressed twice.
//!
//! - `ActiveSegment::seal` appends the summary frame, forces the file, and only
//!   then closes it.
//! - `SealedSegment::compress` uses the atomic rename pattern:
//!   1. Stream the bare file into `wal-<seq>.v1.gz.tmp`
//!   2. durable_sync the temp file
//!   3. Decompress it to EOF and check length and CRC32 against the bare file
//!   4. Rename the temp file to `wal-<seq>.v1.gz` and sync the directory
//!   5. Delete the bare file and sync the directory
//!
//! If the process crashes at any point:
//! - Before step 4: the bare file is intact, the temp file is orphaned (ignored by readers)
//! - Between steps 4 and 5: both forms exist; readers prefer the bare file

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{WalError, WalResult};
use crate::format::{encode_frame, Frame, SegmentHeader, SegmentSummary};
use crate::platform_durability::{durable_sync, sync_dir};
use crate::segment::{bare_file_name, compressed_file_name};

const COPY_CHUNK: usize = 64 * 1024;

/// The segment currently receiving frames. Owned by the writer thread only.
pub struct ActiveSegment {
    file: File,
    path: PathBuf,
    dir: PathBuf,
    sequence: u64,
    /// Bytes written to the file so far
    len: u64,
    /// CRC32 over every byte written so far (the future summary checksum)
    crc: crc32fast::Hasher,
    last_id: u32,
    mints: u64,
    /// Whether bytes were written since the last force
    unforced: bool,
    forces: u64,
}

impl ActiveSegment {
    /// Create `wal-<sequence>.v1` and write its header frame.
    pub fn create(dir: &Path, sequence: u64, store_uuid: &str, first_id: u32) -> WalResult<Self> {
        let path = dir.join(bare_file_name(sequence));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(WalError::io_at(&path, "Failed to create WAL segment"))?;

        let mut segment = Self {
            file,
            path,
            dir: dir.to_path_buf(),
            sequence,
            len: 0,
            crc: crc32fast::Hasher::new(),
            last_id: 0,
            mints: 0,
            unforced: false,
            forces: 0,
        };

        let mut header = Vec::new();
        let frame = Frame::Header(SegmentHeader::new(store_uuid, sequence, first_id));
        encode_frame(&frame, &mut header)?;
        segment.write(&header)?;
        sync_dir(dir)?;
        Ok(segment)
    }

    /// Append already-encoded frames.
    pub fn write(&mut self, bytes: &[u8]) -> WalResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(bytes)
            .map_err(WalError::io_at(&self.path, "WAL write failed"))?;
        self.crc.update(bytes);
        self.len += bytes.len() as u64;
        self.unforced = true;
        Ok(())
    }

    /// Note that a mint for `id` has been placed in this segment (possibly still buffered).
    ///
    /// Producers log concurrently, so ids can arrive out of order; the summary
    /// keeps the highest one.
    pub fn record_mint(&mut self, id: u32) {
        self.last_id = self.last_id.max(id);
        self.mints += 1;
    }

    /// Force written bytes to stable storage. Does nothing when there is nothing unforced.
    ///
    /// Returns whether a sync was issued.
    pub fn force(&mut self) -> WalResult<bool> {
        if !self.unforced {
            return Ok(false);
        }
        durable_sync(&self.file).map_err(WalError::io_at(&self.path, "WAL durable_sync failed"))?;
        self.unforced = false;
        self.forces += 1;
        Ok(true)
    }

    /// Append the summary frame, force, and close.
    pub fn seal(mut self) -> WalResult<SealedSegment> {
        let summary = SegmentSummary { last_id: self.last_id, crc32: self.crc.clone().finalize() };
        let mut frame = Vec::new();
        encode_frame(&Frame::Summary(summary), &mut frame)?;
        self.file
            .write_all(&frame)
            .map_err(WalError::io_at(&self.path, "Failed to write segment summary"))?;
        self.len += frame.len() as u64;
        self.unforced = true;

        // CRITICAL: force before the handle is dropped; a sealed segment must be fully durable.
        self.force()?;

        let ActiveSegment { file, path, dir, sequence, len, forces, mints, .. } = self;
        drop(file);

        Ok(SealedSegment {
            path,
            dir,
            sequence,
            bytes: len,
            summary,
            mints,
            forces_before_close: forces,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes written to the file (excluding anything the caller still buffers)
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether any mint has been placed in this segment
    pub fn has_mints(&self) -> bool {
        self.mints > 0
    }
}

/// A closed, fully forced bare segment waiting for compression
#[derive(Debug)]
pub struct SealedSegment {
    path: PathBuf,
    dir: PathBuf,
    sequence: u64,
    bytes: u64,
    summary: SegmentSummary,
    mints: u64,
    forces_before_close: u64,
}

impl SealedSegment {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Total file size, summary included
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn summary(&self) -> SegmentSummary {
        self.summary
    }

    pub fn mints(&self) -> u64 {
        self.mints
    }

    /// Number of syncs issued on the file before it was closed
    pub fn forces_before_close(&self) -> u64 {
        self.forces_before_close
    }

    /// gzip the segment and replace the bare file with it.
    ///
    /// On failure the temp file is removed and the bare file stays in place.
    pub fn compress(self) -> WalResult<CompressedSegment> {
        let gz_path = self.dir.join(compressed_file_name(self.sequence));
        let tmp_path = self.dir.join(format!("{}.tmp", compressed_file_name(self.sequence)));

        let result = self
            .write_compressed(&tmp_path)
            .and_then(|(len, crc)| {
                if len != self.bytes {
                    let reason = format!("bare file is {} bytes, expected {}", len, self.bytes);
                    return Err(self.failure(reason));
                }
                verify_compressed(&tmp_path, len, crc).map_err(|reason| self.failure(reason))
            });
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, &gz_path)
            .map_err(WalError::io_at(&gz_path, "Failed to install compressed segment"))?;
        sync_dir(&self.dir)?;

        // Step 5: the .gz is verified and durable; only now may the bare file go.
        fs::remove_file(&self.path)
            .map_err(WalError::io_at(&self.path, "Failed to delete bare segment"))?;
        sync_dir(&self.dir)?;

        let compressed_bytes = fs::metadata(&gz_path).map(|m| m.len()).unwrap_or(0);
        Ok(CompressedSegment {
            path: gz_path,
            sequence: self.sequence,
            original_bytes: self.bytes,
            compressed_bytes,
        })
    }

    /// Stream the bare file through gzip; returns (bytes read, CRC32 of bytes read).
    fn write_compressed(&self, tmp_path: &Path) -> WalResult<(u64, u32)> {
        let mut source = BufReader::new(
            File::open(&self.path)
                .map_err(WalError::io_at(&self.path, "Failed to open sealed segment"))?,
        );
        let out = File::create(tmp_path)
            .map_err(WalError::io_at(tmp_path, "Failed to create compressed segment"))?;
        let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());

        let mut hasher = crc32fast::Hasher::new();
        let mut total = 0u64;
        let mut chunk = vec![0u8; COPY_CHUNK];
        loop {
            let n = source
                .read(&mut chunk)
                .map_err(WalError::io_at(&self.path, "Failed to read sealed segment"))?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            encoder
                .write_all(&chunk[..n])
                .map_err(WalError::io_at(tmp_path, "Failed to write compressed segment"))?;
            total += n as u64;
        }

        let writer = encoder
            .finish()
            .map_err(WalError::io_at(tmp_path, "Failed to finish gzip stream"))?;
        let file = writer
            .into_inner()
            .map_err(|e| {
                WalError::io_at(tmp_path, "Failed to flush compressed segment")(e.into_error())
            })?;
        durable_sync(&file)
            .map_err(WalError::io_at(tmp_path, "Failed to sync compressed segment"))?;

        Ok((total, hasher.finalize()))
    }

    fn failure(&self, reason: String) -> WalError {
        WalError::CompressionFailed { path: self.path.clone(), reason }
    }
}

/// Decompress `path` to EOF and confirm it reproduces `len` bytes with CRC32 `crc`.
fn verify_compressed(path: &Path, len: u64, crc: u32) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("cannot reopen compressed segment: {}", e))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));

    let mut hasher = crc32fast::Hasher::new();
    let mut total = 0u64;
    let mut chunk = vec![0u8; COPY_CHUNK];
    loop {
        let n = decoder
            .read(&mut chunk)
            .map_err(|e| format!("compressed segment does not decode: {}", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        total += n as u64;
    }

    if total == 0 {
        return Err("compressed segment decodes to nothing".into());
    }
    if total != len {
        return Err(format!("compressed segment decodes to {} bytes, expected {}", total, len));
    }
    let actual = hasher.finalize();
    if actual != crc {
        return Err(format!("compressed segment CRC32 0x{:08x}, expected 0x{:08x}", actual, crc));
    }
    Ok(())
}

/// Final state: only the `.gz` remains
#[derive(Debug, Clone)]
pub struct CompressedSegment {
    pub path: PathBuf,
    pub sequence: u64,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

impl CompressedSegment {
    /// Compressed size relative to the bare size (0.0 to 1.0 for compressible data)
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        self.compressed_bytes as f64 / self.original_bytes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{value_hash, ValueKind, WalRecord};
    use crate::segment::{resolve_chain, SegmentCursor, SegmentStep};
    use tempfile::TempDir;

    fn write_mints(segment: &mut ActiveSegment, ids: std::ops::RangeInclusive<u32>) {
        for id in ids {
            let lexical = format!("literal-{}", id);
            let record = WalRecord {
                lsn: id as u64,
                id,
                kind: ValueKind::Literal,
                hash: value_hash(ValueKind::Literal, &lexical, "", "en"),
                lexical,
                datatype: String::new(),
                language: "en".into(),
            };
            let mut buf = Vec::new();
            encode_frame(&Frame::Mint(record), &mut buf).unwrap();
            segment.write(&buf).unwrap();
            segment.record_mint(id);
        }
    }

    fn read_ids(dir: &Path) -> Vec<u32> {
        let chain = resolve_chain(dir).unwrap();
        let mut ids = Vec::new();
        for entry in &chain.segments {
            let mut cursor = SegmentCursor::open(entry);
            while let SegmentStep::Record(r) = cursor.next_step().unwrap() {
                ids.push(r.id);
            }
        }
        ids
    }

    #[test]
    fn test_force_only_with_pending_writes() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 1, "store", 0).unwrap();

        assert!(segment.force().unwrap(), "header write must be pending");
        assert!(!segment.force().unwrap(), "nothing pending after a force");

        write_mints(&mut segment, 1..=3);
        assert!(segment.force().unwrap());
        assert!(!segment.force().unwrap());
    }

    #[test]
    fn test_create_refuses_existing_segment() {
        let dir = TempDir::new().unwrap();
        let _first = ActiveSegment::create(dir.path(), 1, "store", 0).unwrap();
        assert!(ActiveSegment::create(dir.path(), 1, "store", 0).is_err());
    }

    #[test]
    fn test_seal_forces_before_close() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 1, "store", 1).unwrap();
        write_mints(&mut segment, 1..=5);
        segment.force().unwrap();

        let sealed = segment.seal().unwrap();
        // One force for the mints, one for the summary written by seal.
        assert_eq!(sealed.forces_before_close(), 2);
        assert_eq!(sealed.summary().last_id, 5);
        assert_eq!(sealed.mints(), 5);
        assert_eq!(fs::metadata(sealed.path()).unwrap().len(), sealed.bytes());
    }

    #[test]
    fn test_summary_keeps_highest_id() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 1, "store", 7).unwrap();
        for id in [7, 9, 8] {
            segment.record_mint(id);
        }
        let sealed = segment.seal().unwrap();
        assert_eq!(sealed.summary().last_id, 9);
        assert_eq!(sealed.mints(), 3);
    }

    #[test]
    fn test_compress_replaces_bare_file() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 1, "store", 1).unwrap();
        write_mints(&mut segment, 1..=50);
        let sealed = segment.seal().unwrap();
        let bare_path = sealed.path().to_path_buf();
        let bare_bytes = fs::read(&bare_path).unwrap();

        let compressed = sealed.compress().unwrap();
        assert!(!bare_path.exists());
        assert!(compressed.path.exists());
        assert!(compressed.ratio() < 1.0);

        let mut decoded = Vec::new();
        GzDecoder::new(File::open(&compressed.path).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, bare_bytes);
        assert_eq!(read_ids(dir.path()), (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn test_failed_verification_keeps_bare_file() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 1, "store", 1).unwrap();
        write_mints(&mut segment, 1..=10);
        let sealed = segment.seal().unwrap();
        let bare_path = sealed.path().to_path_buf();

        // The file on disk no longer matches what the writer sealed.
        let file = OpenOptions::new().write(true).open(&bare_path).unwrap();
        file.set_len(sealed.bytes() / 2).unwrap();
        drop(file);

        let err = sealed.compress().unwrap_err();
        assert!(matches!(err, WalError::CompressionFailed { .. }));
        assert!(bare_path.exists());
        assert!(!dir.path().join(compressed_file_name(1)).exists());
        assert!(!dir.path().join(format!("{}.tmp", compressed_file_name(1))).exists());
    }
}
