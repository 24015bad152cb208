//! Value-store WAL facade
//!
//! The public entry point. `open` inspects the directory, picks the next
//! segment sequence and the starting LSN, creates a fresh segment and starts
//! the writer thread. Producers call `log_mint`, commit paths call
//! `await_durable`.
//!
//! Durability contract: `log_mint` returning an LSN means the record is
//! queued, NOT that it is on disk. Only `await_durable(lsn)` returning Ok
//! means every record up to `lsn` has been forced.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use fs2::FileExt;
use parking_lot::Mutex;

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::format::{value_hash, Lsn, ValueKind, WalRecord, NO_LSN};
use crate::lifecycle::ActiveSegment;
use crate::segment::{
    self, list_segment_files, SegmentCursor, SegmentEntry, SegmentFile, SegmentStep, LOCK_FILE,
};
use crate::writer::{self, QueuedMint, WalShared, WalStats};

/// A term to mint, without its LSN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintRequest {
    pub id: u32,
    pub kind: ValueKind,
    pub lexical: String,
    pub datatype: String,
    pub language: String,
}

impl MintRequest {
    pub fn new(id: u32, kind: ValueKind, lexical: impl Into<String>) -> Self {
        Self { id, kind, lexical: lexical.into(), datatype: String::new(), language: String::new() }
    }

    #[must_use]
    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = datatype.into();
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn hash(&self) -> i32 {
        value_hash(self.kind, &self.lexical, &self.datatype, &self.language)
    }
}

/// Crash-durable log of minted term ids
pub struct ValueStoreWal {
    shared: Arc<WalShared>,
    writer: Mutex<Option<JoinHandle<()>>>,
    lock_file: Mutex<Option<File>>,
    closed: AtomicBool,
    has_initial_segments: bool,
}

impl ValueStoreWal {
    /// Open (or create) the WAL in `config.wal_directory`.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        let dir = config.wal_directory.clone();
        fs::create_dir_all(&dir).map_err(WalError::io_at(&dir, "Failed to create WAL directory"))?;
        let lock_file = acquire_directory_lock(&dir)?;

        let files = list_segment_files(&dir)?;
        let has_initial_segments = !files.is_empty();
        let max_sequence = files
            .iter()
            .map(|f| f.name_sequence.max(segment::read_segment_sequence(&f.path)))
            .max()
            .unwrap_or(0);
        let start_lsn = newest_lsn(&files)?;

        let sequence = max_sequence + 1;
        let active = ActiveSegment::create(&dir, sequence, &config.store_uuid, 0)?;
        let shared = Arc::new(WalShared::new(config, start_lsn));
        let handle = writer::spawn(Arc::clone(&shared), active, sequence + 1)?;

        tracing::info!(
            dir = %dir.display(),
            existing_segments = files.len(),
            sequence,
            start_lsn,
            "opened value-store WAL"
        );

        Ok(Self {
            shared,
            writer: Mutex::new(Some(handle)),
            lock_file: Mutex::new(Some(lock_file)),
            closed: AtomicBool::new(false),
            has_initial_segments,
        })
    }

    /// Queue a mint record and return its LSN. Blocks while the queue is full.
    ///
    /// Returning does NOT imply durability; pair with `await_durable`.
    pub fn log_mint(
        &self,
        id: u32,
        kind: ValueKind,
        lexical: &str,
        datatype: Option<&str>,
        language: Option<&str>,
        hash: i32,
    ) -> WalResult<Lsn> {
        self.ensure_open()?;

        // Assignment and enqueue happen under one lock so queue order is LSN order.
        let _guard = self.shared.enqueue_lock.lock();
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        let lsn = self.shared.last_assigned.load(Ordering::Acquire) + 1;
        let record = WalRecord {
            lsn,
            id,
            kind,
            lexical: lexical.to_string(),
            datatype: datatype.unwrap_or_default().to_string(),
            language: language.unwrap_or_default().to_string(),
            hash,
        };

        if self.shared.queue.put(QueuedMint { epoch, record }).is_err() {
            return Err(self.shared.failure().unwrap_or(WalError::Closed));
        }
        self.shared.last_assigned.store(lsn, Ordering::Release);
        Ok(lsn)
    }

    /// `log_mint` for a prepared request, hashing it on the way.
    pub fn log_mint_request(&self, request: &MintRequest) -> WalResult<Lsn> {
        self.log_mint(
            request.id,
            request.kind,
            &request.lexical,
            Some(&request.datatype),
            Some(&request.language),
            request.hash(),
        )
    }

    /// Mint a batch of seed terms. Waits for durability when
    /// `sync_bootstrap_on_open` is set. Returns the last LSN (NO_LSN for an empty batch).
    pub fn log_bootstrap(&self, requests: &[MintRequest]) -> WalResult<Lsn> {
        let mut last = NO_LSN;
        for request in requests {
            last = self.log_mint_request(request)?;
        }
        if self.shared.config.sync_bootstrap_on_open {
            self.await_durable(last)?;
        }
        Ok(last)
    }

    /// Block until every record up to `lsn` has been forced.
    ///
    /// Returns immediately for `NO_LSN` and on a closed WAL. A purge while
    /// waiting voids the LSN and also returns.
    pub fn await_durable(&self, lsn: Lsn) -> WalResult<()> {
        if lsn == NO_LSN || self.is_closed() {
            return Ok(());
        }
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }

        let shared = &self.shared;
        let epoch = shared.epoch.load(Ordering::Acquire);
        let last_assigned = shared.last_assigned.load(Ordering::Acquire);
        if lsn > last_assigned {
            return Err(WalError::LsnNotAssigned { lsn, last_assigned });
        }

        shared.wait_while(|| {
            if shared.epoch.load(Ordering::Acquire) != epoch
                || shared.writer_done.load(Ordering::Acquire)
                || shared.failure().is_some()
            {
                return false;
            }
            let durable = shared.writer_epoch.load(Ordering::Acquire) == epoch
                && shared.last_forced.load(Ordering::Acquire) >= lsn;
            if !durable {
                // Re-asserted on every wake: a purge resets the request.
                shared.requested_force.fetch_max(lsn, Ordering::AcqRel);
            }
            !durable
        });

        match shared.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delete every segment and restart sequencing and LSNs from scratch.
    ///
    /// Producers blocked on a full queue are released. LSNs handed out
    /// before the purge are void.
    pub fn purge_all_segments(&self) -> WalResult<()> {
        self.ensure_open()?;
        let shared = &self.shared;

        // Release blocked producers first; one of them may hold the enqueue lock.
        shared.queue.clear();
        let epoch = {
            let _guard = shared.enqueue_lock.lock();
            shared.last_assigned.store(NO_LSN, Ordering::Release);
            shared.epoch.fetch_add(1, Ordering::AcqRel) + 1
        };
        shared.queue.clear();

        shared.wait_while(|| {
            shared.writer_epoch.load(Ordering::Acquire) < epoch
                && !shared.writer_done.load(Ordering::Acquire)
                && shared.failure().is_none()
        });

        if let Some(err) = shared.failure() {
            return Err(err);
        }
        if shared.writer_epoch.load(Ordering::Acquire) < epoch {
            return Err(WalError::Closed);
        }
        Ok(())
    }

    /// Drain queued records, force them, stop the writer and release the directory lock.
    ///
    /// Safe to call any number of times from any number of threads; later
    /// calls wait for the first to finish and then return Ok.
    pub fn close(&self) -> WalResult<()> {
        let mut writer = self.writer.lock();
        self.closed.store(true, Ordering::Release);
        let Some(handle) = writer.take() else {
            return Ok(());
        };

        self.shared.running.store(false, Ordering::Release);
        self.shared.queue.close();
        if handle.join().is_err() {
            self.shared.record_failure(WalError::WriterFailed {
                message: "writer thread panicked".into(),
            });
        }
        self.shared.notify_progress();

        if let Some(lock_file) = self.lock_file.lock().take() {
            let _ = lock_file.unlock();
        }

        let stats = &self.shared.stats;
        tracing::info!(
            dir = %self.shared.config.wal_directory.display(),
            records = stats.records_written(),
            rotations = stats.rotations(),
            last_forced_lsn = self.last_forced_lsn(),
            "closed value-store WAL"
        );

        match self.shared.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tolerant header probe; 0 for empty, truncated or foreign files.
    pub fn read_segment_sequence(path: &Path) -> u64 {
        segment::read_segment_sequence(path)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether segments existed before this instance opened the directory
    pub fn has_initial_segments(&self) -> bool {
        self.has_initial_segments
    }

    pub fn last_forced_lsn(&self) -> Lsn {
        self.shared.last_forced.load(Ordering::Acquire)
    }

    pub fn last_appended_lsn(&self) -> Lsn {
        self.shared.last_appended.load(Ordering::Acquire)
    }

    pub fn last_assigned_lsn(&self) -> Lsn {
        self.shared.last_assigned.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &WalStats {
        &self.shared.stats
    }

    pub fn config(&self) -> &WalConfig {
        &self.shared.config
    }

    pub fn store_uuid(&self) -> &str {
        &self.shared.config.store_uuid
    }

    fn ensure_open(&self) -> WalResult<()> {
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }
        if self.is_closed() {
            return Err(WalError::Closed);
        }
        Ok(())
    }
}

impl Drop for ValueStoreWal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn acquire_directory_lock(dir: &Path) -> WalResult<File> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(WalError::io_at(&path, "Failed to open WAL lock file"))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(WalError::DirectoryLocked { path: dir.to_path_buf() })
        }
        Err(e) => Err(WalError::io_at(&path, "Failed to lock WAL directory")(e)),
    }
}

/// Highest LSN in the newest segment that holds any mint record.
fn newest_lsn(files: &[SegmentFile]) -> WalResult<Lsn> {
    for file in files.iter().rev() {
        let entry = SegmentEntry {
            path: file.path.clone(),
            sequence: file.name_sequence,
            first_id: 0,
            compressed: file.compressed,
        };
        let mut cursor = SegmentCursor::open(&entry);
        let mut max_lsn = NO_LSN;
        while let SegmentStep::Record(record) = cursor.next_step()? {
            max_lsn = max_lsn.max(record.lsn);
        }
        if max_lsn != NO_LSN {
            return Ok(max_lsn);
        }
    }
    Ok(NO_LSN)
}
