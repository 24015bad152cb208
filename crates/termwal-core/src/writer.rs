//! LogWriter: the single thread that owns segment I/O
//!
//! Producers never touch a segment file. They enqueue records; this thread
//! drains the queue in FIFO (= LSN) order, batches frames into a growable
//! buffer, writes them to the active segment, forces according to the sync
//! policy, and rotates when the segment is full.
//!
//! Rotation is synchronous on this thread:
//! 1. Write out the batch buffer
//! 2. Seal: append the summary frame, force, close
//! 3. Open the next segment with a fresh header
//! 4. Hand the sealed segment to a background compression thread
//!
//! Durability progress is published through `WalShared` atomics and a
//! condition variable that `await_durable` and `purge_all_segments` wait on.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{SyncPolicy, WalConfig};
use crate::error::{WalError, WalResult};
use crate::format::{encode_mint, Lsn, WalRecord, NO_LSN};
use crate::lifecycle::{ActiveSegment, SealedSegment};
use crate::platform_durability::sync_dir;
use crate::queue::BoundedQueue;
use crate::segment::delete_all_segment_files;

/// Upper bound on records taken from the queue per loop iteration
const MAX_BATCH_RECORDS: usize = 1024;

/// Waiters re-check state at least this often even without a notification
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// A record in flight, tagged with the purge epoch it was assigned under
pub(crate) struct QueuedMint {
    pub(crate) epoch: u64,
    pub(crate) record: WalRecord,
}

/// Writer counters, readable at any time
#[derive(Debug, Default)]
pub struct WalStats {
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    forces: AtomicU64,
    rotations: AtomicU64,
    segments_compressed: AtomicU64,
    compression_failures: AtomicU64,
}

impl WalStats {
    /// Mint records appended to segments
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Encoded mint bytes appended to segments
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Syncs issued on segment files
    pub fn forces(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    pub fn segments_compressed(&self) -> u64 {
        self.segments_compressed.load(Ordering::Relaxed)
    }

    pub fn compression_failures(&self) -> u64 {
        self.compression_failures.load(Ordering::Relaxed)
    }
}

/// State shared between the facade, producers, waiters and the writer thread
pub(crate) struct WalShared {
    pub(crate) config: WalConfig,
    pub(crate) queue: BoundedQueue<QueuedMint>,
    /// Held across LSN assignment and enqueue so queue order is LSN order
    pub(crate) enqueue_lock: Mutex<()>,
    /// Purge epoch producers assign under
    pub(crate) epoch: AtomicU64,
    /// Purge epoch the writer has completed
    pub(crate) writer_epoch: AtomicU64,
    pub(crate) last_assigned: AtomicU64,
    pub(crate) last_appended: AtomicU64,
    pub(crate) last_forced: AtomicU64,
    /// Highest LSN a caller is blocked on
    pub(crate) requested_force: AtomicU64,
    pub(crate) running: AtomicBool,
    pub(crate) writer_done: AtomicBool,
    failure: Mutex<Option<WalError>>,
    progress_lock: Mutex<()>,
    progress: Condvar,
    pub(crate) stats: WalStats,
}

impl WalShared {
    pub(crate) fn new(config: WalConfig, start_lsn: Lsn) -> Self {
        let queue = BoundedQueue::new(config.queue_capacity);
        Self {
            config,
            queue,
            enqueue_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            writer_epoch: AtomicU64::new(0),
            last_assigned: AtomicU64::new(start_lsn),
            last_appended: AtomicU64::new(start_lsn),
            last_forced: AtomicU64::new(start_lsn),
            requested_force: AtomicU64::new(NO_LSN),
            running: AtomicBool::new(true),
            writer_done: AtomicBool::new(false),
            failure: Mutex::new(None),
            progress_lock: Mutex::new(()),
            progress: Condvar::new(),
            stats: WalStats::default(),
        }
    }

    pub(crate) fn failure(&self) -> Option<WalError> {
        self.failure.lock().clone()
    }

    pub(crate) fn record_failure(&self, err: WalError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(WalError::WriterFailed { message: err.to_string() });
        }
    }

    /// Wake everything blocked in `wait_while`.
    pub(crate) fn notify_progress(&self) {
        let _guard = self.progress_lock.lock();
        self.progress.notify_all();
    }

    /// Block while `blocked` returns true. The predicate is evaluated under the
    /// progress lock, so a notification between check and wait is never lost.
    pub(crate) fn wait_while(&self, mut blocked: impl FnMut() -> bool) {
        let mut guard = self.progress_lock.lock();
        while blocked() {
            self.progress.wait_for(&mut guard, WAIT_SLICE);
        }
    }
}

/// Start the writer thread on an already-created active segment.
pub(crate) fn spawn(
    shared: Arc<WalShared>,
    segment: ActiveSegment,
    next_sequence: u64,
) -> WalResult<JoinHandle<()>> {
    let writer = LogWriter {
        dir: shared.config.wal_directory.clone(),
        buffer: Vec::with_capacity(shared.config.batch_buffer_bytes),
        shared,
        segment: Some(segment),
        next_sequence,
        epoch: 0,
        scratch: Vec::new(),
        batch: Vec::new(),
        compressions: Vec::new(),
        last_sync: Instant::now(),
    };

    thread::Builder::new()
        .name("termwal-writer".to_string())
        .spawn(move || writer.run())
        .map_err(|e| WalError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn WAL writer thread: {}", e),
        })
}

struct LogWriter {
    shared: Arc<WalShared>,
    dir: PathBuf,
    segment: Option<ActiveSegment>,
    next_sequence: u64,
    epoch: u64,
    /// Encoded frames not yet written to the segment file
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    batch: Vec<QueuedMint>,
    compressions: Vec<JoinHandle<()>>,
    last_sync: Instant,
}

impl LogWriter {
    fn run(mut self) {
        let result = self.run_loop().and_then(|()| self.flush_and_force());
        if let Err(err) = result {
            tracing::error!(error = %err, dir = %self.dir.display(), "WAL writer failed");
            self.shared.record_failure(err);
            self.shared.queue.close();
        }

        self.join_compressions();
        self.segment = None;
        self.shared.writer_done.store(true, Ordering::Release);
        self.shared.notify_progress();
    }

    fn run_loop(&mut self) -> WalResult<()> {
        let idle_poll = self.shared.config.idle_poll_interval;
        loop {
            self.sync_epoch()?;
            if !self.shared.running.load(Ordering::Acquire) && self.shared.queue.is_empty() {
                return Ok(());
            }

            let mut batch = std::mem::take(&mut self.batch);
            let taken = self.shared.queue.drain_into(&mut batch, MAX_BATCH_RECORDS, idle_poll);
            for queued in batch.drain(..) {
                if queued.epoch > self.epoch {
                    self.sync_epoch()?;
                }
                if queued.epoch != self.epoch {
                    continue;
                }
                self.append(&queued.record)?;
            }
            self.batch = batch;

            if taken == 0 {
                self.flush_buffer()?;
            }
            self.apply_sync_policy(taken > 0)?;
            self.reap_compressions();
        }
    }

    fn apply_sync_policy(&mut self, appended: bool) -> WalResult<()> {
        let last_forced = self.shared.last_forced.load(Ordering::Acquire);
        let last_appended = self.shared.last_appended.load(Ordering::Acquire);
        let requested = self.shared.requested_force.load(Ordering::Acquire);
        let waiter_ready = requested > last_forced && requested <= last_appended;

        let due = match self.shared.config.sync_policy {
            SyncPolicy::Always => appended,
            SyncPolicy::Commit => false,
            SyncPolicy::Interval => self.last_sync.elapsed() >= self.shared.config.sync_interval,
        };

        if due || waiter_ready {
            self.flush_and_force()?;
        }
        Ok(())
    }

    fn append(&mut self, record: &WalRecord) -> WalResult<()> {
        self.scratch.clear();
        let framed = encode_mint(record, &mut self.scratch)? as u64;

        let rotate = match self.segment.as_ref() {
            Some(segment) => {
                segment.has_mints()
                    && segment.len() + self.buffer.len() as u64 + framed
                        > self.shared.config.max_segment_bytes
            }
            None => return Err(no_active_segment()),
        };
        if rotate {
            self.rotate(record.id)?;
        }

        self.buffer.extend_from_slice(&self.scratch);
        if let Some(segment) = self.segment.as_mut() {
            segment.record_mint(record.id);
        }
        self.shared.last_appended.store(record.lsn, Ordering::Release);
        self.shared.stats.records_written.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.bytes_written.fetch_add(framed, Ordering::Relaxed);

        if self.buffer.len() >= self.shared.config.batch_buffer_bytes {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Write buffered frames to the segment file (no force).
    fn flush_buffer(&mut self) -> WalResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let segment = self.segment.as_mut().ok_or_else(no_active_segment)?;
        segment.write(&self.buffer)?;
        self.buffer.clear();

        let nominal = self.shared.config.batch_buffer_bytes;
        if self.buffer.capacity() > nominal * 4 {
            self.buffer.shrink_to(nominal);
        }
        Ok(())
    }

    /// Write out the buffer and force, if anything was appended since the last force.
    fn flush_and_force(&mut self) -> WalResult<()> {
        self.last_sync = Instant::now();
        let appended = self.shared.last_appended.load(Ordering::Acquire);
        if appended <= self.shared.last_forced.load(Ordering::Acquire) && self.buffer.is_empty() {
            return Ok(());
        }

        self.flush_buffer()?;
        if let Some(segment) = self.segment.as_mut() {
            if segment.force()? {
                self.shared.stats.forces.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.publish_forced(appended);
        Ok(())
    }

    fn publish_forced(&self, lsn: Lsn) {
        self.shared.last_forced.fetch_max(lsn, Ordering::AcqRel);
        self.shared.notify_progress();
    }

    fn rotate(&mut self, next_first_id: u32) -> WalResult<()> {
        self.flush_buffer()?;
        let appended = self.shared.last_appended.load(Ordering::Acquire);

        let segment = self.segment.take().ok_or_else(no_active_segment)?;
        let sealed = segment.seal()?;
        self.shared.stats.forces.fetch_add(1, Ordering::Relaxed);
        self.publish_forced(appended);
        tracing::debug!(
            sequence = sealed.sequence(),
            bytes = sealed.bytes(),
            last_id = sealed.summary().last_id,
            "sealed WAL segment"
        );

        self.open_next(next_first_id)?;
        self.spawn_compression(sealed);
        self.shared.stats.rotations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn open_next(&mut self, first_id: u32) -> WalResult<()> {
        let sequence = self.next_sequence;
        let store_uuid = &self.shared.config.store_uuid;
        let segment = ActiveSegment::create(&self.dir, sequence, store_uuid, first_id)?;
        self.segment = Some(segment);
        self.next_sequence += 1;
        Ok(())
    }

    fn spawn_compression(&mut self, sealed: SealedSegment) {
        let shared = Arc::clone(&self.shared);
        let sequence = sealed.sequence();
        let spawned = thread::Builder::new()
            .name(format!("termwal-compress-{}", sequence))
            .spawn(move || compress_sealed(&shared, sealed));
        match spawned {
            Ok(handle) => self.compressions.push(handle),
            Err(e) => {
                tracing::warn!(
                    sequence,
                    error = %e,
                    "could not start compression; segment stays bare"
                )
            }
        }
    }

    fn reap_compressions(&mut self) {
        self.compressions.retain(|h| !h.is_finished());
    }

    fn join_compressions(&mut self) {
        for handle in self.compressions.drain(..) {
            let _ = handle.join();
        }
    }

    /// Carry out a purge if the facade has moved to a newer epoch.
    fn sync_epoch(&mut self) -> WalResult<()> {
        let current = self.shared.epoch.load(Ordering::Acquire);
        if current == self.epoch {
            return Ok(());
        }

        self.buffer.clear();
        self.segment = None;
        self.join_compressions();
        let removed = delete_all_segment_files(&self.dir)?;
        sync_dir(&self.dir)?;

        self.shared.last_appended.store(NO_LSN, Ordering::Release);
        self.shared.last_forced.store(NO_LSN, Ordering::Release);
        self.shared.requested_force.store(NO_LSN, Ordering::Release);
        self.next_sequence = 1;
        self.epoch = current;
        self.open_next(0)?;

        self.shared.writer_epoch.store(current, Ordering::Release);
        self.shared.notify_progress();
        tracing::info!(removed, dir = %self.dir.display(), "purged all WAL segments");
        Ok(())
    }
}

fn compress_sealed(shared: &WalShared, sealed: SealedSegment) {
    let sequence = sealed.sequence();
    match sealed.compress() {
        Ok(compressed) => {
            shared.stats.segments_compressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sequence, ratio = compressed.ratio(), "compressed WAL segment");
        }
        Err(e) => {
            shared.stats.compression_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                sequence,
                error = %e,
                "WAL segment compression failed; keeping bare segment"
            );
        }
    }
}

fn no_active_segment() -> WalError {
    WalError::WriterFailed { message: "no active segment".into() }
}
