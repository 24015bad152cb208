//! Configuration for the value-store WAL
//!
//! A `WalConfig` is only obtainable through `WalConfigBuilder::build`, which
//! validates every field eagerly and names the offending field on failure.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{WalError, WalResult};
use crate::platform_durability::{durable_sync, sync_dir};

/// Directory name under the store's data directory that holds the WAL.
pub const DEFAULT_DIRECTORY_NAME: &str = "wal";

/// File holding the store identity, stamped into every segment header.
pub const STORE_UUID_FILE: &str = "store.uuid";

/// Smallest accepted batch buffer. The limit itself is rejected.
pub const MIN_BATCH_BUFFER_BYTES: usize = 4 * 1024;

/// When the writer forces appended records to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Force after every batch.
    Always,
    /// Force only when a caller is awaiting a specific LSN.
    Commit,
    /// Force on a timer, plus always on rotation and shutdown.
    #[default]
    Interval,
}

/// Validated WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding segments, the lock file and `store.uuid`
    pub wal_directory: PathBuf,
    /// Store identity written into every segment header
    pub store_uuid: String,
    /// Durability policy for the writer thread
    pub sync_policy: SyncPolicy,
    /// Timer period for `SyncPolicy::Interval`
    pub sync_interval: Duration,
    /// How long the writer waits on an empty queue before re-checking state
    pub idle_poll_interval: Duration,
    /// Rotation threshold for a single segment (bytes)
    pub max_segment_bytes: u64,
    /// Capacity of the producer queue; `log_mint` blocks when it is full
    pub queue_capacity: usize,
    /// Nominal size of the writer's batch buffer (bytes)
    pub batch_buffer_bytes: usize,
    /// Rebuild the id→term map from the WAL when the store opens
    pub recover_value_store_on_open: bool,
    /// Await durability of bootstrap mints before returning from open
    pub sync_bootstrap_on_open: bool,
}

impl WalConfig {
    /// Start a builder with default tuning and no directory or store identity.
    pub fn builder() -> WalConfigBuilder {
        WalConfigBuilder::default()
    }

    /// Builder for `<data_dir>/wal` with the store identity loaded from
    /// `store.uuid`, creating the directory and the identity if missing.
    pub fn for_data_dir<P: AsRef<Path>>(data_dir: P) -> WalResult<WalConfigBuilder> {
        let wal_dir = data_dir.as_ref().join(DEFAULT_DIRECTORY_NAME);
        let store_uuid = load_or_create_store_uuid(&wal_dir)?;
        Ok(WalConfig::builder().wal_directory(wal_dir).store_uuid(store_uuid))
    }
}

/// Builder for [`WalConfig`]
#[derive(Debug, Clone)]
pub struct WalConfigBuilder {
    wal_directory: Option<PathBuf>,
    store_uuid: Option<String>,
    sync_policy: SyncPolicy,
    sync_interval: Duration,
    idle_poll_interval: Duration,
    max_segment_bytes: u64,
    queue_capacity: usize,
    batch_buffer_bytes: usize,
    recover_value_store_on_open: bool,
    sync_bootstrap_on_open: bool,
}

impl Default for WalConfigBuilder {
    fn default() -> Self {
        Self {
            wal_directory: None,
            store_uuid: None,
            sync_policy: SyncPolicy::default(),
            sync_interval: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(5),
            max_segment_bytes: 128 * 1024 * 1024,
            queue_capacity: 16 * 1024,
            batch_buffer_bytes: 128 * 1024,
            recover_value_store_on_open: false,
            sync_bootstrap_on_open: false,
        }
    }
}

impl WalConfigBuilder {
    #[must_use]
    pub fn wal_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.wal_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn store_uuid<S: Into<String>>(mut self, uuid: S) -> Self {
        self.store_uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    #[must_use]
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    #[must_use]
    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn batch_buffer_bytes(mut self, bytes: usize) -> Self {
        self.batch_buffer_bytes = bytes;
        self
    }

    #[must_use]
    pub fn recover_value_store_on_open(mut self, enabled: bool) -> Self {
        self.recover_value_store_on_open = enabled;
        self
    }

    #[must_use]
    pub fn sync_bootstrap_on_open(mut self, enabled: bool) -> Self {
        self.sync_bootstrap_on_open = enabled;
        self
    }

    /// Validate all parameters and produce the configuration.
    pub fn build(self) -> WalResult<WalConfig> {
        let wal_directory = match self.wal_directory {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => return Err(invalid("wal_directory", "is required")),
        };
        let store_uuid = match self.store_uuid {
            Some(uuid) if !uuid.trim().is_empty() => uuid,
            _ => return Err(invalid("store_uuid", "is required")),
        };
        if self.max_segment_bytes == 0 {
            return Err(invalid("max_segment_bytes", "must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be > 0"));
        }
        if self.batch_buffer_bytes <= MIN_BATCH_BUFFER_BYTES {
            return Err(invalid(
                "batch_buffer_bytes",
                format!("must be > {} bytes", MIN_BATCH_BUFFER_BYTES),
            ));
        }
        if self.sync_interval.is_zero() {
            return Err(invalid("sync_interval", "must be > 0"));
        }
        if self.idle_poll_interval.is_zero() {
            return Err(invalid("idle_poll_interval", "must be > 0"));
        }

        Ok(WalConfig {
            wal_directory,
            store_uuid,
            sync_policy: self.sync_policy,
            sync_interval: self.sync_interval,
            idle_poll_interval: self.idle_poll_interval,
            max_segment_bytes: self.max_segment_bytes,
            queue_capacity: self.queue_capacity,
            batch_buffer_bytes: self.batch_buffer_bytes,
            recover_value_store_on_open: self.recover_value_store_on_open,
            sync_bootstrap_on_open: self.sync_bootstrap_on_open,
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> WalError {
    WalError::InvalidConfig { field, reason: reason.into() }
}

/// Read the store identity from `<wal_dir>/store.uuid`, or mint a new one.
///
/// A new identity is written through a temp file and renamed into place so a
/// crash never leaves a half-written `store.uuid` behind.
pub fn load_or_create_store_uuid(wal_dir: &Path) -> WalResult<String> {
    fs::create_dir_all(wal_dir)
        .map_err(WalError::io_at(wal_dir, "Failed to create WAL directory"))?;

    let path = wal_dir.join(STORE_UUID_FILE);
    match fs::read_to_string(&path) {
        Ok(existing) if !existing.trim().is_empty() => return Ok(existing.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(WalError::io_at(&path, "Failed to read store.uuid")(e)),
    }

    let uuid = uuid::Uuid::new_v4().to_string();
    let tmp = wal_dir.join(format!("{}.tmp", STORE_UUID_FILE));
    {
        let mut file = fs::File::create(&tmp)
            .map_err(WalError::io_at(&tmp, "Failed to create store.uuid"))?;
        file.write_all(uuid.as_bytes())
            .map_err(WalError::io_at(&tmp, "Failed to write store.uuid"))?;
        durable_sync(&file).map_err(WalError::io_at(&tmp, "Failed to sync store.uuid"))?;
    }
    fs::rename(&tmp, &path).map_err(WalError::io_at(&path, "Failed to install store.uuid"))?;
    sync_dir(wal_dir)?;

    tracing::info!(path = %path.display(), store_uuid = %uuid, "created new WAL store identity");
    Ok(uuid)
}
