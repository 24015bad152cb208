//! termwal core: write-ahead log for RDF term dictionary mints
//!
//! Every newly minted term id is logged here before or while the term
//! dictionary persists it, so the id→term mapping can be rebuilt after a
//! crash or after dictionary corruption, independently of the dictionary's
//! own files.
//!
//! # Architecture
//!
//! - **Write path**: producers → `ValueStoreWal::log_mint` → bounded queue →
//!   single writer thread → `wal-<seq>.v1` segments
//! - **Durability**: `await_durable(lsn)` blocks until the writer has forced
//!   through that LSN, under the configured `SyncPolicy`
//! - **Segment lifecycle**: OPEN → SEALED (summary + force) → COMPRESSED (`.v1.gz`)
//! - **Read path**: `WalReader`, `WalRecovery` and `WalSearch` read segment
//!   files directly and tolerate truncation and corruption

pub mod config;
pub mod dictionary;
pub mod error;
pub mod format;
pub mod lifecycle;
pub mod platform_durability;
pub mod queue;
pub mod reader;
pub mod recovery;
pub mod search;
pub mod segment;
pub mod wal;
mod writer;

// Re-export key types for convenience
pub use config::{SyncPolicy, WalConfig, WalConfigBuilder, DEFAULT_DIRECTORY_NAME};
pub use dictionary::{
    bootstrap_recovery, PendingHighWaterMark, ResolvedValue, StoredValue, ValueResolver,
};
pub use error::{WalError, WalResult};
pub use format::{value_hash, Lsn, ValueKind, WalRecord, NO_LSN};
pub use reader::{RecordIter, ScanResult, WalReader};
pub use recovery::{RecoveryReport, WalRecovery};
pub use search::WalSearch;
pub use wal::{MintRequest, ValueStoreWal};
pub use writer::WalStats;
