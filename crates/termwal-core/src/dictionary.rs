//! Surface used by the term dictionary
//!
//! - `PendingHighWaterMark`: the dictionary mints several terms, remembers the
//!   highest LSN, and drains it at commit time to pass to `await_durable`.
//! - `ValueResolver`: when a stored term fails to decode, look its id up in the
//!   WAL and hand back a distinguishable "corrupt but recovered" value instead
//!   of failing the read.
//! - `bootstrap_recovery`: replay the WAL at store open when configured.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::WalConfig;
use crate::error::WalResult;
use crate::format::{Lsn, WalRecord, NO_LSN};
use crate::reader::WalReader;
use crate::recovery::{RecoveryReport, WalRecovery};
use crate::search::WalSearch;

/// Highest LSN minted since the last drain
#[derive(Debug, Default)]
pub struct PendingHighWaterMark {
    lsn: AtomicU64,
}

impl PendingHighWaterMark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, lsn: Lsn) {
        self.lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    /// Take the mark and reset it; None if nothing was minted since the last drain.
    pub fn drain(&self) -> Option<Lsn> {
        match self.lsn.swap(NO_LSN, Ordering::AcqRel) {
            NO_LSN => None,
            lsn => Some(lsn),
        }
    }

    pub fn peek(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }
}

/// What the dictionary's own storage produced for an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue<T> {
    Intact(T),
    Corrupt { id: u32, reason: String },
}

/// A stored value after consulting the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedValue<T> {
    Intact(T),
    /// Dictionary bytes were damaged but the WAL still holds the minting record
    CorruptRecovered { id: u32, reason: String, record: WalRecord },
    CorruptUnrecoverable { id: u32, reason: String },
}

impl<T> ResolvedValue<T> {
    pub fn is_corrupt(&self) -> bool {
        !matches!(self, ResolvedValue::Intact(_))
    }
}

pub struct ValueResolver {
    search: WalSearch,
}

impl ValueResolver {
    pub fn new(config: &WalConfig) -> Self {
        Self { search: WalSearch::open(config) }
    }

    pub fn with_search(search: WalSearch) -> Self {
        Self { search }
    }

    pub fn resolve<T>(&self, stored: StoredValue<T>) -> WalResult<ResolvedValue<T>> {
        match stored {
            StoredValue::Intact(value) => Ok(ResolvedValue::Intact(value)),
            StoredValue::Corrupt { id, reason } => match self.search.find_value_by_id(id)? {
                Some(record) => {
                    tracing::warn!(
                        id,
                        reason = %reason,
                        lsn = record.lsn,
                        "recovered corrupt term from WAL"
                    );
                    Ok(ResolvedValue::CorruptRecovered { id, reason, record })
                }
                None => Ok(ResolvedValue::CorruptUnrecoverable { id, reason }),
            },
        }
    }
}

/// Replay the WAL if `recover_value_store_on_open` is set.
pub fn bootstrap_recovery(config: &WalConfig) -> WalResult<Option<RecoveryReport>> {
    if !config.recover_value_store_on_open {
        return Ok(None);
    }
    let report = WalRecovery::replay_with_report(&WalReader::open(config))?;
    tracing::info!(
        recovered = report.dictionary.len(),
        complete = report.complete,
        "rebuilt value store from WAL"
    );
    Ok(Some(report))
}
