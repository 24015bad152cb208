//! Rebuild the id→term dictionary from the WAL
//!
//! An id is minted exactly once, so the FIRST record seen for an id is
//! authoritative. Later records with the same id come from stale views
//! replayed across a restart boundary and are counted, not applied.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::error::WalResult;
use crate::format::{Lsn, WalRecord};
use crate::reader::WalReader;

/// Outcome of a replay
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub dictionary: BTreeMap<u32, WalRecord>,
    /// False when the reader hit a gap, a fault or a missing summary
    pub complete: bool,
    pub last_valid_lsn: Lsn,
    /// Records ignored because their id was already present
    pub duplicates: usize,
}

pub struct WalRecovery;

impl WalRecovery {
    /// id→record map, first occurrence wins.
    pub fn replay(reader: &WalReader) -> WalResult<BTreeMap<u32, WalRecord>> {
        Ok(Self::replay_with_report(reader)?.dictionary)
    }

    /// Like `replay`, but also reports whether the log was read completely.
    pub fn replay_with_report(reader: &WalReader) -> WalResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut iter = reader.iter();

        for record in iter.by_ref() {
            let record = record?;
            match report.dictionary.entry(record.id) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(_) => report.duplicates += 1,
            }
        }

        report.complete = iter.is_complete();
        report.last_valid_lsn = iter.last_valid_lsn();
        if !report.complete {
            tracing::warn!(
                dir = %reader.directory().display(),
                recovered = report.dictionary.len(),
                last_valid_lsn = report.last_valid_lsn,
                "WAL replay incomplete"
            );
        }
        Ok(report)
    }
}
