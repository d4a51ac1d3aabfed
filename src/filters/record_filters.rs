//! Stock record filters (§4.4 supplement), grounded in the madara
//! filter classes: `CounterFilter.cpp`, `ClearRecords.cpp`,
//! `DynamicPrefixFilter.h`. Expressed here as plain structs implementing
//! [`RecordFilter`] rather than a class hierarchy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::RecordFilter;
use crate::record::{Record, TypeTag};

/// Counts records seen per type tag, passing every record through
/// unchanged. Useful wired into every type slot of a chain purely for
/// telemetry.
#[derive(Default)]
pub struct CounterFilter {
    counts: Mutex<HashMap<TypeTag, u64>>,
    total: AtomicU64,
}

impl CounterFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn count_for(&self, tag: TypeTag) -> u64 {
        self.counts.lock().unwrap().get(&tag).copied().unwrap_or(0)
    }
}

impl RecordFilter for CounterFilter {
    fn apply(&self, record: Record, _name: &str) -> Record {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.counts.lock().unwrap().entry(record.value.type_tag()).or_insert(0) += 1;
        record
    }
}

/// Unconditionally reduces every record it sees to `Empty`, dropping it
/// from the batch — the filter-chain equivalent of madara's
/// `ClearRecords` aggregate helper, expressed per-record here since
/// clearing one record at a time composes more simply with the rest of
/// the chain.
pub struct ClearRecordsFilter;

impl RecordFilter for ClearRecordsFilter {
    fn apply(&self, _record: Record, _name: &str) -> Record {
        Record::new()
    }
}

/// Drops any record whose name does not start with the configured
/// prefix, grounded in `DynamicPrefixFilter`'s name-gating behavior.
pub struct PrefixFilter {
    prefix: String,
}

impl PrefixFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl RecordFilter for PrefixFilter {
    fn apply(&self, record: Record, name: &str) -> Record {
        if name.starts_with(&self.prefix) {
            record
        } else {
            Record::new()
        }
    }
}
