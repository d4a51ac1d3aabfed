//! The filter chain (§4.4): ordered per-type and aggregate record
//! transforms at send/receive/rebroadcast time, plus a separate ordered
//! buffer-filter chain over serialized bytes.

pub mod buffer_filters;
pub mod record_filters;

use std::collections::HashMap;
use std::sync::Arc;

use crate::record::{Record, RecordValue, TypeTag};

/// `(record, name) -> record`. An `Empty` result removes the record from
/// the batch. Filters run on the transport thread and must not block —
/// they may read the store via a held `Arc<Store>` but must use a
/// try-lock or defer to a background task for anything that can't
/// complete immediately (§4.4 execution contract).
pub trait RecordFilter: Send + Sync {
    fn apply(&self, record: Record, name: &str) -> Record;
}

/// Operates on the whole record map of a message: may insert, delete, or
/// modify entries in place.
pub trait AggregateFilter: Send + Sync {
    fn apply(&self, records: &mut HashMap<String, Record>);
}

#[derive(Default)]
pub struct FilterChain {
    per_type: HashMap<TypeTag, Vec<Arc<dyn RecordFilter>>>,
    aggregate: Vec<Arc<dyn AggregateFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record_filter(&mut self, type_tag: TypeTag, filter: Arc<dyn RecordFilter>) {
        self.per_type.entry(type_tag).or_default().push(filter);
    }

    /// Registers `filter` against every known type tag — the common case
    /// for a filter like `PrefixFilter` that doesn't care about payload
    /// type.
    pub fn add_record_filter_all_types(&mut self, filter: Arc<dyn RecordFilter>) {
        for tag in ALL_TYPE_TAGS {
            self.add_record_filter(tag, filter.clone());
        }
    }

    pub fn add_aggregate_filter(&mut self, filter: Arc<dyn AggregateFilter>) {
        self.aggregate.push(filter);
    }

    /// Runs per-type filters over every record, dropping any reduced to
    /// `Empty`, then runs aggregate filters over the survivors.
    pub fn apply(&self, records: HashMap<String, Record>) -> HashMap<String, Record> {
        let mut out = HashMap::with_capacity(records.len());
        for (name, record) in records {
            let mut current = record;
            if let Some(filters) = self.per_type.get(&current.value.type_tag()) {
                for filter in filters {
                    current = filter.apply(current, &name);
                    if matches!(current.value, RecordValue::Empty) {
                        break;
                    }
                }
            }
            if !matches!(current.value, RecordValue::Empty) {
                out.insert(name, current);
            }
        }
        for filter in &self.aggregate {
            filter.apply(&mut out);
        }
        out
    }
}

const ALL_TYPE_TAGS: [TypeTag; 11] = [
    TypeTag::Empty,
    TypeTag::Integer,
    TypeTag::Double,
    TypeTag::String,
    TypeTag::IntegerArray,
    TypeTag::DoubleArray,
    TypeTag::BinaryFile,
    TypeTag::TextFile,
    TypeTag::Xml,
    TypeTag::ImageJpeg,
    TypeTag::Any,
];
