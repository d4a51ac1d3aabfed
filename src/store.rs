//! The concurrent name-to-record table (§3.2/§4.2).
//!
//! Follows the teacher's `RwLockEngine` pattern: a shared read lock serves
//! lookups and enumeration, an exclusive write lock serves `set` and inbound
//! merge. Unlike the teacher's `String`-valued map, each slot is a full
//! [`Record`] carrying clock/quality metadata, and local/global visibility is
//! tracked by name prefix.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

use crate::record::{ApplyOutcome, Record, RecordValue};

/// A name prefixed with `.` is local-only: it is visible to `get`/`set` but
/// is never placed in the modified set a transport send sweeps, and it is
/// always stripped from `to_map`/`save_context`.
fn is_local_name(name: &str) -> bool {
    name.starts_with('.')
}

/// A stable, O(1) handle to one slot, usable in a hot loop (KaRL variable
/// access) without repeating a hash lookup each time (§3.2/§5).
#[derive(Clone)]
pub struct VariableReference {
    table: Arc<RwLock<HashMap<String, Record>>>,
    name: Arc<str>,
}

impl VariableReference {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Record {
        self.table
            .read()
            .await
            .get(&*self.name)
            .cloned()
            .unwrap_or_default()
    }
}

/// The store's current clock, protected for atomic fetch-and-increment on a
/// local write (§3.2).
struct ClockState {
    value: u64,
}

/// Concurrent knowledge-record table plus the bookkeeping a local write or
/// an inbound merge needs: a monotonically increasing store clock and a
/// change-notification signal for `wait`.
pub struct Store {
    table: Arc<RwLock<HashMap<String, Record>>>,
    clock: RwLock<ClockState>,
    /// Names written locally since the last send sweep (globals only).
    modified: RwLock<Vec<String>>,
    /// Fired whenever any name changes, local or remote, for `wait()`.
    pub change_signal: Notify,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            clock: RwLock::new(ClockState { value: 0 }),
            modified: RwLock::new(Vec::new()),
            change_signal: Notify::new(),
        }
    }

    pub async fn current_clock(&self) -> u64 {
        self.clock.read().await.value
    }

    async fn next_clock(&self) -> u64 {
        let mut c = self.clock.write().await;
        c.value += 1;
        c.value
    }

    /// Bring the store clock up to at least `incoming`, matching the
    /// "store clock never goes backward" rule of §3.2/§5.
    async fn observe_clock(&self, incoming: u64) {
        let mut c = self.clock.write().await;
        if incoming > c.value {
            c.value = incoming;
        }
    }

    pub async fn get(&self, name: &str) -> Record {
        self.table.read().await.get(name).cloned().unwrap_or_default()
    }

    pub async fn get_ref(&self, name: &str) -> VariableReference {
        VariableReference { table: self.table.clone(), name: Arc::from(name) }
    }

    /// Local write: bumps the store clock, stamps the record with it and
    /// with `write_quality`, and records the name in the modified set
    /// unless it is a `.`-prefixed local (§3.2/§4.1).
    pub async fn set(&self, name: &str, value: RecordValue) {
        let clock = self.next_clock().await;
        let mut table = self.table.write().await;
        let slot = table.entry(name.to_string()).or_default();
        let quality = slot.write_quality.max(1);
        slot.set_value(value);
        slot.clock = clock;
        slot.quality = quality;
        drop(table);

        if !is_local_name(name) {
            let mut modified = self.modified.write().await;
            if !modified.iter().any(|n| n == name) {
                modified.push(name.to_string());
            }
        }
        self.change_signal.notify_waiters();
    }

    /// Like `set`, but never adds `name` to the modified set even if it
    /// isn't `.`-prefixed — backs the evaluator's "treat-globals-as-locals"
    /// setting and function-argument binding (§4.3).
    pub async fn set_no_publish(&self, name: &str, value: RecordValue) {
        let clock = self.next_clock().await;
        let mut table = self.table.write().await;
        let slot = table.entry(name.to_string()).or_default();
        let quality = slot.write_quality.max(1);
        slot.set_value(value);
        slot.clock = clock;
        slot.quality = quality;
        drop(table);
        self.change_signal.notify_waiters();
    }

    pub async fn set_write_quality(&self, name: &str, quality: u32) {
        let mut table = self.table.write().await;
        table.entry(name.to_string()).or_default().write_quality = quality;
    }

    pub async fn delete(&self, name: &str) -> bool {
        let removed = self.table.write().await.remove(name).is_some();
        if removed {
            self.change_signal.notify_waiters();
        }
        removed
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.table.read().await.contains_key(name)
    }

    /// Merge an inbound record under last-writer-wins (§4.1): higher clock
    /// wins outright; equal clock defers to quality; equal clock and
    /// quality keeps whatever is already stored (first writer wins). A
    /// record with no name is always discarded.
    pub async fn apply(&self, name: &str, incoming: &Record) -> ApplyOutcome {
        if name.is_empty() {
            return ApplyOutcome::DiscardedNullKey;
        }

        self.observe_clock(incoming.clock).await;

        let mut table = self.table.write().await;
        let outcome = match table.get(name) {
            None => {
                table.insert(name.to_string(), incoming.clone());
                ApplyOutcome::Applied
            }
            Some(current) => {
                if incoming.clock > current.clock {
                    table.insert(name.to_string(), incoming.clone());
                    ApplyOutcome::Applied
                } else if incoming.clock < current.clock {
                    ApplyOutcome::DiscardedStaleClock
                } else if incoming.quality > current.quality {
                    table.insert(name.to_string(), incoming.clone());
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::DiscardedLowQuality
                }
            }
        };
        drop(table);

        if outcome == ApplyOutcome::Applied {
            self.change_signal.notify_waiters();
        }
        outcome
    }

    /// Names written locally (globals only) since the last sweep, clearing
    /// the set as the send path does (§4.1/§4.6 "modifieds").
    pub async fn drain_modified(&self) -> Vec<String> {
        let mut modified = self.modified.write().await;
        std::mem::take(&mut *modified)
    }

    /// `to_vector`: `out[i] = get("{prefix}{start+i}")` for `i` in
    /// `[0, end-start)` (§4.2 supplement, grounded in `Variables.cpp`).
    pub async fn to_vector(&self, prefix: &str, start: usize, end: usize) -> Vec<Record> {
        let table = self.table.read().await;
        (start..end)
            .map(|i| table.get(&format!("{prefix}{i}")).cloned().unwrap_or_default())
            .collect()
    }

    /// `to_map`: every stored name sharing `prefix`, with a trailing `*`
    /// wildcard marker stripped before matching — no general glob support
    /// (§4.2 supplement).
    pub async fn to_map(&self, prefix: &str) -> HashMap<String, Record> {
        let literal_prefix = prefix.strip_suffix('*').unwrap_or(prefix);
        let table = self.table.read().await;
        table
            .iter()
            .filter(|(name, _)| name.starts_with(literal_prefix))
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    /// Serialize every non-local name into the record wire format (§3.4),
    /// used by `save_context`.
    pub async fn save_context(&self) -> Vec<u8> {
        let table = self.table.read().await;
        let mut buf = Vec::new();
        for (name, record) in table.iter() {
            if is_local_name(name) {
                continue;
            }
            record.write(name, &mut buf);
        }
        buf
    }

    /// Load a buffer previously produced by `save_context`, merging each
    /// record as if it had arrived over the wire (so LWW still applies).
    pub async fn load_context(&self, buf: &[u8]) -> crate::error::Result<usize> {
        let mut pos = 0;
        let mut count = 0;
        while pos < buf.len() {
            let (name, record, next) = Record::read(buf, pos)?;
            self.apply(&name, &record).await;
            pos = next;
            count += 1;
        }
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }

    /// Block until the next change signal fires, for `wait()` polling
    /// loops (§4.3/§4.7, Notify per the Ambient concurrency note).
    pub async fn wait_for_change(&self) {
        self.change_signal.notified().await;
    }

    /// Render every non-local name/value pair, for the `#print` system call
    /// and debugging (no particular ordering guarantee).
    pub async fn print_all(&self) -> String {
        let table = self.table.read().await;
        let mut names: Vec<&String> = table.keys().filter(|n| !is_local_name(n)).collect();
        names.sort();
        names
            .into_iter()
            .map(|n| format!("{n}={}", table.get(n).unwrap().to_string_delim(",")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = Store::new();
        store.set("x", RecordValue::Integer(42)).await;
        assert_eq!(store.get("x").await.to_integer(), 42);
    }

    #[tokio::test]
    async fn local_names_excluded_from_modified_set() {
        let store = Store::new();
        store.set(".private", RecordValue::Integer(1)).await;
        store.set("public", RecordValue::Integer(2)).await;
        let modified = store.drain_modified().await;
        assert_eq!(modified, vec!["public".to_string()]);
    }

    #[tokio::test]
    async fn idempotent_local_write_produces_one_modified_entry() {
        let store = Store::new();
        store.set("x", RecordValue::Integer(1)).await;
        store.set("x", RecordValue::Integer(1)).await;
        let modified = store.drain_modified().await;
        assert_eq!(modified, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn apply_prefers_higher_clock() {
        let store = Store::new();
        store.apply("x", &Record { clock: 5, quality: 1, ..Record::from_integer(1) }).await;
        let outcome = store
            .apply("x", &Record { clock: 3, quality: 99, ..Record::from_integer(2) })
            .await;
        assert_eq!(outcome, ApplyOutcome::DiscardedStaleClock);
        assert_eq!(store.get("x").await.to_integer(), 1);
    }

    #[tokio::test]
    async fn apply_tie_break_by_quality_then_first_writer_wins() {
        let store = Store::new();
        store.apply("x", &Record { clock: 5, quality: 5, ..Record::from_integer(1) }).await;
        let higher_quality = store
            .apply("x", &Record { clock: 5, quality: 9, ..Record::from_integer(2) })
            .await;
        assert_eq!(higher_quality, ApplyOutcome::Applied);
        assert_eq!(store.get("x").await.to_integer(), 2);

        let equal_quality = store
            .apply("x", &Record { clock: 5, quality: 9, ..Record::from_integer(3) })
            .await;
        assert_eq!(equal_quality, ApplyOutcome::DiscardedLowQuality);
        assert_eq!(store.get("x").await.to_integer(), 2);
    }

    #[tokio::test]
    async fn concurrent_reads_do_not_block_each_other() {
        let store = Arc::new(Store::new());
        store.set("shared", RecordValue::Integer(7)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.get("shared").await.to_integer() }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn to_map_strips_trailing_wildcard() {
        let store = Store::new();
        store.set("robot.0.x", RecordValue::Integer(1)).await;
        store.set("robot.1.x", RecordValue::Integer(2)).await;
        store.set("other", RecordValue::Integer(3)).await;
        let map = store.to_map("robot.*").await;
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn save_and_load_context_round_trips() {
        let store = Store::new();
        store.set("a", RecordValue::Integer(1)).await;
        store.set("b", RecordValue::String(Arc::new("hi".to_string()))).await;
        let buf = store.save_context().await;

        let reloaded = Store::new();
        reloaded.load_context(&buf).await.unwrap();
        assert_eq!(reloaded.get("a").await.to_integer(), 1);
        assert_eq!(reloaded.get("b").await.to_string_delim(","), "hi");
    }
}
