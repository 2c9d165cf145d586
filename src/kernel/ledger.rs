//! Execution ledger: append-only history of execution attempts.
//!
//! One stream per function name, tagged with the incarnation of the record
//! it belongs to. Deleting a function purges its stream and leaves a
//! tombstone, so records from the deleted incarnation that complete late
//! are dropped instead of leaking into a re-uploaded function's history.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::ErrorKind;
use crate::sandbox::Outcome;

/// How one recorded execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Success { value: serde_json::Value },
    Failure { kind: ErrorKind, detail: String },
}

impl From<Outcome> for RecordOutcome {
    fn from(outcome: Outcome) -> Self {
        let (kind, detail) = match outcome {
            Outcome::Success(value) => return RecordOutcome::Success { value },
            Outcome::ParameterError(d) => (ErrorKind::ParameterError, d),
            Outcome::TimeoutError(d) => (ErrorKind::TimeoutError, d),
            Outcome::MemoryLimitError(d) => (ErrorKind::MemoryLimitError, d),
            Outcome::RuntimeError(d) => (ErrorKind::RuntimeError, d),
        };
        RecordOutcome::Failure { kind, detail }
    }
}

/// One execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub incarnation: u64,
    /// Summarized copy of the parameters the caller supplied.
    pub parameters: serde_json::Value,
    pub outcome: RecordOutcome,
    pub duration_ms: u64,
    pub peak_memory: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

type Records = Arc<RwLock<Vec<Arc<ExecutionRecord>>>>;

struct Stream {
    incarnation: u64,
    records: Records,
}

#[derive(Default)]
struct Streams {
    by_name: HashMap<String, Stream>,
    /// Highest purged incarnation per name, kept until a newer
    /// incarnation starts a stream.
    tombstones: HashMap<String, u64>,
}

impl Streams {
    fn admits(&self, record: &ExecutionRecord) -> bool {
        if self
            .tombstones
            .get(&record.name)
            .is_some_and(|dead| record.incarnation <= *dead)
        {
            return false;
        }
        self.by_name
            .get(&record.name)
            .map_or(true, |s| record.incarnation >= s.incarnation)
    }

    /// The stream `record` belongs in, started or replaced as needed.
    /// `None` when the record must be dropped.
    fn stream_for(&mut self, record: &ExecutionRecord) -> Option<Records> {
        if !self.admits(record) {
            return None;
        }
        let fresh = || Stream {
            incarnation: record.incarnation,
            records: Records::default(),
        };
        let stream = self.by_name.entry(record.name.clone()).or_insert_with(fresh);
        if record.incarnation > stream.incarnation {
            *stream = fresh();
        }
        let records = stream.records.clone();
        // the live stream now rejects anything older
        self.tombstones.remove(&record.name);
        Some(records)
    }
}

pub struct Ledger {
    config: LedgerConfig,
    streams: RwLock<Streams>,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(Streams::default()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Whether `record` would be kept. Records from a purged incarnation,
    /// or older than the live stream, are not.
    pub fn accepts(&self, record: &ExecutionRecord) -> bool {
        read(&self.streams).admits(record)
    }

    /// Append a record. Returns `false` when it was dropped.
    pub fn insert(&self, record: ExecutionRecord) -> bool {
        let Some(records) = write(&self.streams).stream_for(&record) else {
            tracing::debug!(
                name = %record.name,
                incarnation = record.incarnation,
                "dropping execution record for a deleted function"
            );
            return false;
        };
        write(&records).push(Arc::new(record));
        true
    }

    /// Lazy view of the history of `name`, oldest first.
    pub fn query(&self, name: &str) -> LedgerQuery {
        let records = read(&self.streams)
            .by_name
            .get(name)
            .map(|s| s.records.clone())
            .unwrap_or_default();
        let len = read(&records).len();
        LedgerQuery {
            records,
            len,
            pos: 0,
        }
    }

    /// Delete cascade: drop every record of `name` up to `incarnation` and
    /// refuse any that arrive later.
    pub fn purge(&self, name: &str, incarnation: u64) {
        let mut streams = write(&self.streams);
        let tombstone = streams.tombstones.entry(name.to_string()).or_insert(0);
        *tombstone = (*tombstone).max(incarnation);
        if streams
            .by_name
            .get(name)
            .is_some_and(|s| s.incarnation <= incarnation)
        {
            streams.by_name.remove(name);
        }
    }

    /// Number of records held for `name`.
    pub fn count(&self, name: &str) -> usize {
        self.query(name).len()
    }

    /// Shrink a parameter document for storage.
    pub fn summarize(&self, value: &serde_json::Value) -> serde_json::Value {
        summarize(value, &self.config)
    }
}

/// A snapshot-length, restartable iterator over one history. Records
/// appended after the query was taken are not visited.
#[derive(Clone)]
pub struct LedgerQuery {
    records: Records,
    len: usize,
    pos: usize,
}

impl LedgerQuery {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start again from the oldest record.
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for LedgerQuery {
    type Item = Arc<ExecutionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.len {
            return None;
        }
        let item = read(&self.records).get(self.pos).cloned();
        self.pos += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.len - self.pos;
        (left, Some(left))
    }
}

impl ExactSizeIterator for LedgerQuery {}

/// Truncate long strings and collections, recursively.
pub fn summarize(value: &serde_json::Value, config: &LedgerConfig) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) if s.chars().count() > config.max_string_chars => {
            let mut short: String = s.chars().take(config.max_string_chars).collect();
            short.push('…');
            Value::String(short)
        }
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(config.max_collection_items)
                .map(|v| summarize(v, config))
                .collect();
            if items.len() > config.max_collection_items {
                out.push(Value::String(format!(
                    "… {} more",
                    items.len() - config.max_collection_items
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out: serde_json::Map<String, Value> = map
                .iter()
                .take(config.max_collection_items)
                .map(|(k, v)| (k.clone(), summarize(v, config)))
                .collect();
            if map.len() > config.max_collection_items {
                out.insert(
                    "…".into(),
                    Value::String(format!("{} more", map.len() - config.max_collection_items)),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

// Lock helpers: a poisoned lock still holds consistent data here, since
// every critical section is a single push or map update.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str, incarnation: u64, n: i64) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            incarnation,
            parameters: json!({"n": n}),
            outcome: RecordOutcome::Success { value: json!(n * n) },
            duration_ms: 1,
            peak_memory: 128,
            started_at: now,
            finished_at: now,
        }
    }

    fn values(query: LedgerQuery) -> Vec<serde_json::Value> {
        query.map(|r| r.parameters["n"].clone()).collect()
    }

    #[test]
    fn history_is_oldest_first() {
        let ledger = Ledger::new(LedgerConfig::default());
        for n in 0..3 {
            assert!(ledger.insert(record("sq", 1, n)));
        }
        assert_eq!(values(ledger.query("sq")), vec![json!(0), json!(1), json!(2)]);
        assert!(ledger.query("other").is_empty());
    }

    #[test]
    fn query_is_a_restartable_snapshot() {
        let ledger = Ledger::new(LedgerConfig::default());
        ledger.insert(record("sq", 1, 1));
        let mut query = ledger.query("sq");
        ledger.insert(record("sq", 1, 2));
        assert_eq!(query.len(), 1);
        assert_eq!(query.by_ref().count(), 1);
        assert!(query.next().is_none());
        query.restart();
        assert_eq!(query.count(), 1);
        assert_eq!(ledger.count("sq"), 2);
    }

    #[test]
    fn purge_leaves_a_tombstone() {
        let ledger = Ledger::new(LedgerConfig::default());
        ledger.insert(record("sq", 1, 1));
        ledger.purge("sq", 1);
        assert_eq!(ledger.count("sq"), 0);

        // A late record from the deleted incarnation is dropped.
        assert!(!ledger.insert(record("sq", 1, 2)));
        // The re-uploaded function starts a fresh history.
        assert!(ledger.insert(record("sq", 2, 3)));
        assert_eq!(values(ledger.query("sq")), vec![json!(3)]);
    }

    #[test]
    fn purge_after_the_check_still_wins() {
        let ledger = Ledger::new(LedgerConfig::default());
        ledger.insert(record("sq", 1, 1));

        let late = record("sq", 1, 2);
        assert!(ledger.accepts(&late));
        ledger.purge("sq", 1);
        // the append step re-checks under the write lock
        assert!(write(&ledger.streams).stream_for(&late).is_none());
        assert!(!ledger.insert(late));
        assert_eq!(ledger.count("sq"), 0);
    }

    #[test]
    fn concurrent_purge_never_leaks_into_the_next_incarnation() {
        use std::sync::Barrier;

        let ledger = Arc::new(Ledger::new(LedgerConfig::default()));
        for incarnation in 1..=200u64 {
            let barrier = Arc::new(Barrier::new(2));
            let writer = {
                let (ledger, barrier) = (ledger.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.insert(record("sq", incarnation, 0));
                })
            };
            barrier.wait();
            ledger.purge("sq", incarnation);
            writer.join().unwrap();
            assert_eq!(ledger.count("sq"), 0, "incarnation {incarnation}");
        }
    }

    #[test]
    fn tombstone_is_dropped_once_a_newer_stream_starts() {
        let ledger = Ledger::new(LedgerConfig::default());
        ledger.insert(record("sq", 1, 1));
        ledger.purge("sq", 1);
        assert_eq!(read(&ledger.streams).tombstones.len(), 1);

        assert!(ledger.insert(record("sq", 2, 2)));
        assert!(read(&ledger.streams).tombstones.is_empty());
        // the live stream still refuses the deleted incarnation
        assert!(!ledger.insert(record("sq", 1, 3)));
        assert_eq!(values(ledger.query("sq")), vec![json!(2)]);
    }

    #[test]
    fn newer_incarnation_replaces_stream() {
        let ledger = Ledger::new(LedgerConfig::default());
        ledger.insert(record("sq", 1, 1));
        ledger.insert(record("sq", 4, 2));
        assert!(!ledger.insert(record("sq", 3, 9)));
        assert_eq!(values(ledger.query("sq")), vec![json!(2)]);
    }

    #[test]
    fn summaries_truncate() {
        let config = LedgerConfig {
            max_string_chars: 4,
            max_collection_items: 2,
        };
        let out = summarize(
            &json!({"s": "abcdefg", "xs": [1, 2, 3, 4], "nested": {"t": "xyz"}}),
            &config,
        );
        // Map keys iterate in sorted order: nested, s, xs.
        assert_eq!(out["nested"], json!({"t": "xyz"}));
        assert_eq!(out["s"], json!("abcd…"));
        assert!(out.get("xs").is_none());
        assert_eq!(out["…"], json!("1 more"));

        let list = summarize(&json!([1, 2, 3, 4]), &config);
        assert_eq!(list, json!([1, 2, "… 2 more"]));
    }

    #[test]
    fn outcome_conversion() {
        let failure: RecordOutcome = Outcome::TimeoutError("slow".into()).into();
        assert_eq!(
            failure,
            RecordOutcome::Failure {
                kind: ErrorKind::TimeoutError,
                detail: "slow".into()
            }
        );
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json, json!({"status": "failure", "kind": "TimeoutError", "detail": "slow"}));
    }
}
