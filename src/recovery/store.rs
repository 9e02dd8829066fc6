//! The query cache the coordinator inspects and repairs.

use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Idle,
    Fetching,
    Paused,
}

/// Observable state of one cached query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub key: String,
    pub has_data: bool,
    pub error: Option<String>,
    pub fetch_status: FetchStatus,
    /// Epoch milliseconds of the last successful fetch.
    pub data_updated_at: Option<u64>,
    /// Epoch milliseconds of the last failed fetch.
    pub error_updated_at: Option<u64>,
}

impl QueryRecord {
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }
}

/// A query cache. Mutating calls are requests; the cache performs them asynchronously.
pub trait QueryStore: Send + Sync {
    fn queries(&self) -> Vec<QueryRecord>;

    fn query(&self, key: &str) -> Option<QueryRecord>;

    /// Mark one query stale.
    fn invalidate(&self, key: &str);

    /// Mark every query stale.
    fn invalidate_all(&self);

    /// Drop a query's data and error so it can be fetched from scratch.
    fn reset(&self, key: &str);

    fn refetch(&self, key: &str);

    fn refetch_all(&self);
}

/// A call made against a [`MemoryQueryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Invalidate(String),
    InvalidateAll,
    Reset(String),
    Refetch(String),
    RefetchAll,
}

/// In-process query store that records every mutating call.
#[derive(Debug, Default)]
pub struct MemoryQueryStore {
    queries: DashMap<String, QueryRecord>,
    calls: Mutex<Vec<StoreCall>>,
}

impl MemoryQueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: QueryRecord) {
        self.queries.insert(record.key.clone(), record);
    }

    pub fn remove(&self, key: &str) {
        self.queries.remove(key);
    }

    /// Calls received so far, oldest first.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain the recorded calls.
    pub fn take_calls(&self) -> Vec<StoreCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }
}

impl QueryStore for MemoryQueryStore {
    fn queries(&self) -> Vec<QueryRecord> {
        let mut all: Vec<_> = self.queries.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    fn query(&self, key: &str) -> Option<QueryRecord> {
        self.queries.get(key).map(|r| r.value().clone())
    }

    fn invalidate(&self, key: &str) {
        self.record(StoreCall::Invalidate(key.to_string()));
    }

    fn invalidate_all(&self) {
        self.record(StoreCall::InvalidateAll);
    }

    fn reset(&self, key: &str) {
        if let Some(mut record) = self.queries.get_mut(key) {
            record.has_data = false;
            record.error = None;
            record.data_updated_at = None;
            record.error_updated_at = None;
        }
        self.record(StoreCall::Reset(key.to_string()));
    }

    fn refetch(&self, key: &str) {
        self.record(StoreCall::Refetch(key.to_string()));
    }

    fn refetch_all(&self) {
        self.record(StoreCall::RefetchAll);
    }
}
