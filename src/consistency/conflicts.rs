//! Field-level conflict detection and resolution.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::broadcast::TopicBroadcaster;
use crate::clock::now_millis;
use crate::observability::metrics;
use crate::storage::{DurableStore, StorageError};

/// An entity snapshot: opaque field values keyed by field name.
pub type Snapshot = Map<String, Value>;

/// Which side of a conflict a value or timestamp belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    Server,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Local => "local",
            Source::Server => "server",
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Server,
    Manual,
}

/// A field whose local and server values differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConflict {
    pub field: String,
    /// `Null` when the field is absent locally.
    pub local_value: Value,
    /// `Null` when the field is absent on the server.
    pub server_value: Value,
    /// The side whose value was written most recently.
    pub source: Source,
    /// Detection time, epoch milliseconds.
    pub timestamp: u64,
}

/// A recorded decision for one conflicting field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub field: String,
    pub resolved_value: Value,
    pub resolution: Resolution,
    pub resolved_by: Option<String>,
    /// Epoch milliseconds.
    pub resolved_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no conflict found for {entity_id}.{field}")]
pub struct ConflictNotFound {
    pub entity_id: String,
    pub field: String,
}

/// Cross-tab message announcing fresh entity data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    DataUpdate {
        #[serde(rename = "entityId")]
        entity_id: String,
        data: Snapshot,
        timestamp: u64,
    },
}

pub fn sync_topic(entity_id: &str) -> String {
    format!("data_sync_{}", entity_id)
}

fn field_timestamp_key(entity_id: &str, field: &str, source: Source) -> String {
    format!("field_timestamp_{}_{}_{}", entity_id, field, source.as_str())
}

fn canonical(value: Option<&Value>) -> Option<String> {
    value.map(Value::to_string)
}

/// Detects and resolves conflicts between local and server snapshots of an entity.
pub struct DataConsistencyService {
    conflicts: DashMap<String, Vec<DataConflict>>,
    resolutions: DashMap<String, Vec<ConflictResolution>>,
    store: Arc<dyn DurableStore>,
    broadcaster: Arc<dyn TopicBroadcaster>,
}

impl DataConsistencyService {
    pub fn new(store: Arc<dyn DurableStore>, broadcaster: Arc<dyn TopicBroadcaster>) -> Self {
        Self {
            conflicts: DashMap::new(),
            resolutions: DashMap::new(),
            store,
            broadcaster,
        }
    }

    /// Compare two snapshots field by field and store the differing fields.
    ///
    /// Replaces any conflicts previously stored for the entity.
    pub fn detect_conflicts(&self, entity_id: &str, local: &Snapshot, server: &Snapshot) -> Vec<DataConflict> {
        let mut fields: Vec<&String> = local.keys().chain(server.keys()).collect();
        fields.sort();
        fields.dedup();

        let now = now_millis();
        let mut conflicts = Vec::new();

        for field in fields {
            let local_value = local.get(field);
            let server_value = server.get(field);
            if canonical(local_value) == canonical(server_value) {
                continue;
            }

            let local_ts = self.field_timestamp(entity_id, field, Source::Local);
            let server_ts = self.field_timestamp(entity_id, field, Source::Server);
            // Ties, including two untracked fields, go to the server.
            let source = if local_ts > server_ts { Source::Local } else { Source::Server };

            conflicts.push(DataConflict {
                field: field.clone(),
                local_value: local_value.cloned().unwrap_or(Value::Null),
                server_value: server_value.cloned().unwrap_or(Value::Null),
                source,
                timestamp: now,
            });
        }

        if conflicts.is_empty() {
            self.conflicts.remove(entity_id);
        } else {
            tracing::info!(entity_id = %entity_id, count = conflicts.len(), "Data conflicts detected");
            metrics::record_conflicts_detected(conflicts.len());
            self.conflicts.insert(entity_id.to_string(), conflicts.clone());
        }

        conflicts
    }

    /// Settle one conflicting field and move it into the resolution history.
    ///
    /// Without an explicit value, `Local` takes the local value and
    /// `Server`/`Manual` take the server value.
    pub fn resolve_conflict(
        &self,
        entity_id: &str,
        field: &str,
        resolution: Resolution,
        resolved_value: Option<Value>,
        resolved_by: Option<&str>,
    ) -> Result<ConflictResolution, ConflictNotFound> {
        let not_found = || ConflictNotFound {
            entity_id: entity_id.to_string(),
            field: field.to_string(),
        };

        let conflict = {
            let mut entry = self.conflicts.get_mut(entity_id).ok_or_else(not_found)?;
            let idx = entry.iter().position(|c| c.field == field).ok_or_else(not_found)?;
            entry.remove(idx)
        };
        self.conflicts.remove_if(entity_id, |_, remaining| remaining.is_empty());

        let resolved_value = resolved_value.unwrap_or_else(|| match resolution {
            Resolution::Local => conflict.local_value.clone(),
            Resolution::Server | Resolution::Manual => conflict.server_value.clone(),
        });

        let record = ConflictResolution {
            field: field.to_string(),
            resolved_value,
            resolution,
            resolved_by: resolved_by.map(str::to_string),
            resolved_at: now_millis(),
        };

        self.resolutions
            .entry(entity_id.to_string())
            .or_default()
            .push(record.clone());

        tracing::debug!(entity_id = %entity_id, field = %field, ?resolution, "Conflict resolved");
        Ok(record)
    }

    /// Active conflicts for an entity.
    pub fn conflicts(&self, entity_id: &str) -> Vec<DataConflict> {
        self.conflicts
            .get(entity_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Resolution history for an entity, oldest first.
    pub fn resolutions(&self, entity_id: &str) -> Vec<ConflictResolution> {
        self.resolutions
            .get(entity_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn clear_conflicts(&self, entity_id: &str) {
        self.conflicts.remove(entity_id);
    }

    /// Record that `source` wrote `field` just now.
    pub fn set_field_timestamp(&self, entity_id: &str, field: &str, source: Source) {
        self.set_field_timestamp_at(entity_id, field, source, now_millis());
    }

    /// Record that `source` wrote `field` at `timestamp` (epoch milliseconds).
    pub fn set_field_timestamp_at(&self, entity_id: &str, field: &str, source: Source, timestamp: u64) {
        let key = field_timestamp_key(entity_id, field, source);
        if let Err(e) = self.store.set(&key, &timestamp.to_string()) {
            tracing::warn!(key = %key, error = %e, "Failed to set field timestamp");
        }
    }

    /// Last recorded write time for a field, or 0 if unknown or unreadable.
    pub fn field_timestamp(&self, entity_id: &str, field: &str, source: Source) -> u64 {
        let key = field_timestamp_key(entity_id, field, source);
        let parsed = self.store.get(&key).and_then(|stored| match stored {
            None => Ok(0),
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| StorageError::Malformed {
                key: key.clone(),
                reason: e.to_string(),
            }),
        });

        parsed.unwrap_or_else(|e| {
            tracing::warn!(key = %key, error = %e, "Failed to read field timestamp");
            0
        })
    }

    /// Announce fresh entity data to other tabs. Best effort.
    pub fn sync_across_tabs(&self, entity_id: &str, data: &Snapshot) {
        let message = SyncMessage::DataUpdate {
            entity_id: entity_id.to_string(),
            data: data.clone(),
            timestamp: now_millis(),
        };
        match serde_json::to_value(&message) {
            Ok(value) => self.broadcaster.publish(&sync_topic(entity_id), value),
            Err(e) => tracing::warn!(entity_id = %entity_id, error = %e, "Failed to encode sync message"),
        }
    }

    /// Receive data updates other tabs publish for an entity.
    pub fn subscribe_updates(&self, entity_id: &str) -> broadcast::Receiver<Value> {
        self.broadcaster.subscribe(&sync_topic(entity_id))
    }
}
