// src/persistence.rs
// Append-only log handling: the record shapes, the append path, the
// rewrite-compaction and the load-time replay bookkeeping.
//
// On disk every record is one JSON line. Three shapes exist: a live
// document (has `_id`), a tombstone (`{"$$deleted": true, "_id": id}`)
// and index DDL (`{"$$indexCreated": {...}}` / `{"$$indexRemoved":
// field}`). In memory they become a tagged enum immediately.

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use serde_json::Value;

use crate::error::{Result, VellumError};
use crate::index::IndexOptions;
use crate::log_warn;
use crate::serialization::{self, SerializationHooks};
use crate::storage;
use crate::value::{DELETED_KEY, INDEX_CREATED_KEY, INDEX_REMOVED_KEY};

/// One parsed log line
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Live document state
    Doc(Value),
    /// The document with this `_id` was deleted
    Tombstone(Value),
    /// Index DDL: created
    IndexCreated(IndexOptions),
    /// Index DDL: removed
    IndexRemoved(String),
    /// Well-formed JSON that is none of the three shapes; skipped
    Ignored,
}

/// Classify one decoded line. Corruption is a failed decode; a decoded
/// value of an unexpected shape is merely ignored.
pub fn parse_record(value: Value) -> LogRecord {
    let Some(map) = value.as_object() else {
        return LogRecord::Ignored;
    };
    if map.get(DELETED_KEY) == Some(&Value::Bool(true)) {
        if let Some(id) = map.get("_id") {
            return LogRecord::Tombstone(id.clone());
        }
    }
    if map.contains_key("_id") {
        return LogRecord::Doc(value);
    }
    if let Some(spec) = map.get(INDEX_CREATED_KEY) {
        if spec.get("fieldName").map(|f| f.is_string()).unwrap_or(false) {
            if let Ok(options) = serde_json::from_value::<IndexOptions>(spec.clone()) {
                return LogRecord::IndexCreated(options);
            }
        }
        return LogRecord::Ignored;
    }
    if let Some(field) = map.get(INDEX_REMOVED_KEY).and_then(Value::as_str) {
        return LogRecord::IndexRemoved(field.to_string());
    }
    LogRecord::Ignored
}

/// Serialize one of the record shapes back to a document value
pub fn tombstone_record(id: &Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(DELETED_KEY.to_string(), Value::Bool(true));
    map.insert("_id".to_string(), id.clone());
    Value::Object(map)
}

pub fn index_created_record(options: &IndexOptions) -> Result<Value> {
    let spec = serde_json::to_value(options)
        .map_err(|e| VellumError::Serialization(e.to_string()))?;
    let mut map = serde_json::Map::new();
    map.insert(INDEX_CREATED_KEY.to_string(), spec);
    Ok(Value::Object(map))
}

pub fn index_removed_record(field_name: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        INDEX_REMOVED_KEY.to_string(),
        Value::String(field_name.to_string()),
    );
    Value::Object(map)
}

/// What a full log replay reconstructs
#[derive(Debug, Default)]
pub struct LoadedData {
    /// Latest state per id, in no particular order
    pub docs: Vec<Value>,
    /// Index DDL that survived (created and not later removed)
    pub indexes: Vec<IndexOptions>,
    pub corrupt_lines: usize,
    pub total_lines: usize,
}

/// The append-only log of one datastore
pub struct Persistence {
    filename: Option<PathBuf>,
    corrupt_alert_threshold: f64,
    hooks: Option<SerializationHooks>,
}

impl Persistence {
    /// `filename: None` (or `in_memory_only`) means no persistence at
    /// all. A filename ending in `~` is reserved for the crash-safe
    /// temporaries and rejected here.
    pub fn new(
        filename: Option<PathBuf>,
        in_memory_only: bool,
        corrupt_alert_threshold: f64,
        hooks: Option<SerializationHooks>,
    ) -> Result<Persistence> {
        let filename = if in_memory_only { None } else { filename };
        if let Some(path) = &filename {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.ends_with('~') {
                return Err(VellumError::ReservedFilename(
                    path.to_string_lossy().into_owned(),
                ));
            }
        }
        Ok(Persistence {
            filename,
            corrupt_alert_threshold: corrupt_alert_threshold.clamp(0.0, 1.0),
            hooks,
        })
    }

    pub fn is_in_memory(&self) -> bool {
        self.filename.is_none()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    fn encode_line(&self, doc: &Value) -> Result<String> {
        let raw = serialization::serialize(doc)?;
        Ok(match &self.hooks {
            Some(hooks) => hooks.encode(&raw),
            None => raw,
        })
    }

    fn decode_line(&self, raw: &str) -> Result<Value> {
        let line = match &self.hooks {
            Some(hooks) => hooks.decode(raw),
            None => raw.to_string(),
        };
        serialization::deserialize(&line)
    }

    /// Append one record per document, in order, as one durable write
    pub fn persist_new_state(&self, docs: &[Value]) -> Result<()> {
        let Some(path) = &self.filename else {
            return Ok(());
        };
        if docs.is_empty() {
            return Ok(());
        }
        let mut buffer = String::new();
        for doc in docs {
            buffer.push_str(&self.encode_line(doc)?);
            buffer.push('\n');
        }
        storage::append_file(path, &buffer)
    }

    /// Rewrite the whole cache: every live document plus an
    /// `$$indexCreated` record per non-`_id` index, through the
    /// crash-safe protocol. Returns whether a rewrite happened (the
    /// in-memory case has nothing to compact).
    pub fn persist_cached_database<'a, D>(&self, docs: D, indexes: &[IndexOptions]) -> Result<bool>
    where
        D: IntoIterator<Item = &'a Value>,
    {
        let Some(path) = &self.filename else {
            return Ok(false);
        };
        let mut buffer = String::new();
        for doc in docs {
            buffer.push_str(&self.encode_line(doc)?);
            buffer.push('\n');
        }
        for options in indexes {
            buffer.push_str(&self.encode_line(&index_created_record(options)?)?);
            buffer.push('\n');
        }
        storage::crash_safe_write_file(path, &buffer)?;
        Ok(true)
    }

    /// Prepare the datafile and read it whole. `None` when running in
    /// memory.
    pub fn read_raw(&self) -> Result<Option<String>> {
        let Some(path) = &self.filename else {
            return Ok(None);
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                storage::ensure_directory_exists(dir)?;
            }
        }
        storage::ensure_datafile_integrity(path)?;
        Ok(Some(storage::read_file(path)?))
    }

    /// Replay raw log text: keep the latest state per id, apply
    /// tombstones and index DDL, count corrupt lines. More corrupt
    /// lines than the alert threshold allows aborts the load.
    pub fn treat_raw_data(&self, raw: &str) -> Result<LoadedData> {
        let lines: Vec<&str> = raw.split('\n').collect();
        let mut docs_by_id: AHashMap<String, Value> = AHashMap::new();
        let mut indexes: AHashMap<String, IndexOptions> = AHashMap::new();
        let mut corrupt = 0usize;
        let mut total = 0usize;

        for (i, line) in lines.iter().enumerate() {
            // The datafile is \n-terminated: a blank final line is not
            // a record and does not count toward corruption
            if i == lines.len() - 1 && line.is_empty() {
                continue;
            }
            total += 1;
            let value = match self.decode_line(line) {
                Ok(v) => v,
                Err(_) => {
                    corrupt += 1;
                    continue;
                }
            };
            match parse_record(value) {
                LogRecord::Doc(doc) => {
                    let key = doc["_id"].to_string();
                    docs_by_id.insert(key, doc);
                }
                LogRecord::Tombstone(id) => {
                    docs_by_id.remove(&id.to_string());
                }
                LogRecord::IndexCreated(options) => {
                    indexes.insert(options.field_name.clone(), options);
                }
                LogRecord::IndexRemoved(field) => {
                    indexes.remove(&field);
                }
                LogRecord::Ignored => {}
            }
        }

        if total > 0 && corrupt as f64 / total as f64 > self.corrupt_alert_threshold {
            return Err(VellumError::CorruptDatafile { corrupt, total });
        }
        if corrupt > 0 {
            log_warn!("tolerated {} corrupt lines out of {}", corrupt, total);
        }

        Ok(LoadedData {
            docs: docs_by_id.into_values().collect(),
            indexes: indexes.into_values().collect(),
            corrupt_lines: corrupt,
            total_lines: total,
        })
    }
}
