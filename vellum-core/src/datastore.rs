// src/datastore.rs
// The datastore façade: one schema-less collection persisted to one
// append-only log. Integrates the index set, the executor, the query
// engine and persistence; owns candidate selection and TTL expiration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;

use crate::compare::{StringComparator, ValueOrdering};
use crate::cursor::Cursor;
use crate::error::{Result, VellumError};
use crate::executor::Executor;
use crate::index::{IndexOptions, IndexSet, SharedDoc};
use crate::index::tree::Bounds;
use crate::persistence::{
    index_created_record, index_removed_record, tombstone_record, Persistence,
};
use crate::query::operators::ComparisonOperator;
use crate::query::{ClauseValue, Query};
use crate::serialization::{LineTransform, SerializationHooks};
use crate::update::{modify, UpdateExpr};
use crate::value::{
    check_object, date_millis, deep_copy, get_dot_value, is_date, now_date, now_millis, random_id,
};
use crate::{log_debug, log_error, log_info};

/// Called once when an autoloaded datastore finishes (or fails) its
/// initial load
pub type OnLoadCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Construction options
pub struct DatastoreOptions {
    /// Log file path; absent means memory-only
    pub filename: Option<PathBuf>,
    /// Force no persistence even with a filename
    pub in_memory_only: bool,
    /// Auto-populate `createdAt` / `updatedAt`
    pub timestamp_data: bool,
    /// Schedule the initial load at construction
    pub autoload: bool,
    /// Invoked when the autoload finishes; without it a failed
    /// autoload is only logged and the datastore stays unready
    pub onload: Option<OnLoadCallback>,
    /// Line transform applied after serializing each record
    pub after_serialization: Option<LineTransform>,
    /// Inverse transform applied before deserializing each record
    pub before_deserialization: Option<LineTransform>,
    /// Tolerated fraction of corrupt log lines at load, in [0, 1]
    pub corrupt_alert_threshold: f64,
    /// Custom string comparator for sorts, index keys and range
    /// operators
    pub compare_strings: Option<StringComparator>,
}

impl Default for DatastoreOptions {
    fn default() -> Self {
        DatastoreOptions {
            filename: None,
            in_memory_only: false,
            timestamp_data: false,
            autoload: false,
            onload: None,
            after_serialization: None,
            before_deserialization: None,
            corrupt_alert_threshold: 0.1,
            compare_strings: None,
        }
    }
}

impl DatastoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.in_memory_only = true;
        self
    }

    pub fn with_timestamp_data(mut self, timestamp_data: bool) -> Self {
        self.timestamp_data = timestamp_data;
        self
    }

    pub fn with_autoload(mut self, autoload: bool) -> Self {
        self.autoload = autoload;
        self
    }

    pub fn with_onload(mut self, onload: OnLoadCallback) -> Self {
        self.onload = Some(onload);
        self
    }

    pub fn with_hooks(
        mut self,
        after_serialization: LineTransform,
        before_deserialization: LineTransform,
    ) -> Self {
        self.after_serialization = Some(after_serialization);
        self.before_deserialization = Some(before_deserialization);
        self
    }

    pub fn with_corrupt_alert_threshold(mut self, threshold: f64) -> Self {
        self.corrupt_alert_threshold = threshold;
        self
    }

    pub fn with_compare_strings(mut self, compare_strings: StringComparator) -> Self {
        self.compare_strings = Some(compare_strings);
        self
    }
}

/// Options for [`Datastore::update`]
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Update every matching document instead of the first
    pub multi: bool,
    /// Insert a document built from the query and the update when
    /// nothing matches
    pub upsert: bool,
    /// Return copies of the updated documents
    pub return_updated_docs: bool,
}

/// Outcome of [`Datastore::update`]
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    pub num_affected: usize,
    /// Whether the update inserted a fresh document
    pub upsert: bool,
    /// The updated documents, under `return_updated_docs` (always
    /// present for an upsert)
    pub affected_documents: Option<Vec<Value>>,
}

pub(crate) struct Inner {
    pub(crate) indexes: IndexSet,
    pub(crate) ttl_indexes: AHashMap<String, i64>,
    pub(crate) persistence: Persistence,
}

pub(crate) struct Shared {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) executor: Executor,
    pub(crate) ordering: ValueOrdering,
    pub(crate) timestamp_data: bool,
    compaction_listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    autocompaction: Mutex<Option<Sender<()>>>,
}

/// An embedded, single-process document collection
pub struct Datastore {
    shared: Arc<Shared>,
}

impl Datastore {
    /// Build a datastore. The filename and the serialization hook pair
    /// are validated here; with `autoload` the initial load is
    /// scheduled immediately (force-queued past the pre-ready buffer).
    pub fn new(options: DatastoreOptions) -> Result<Datastore> {
        let hooks = SerializationHooks::from_options(
            options.after_serialization,
            options.before_deserialization,
        )?;
        let persistence = Persistence::new(
            options.filename,
            options.in_memory_only,
            options.corrupt_alert_threshold,
            hooks,
        )?;
        let ordering = match options.compare_strings {
            Some(cmp) => ValueOrdering::with_comparator(cmp),
            None => ValueOrdering::new(),
        };

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                indexes: IndexSet::new(ordering.clone()),
                ttl_indexes: AHashMap::new(),
                persistence,
            }),
            executor: Executor::new()?,
            ordering,
            timestamp_data: options.timestamp_data,
            compaction_listeners: Mutex::new(Vec::new()),
            autocompaction: Mutex::new(None),
        });

        let datastore = Datastore { shared };
        if options.autoload {
            let sh = datastore.shared.clone();
            let onload = options.onload;
            datastore.shared.executor.push_detached(
                true,
                Box::new(move || {
                    let result = Shared::load_database_task(&sh);
                    match onload {
                        Some(callback) => callback(result),
                        None => {
                            if let Err(e) = result {
                                log_error!("autoload failed: {}", e);
                            }
                        }
                    }
                }),
            );
        }
        Ok(datastore)
    }

    /// Load (or reload) the datafile: reset the indexes, replay the
    /// log, rebuild every index, compact, then open the gate for
    /// buffered operations.
    pub fn load_database(&self) -> Result<()> {
        let sh = self.shared.clone();
        self.shared
            .executor
            .submit(true, move || Shared::load_database_task(&sh))
    }

    /// Insert one document; returns a copy of what was stored
    pub fn insert(&self, doc: Value) -> Result<Value> {
        let sh = self.shared.clone();
        let mut inserted = self.shared.executor.submit(false, move || {
            let mut inner = sh.inner.lock();
            Shared::insert_docs_locked(&sh, &mut inner, vec![doc])
        })?;
        Ok(inserted.remove(0))
    }

    /// Insert a batch atomically: one key or unique-constraint error
    /// rejects the whole batch
    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            let mut inner = sh.inner.lock();
            Shared::insert_docs_locked(&sh, &mut inner, docs)
        })
    }

    /// Start building a query; the cursor executes through the
    /// executor when [`Cursor::exec`] is called
    pub fn find(&self, query: Value) -> Cursor {
        Cursor::new(self.shared.clone(), query)
    }

    /// First matching document, if any
    pub fn find_one(&self, query: Value) -> Result<Option<Value>> {
        let mut docs = self.find(query).limit(1).exec()?;
        Ok(docs.pop())
    }

    /// Number of matching documents, through the same candidate +
    /// filter path as `find`
    pub fn count(&self, query: Value) -> Result<usize> {
        let cursor = self.find(query);
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            let mut inner = sh.inner.lock();
            Ok(cursor.exec_locked(&sh, &mut inner)?.len())
        })
    }

    /// Apply an update expression to the matching documents
    pub fn update(&self, query: Value, update: Value, options: UpdateOptions) -> Result<UpdateResult> {
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            let mut inner = sh.inner.lock();
            Shared::update_locked(&sh, &mut inner, &query, &update, &options)
        })
    }

    /// Remove the first matching document (or all of them with
    /// `multi`); returns how many were removed
    pub fn remove(&self, query: Value, multi: bool) -> Result<usize> {
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            let mut inner = sh.inner.lock();
            let parsed = Query::parse(&query)?;
            Shared::remove_locked(&sh, &mut inner, &parsed, multi)
        })
    }

    /// Create a secondary index (and register its TTL when
    /// `expire_after_seconds` is set). A field that is already indexed
    /// is a no-op.
    pub fn ensure_index(&self, options: IndexOptions) -> Result<()> {
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            Shared::ensure_index_task(&sh, options)
        })
    }

    /// Drop a secondary index
    pub fn remove_index(&self, field_name: impl Into<String>) -> Result<()> {
        let field_name = field_name.into();
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            Shared::remove_index_task(&sh, &field_name)
        })
    }

    /// Rewrite the log so it holds exactly the live state
    pub fn compact_datafile(&self) -> Result<()> {
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            let mut inner = sh.inner.lock();
            let compacted = Shared::compact_locked(&sh, &mut inner)?;
            drop(inner);
            if compacted {
                sh.fire_compaction_done();
            }
            Ok(())
        })
    }

    /// Compact on a timer. Intervals below 5000 ms are raised to the
    /// floor; the timer dies with the datastore.
    pub fn set_autocompaction_interval(&self, interval_ms: u64) {
        const MINIMUM_INTERVAL_MS: u64 = 5000;
        let interval = Duration::from_millis(interval_ms.max(MINIMUM_INTERVAL_MS));

        self.stop_autocompaction();
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let weak = Arc::downgrade(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("vellum-autocompaction".to_string())
            .spawn(move || loop {
                match cancel_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(sh) = weak.upgrade() else { break };
                        let task_sh = sh.clone();
                        sh.executor.push_detached(
                            false,
                            Box::new(move || {
                                let mut inner = task_sh.inner.lock();
                                match Shared::compact_locked(&task_sh, &mut inner) {
                                    Ok(compacted) => {
                                        drop(inner);
                                        if compacted {
                                            task_sh.fire_compaction_done();
                                        }
                                    }
                                    Err(e) => log_error!("autocompaction failed: {}", e),
                                }
                            }),
                        );
                    }
                }
            });
        match spawned {
            Ok(_) => *self.shared.autocompaction.lock() = Some(cancel_tx),
            Err(e) => log_error!("could not start the autocompaction timer: {}", e),
        }
    }

    /// Cancel the autocompaction timer
    pub fn stop_autocompaction(&self) {
        self.shared.autocompaction.lock().take();
    }

    /// Register a listener fired after each successful compaction
    /// (runs on the executor thread)
    pub fn on_compaction_done(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.shared.compaction_listeners.lock().push(Box::new(listener));
    }

    /// Whether the initial load has completed
    pub fn is_ready(&self) -> bool {
        self.shared.executor.is_ready()
    }
}

impl Shared {
    pub(crate) fn fire_compaction_done(&self) {
        for listener in self.compaction_listeners.lock().iter() {
            listener();
        }
    }

    // DDL specs of every non-_id index, TTL registration included
    fn index_specs(inner: &Inner) -> Vec<IndexOptions> {
        inner
            .indexes
            .iter()
            .filter(|(name, _)| name.as_str() != "_id")
            .map(|(name, index)| {
                let mut options = index.options();
                options.expire_after_seconds = inner.ttl_indexes.get(name).copied();
                options
            })
            .collect()
    }

    fn compact_locked(_shared: &Arc<Shared>, inner: &mut Inner) -> Result<bool> {
        let docs = inner.indexes.id_index().all();
        let specs = Self::index_specs(inner);
        let values: Vec<&Value> = docs.iter().map(|d| d.as_ref()).collect();
        let compacted = inner.persistence.persist_cached_database(values, &specs)?;
        if compacted {
            log_debug!("compacted datafile, {} live documents", docs.len());
        }
        Ok(compacted)
    }

    fn load_database_task(shared: &Arc<Shared>) -> Result<()> {
        let mut inner = shared.inner.lock();
        inner.indexes.reset_data();

        if let Some(raw) = inner.persistence.read_raw()? {
            let loaded = inner.persistence.treat_raw_data(&raw)?;
            for spec in &loaded.indexes {
                inner.indexes.ensure(spec);
                if let Some(seconds) = spec.expire_after_seconds {
                    inner.ttl_indexes.insert(spec.field_name.clone(), seconds);
                }
            }
            let docs: Vec<SharedDoc> = loaded.docs.into_iter().map(Arc::new).collect();
            if let Err(e) = inner.indexes.add_documents(&docs) {
                inner.indexes.reset_data();
                return Err(e);
            }
            log_info!(
                "loaded {} documents and {} secondary indexes ({} corrupt lines)",
                docs.len(),
                loaded.indexes.len(),
                loaded.corrupt_lines
            );
            // A fresh load leaves behind a fresh, compacted log
            let compacted = Self::compact_locked(shared, &mut inner)?;
            drop(inner);
            if compacted {
                shared.fire_compaction_done();
            }
        } else {
            drop(inner);
        }
        shared.executor.process_buffer();
        Ok(())
    }

    fn insert_docs_locked(
        shared: &Arc<Shared>,
        inner: &mut Inner,
        docs: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let mut prepared: Vec<SharedDoc> = Vec::with_capacity(docs.len());
        for doc in docs {
            let doc = Self::prepare_document(shared, inner, &prepared, doc)?;
            prepared.push(Arc::new(doc));
        }
        inner.indexes.add_documents(&prepared)?;
        let values: Vec<Value> = prepared.iter().map(|d| d.as_ref().clone()).collect();
        inner.persistence.persist_new_state(&values)?;
        Ok(values)
    }

    // Deep-copy semantics come from ownership: the caller moved the
    // value in, and every stored/returned document is a fresh clone.
    fn prepare_document(
        shared: &Arc<Shared>,
        inner: &Inner,
        batch: &[SharedDoc],
        mut doc: Value,
    ) -> Result<Value> {
        let map = doc.as_object_mut().ok_or_else(|| {
            VellumError::InvalidUpdate("only mappings can be inserted".to_string())
        })?;

        if !map.contains_key("_id") {
            let id = Self::fresh_id(inner, batch);
            map.insert("_id".to_string(), Value::String(id));
        }
        if shared.timestamp_data {
            let now = now_date();
            map.entry("createdAt").or_insert_with(|| now.clone());
            map.entry("updatedAt").or_insert(now);
        }
        check_object(&doc)?;
        Ok(doc)
    }

    // A random id that collides neither with the _id index nor with
    // the batch being prepared
    fn fresh_id(inner: &Inner, batch: &[SharedDoc]) -> String {
        loop {
            let candidate = random_id(16);
            let in_index = !inner
                .indexes
                .id_index()
                .search(&Value::String(candidate.clone()))
                .is_empty();
            let in_batch = batch
                .iter()
                .any(|d| d.get("_id").and_then(Value::as_str) == Some(candidate.as_str()));
            if !in_index && !in_batch {
                return candidate;
            }
        }
    }

    // Candidate selection: first applicable of equality / $in / range
    // on an indexed top-level field, else a full scan of the _id index
    fn select_candidates(inner: &Inner, query: &Query) -> Vec<SharedDoc> {
        fn is_indexable_scalar(v: &Value) -> bool {
            matches!(
                v,
                Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
            ) || is_date(v)
        }

        for clause in query.field_clauses() {
            if let ClauseValue::Literal(v) = &clause.value {
                if is_indexable_scalar(v) {
                    if let Some(index) = inner.indexes.get(&clause.path) {
                        return index.search(v);
                    }
                }
            }
        }
        for clause in query.field_clauses() {
            if let ClauseValue::Operators(ops) = &clause.value {
                if let Some(index) = inner.indexes.get(&clause.path) {
                    for op in ops {
                        if let ComparisonOperator::In(members) = op {
                            return index.search_any(members);
                        }
                    }
                }
            }
        }
        for clause in query.field_clauses() {
            if let ClauseValue::Operators(ops) = &clause.value {
                if let Some(index) = inner.indexes.get(&clause.path) {
                    let mut bounds = Bounds::default();
                    let mut ranged = false;
                    for op in ops {
                        match op {
                            ComparisonOperator::Lt(v) => {
                                bounds.lt = Some(v.clone());
                                ranged = true;
                            }
                            ComparisonOperator::Lte(v) => {
                                bounds.lte = Some(v.clone());
                                ranged = true;
                            }
                            ComparisonOperator::Gt(v) => {
                                bounds.gt = Some(v.clone());
                                ranged = true;
                            }
                            ComparisonOperator::Gte(v) => {
                                bounds.gte = Some(v.clone());
                                ranged = true;
                            }
                            _ => {}
                        }
                    }
                    if ranged {
                        return index.between_bounds(&bounds);
                    }
                }
            }
        }
        inner.indexes.id_index().all()
    }

    /// Candidates for a query, with the TTL sweep applied: expired
    /// documents are filtered out of the result and their removal is
    /// queued behind the current task.
    pub(crate) fn get_candidates(
        shared: &Arc<Shared>,
        inner: &Inner,
        query: &Query,
        dont_expire_stale_docs: bool,
    ) -> Vec<SharedDoc> {
        let docs = Self::select_candidates(inner, query);
        if dont_expire_stale_docs || inner.ttl_indexes.is_empty() {
            return docs;
        }

        let now = now_millis();
        let mut valid = Vec::with_capacity(docs.len());
        let mut expired_ids: Vec<Value> = Vec::new();
        for doc in docs {
            let expired = inner.ttl_indexes.iter().any(|(field, seconds)| {
                get_dot_value(doc.as_ref(), field)
                    .and_then(|v| date_millis(&v))
                    .map(|ms| now - ms > seconds * 1000)
                    .unwrap_or(false)
            });
            if expired {
                if let Some(id) = doc.get("_id") {
                    expired_ids.push(id.clone());
                }
            } else {
                valid.push(doc);
            }
        }

        if !expired_ids.is_empty() {
            log_debug!("expiring {} stale documents", expired_ids.len());
        }
        for id in expired_ids {
            let weak = Arc::downgrade(shared);
            shared.executor.push_detached(
                false,
                Box::new(move || {
                    let Some(sh) = weak.upgrade() else { return };
                    let mut id_query = serde_json::Map::new();
                    id_query.insert("_id".to_string(), id);
                    match Query::parse(&Value::Object(id_query)) {
                        Ok(parsed) => {
                            let mut inner = sh.inner.lock();
                            if let Err(e) = Shared::remove_locked(&sh, &mut inner, &parsed, false) {
                                log_error!("ttl removal failed: {}", e);
                            }
                        }
                        Err(e) => log_error!("ttl removal failed: {}", e),
                    }
                }),
            );
        }
        valid
    }

    pub(crate) fn remove_locked(
        shared: &Arc<Shared>,
        inner: &mut Inner,
        query: &Query,
        multi: bool,
    ) -> Result<usize> {
        let candidates = Self::get_candidates(shared, inner, query, true);
        let mut tombstones = Vec::new();
        let mut removed = 0usize;
        for doc in candidates {
            if query.matches(doc.as_ref(), &shared.ordering) && (multi || removed == 0) {
                inner.indexes.remove_document(&doc);
                if let Some(id) = doc.get("_id") {
                    tombstones.push(tombstone_record(id));
                }
                removed += 1;
            }
        }
        inner.persistence.persist_new_state(&tombstones)?;
        Ok(removed)
    }

    fn update_locked(
        shared: &Arc<Shared>,
        inner: &mut Inner,
        query_value: &Value,
        update_value: &Value,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        let query = Query::parse(query_value)?;
        let expr = UpdateExpr::parse(update_value)?;

        if options.upsert {
            let candidates = Self::get_candidates(shared, inner, &query, false);
            let matched = candidates
                .iter()
                .any(|d| query.matches(d.as_ref(), &shared.ordering));
            if !matched {
                // Seed from the query literals (strict keys) unless the
                // update is a pure replacement
                let seed = match &expr {
                    UpdateExpr::Replacement(replacement) => replacement.clone(),
                    UpdateExpr::Modifiers(_) => {
                        let base = deep_copy(query_value, true);
                        modify(&base, &expr, &shared.ordering)?
                    }
                };
                let inserted = Self::insert_docs_locked(shared, inner, vec![seed])?;
                return Ok(UpdateResult {
                    num_affected: 1,
                    upsert: true,
                    affected_documents: Some(inserted),
                });
            }
        }

        let candidates = Self::get_candidates(shared, inner, &query, false);
        let mut pairs: Vec<(SharedDoc, SharedDoc)> = Vec::new();
        for doc in candidates {
            if query.matches(doc.as_ref(), &shared.ordering) && (options.multi || pairs.is_empty()) {
                let mut new_doc = modify(doc.as_ref(), &expr, &shared.ordering)?;
                if shared.timestamp_data {
                    if let Some(map) = new_doc.as_object_mut() {
                        if let Some(created) = doc.get("createdAt") {
                            map.insert("createdAt".to_string(), created.clone());
                        }
                        map.insert("updatedAt".to_string(), now_date());
                    }
                }
                pairs.push((doc.clone(), Arc::new(new_doc)));
            }
        }

        if pairs.is_empty() {
            return Ok(UpdateResult {
                num_affected: 0,
                upsert: false,
                affected_documents: options.return_updated_docs.then(Vec::new),
            });
        }

        inner.indexes.update_documents(&pairs)?;
        let new_values: Vec<Value> = pairs.iter().map(|(_, n)| n.as_ref().clone()).collect();
        inner.persistence.persist_new_state(&new_values)?;
        Ok(UpdateResult {
            num_affected: pairs.len(),
            upsert: false,
            affected_documents: options.return_updated_docs.then_some(new_values),
        })
    }

    fn ensure_index_task(shared: &Arc<Shared>, options: IndexOptions) -> Result<()> {
        if options.field_name.is_empty() {
            return Err(VellumError::MissingFieldName);
        }
        let mut inner = shared.inner.lock();
        if inner.indexes.contains(&options.field_name) {
            return Ok(());
        }
        inner.indexes.ensure(&options);
        if let Some(seconds) = options.expire_after_seconds {
            inner.ttl_indexes.insert(options.field_name.clone(), seconds);
        }

        let docs = inner.indexes.id_index().all();
        let build = match inner.indexes.get_mut(&options.field_name) {
            Some(index) => index.insert_all(&docs),
            None => Ok(()),
        };
        if let Err(e) = build {
            inner.indexes.remove_index(&options.field_name);
            inner.ttl_indexes.remove(&options.field_name);
            return Err(e);
        }

        inner
            .persistence
            .persist_new_state(&[index_created_record(&options)?])?;
        log_debug!("indexed field {}", options.field_name);
        Ok(())
    }

    fn remove_index_task(shared: &Arc<Shared>, field_name: &str) -> Result<()> {
        if field_name == "_id" {
            return Ok(());
        }
        let mut inner = shared.inner.lock();
        inner.indexes.remove_index(field_name);
        inner.ttl_indexes.remove(field_name);
        inner
            .persistence
            .persist_new_state(&[index_removed_record(field_name)])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn memory_db() -> Datastore {
        let db = Datastore::new(DatastoreOptions::new()).unwrap();
        db.load_database().unwrap();
        db
    }

    #[test]
    fn test_insert_assigns_a_random_16_char_id() {
        let db = memory_db();
        let doc = db.insert(json!({"planet": "Earth"})).unwrap();
        let id = doc["_id"].as_str().unwrap();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_insert_accepts_caller_supplied_unique_ids() {
        let db = memory_db();
        db.insert(json!({"_id": "one", "n": 1})).unwrap();
        assert!(matches!(
            db.insert(json!({"_id": "one", "n": 2})),
            Err(VellumError::UniqueViolation { .. })
        ));
    }

    #[test]
    fn test_insert_validates_keys() {
        let db = memory_db();
        assert!(matches!(
            db.insert(json!({"$bad": 1})),
            Err(VellumError::InvalidKey(_))
        ));
        assert!(matches!(
            db.insert(json!({"a.b": 1})),
            Err(VellumError::InvalidKey(_))
        ));
        assert!(db.insert(json!(42)).is_err());
    }

    #[test]
    fn test_insert_many_is_atomic() {
        let db = memory_db();
        db.ensure_index(IndexOptions::field("k").with_unique(true))
            .unwrap();
        db.insert(json!({"k": 1})).unwrap();
        let batch = vec![json!({"k": 2}), json!({"k": 1}), json!({"k": 3})];
        assert!(db.insert_many(batch).is_err());
        // Neither k=2 nor k=3 survived the failed batch
        assert_eq!(db.count(json!({})).unwrap(), 1);
    }

    #[test]
    fn test_find_and_count_share_semantics() {
        let db = memory_db();
        for age in [5, 57, 52, 23, 89] {
            db.insert(json!({"age": age})).unwrap();
        }
        assert_eq!(db.find(json!({})).exec().unwrap().len(), 5);
        assert_eq!(db.count(json!({"age": {"$gt": 23}})).unwrap(), 3);
        let ages: Vec<i64> = db
            .find(json!({"age": {"$gt": 23}}))
            .exec()
            .unwrap()
            .iter()
            .map(|d| d["age"].as_i64().unwrap())
            .collect();
        assert_eq!(ages.len(), 3);
        for age in [57, 52, 89] {
            assert!(ages.contains(&age));
        }
    }

    #[test]
    fn test_update_with_modifiers() {
        let db = memory_db();
        db.insert(json!({"_id": "X", "a": 1})).unwrap();
        let report = db
            .update(json!({"_id": "X"}), json!({"$inc": {"a": 2}}), UpdateOptions::default())
            .unwrap();
        assert_eq!(report.num_affected, 1);
        assert!(!report.upsert);
        let doc = db.find_one(json!({"_id": "X"})).unwrap().unwrap();
        assert_eq!(doc, json!({"_id": "X", "a": 3}));
    }

    #[test]
    fn test_update_cannot_change_id() {
        let db = memory_db();
        db.insert(json!({"_id": "X", "a": 1})).unwrap();
        assert!(matches!(
            db.update(json!({"_id": "X"}), json!({"_id": "Y", "a": 0}), UpdateOptions::default()),
            Err(VellumError::ImmutableId)
        ));
        let doc = db.find_one(json!({"_id": "X"})).unwrap().unwrap();
        assert_eq!(doc, json!({"_id": "X", "a": 1}));
    }

    #[test]
    fn test_update_multi() {
        let db = memory_db();
        for n in 0..4 {
            db.insert(json!({"n": n, "kind": if n % 2 == 0 { "even" } else { "odd" }}))
                .unwrap();
        }
        let single = db
            .update(json!({"kind": "even"}), json!({"$set": {"seen": true}}), UpdateOptions::default())
            .unwrap();
        assert_eq!(single.num_affected, 1);

        let multi = db
            .update(
                json!({"kind": "even"}),
                json!({"$set": {"seen": true}}),
                UpdateOptions { multi: true, ..Default::default() },
            )
            .unwrap();
        assert_eq!(multi.num_affected, 2);
        assert_eq!(db.count(json!({"seen": true})).unwrap(), 2);
    }

    #[test]
    fn test_update_returns_updated_docs_on_request() {
        let db = memory_db();
        db.insert(json!({"_id": "X", "a": 1})).unwrap();
        let report = db
            .update(
                json!({"_id": "X"}),
                json!({"$set": {"a": 2}}),
                UpdateOptions { return_updated_docs: true, ..Default::default() },
            )
            .unwrap();
        assert_eq!(report.affected_documents, Some(vec![json!({"_id": "X", "a": 2})]));
    }

    #[test]
    fn test_upsert_from_query_literals_and_modifiers() {
        let db = memory_db();
        let report = db
            .update(
                json!({"kind": "counter", "bucket": {"$in": ["a"]}}),
                json!({"$inc": {"n": 5}}),
                UpdateOptions { upsert: true, ..Default::default() },
            )
            .unwrap();
        assert!(report.upsert);
        assert_eq!(report.num_affected, 1);
        // Operator keys are stripped out of the seed; literals stay
        let doc = db.find_one(json!({"kind": "counter"})).unwrap().unwrap();
        assert_eq!(doc["n"], json!(5));
        assert_eq!(doc["bucket"], json!({}));
    }

    #[test]
    fn test_upsert_with_replacement() {
        let db = memory_db();
        let report = db
            .update(
                json!({"missing": true}),
                json!({"fresh": 1}),
                UpdateOptions { upsert: true, ..Default::default() },
            )
            .unwrap();
        assert!(report.upsert);
        let docs = report.affected_documents.unwrap();
        assert_eq!(docs[0]["fresh"], json!(1));
        assert!(docs[0].get("missing").is_none());
    }

    #[test]
    fn test_update_does_not_upsert_when_something_matches() {
        let db = memory_db();
        db.insert(json!({"k": 1, "n": 0})).unwrap();
        let report = db
            .update(
                json!({"k": 1}),
                json!({"$inc": {"n": 1}}),
                UpdateOptions { upsert: true, ..Default::default() },
            )
            .unwrap();
        assert!(!report.upsert);
        assert_eq!(db.count(json!({})).unwrap(), 1);
    }

    #[test]
    fn test_remove() {
        let db = memory_db();
        for n in 0..5 {
            db.insert(json!({"n": n})).unwrap();
        }
        assert_eq!(db.remove(json!({"n": {"$gte": 3}}), false).unwrap(), 1);
        assert_eq!(db.remove(json!({"n": {"$gte": 0}}), true).unwrap(), 4);
        assert_eq!(db.count(json!({})).unwrap(), 0);
        assert_eq!(db.remove(json!({"n": 99}), true).unwrap(), 0);
    }

    #[test]
    fn test_unique_index_rollback_keeps_both_indexes_consistent() {
        let db = memory_db();
        db.ensure_index(IndexOptions::field("name").with_unique(true))
            .unwrap();
        db.insert(json!({"name": "a"})).unwrap();
        assert!(matches!(
            db.insert(json!({"name": "a"})),
            Err(VellumError::UniqueViolation { .. })
        ));
        assert_eq!(db.count(json!({})).unwrap(), 1);
        assert_eq!(db.count(json!({"name": "a"})).unwrap(), 1);
    }

    #[test]
    fn test_ensure_index_requires_a_field_name() {
        let db = memory_db();
        assert!(matches!(
            db.ensure_index(IndexOptions::field("")),
            Err(VellumError::MissingFieldName)
        ));
    }

    #[test]
    fn test_ensure_index_over_existing_docs_rolls_back_on_violation() {
        let db = memory_db();
        db.insert(json!({"k": 1})).unwrap();
        db.insert(json!({"k": 1})).unwrap();
        assert!(matches!(
            db.ensure_index(IndexOptions::field("k").with_unique(true)),
            Err(VellumError::UniqueViolation { .. })
        ));
        // The failed index is gone: the same insert is accepted again
        db.insert(json!({"k": 1})).unwrap();
        assert_eq!(db.count(json!({"k": 1})).unwrap(), 3);
    }

    #[test]
    fn test_ensure_index_twice_is_a_noop() {
        let db = memory_db();
        db.ensure_index(IndexOptions::field("k")).unwrap();
        db.insert(json!({"k": 1})).unwrap();
        db.ensure_index(IndexOptions::field("k").with_unique(true))
            .unwrap();
        // Still the original non-unique definition
        db.insert(json!({"k": 1})).unwrap();
    }

    #[test]
    fn test_timestamp_data() {
        let db = Datastore::new(DatastoreOptions::new().with_timestamp_data(true)).unwrap();
        db.load_database().unwrap();
        let doc = db.insert(json!({"a": 1})).unwrap();
        assert!(is_date(&doc["createdAt"]));
        assert!(is_date(&doc["updatedAt"]));
        let created = doc["createdAt"].clone();

        db.update(json!({"a": 1}), json!({"$set": {"a": 2}}), UpdateOptions::default())
            .unwrap();
        let updated = db.find_one(json!({"a": 2})).unwrap().unwrap();
        assert_eq!(updated["createdAt"], created);
        assert!(is_date(&updated["updatedAt"]));
    }

    #[test]
    fn test_ttl_expiration() {
        let db = memory_db();
        db.ensure_index(IndexOptions::field("expire").with_expire_after_seconds(1))
            .unwrap();
        let stale = now_millis() - 10_000;
        db.insert(json!({"_id": "old", "expire": {"$$date": stale}}))
            .unwrap();
        db.insert(json!({"_id": "new", "expire": {"$$date": now_millis()}}))
            .unwrap();
        // Documents without the field never expire
        db.insert(json!({"_id": "plain"})).unwrap();

        let found = db.find(json!({})).exec().unwrap();
        let ids: Vec<&str> = found.iter().map(|d| d["_id"].as_str().unwrap()).collect();
        assert!(!ids.contains(&"old"));
        assert!(ids.contains(&"new"));
        assert!(ids.contains(&"plain"));

        // The scheduled removal ran after the scan returned
        assert_eq!(db.count(json!({"_id": "old"})).unwrap(), 0);
    }

    #[test]
    fn test_reserved_filename_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = Datastore::new(
            DatastoreOptions::new().with_filename(dir.path().join("store.db~")),
        );
        assert!(matches!(result, Err(VellumError::ReservedFilename(_))));
    }

    #[test]
    fn test_compaction_event() {
        let dir = TempDir::new().unwrap();
        let db = Datastore::new(
            DatastoreOptions::new().with_filename(dir.path().join("store.db")),
        )
        .unwrap();
        db.load_database().unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let fired = fired.clone();
            db.on_compaction_done(move || {
                fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        db.insert(json!({"a": 1})).unwrap();
        db.compact_datafile().unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffered_operations_wait_for_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        std::fs::write(&path, "{\"_id\":\"a\",\"n\":1}\n").unwrap();

        let db = Arc::new(
            Datastore::new(DatastoreOptions::new().with_filename(&path)).unwrap(),
        );
        assert!(!db.is_ready());

        // A find submitted before the load buffers until load_database
        // opens the gate
        let handle = {
            let db = db.clone();
            std::thread::spawn(move || db.count(json!({})).unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        db.load_database().unwrap();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_autoload_with_onload_callback() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        std::fs::write(&path, "{\"_id\":\"a\"}\n").unwrap();

        let (tx, rx) = bounded(1);
        let db = Datastore::new(
            DatastoreOptions::new()
                .with_filename(&path)
                .with_autoload(true)
                .with_onload(Box::new(move |result| {
                    let _ = tx.send(result.is_ok());
                })),
        )
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(db.count(json!({})).unwrap(), 1);
    }

    #[test]
    fn test_corrupt_datafile_keeps_the_executor_closed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        std::fs::write(&path, "garbage\nmore garbage\n{\"_id\":\"a\"}\n").unwrap();

        let db = Datastore::new(DatastoreOptions::new().with_filename(&path)).unwrap();
        assert!(matches!(
            db.load_database(),
            Err(VellumError::CorruptDatafile { .. })
        ));
        assert!(!db.is_ready());

        // A permissive threshold accepts the same file
        let db = Datastore::new(
            DatastoreOptions::new()
                .with_filename(&path)
                .with_corrupt_alert_threshold(0.9),
        )
        .unwrap();
        db.load_database().unwrap();
        assert_eq!(db.count(json!({})).unwrap(), 1);
    }

    #[test]
    fn test_candidate_selection_uses_indexes() {
        let db = memory_db();
        db.ensure_index(IndexOptions::field("city")).unwrap();
        for (i, city) in ["a", "b", "a", "c"].iter().enumerate() {
            db.insert(json!({"n": i, "city": city})).unwrap();
        }
        assert_eq!(db.count(json!({"city": "a"})).unwrap(), 2);
        assert_eq!(db.count(json!({"city": {"$in": ["b", "c"]}})).unwrap(), 2);
        db.ensure_index(IndexOptions::field("n")).unwrap();
        assert_eq!(db.count(json!({"n": {"$gte": 1, "$lt": 3}})).unwrap(), 2);
    }
}
