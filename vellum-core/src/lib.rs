// vellum-core/src/lib.rs
// Embedded, single-process document database: schema-less documents in
// one append-only log with periodic compaction, a MongoDB-style
// query/update language, secondary indexes and TTL expiration.

#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]

pub mod compare;
pub mod cursor;
pub mod datastore;
pub mod error;
pub mod executor;
pub mod index;
pub mod logging;
pub mod persistence;
pub mod projection;
pub mod query;
pub mod serialization;
pub mod storage;
pub mod update;
pub mod value;

// Public exports
pub use compare::{are_things_equal, StringComparator, ValueOrdering};
pub use cursor::Cursor;
pub use datastore::{
    Datastore, DatastoreOptions, OnLoadCallback, UpdateOptions, UpdateResult,
};
pub use error::{Result, VellumError};
pub use index::IndexOptions;
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use query::{Query, WherePredicate};
pub use serialization::LineTransform;
pub use value::{date_from_datetime, date_millis, is_date, make_date, now_date};
