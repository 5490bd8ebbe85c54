// src/serialization.rs
// One document per line of UTF-8 text, plus the optional line-transform
// hook pair applied around every encode/decode.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, VellumError};
use crate::value::{check_object, random_id};

/// A line transform applied after serialization or before
/// deserialization (encryption, compression, ...)
pub type LineTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Encode one document as a single JSON line. Keys are validated
/// against the document key rules first. Dates are already tagged
/// mappings in memory, so they serialize as `{"$$date": <ms>}` with no
/// further work.
pub fn serialize(doc: &Value) -> Result<String> {
    check_object(doc)?;
    serde_json::to_string(doc).map_err(|e| VellumError::Serialization(e.to_string()))
}

/// Decode one line back into a document. A failure here is counted as
/// a corrupt line by the loader, not surfaced to callers directly.
pub fn deserialize(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| VellumError::Serialization(e.to_string()))
}

/// Inverse pair of line transforms. Validated at datastore
/// construction by round-tripping random strings.
#[derive(Clone)]
pub struct SerializationHooks {
    pub after_serialization: LineTransform,
    pub before_deserialization: LineTransform,
}

impl SerializationHooks {
    /// Build the pair from the two construction options. Supplying only
    /// one of the two fails with `BadHooks`; supplying both runs the
    /// round-trip probe: random strings of lengths 1..=29, ten probes
    /// per length, must survive encode-then-decode unchanged.
    pub fn from_options(
        after_serialization: Option<LineTransform>,
        before_deserialization: Option<LineTransform>,
    ) -> Result<Option<SerializationHooks>> {
        let hooks = match (after_serialization, before_deserialization) {
            (None, None) => return Ok(None),
            (Some(a), Some(b)) => SerializationHooks {
                after_serialization: a,
                before_deserialization: b,
            },
            _ => return Err(VellumError::BadHooks),
        };
        hooks.validate()?;
        Ok(Some(hooks))
    }

    fn validate(&self) -> Result<()> {
        for len in 1..=29 {
            for _ in 0..10 {
                let probe = random_id(len);
                let round_trip = (self.before_deserialization)(&(self.after_serialization)(&probe));
                if round_trip != probe {
                    return Err(VellumError::BadHooks);
                }
            }
        }
        Ok(())
    }

    pub fn encode(&self, line: &str) -> String {
        (self.after_serialization)(line)
    }

    pub fn decode(&self, line: &str) -> String {
        (self.before_deserialization)(line)
    }
}
