// src/projection.rs
// Pick/omit projections over dot paths. A pick projection builds a new
// document with $set; an omit projection copies the input and $unsets
// each listed path. `_id` may always be toggled explicitly.

use serde_json::Value;

use crate::error::{Result, VellumError};
use crate::query::operators::truthy;
use crate::update::{set_dot, unset_dot};
use crate::value::get_dot_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Pick,
    Omit,
}

/// A parsed projection expression
#[derive(Debug, Clone)]
pub struct Projection {
    mode: Option<Mode>,
    paths: Vec<String>,
    keep_id: bool,
}

impl Projection {
    /// Parse a `{path: 0|1, ...}` mapping. Mixing 0 and 1 fails with
    /// `MixedProjection`, except for the `_id` toggle.
    pub fn parse(projection: &Value) -> Result<Projection> {
        let map = projection.as_object().ok_or_else(|| {
            VellumError::InvalidQuery("a projection must be a mapping".to_string())
        })?;

        let mut mode = None;
        let mut paths = Vec::new();
        let mut keep_id = true;
        for (path, action) in map {
            let pick = truthy(action);
            if path == "_id" {
                keep_id = pick;
                continue;
            }
            let this_mode = if pick { Mode::Pick } else { Mode::Omit };
            match mode {
                None => mode = Some(this_mode),
                Some(m) if m != this_mode => return Err(VellumError::MixedProjection),
                Some(_) => {}
            }
            paths.push(path.clone());
        }
        Ok(Projection { mode, paths, keep_id })
    }

    /// Apply the projection, producing a fresh document copy
    pub fn apply(&self, doc: &Value) -> Result<Value> {
        let mut out = match self.mode {
            // Empty projection: the input unchanged (except an explicit
            // _id toggle)
            None => doc.clone(),
            Some(Mode::Pick) => {
                let mut picked = Value::Object(serde_json::Map::new());
                for path in &self.paths {
                    if let Some(v) = get_dot_value(doc, path) {
                        set_dot(&mut picked, path, v)?;
                    }
                }
                picked
            }
            Some(Mode::Omit) => {
                let mut copy = doc.clone();
                for path in &self.paths {
                    unset_dot(&mut copy, path)?;
                }
                copy
            }
        };

        if let Some(map) = out.as_object_mut() {
            if self.keep_id {
                if let (None, Some(id)) = (map.get("_id"), doc.get("_id")) {
                    map.insert("_id".to_string(), id.clone());
                }
            } else {
                map.remove("_id");
            }
        }
        Ok(out)
    }
}
