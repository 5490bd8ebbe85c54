// src/compare.rs
// Total order and structural equality over document values.
//
// Type-band order: undefined < null < number < string < boolean < date
// < sequence < mapping. Within a band values compare naturally; a
// caller-supplied string comparator overrides the default for all
// string comparisons (sorts, index keys, $lt/$gt).

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::value::date_millis;

/// Caller-supplied string comparator
pub type StringComparator = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Comparison context threaded through sorts, index trees and range
/// operators. Cheap to clone.
#[derive(Clone, Default)]
pub struct ValueOrdering {
    compare_strings: Option<StringComparator>,
}

fn type_band(v: &Value) -> u8 {
    if date_millis(v).is_some() {
        return 4;
    }
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn number_value(v: &Value) -> f64 {
    v.as_f64().unwrap_or(0.0)
}

impl ValueOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comparator(compare_strings: StringComparator) -> Self {
        ValueOrdering {
            compare_strings: Some(compare_strings),
        }
    }

    pub fn cmp_strings(&self, a: &str, b: &str) -> Ordering {
        match &self.compare_strings {
            Some(f) => f(a, b),
            None => a.cmp(b),
        }
    }

    /// Total order over document values
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let (band_a, band_b) = (type_band(a), type_band(b));
        if band_a != band_b {
            return band_a.cmp(&band_b);
        }
        match band_a {
            0 => Ordering::Equal,
            1 => number_value(a)
                .partial_cmp(&number_value(b))
                .unwrap_or(Ordering::Equal),
            2 => self.cmp_strings(a.as_str().unwrap_or(""), b.as_str().unwrap_or("")),
            3 => a.as_bool().cmp(&b.as_bool()),
            4 => date_millis(a).cmp(&date_millis(b)),
            5 => self.compare_arrays(
                a.as_array().map(Vec::as_slice).unwrap_or(&[]),
                b.as_array().map(Vec::as_slice).unwrap_or(&[]),
            ),
            _ => self.compare_objects(a, b),
        }
    }

    /// Order with the undefined band below everything else
    pub fn compare_opt(&self, a: Option<&Value>, b: Option<&Value>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(av), Some(bv)) => self.compare(av, bv),
        }
    }

    // Lexicographic by element; shorter wins ties
    fn compare_arrays(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (x, y) in a.iter().zip(b.iter()) {
            let cmp = self.compare(x, y);
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        a.len().cmp(&b.len())
    }

    // Values at the i-th sorted key, pairwise; shorter wins ties
    fn compare_objects(&self, a: &Value, b: &Value) -> Ordering {
        let empty = serde_json::Map::new();
        let ma = a.as_object().unwrap_or(&empty);
        let mb = b.as_object().unwrap_or(&empty);
        // serde_json maps iterate in sorted key order
        for ((_, va), (_, vb)) in ma.iter().zip(mb.iter()) {
            let cmp = self.compare(va, vb);
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        ma.len().cmp(&mb.len())
    }
}

/// Structural equality. Sequences are equal only if same length and
/// element-wise equal; numbers compare by value (`1` equals `1.0`);
/// the undefined case is handled by callers (it is never equal).
pub fn are_things_equal(a: &Value, b: &Value) -> bool {
    match (date_millis(a), date_millis(b)) {
        (Some(x), Some(y)) => return x == y,
        (Some(_), None) | (None, Some(_)) => return false,
        (None, None) => {}
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => number_value(a) == number_value(b),
        (Value::Array(xa), Value::Array(xb)) => {
            xa.len() == xb.len() && xa.iter().zip(xb.iter()).all(|(x, y)| are_things_equal(x, y))
        }
        (Value::Object(ma), Value::Object(mb)) => {
            ma.len() == mb.len()
                && ma.iter().all(|(k, va)| {
                    mb.get(k).map(|vb| are_things_equal(va, vb)).unwrap_or(false)
                })
        }
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        _ => false,
    }
}

/// `$lt/$lte/$gt/$gte` comparison: defined only between comparable
/// scalars (number/number, string/string, date/date), `None` otherwise.
pub fn compare_scalars(a: &Value, b: &Value, ordering: &ValueOrdering) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (date_millis(a), date_millis(b)) {
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => number_value(a).partial_cmp(&number_value(b)),
        (Value::String(x), Value::String(y)) => Some(ordering.cmp_strings(x, y)),
        _ => None,
    }
}
