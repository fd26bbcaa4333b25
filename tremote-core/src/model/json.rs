//! Lenient accessors over daemon JSON objects
//!
//! The daemon omits fields it does not know and older versions send
//! integers as floats. Every accessor falls back to the zero value of its
//! type instead of failing, so one odd field never drops a whole snapshot.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub type JsonObject = Map<String, Value>;

pub(crate) fn int(object: &JsonObject, key: &str) -> i64 {
    object.get(key).map(value_to_int).unwrap_or(0)
}

pub(crate) fn value_to_int(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|float| float as i64))
        .unwrap_or(0)
}

pub(crate) fn float(object: &JsonObject, key: &str) -> f64 {
    object.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

pub(crate) fn boolean(object: &JsonObject, key: &str) -> bool {
    object.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn string(object: &JsonObject, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_default()
}

pub(crate) fn array<'a>(object: &'a JsonObject, key: &str) -> &'a [Value] {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub(crate) fn object<'a>(object: &'a JsonObject, key: &str) -> Option<&'a JsonObject> {
    object.get(key).and_then(Value::as_object)
}

/// Unix timestamp in seconds; zero and negative values mean "never".
pub(crate) fn date(object: &JsonObject, key: &str) -> Option<DateTime<Utc>> {
    match int(object, key) {
        seconds if seconds > 0 => DateTime::from_timestamp(seconds, 0),
        _ => None,
    }
}

/// Relative comparison for values that come back with rounding noise.
pub fn fuzzy_eq(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() * 1e12 <= a.abs().min(b.abs())
}

pub(crate) fn set_changed<T: PartialEq>(value: &mut T, new_value: T, changed: &mut bool) {
    if *value != new_value {
        *value = new_value;
        *changed = true;
    }
}

pub(crate) fn set_changed_float(value: &mut f64, new_value: f64, changed: &mut bool) {
    if !fuzzy_eq(*value, new_value) {
        *value = new_value;
        *changed = true;
    }
}
