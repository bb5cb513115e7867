// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Structural JSON deltas.
//!
//! A delta against a base object is itself an object: a changed key maps to
//! `[newValue]`, a removed key to `[]`, and a nested object edit recurses as
//! a plain object. A delta whose root is `[newValue]` replaces the whole
//! body. Applying the delta of `old -> new` to `old` yields exactly `new`.

use serde_json::{Map, Value};

use crate::error::Error;

/// Compute the delta from `old` to `new`. `None` means the values are equal.
pub fn create_delta(old: &Value, new: &Value) -> Option<Value> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => Some(Value::Object(diff_objects(old, new))),
        _ => Some(replacement(new)),
    }
}

fn diff_objects(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();
    for (key, new_value) in new {
        match old.get(key) {
            None => {
                delta.insert(key.clone(), replacement(new_value));
            },
            Some(old_value) if old_value == new_value => {},
            Some(Value::Object(old_sub)) => match new_value {
                Value::Object(new_sub) => {
                    delta.insert(key.clone(), Value::Object(diff_objects(old_sub, new_sub)));
                },
                other => {
                    delta.insert(key.clone(), replacement(other));
                },
            },
            Some(_) => {
                delta.insert(key.clone(), replacement(new_value));
            },
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            delta.insert(key.clone(), Value::Array(Vec::new()));
        }
    }
    delta
}

fn replacement(value: &Value) -> Value {
    Value::Array(vec![value.clone()])
}

/// Apply `delta` to `base`.
pub fn apply_delta(base: &Value, delta: &Value) -> Result<Value, Error> {
    match delta {
        Value::Array(arr) => match arr.as_slice() {
            [new] => Ok(new.clone()),
            _ => Err(corrupt("root replacement must hold exactly one value")),
        },
        Value::Object(edits) => match base {
            Value::Object(base) => apply_object(base, edits),
            _ => Err(corrupt("object delta applied to non-object base")),
        },
        _ => Err(corrupt("delta must be an object or a replacement array")),
    }
}

fn apply_object(base: &Map<String, Value>, edits: &Map<String, Value>) -> Result<Value, Error> {
    let mut out = base.clone();
    for (key, edit) in edits {
        match edit {
            Value::Array(arr) => match arr.as_slice() {
                [] => {
                    out.remove(key);
                },
                [new] => {
                    out.insert(key.clone(), new.clone());
                },
                _ => return Err(corrupt("replacement must hold exactly one value")),
            },
            Value::Object(sub_edits) => {
                let sub = base
                    .get(key)
                    .ok_or_else(|| corrupt("nested edit of a missing key"))?;
                match sub {
                    Value::Object(sub_base) => {
                        out.insert(key.clone(), apply_object(sub_base, sub_edits)?);
                    },
                    _ => return Err(corrupt("nested edit of a non-object value")),
                }
            },
            _ => return Err(corrupt("edit must be an array or nested object")),
        }
    }
    Ok(Value::Object(out))
}

fn corrupt(why: &str) -> Error {
    Error::CorruptDelta(why.into())
}
