// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Deltas let a reader that already holds an ancestor value catch up with a
//! patch instead of the full value. The only format is a JSON patch
//! (RFC 6902) from the ancestor document to the new document.

use serde_json::{json, Map, Value};

/// How a record's value relates to its ancestor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum DeltaType {
    /// The value is always delivered in full.
    #[default]
    None = 0,
    /// A JSON patch against the ancestor value is kept alongside the value.
    JsonPatch = 1,
}

impl DeltaType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::JsonPatch),
            _ => None,
        }
    }
}

/// Builds the JSON patch that turns `ancestor` into `value`. Returns `None`
/// if either side is not valid JSON.
pub fn json_patch(ancestor: &[u8], value: &[u8]) -> Option<Vec<u8>> {
    let from: Value = serde_json::from_slice(ancestor).ok()?;
    let to: Value = serde_json::from_slice(value).ok()?;

    let mut ops = Vec::new();
    diff(&mut String::new(), &from, &to, &mut ops);

    serde_json::to_vec(&Value::Array(ops)).ok()
}

fn diff(path: &mut String, from: &Value, to: &Value, ops: &mut Vec<Value>) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => diff_objects(path, a, b, ops),
        // arrays are diffed by position only when the length is unchanged,
        // a resized array is replaced whole
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&i.to_string());
                diff(path, x, y, ops);
                path.truncate(len);
            }
        }
        (a, b) if a == b => {}
        (_, b) => ops.push(json!({ "op": "replace", "path": path.as_str(), "value": b })),
    }
}

fn diff_objects(path: &mut String, a: &Map<String, Value>, b: &Map<String, Value>, ops: &mut Vec<Value>) {
    for (key, x) in a {
        let len = path.len();
        push_token(path, key);
        match b.get(key) {
            Some(y) => diff(path, x, y, ops),
            None => ops.push(json!({ "op": "remove", "path": path.as_str() })),
        }
        path.truncate(len);
    }

    for (key, y) in b {
        if !a.contains_key(key) {
            let len = path.len();
            push_token(path, key);
            ops.push(json!({ "op": "add", "path": path.as_str(), "value": y }));
            path.truncate(len);
        }
    }
}

// json pointer escaping, `~` before `/`
fn push_token(path: &mut String, token: &str) {
    path.push('/');
    path.push_str(&token.replace('~', "~0").replace('/', "~1"));
}
