// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Blob references inside document bodies, and the legacy `_attachments`
//! layout older peers require.

use halyard_store::BlobDigest;
use serde_json::{Map, Value};

pub const BLOB_TYPE_MARKER: &str = "blob";

/// If `dict` is a blob reference, its digest.
///
/// A blob reference carries `@type:"blob"` plus a `digest`; entries of an
/// `_attachments` dictionary are references whenever they carry a digest.
pub fn blob_ref_digest(dict: &Map<String, Value>) -> Option<BlobDigest> {
    if dict.get("@type").and_then(Value::as_str) != Some(BLOB_TYPE_MARKER) {
        return None;
    }
    dict.get("digest")?.as_str()?.parse().ok()
}

fn attachment_digest(dict: &Map<String, Value>) -> Option<BlobDigest> {
    dict.get("digest")?.as_str()?.parse().ok()
}

/// Deep iteration over every blob reference in `root`, including legacy
/// `_attachments` entries that carry a digest.
pub fn find_blob_references(root: &Value, callback: &mut dyn FnMut(&Map<String, Value>)) {
    fn walk(value: &Value, in_attachments: bool, callback: &mut dyn FnMut(&Map<String, Value>)) {
        match value {
            Value::Object(dict) => {
                if blob_ref_digest(dict).is_some()
                    || (in_attachments && attachment_digest(dict).is_some())
                {
                    callback(dict);
                }
                for (key, child) in dict {
                    walk(child, key.as_str() == "_attachments", callback);
                }
            },
            Value::Array(items) => {
                for child in items {
                    walk(child, false, callback);
                }
            },
            _ => {},
        }
    }
    walk(root, false, callback)
}

/// All distinct blob digests referenced by `root`.
pub fn collect_blob_digests(root: &Value) -> Vec<BlobDigest> {
    let mut digests = Vec::new();
    find_blob_references(root, &mut |dict| {
        if let Some(d) = blob_ref_digest(dict).or_else(|| attachment_digest(dict)) {
            if !digests.contains(&d) {
                digests.push(d);
            }
        }
    });
    digests
}

pub fn may_contain_blobs(root: &Value) -> bool {
    !collect_blob_digests(root).is_empty()
}

/// A body of the form `{"_removed": true, ...}` announces a doc revoked from
/// the peer's view; the puller purges it locally.
pub fn is_removed(root: &Value) -> bool {
    root.get("_removed").and_then(Value::as_bool).unwrap_or(false)
}

/// Strip `_`-prefixed meta properties a peer may have included redundantly.
/// `_attachments` and `_removed` are meaningful and survive. Returns the
/// stripped body and whether anything changed.
pub fn strip_meta_properties(root: &Value) -> (Value, bool) {
    match root {
        Value::Object(dict) => {
            let out: Map<String, Value> = dict
                .iter()
                .filter(|&(key, _)| {
                    !key.starts_with('_') || key.as_str() == "_attachments" || key.as_str() == "_removed"
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let changed = out.len() != dict.len();
            (Value::Object(out), changed)
        },
        other => (other.clone(), false),
    }
}

/// Duplicate blob references into a top-level `_attachments` dictionary, as
/// pre-blob peers expect: one `stub:true` entry per reference, keyed by the
/// reference's path, with `revpos` set to the sending revision's generation.
///
/// Idempotent: references whose digest is already present under
/// `_attachments` are not duplicated again.
pub fn encode_legacy_attachments(root: &Value, rev_generation: u64) -> Value {
    let dict = match root {
        Value::Object(dict) => dict,
        _ => return root.clone(),
    };

    let mut existing: Vec<BlobDigest> = Vec::new();
    if let Some(Value::Object(atts)) = dict.get("_attachments") {
        for entry in atts.values() {
            if let Value::Object(entry) = entry {
                if let Some(d) = attachment_digest(entry) {
                    existing.push(d);
                }
            }
        }
    }

    let mut added: Map<String, Value> = Map::new();
    collect_refs_with_path(root, "", &mut |path, blob| {
        let digest = match blob_ref_digest(blob) {
            Some(d) => d,
            None => return,
        };
        if existing.contains(&digest) {
            return;
        }
        let mut entry = blob.clone();
        entry.remove("@type");
        entry.insert("stub".into(), Value::Bool(true));
        entry.insert("revpos".into(), Value::from(rev_generation));
        added.insert(format!("blob_{}", path), Value::Object(entry));
        existing.push(digest);
    });

    if added.is_empty() {
        return root.clone();
    }
    let mut out = dict.clone();
    let atts = out
        .entry("_attachments")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(atts) = atts {
        atts.extend(added);
    }
    Value::Object(out)
}

fn collect_refs_with_path(
    value: &Value,
    path: &str,
    callback: &mut dyn FnMut(&str, &Map<String, Value>),
) {
    match value {
        Value::Object(dict) => {
            if blob_ref_digest(dict).is_some() {
                callback(path, dict);
                return;
            }
            for (key, child) in dict {
                if key.as_str() == "_attachments" {
                    continue;
                }
                collect_refs_with_path(child, &format!("{}/{}", path, key), callback);
            }
        },
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_refs_with_path(child, &format!("{}/{}", path, i), callback);
            }
        },
        _ => {},
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn digest_str(content: &[u8]) -> String {
        BlobDigest::compute(content).to_string()
    }

    fn body_with_blob() -> Value {
        json!({
            "title": "report",
            "cover": {
                "@type": "blob",
                "digest": digest_str(b"img"),
                "length": 3,
                "content_type": "image/png"
            }
        })
    }

    #[test]
    fn finds_refs_and_legacy_attachments() {
        let body = json!({
            "x": {"@type": "blob", "digest": digest_str(b"a"), "length": 1},
            "_attachments": {
                "file": {"digest": digest_str(b"b"), "stub": true}
            },
            "not_a_blob": {"digest": "sha256-but-no-type"}
        });
        let digests = collect_blob_digests(&body);
        assert_eq!(digests.len(), 2);
    }

    #[test]
    fn legacy_transform_adds_stub_entries() {
        let out = encode_legacy_attachments(&body_with_blob(), 3);
        let atts = out.get("_attachments").unwrap().as_object().unwrap();
        let entry = atts.get("blob_/cover").unwrap();
        assert_eq!(entry.get("stub"), Some(&json!(true)));
        assert_eq!(entry.get("revpos"), Some(&json!(3)));
        assert_eq!(entry.get("digest"), Some(&json!(digest_str(b"img"))));
        assert!(entry.get("@type").is_none());
        // The inline reference is left in place.
        assert_eq!(out.get("cover"), body_with_blob().get("cover"));
    }

    #[test]
    fn legacy_transform_is_idempotent() {
        let once = encode_legacy_attachments(&body_with_blob(), 3);
        let twice = encode_legacy_attachments(&once, 4);
        assert_eq!(once, twice);
    }

    #[test]
    fn strip_meta_keeps_attachments_and_removed() {
        let (stripped, changed) = strip_meta_properties(&json!({
            "_id": "x", "_rev": "1-aa", "_attachments": {}, "_removed": true, "a": 1
        }));
        assert!(changed);
        assert_eq!(stripped, json!({"_attachments": {}, "_removed": true, "a": 1}));

        let (same, changed) = strip_meta_properties(&json!({"a": 1}));
        assert!(!changed);
        assert_eq!(same, json!({"a": 1}));
    }
}
