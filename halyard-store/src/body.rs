// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::fmt;

use bytes::Bytes;
use serde_json::Value;

use crate::error::Error;

/// An encoded document body.
///
/// The encoding is treated as an opaque binary dictionary with a canonical
/// form: here, JSON with object keys sorted. Two bodies with the same
/// canonical bytes are the same body.
#[derive(Clone, Default, Eq, PartialEq, Hash)]
pub struct Body(Bytes);

impl Body {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Encode a JSON value in canonical form.
    pub fn from_value(value: &Value) -> Self {
        // serde_json object maps are BTreeMap-backed, so emission is already
        // key-sorted.
        Self(Bytes::from(
            serde_json::to_vec(value).expect("JSON value must encode"),
        ))
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(Self::from_value(&parse(json.as_bytes())?))
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        if self.0.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        parse(&self.0)
    }

    /// Re-encode into canonical form, eg. after receiving bytes encoded with
    /// a peer's ephemeral shared keys.
    pub fn canonicalized(&self) -> Result<Self, Error> {
        Ok(Self::from_value(&self.to_value()?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn parse(bytes: &[u8]) -> Result<Value, Error> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::CorruptRevisionData(format!("unparseable body: {}", e)))
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.len() <= 120 => write!(f, "Body({})", s),
            _ => write!(f, "Body({} bytes)", self.0.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_sorts_keys() {
        let a = Body::from_json(r#"{"b":1,"a":2}"#).unwrap();
        let b = Body::from_json(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), br#"{"a":2,"b":1}"#);
    }

    #[test]
    fn empty_body_reads_as_empty_dict() {
        assert_eq!(
            Body::empty().to_value().unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn garbage_is_corrupt() {
        assert!(matches!(
            Body::from_bytes(&b"{nope"[..]).to_value(),
            Err(Error::CorruptRevisionData(_))
        ));
    }
}
