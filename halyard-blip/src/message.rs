// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::WireError;

/// Message profiles used by the replicator.
pub mod profiles {
    pub const GET_CHECKPOINT: &str = "getCheckpoint";
    pub const SET_CHECKPOINT: &str = "setCheckpoint";
    pub const GET_COLLECTIONS: &str = "getCollections";
    pub const SUB_CHANGES: &str = "subChanges";
    pub const CHANGES: &str = "changes";
    pub const PROPOSE_CHANGES: &str = "proposeChanges";
    pub const REV: &str = "rev";
    pub const NO_REV: &str = "norev";
    pub const GET_ATTACHMENT: &str = "getAttachment";
    pub const PROVE_ATTACHMENT: &str = "proveAttachment";
}

/// Well-known property names.
pub mod properties {
    pub const PROFILE: &str = "Profile";
    pub const COLLECTION: &str = "collection";
    pub const CLIENT: &str = "client";
    pub const REV: &str = "rev";
    pub const ID: &str = "id";
    pub const SEQUENCE: &str = "sequence";
    pub const HISTORY: &str = "history";
    pub const DELETED: &str = "deleted";
    pub const NO_CONFLICTS: &str = "noconflicts";
    pub const DELTA_SRC: &str = "deltaSrc";
    pub const SINCE: &str = "since";
    pub const CONTINUOUS: &str = "continuous";
    pub const BATCH: &str = "batch";
    pub const ACTIVE_ONLY: &str = "activeOnly";
    pub const REVOCATIONS: &str = "revocations";
    pub const FILTER: &str = "filter";
    pub const CHANNELS: &str = "channels";
    pub const DIGEST: &str = "digest";
    pub const MAX_HISTORY: &str = "maxHistory";
    pub const BLOBS: &str = "blobs";
    pub const DELTAS: &str = "deltas";
    pub const ERROR_DOMAIN: &str = "Error-Domain";
    pub const ERROR_CODE: &str = "Error-Code";
}

/// Flat string dictionary attached to every message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("1"))
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An outbound request under construction.
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    pub properties: Properties,
    pub body: Bytes,
    /// Urgent messages win scheduling ties on the wire; change lists are sent
    /// urgent so the pusher is not starved of revs to send.
    pub urgent: bool,
    pub compressed: bool,
    pub no_reply: bool,
}

impl MessageBuilder {
    pub fn new(profile: &str) -> Self {
        let mut properties = Properties::default();
        properties.insert(properties::PROFILE, profile);
        Self {
            properties,
            body: Bytes::new(),
            urgent: false,
            compressed: false,
            no_reply: false,
        }
    }

    pub fn property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a JSON value as the body.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not representable as JSON (eg. a map with
    /// non-string keys), which is a programming error at the call site.
    pub fn json_body<T: Serialize>(self, value: &T) -> Self {
        let bytes = serde_json::to_vec(value).expect("value must be JSON-representable");
        self.body(bytes)
    }
}

/// A response to a request: properties plus optional body.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub properties: Properties,
    pub body: Bytes,
}

impl Response {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json_body<T: Serialize>(self, value: &T) -> Self {
        let bytes = serde_json::to_vec(value).expect("value must be JSON-representable");
        self.with_body(bytes)
    }

    pub fn json_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A request received from the peer.
///
/// Dropping a [`MessageIn`] without responding releases the reply handle,
/// which the sender observes as a disconnect.
#[derive(Debug)]
pub struct MessageIn {
    pub properties: Properties,
    pub body: Bytes,
    pub urgent: bool,
    pub(crate) reply: Option<oneshot::Sender<Result<Response, WireError>>>,
}

impl MessageIn {
    pub fn profile(&self) -> &str {
        self.properties.get(properties::PROFILE).unwrap_or("")
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key)
    }

    pub fn json_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn wants_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Send a successful response. A no-op if the request was `noreply` or
    /// was already responded to.
    pub fn respond(&mut self, response: Response) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Ok(response));
        }
    }

    pub fn respond_ok(&mut self) {
        self.respond(Response::empty())
    }

    pub fn respond_error(&mut self, error: WireError) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(error));
        }
    }
}
