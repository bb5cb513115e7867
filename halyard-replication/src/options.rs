// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{fmt, sync::Arc, time::Duration};

use halyard_store::{Body, CollectionSpec, DocId, RevFlags, RevId};
use serde_json::Value;

use crate::tuning;

/// Replication mode for one direction of one collection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub enum Mode {
    #[default]
    Disabled,
    /// Serve the peer's requests; never initiate.
    Passive,
    OneShot,
    Continuous,
}

impl Mode {
    pub fn is_active(self) -> bool {
        matches!(self, Self::OneShot | Self::Continuous)
    }

    pub fn is_enabled(self) -> bool {
        self != Self::Disabled
    }
}

/// Decision callback applied to outgoing (push) or incoming (pull)
/// revisions. Returning false skips (push) or rejects (pull) the revision.
pub type ReplicationFilter =
    Arc<dyn Fn(&CollectionSpec, &DocId, &RevId, RevFlags, &Body) -> bool + Send + Sync>;

/// Hook decrypting encrypted sub-values of an incoming body.
pub type PropertyDecryptor = Arc<dyn Fn(&DocId, Value) -> Result<Value, crate::Error> + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProgressLevel {
    #[default]
    Summary,
    PerDocument,
    PerAttachment,
}

/// Per-collection replication options.
#[derive(Clone)]
pub struct CollectionOptions {
    pub spec: CollectionSpec,
    pub push: Mode,
    pub pull: Mode,
    pub channels: Vec<String>,
    pub doc_ids: Option<Vec<DocId>>,
    pub push_filter: Option<ReplicationFilter>,
    pub pull_filter: Option<ReplicationFilter>,
    pub skip_deleted: bool,
    /// Announce changes with `proposeChanges` and honor the server's
    /// accept/reject verdicts (version-vector peers).
    pub propose_changes: bool,
}

impl CollectionOptions {
    pub fn new(spec: CollectionSpec) -> Self {
        Self {
            spec,
            push: Mode::Disabled,
            pull: Mode::Disabled,
            channels: Vec::new(),
            doc_ids: None,
            push_filter: None,
            pull_filter: None,
            skip_deleted: false,
            propose_changes: false,
        }
    }

    pub fn with_push(mut self, mode: Mode) -> Self {
        self.push = mode;
        self
    }

    pub fn with_pull(mut self, mode: Mode) -> Self {
        self.pull = mode;
        self
    }

    pub fn continuous(&self) -> bool {
        self.push == Mode::Continuous || self.pull == Mode::Continuous
    }
}

impl fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("spec", &self.spec)
            .field("push", &self.push)
            .field("pull", &self.pull)
            .field("channels", &self.channels)
            .field("doc_ids", &self.doc_ids)
            .field("skip_deleted", &self.skip_deleted)
            .field("propose_changes", &self.propose_changes)
            .finish()
    }
}

/// Options for a whole replicator.
#[derive(Clone)]
pub struct Options {
    pub collections: Vec<CollectionOptions>,
    /// The remote's URL, used (with `remote_unique_id`) to key checkpoints
    /// and the remote-DB registry.
    pub remote_url: String,
    /// Overrides the URL as remote identity, for peers without stable URLs.
    pub remote_unique_id: Option<String>,
    /// Name of a server-side filter (`sync_gateway/bychannel` for 3.0
    /// channel filtering), forwarded in `subChanges`.
    pub filter_name: Option<String>,
    pub filter_params: Option<Value>,
    pub disable_deltas: bool,
    pub disable_blob_support: bool,
    /// Refuse `rev` messages that would create a conflicting branch.
    pub no_incoming_conflicts: bool,
    /// Purge docs the peer announces as `_removed` (else they surface on the
    /// document-ended stream only).
    pub auto_purge: bool,
    pub progress_level: ProgressLevel,
    pub checkpoint_save_delay: Duration,
    pub property_decryptor: Option<PropertyDecryptor>,
}

impl Options {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            collections: Vec::new(),
            remote_url: remote_url.into(),
            remote_unique_id: None,
            filter_name: None,
            filter_params: None,
            disable_deltas: false,
            disable_blob_support: false,
            no_incoming_conflicts: false,
            auto_purge: true,
            progress_level: ProgressLevel::default(),
            checkpoint_save_delay: tuning::DEFAULT_CHECKPOINT_SAVE_DELAY,
            property_decryptor: None,
        }
    }

    pub fn with_collection(mut self, coll: CollectionOptions) -> Self {
        self.collections.push(coll);
        self
    }

    /// The string identifying the remote database: the unique ID if set,
    /// else the URL.
    pub fn remote_identity(&self) -> &str {
        self.remote_unique_id.as_deref().unwrap_or(&self.remote_url)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Options")
            .field("collections", &self.collections)
            .field("remote_url", &self.remote_url)
            .field("remote_unique_id", &self.remote_unique_id)
            .field("filter_name", &self.filter_name)
            .field("disable_deltas", &self.disable_deltas)
            .field("disable_blob_support", &self.disable_blob_support)
            .field("no_incoming_conflicts", &self.no_incoming_conflicts)
            .field("auto_purge", &self.auto_purge)
            .finish()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Passive => "passive",
            Self::OneShot => "one-shot",
            Self::Continuous => "continuous",
        };
        f.write_str(s)
    }
}
