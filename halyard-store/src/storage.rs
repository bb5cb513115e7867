// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;

use crate::{
    body::Body,
    error::Error,
    revid::RevId,
    types::{CollectionSpec, DocFlags, DocId, PeerId, RemoteDbId, RevFlags, Sequence},
};

/// Names of the raw key-value stores the replicator persists state in.
pub mod stores {
    /// Local checkpoints, keyed by derived checkpoint ID.
    pub const LOCAL_CHECKPOINTS: &str = "checkpoints";
    /// Checkpoints saved on behalf of peers (passive role), keyed by the
    /// client-supplied ID.
    pub const PEER_CHECKPOINTS: &str = "peerCheckpoints";
    /// Database info: UUIDs.
    pub const INFO: &str = "info";
}

/// How much of a document to load.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentLevel {
    /// Flags, current revision ID, sequence; no bodies.
    Metadata,
    /// Metadata plus the current revision's body.
    CurrentRev,
    /// Metadata plus every retained revision body.
    All,
}

/// A revision as stored.
#[derive(Clone, Debug)]
pub struct SavedRev {
    pub rev_id: RevId,
    pub flags: RevFlags,
    pub sequence: Sequence,
    pub parent: Option<RevId>,
    pub body: Option<Body>,
}

impl SavedRev {
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }
}

/// A document and (a slice of) its revision history.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: DocId,
    pub flags: DocFlags,
    /// Revisions, current first.
    pub revs: Vec<SavedRev>,
    pub remote_ancestors: BTreeMap<RemoteDbId, RevId>,
    /// Expiration timestamp (seconds since epoch), zero meaning none.
    pub expiration: u64,
}

impl Document {
    pub fn current(&self) -> &SavedRev {
        &self.revs[0]
    }

    pub fn sequence(&self) -> Sequence {
        self.current().sequence
    }

    pub fn rev(&self, id: &RevId) -> Option<&SavedRev> {
        self.revs.iter().find(|r| &r.rev_id == id)
    }

    pub fn contains(&self, id: &RevId) -> bool {
        self.rev(id).is_some()
    }

    /// The ancestry of `rev`, parent-to-root, following stored parent links.
    pub fn ancestry_of<'a>(&'a self, rev: &RevId) -> Vec<&'a SavedRev> {
        let mut out = Vec::new();
        let mut cursor = self.rev(rev).and_then(|r| r.parent.as_ref());
        while let Some(id) = cursor {
            match self.rev(id) {
                Some(r) => {
                    out.push(r);
                    cursor = r.parent.as_ref();
                },
                None => break,
            }
        }
        out
    }
}

/// A change produced by sequence enumeration or an observer.
#[derive(Clone, Debug)]
pub struct ChangeEntry {
    pub sequence: Sequence,
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub flags: RevFlags,
    pub body_size: u64,
    pub expiration: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EnumerateOptions {
    pub include_deleted: bool,
}

/// The body of a revision being inserted: either the full encoding, or a
/// delta to be applied against a base revision inside the transaction.
pub enum NewBody {
    Full(Body),
    Delta {
        base: RevId,
        apply: Box<dyn FnOnce(&Body) -> Result<Body, Error> + Send>,
    },
}

impl fmt::Debug for NewBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Full(body) => f.debug_tuple("Full").field(body).finish(),
            Self::Delta { base, .. } => f.debug_struct("Delta").field("base", base).finish(),
        }
    }
}

/// Insertion of a replicated (or local) revision.
#[derive(Debug)]
pub struct PutRequest {
    pub doc_id: DocId,
    /// Revision IDs, newest first; `history[0]` is the revision being put.
    pub history: Vec<RevId>,
    pub flags: RevFlags,
    pub allow_conflict: bool,
    /// When set, the insert came from this remote: the revision is recorded
    /// as the remote's known ancestor, and the resulting change is flagged
    /// as non-external to observers on this handle.
    pub remote_db_id: Option<RemoteDbId>,
    pub body: NewBody,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ObserverId(pub u64);

/// A document in a raw key-value store.
#[derive(Clone, Debug)]
pub struct RawDoc {
    pub key: String,
    pub meta: String,
    pub body: Bytes,
}

/// The versioned document store, as the replication core consumes it.
///
/// One handle maps to one open database. Writes require an open transaction;
/// at most one transaction is open per handle at a time (callers serialize,
/// see the replicator's `DbAccess`). Associated collections are created by
/// the application ahead of replication.
pub trait Storage: Send + Sync {
    // Transactions

    fn begin_transaction(&self) -> Result<(), Error>;
    fn commit_transaction(&self) -> Result<(), Error>;
    fn abort_transaction(&self) -> Result<(), Error>;
    fn in_transaction(&self) -> bool;

    // Collections

    fn has_collection(&self, coll: &CollectionSpec) -> bool;
    fn create_collection(&self, coll: &CollectionSpec) -> Result<(), Error>;
    fn last_sequence(&self, coll: &CollectionSpec) -> Result<Sequence, Error>;

    // Documents

    fn get_doc(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        content: ContentLevel,
    ) -> Result<Option<Document>, Error>;

    /// Insert a revision, returning its assigned sequence.
    fn put_rev(&self, coll: &CollectionSpec, put: PutRequest) -> Result<Sequence, Error>;

    /// Remove a document and its entire history. Returns false if absent.
    fn purge_doc(&self, coll: &CollectionSpec, doc_id: &DocId) -> Result<bool, Error>;

    fn set_expiration(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        expiration: u64,
    ) -> Result<(), Error>;

    // Change enumeration and observation

    /// Changes with sequence strictly greater than `since`, ascending, up to
    /// `limit`.
    fn changes_since(
        &self,
        coll: &CollectionSpec,
        since: Sequence,
        limit: usize,
        opts: &EnumerateOptions,
    ) -> Result<Vec<ChangeEntry>, Error>;

    /// Register a change observer. `notify` is invoked (on the writer's
    /// thread) whenever new changes become available; the observer then
    /// drains them with [`Storage::observed_changes`].
    fn add_observer(
        &self,
        coll: &CollectionSpec,
        notify: Box<dyn Fn() + Send + Sync>,
    ) -> Result<ObserverId, Error>;

    fn remove_observer(&self, id: ObserverId);

    /// Pop up to `max` pending observed changes. All entries of one batch
    /// share an origin: `external` is false iff the replicator itself made
    /// them (ie. the write carried a `remote_db_id`).
    fn observed_changes(
        &self,
        id: ObserverId,
        max: usize,
    ) -> Result<(Vec<ChangeEntry>, bool), Error>;

    // Remote ancestors

    fn remote_ancestor(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        remote: RemoteDbId,
    ) -> Result<Option<RevId>, Error>;

    /// Record that `remote` is known to have `rev_id`. The revision must
    /// exist in the document's stored history.
    fn set_remote_ancestor(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        remote: RemoteDbId,
        rev_id: &RevId,
    ) -> Result<(), Error>;

    // Raw stores and database info

    fn get_raw(&self, store: &str, key: &str) -> Result<Option<RawDoc>, Error>;
    fn put_raw(
        &self,
        store: &str,
        key: &str,
        meta: Option<&str>,
        body: Option<&[u8]>,
    ) -> Result<(), Error>;

    fn private_uuid(&self) -> String;
    fn public_uuid(&self) -> String;
    fn previous_private_uuid(&self) -> Option<String>;

    /// The stable peer ID used for `*` resolution in version vectors.
    fn local_peer_id(&self) -> PeerId;

    /// Look up or assign the small integer naming this remote in per-doc
    /// remote-ancestor records.
    fn remote_db_id(&self, unique_id: &str) -> Result<RemoteDbId, Error>;
}
