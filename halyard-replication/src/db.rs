// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{sync::Arc, thread::ThreadId};

use halyard_store::{
    Body, ChangeEntry, CollectionSpec, ContentLevel, DocId, Document, EnumerateOptions,
    ObserverId, PeerId, RawDoc, RemoteDbId, RevId, Sequence, Storage,
};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{
    delta,
    error::{Error, Result},
};

struct TxGate {
    owner: Option<ThreadId>,
}

struct MarkSynced {
    coll: CollectionSpec,
    doc_id: DocId,
    rev_id: RevId,
}

/// Thread-safe access to the storage handle shared by every worker of a
/// replicator.
///
/// Exactly one transaction may be open per handle: [`DbAccess::in_transaction`]
/// blocks until the current one closes. Mark-synced bookkeeping is batched
/// and must be flushed (inside a transaction) before remote-ancestor reads.
pub struct DbAccess {
    storage: Arc<dyn Storage>,
    use_lock: Mutex<()>,
    gate: Mutex<TxGate>,
    gate_cond: Condvar,
    mark_synced: Mutex<Vec<MarkSynced>>,
    remote_id: RemoteDbId,
}

impl DbAccess {
    pub fn new(storage: Arc<dyn Storage>, remote_identity: &str) -> Result<Self> {
        let remote_id = storage.remote_db_id(remote_identity)?;
        Ok(Self {
            storage,
            use_lock: Mutex::new(()),
            gate: Mutex::new(TxGate { owner: None }),
            gate_cond: Condvar::new(),
            mark_synced: Mutex::new(Vec::new()),
            remote_id,
        })
    }

    /// The small integer naming this replication's remote in per-doc
    /// remote-ancestor records.
    pub fn remote_id(&self) -> RemoteDbId {
        self.remote_id
    }

    /// Run `f` holding the storage mutex.
    pub fn with_locked<T>(&self, f: impl FnOnce(&dyn Storage) -> T) -> T {
        let _guard = self.use_lock.lock();
        f(self.storage.as_ref())
    }

    /// Open a transaction, run `f`, commit on `Ok` and abort on `Err`.
    ///
    /// Blocks while another worker's transaction is open. Re-entry from the
    /// thread already holding the transaction is refused rather than
    /// deadlocked.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&dyn Storage) -> Result<T>) -> Result<T> {
        let me = std::thread::current().id();
        {
            let mut gate = self.gate.lock();
            if gate.owner == Some(me) {
                return Err(Error::Store(halyard_store::Error::TransactionOpen));
            }
            while gate.owner.is_some() {
                self.gate_cond.wait(&mut gate);
            }
            gate.owner = Some(me);
        }

        let result = {
            let _guard = self.use_lock.lock();
            match self.storage.begin_transaction() {
                Err(e) => Err(Error::from(e)),
                Ok(()) => match f(self.storage.as_ref()) {
                    Ok(value) => self
                        .storage
                        .commit_transaction()
                        .map_err(Error::from)
                        .map(|()| value),
                    Err(e) => {
                        if let Err(abort) = self.storage.abort_transaction() {
                            warn!(error = %abort, "transaction abort failed");
                        }
                        Err(e)
                    },
                },
            }
        };

        let mut gate = self.gate.lock();
        gate.owner = None;
        self.gate_cond.notify_one();
        drop(gate);
        result
    }

    // Document and raw access

    pub fn get_doc(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        content: ContentLevel,
    ) -> Result<Option<Document>> {
        self.with_locked(|s| s.get_doc(coll, doc_id, content))
            .map_err(Error::from)
    }

    pub fn last_sequence(&self, coll: &CollectionSpec) -> Result<Sequence> {
        self.with_locked(|s| s.last_sequence(coll)).map_err(Error::from)
    }

    pub fn changes_since(
        &self,
        coll: &CollectionSpec,
        since: Sequence,
        limit: usize,
        opts: &EnumerateOptions,
    ) -> Result<Vec<ChangeEntry>> {
        self.with_locked(|s| s.changes_since(coll, since, limit, opts))
            .map_err(Error::from)
    }

    pub fn get_raw(&self, store: &str, key: &str) -> Result<Option<RawDoc>> {
        self.with_locked(|s| s.get_raw(store, key)).map_err(Error::from)
    }

    pub fn has_collection(&self, coll: &CollectionSpec) -> bool {
        self.with_locked(|s| s.has_collection(coll))
    }

    pub fn add_observer(
        &self,
        coll: &CollectionSpec,
        notify: Box<dyn Fn() + Send + Sync>,
    ) -> Result<ObserverId> {
        self.with_locked(|s| s.add_observer(coll, notify))
            .map_err(Error::from)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.with_locked(|s| s.remove_observer(id))
    }

    pub fn observed_changes(&self, id: ObserverId, max: usize) -> Result<(Vec<ChangeEntry>, bool)> {
        self.with_locked(|s| s.observed_changes(id, max))
            .map_err(Error::from)
    }

    pub fn private_uuid(&self) -> String {
        self.storage.private_uuid()
    }

    pub fn previous_private_uuid(&self) -> Option<String> {
        self.storage.previous_private_uuid()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.storage.local_peer_id()
    }

    // Remote ancestors

    /// The most recent revision this replication's remote is known to have,
    /// per the already-loaded document.
    pub fn remote_ancestor_of(&self, doc: &Document) -> Option<RevId> {
        doc.remote_ancestors.get(&self.remote_id).cloned()
    }

    /// Queue a "remote now has this revision" mark. Cheap; flushed in
    /// batches by [`DbAccess::mark_revs_synced_now`].
    pub fn mark_synced(&self, coll: &CollectionSpec, doc_id: DocId, rev_id: RevId) {
        self.mark_synced.lock().push(MarkSynced {
            coll: coll.clone(),
            doc_id,
            rev_id,
        });
    }

    /// Flush the mark-synced queue in its own transaction. MUST run before
    /// reading remote-ancestor state, or reads observe stale ancestors.
    pub fn mark_revs_synced_now(&self) -> Result<()> {
        if self.mark_synced.lock().is_empty() {
            return Ok(());
        }
        self.in_transaction(|storage| self.flush_mark_synced(storage))
    }

    /// Flush inside an already-open transaction (the inserter's batch
    /// transaction does this first, before any insert reads ancestors).
    pub fn flush_mark_synced(&self, storage: &dyn Storage) -> Result<()> {
        let queued = std::mem::take(&mut *self.mark_synced.lock());
        for mark in queued {
            match storage.set_remote_ancestor(&mark.coll, &mark.doc_id, self.remote_id, &mark.rev_id)
            {
                Ok(()) => {},
                // The doc may have been purged or compacted since.
                Err(halyard_store::Error::NotFound) => {
                    warn!(doc = %mark.doc_id, rev = %mark.rev_id, "mark-synced target vanished")
                },
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // Body helpers

    /// Re-encode a body so it uses this database's persistent shared keys
    /// (canonical form).
    pub fn re_encode_for_database(&self, body: &Body) -> Result<Body> {
        body.canonicalized().map_err(Error::from)
    }

    /// Apply a JSON delta received off the wire to a base body.
    pub fn apply_delta(&self, base: &Body, delta_json: &[u8]) -> Result<Body> {
        let delta: serde_json::Value = serde_json::from_slice(delta_json)
            .map_err(|e| Error::CorruptDelta(format!("unparseable delta: {}", e)))?;
        let base = base.to_value()?;
        let new = delta::apply_delta(&base, &delta)?;
        Ok(Body::from_value(&new))
    }

    /// Deep iteration over every blob reference in a decoded body.
    pub fn find_blob_references(
        &self,
        root: &serde_json::Value,
        callback: &mut dyn FnMut(&serde_json::Map<String, serde_json::Value>),
    ) {
        crate::attachments::find_blob_references(root, callback)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use halyard_store::MemStorage;

    use super::*;

    fn db() -> DbAccess {
        let storage = MemStorage::new("dbaccess-test");
        storage
            .create_collection(&CollectionSpec::default_collection())
            .unwrap();
        DbAccess::new(Arc::new(storage), "wss://peer/db").unwrap()
    }

    #[test]
    fn nested_transactions_are_refused() {
        let db = db();
        let result = db.in_transaction(|_| {
            db.in_transaction(|_| Ok(()))
        });
        assert_eq!(
            result,
            Err(Error::Store(halyard_store::Error::TransactionOpen))
        );
    }

    #[test]
    fn failed_transactions_abort() {
        let db = db();
        let err: Result<()> = db.in_transaction(|storage| {
            storage
                .put_raw("x", "k", None, Some(b"v"))
                .map_err(Error::from)?;
            Err(Error::Unexpected("boom".into()))
        });
        assert!(err.is_err());
        assert!(db.get_raw("x", "k").unwrap().is_none());
        // The gate is released; a fresh transaction works.
        db.in_transaction(|storage| {
            storage.put_raw("x", "k", None, Some(b"v")).map_err(Error::from)
        })
        .unwrap();
        assert!(db.get_raw("x", "k").unwrap().is_some());
    }

    #[test]
    fn transactions_block_other_threads() {
        let db = Arc::new(db());
        let db2 = Arc::clone(&db);
        db.in_transaction(|storage| {
            let handle = std::thread::spawn(move || {
                db2.in_transaction(|s| {
                    s.put_raw("x", "later", None, Some(b"1")).map_err(Error::from)
                })
            });
            // Give the other thread a chance to reach the gate.
            std::thread::sleep(std::time::Duration::from_millis(20));
            storage.put_raw("x", "first", None, Some(b"0")).map_err(Error::from)?;
            Ok(handle)
        })
        .and_then(|handle| handle.join().expect("no panic"))
        .unwrap();
        assert!(db.get_raw("x", "later").unwrap().is_some());
    }
}
