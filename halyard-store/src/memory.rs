// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};

use crate::{
    error::Error,
    revid::RevId,
    storage::{
        ChangeEntry, ContentLevel, Document, EnumerateOptions, NewBody, ObserverId, PutRequest,
        RawDoc, SavedRev, Storage,
    },
    types::{CollectionSpec, DocFlags, DocId, PeerId, RemoteDbId, RevFlags, Sequence},
};

/// In-memory [`Storage`] engine.
///
/// Backs the test-suite and in-process loopback replication. UUIDs and the
/// peer ID are derived deterministically from the construction name, so
/// checkpoint-ID tests are reproducible.
pub struct MemStorage {
    peer_id: PeerId,
    private_uuid: String,
    public_uuid: String,
    previous_private_uuid: Mutex<Option<String>>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<CollectionSpec, Collection>,
    raw: BTreeMap<String, BTreeMap<String, RawDoc>>,
    remotes: BTreeMap<String, RemoteDbId>,
    observers: HashMap<u64, Observer>,
    next_observer: u64,
    tx: Option<Snapshot>,
}

#[derive(Clone, Default)]
struct Collection {
    docs: BTreeMap<DocId, DocRecord>,
    by_sequence: BTreeMap<u64, DocId>,
    last_sequence: Sequence,
}

#[derive(Clone)]
struct DocRecord {
    flags: DocFlags,
    /// Revisions, current first.
    revs: Vec<SavedRev>,
    remote_ancestors: BTreeMap<RemoteDbId, RevId>,
    expiration: u64,
}

struct Observer {
    coll: CollectionSpec,
    queue: VecDeque<(ChangeEntry, bool)>,
    notify: Arc<dyn Fn() + Send + Sync>,
}

struct Snapshot {
    collections: BTreeMap<CollectionSpec, Collection>,
    raw: BTreeMap<String, BTreeMap<String, RawDoc>>,
    queues: HashMap<u64, VecDeque<(ChangeEntry, bool)>>,
}

impl MemStorage {
    pub fn new(name: &str) -> Self {
        let peer_id = format!("p-{}", &hex_digest(name)[..16]);
        Self {
            peer_id: peer_id.parse().expect("derived peer ID is well-formed"),
            private_uuid: hex_digest(&format!("{}/private", name)),
            public_uuid: hex_digest(&format!("{}/public", name)),
            previous_private_uuid: Mutex::new(None),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Simulate this database being a copy of `original`: its private UUID
    /// becomes our previous private UUID (checkpoint migration path).
    pub fn set_copied_from(&self, original: &MemStorage) {
        *self.previous_private_uuid.lock() = Some(original.private_uuid.clone());
    }
}

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Inner {
    fn coll(&self, spec: &CollectionSpec) -> Result<&Collection, Error> {
        self.collections.get(spec).ok_or(Error::NotFound)
    }

    fn coll_mut(&mut self, spec: &CollectionSpec) -> Result<&mut Collection, Error> {
        self.collections.get_mut(spec).ok_or(Error::NotFound)
    }

    fn require_tx(&self) -> Result<(), Error> {
        if self.tx.is_none() {
            return Err(Error::NotInTransaction);
        }
        Ok(())
    }

    fn record_change(&mut self, coll: &CollectionSpec, entry: ChangeEntry, external: bool) {
        for obs in self.observers.values_mut() {
            if &obs.coll == coll {
                obs.queue.push_back((entry.clone(), external));
            }
        }
    }
}

impl DocRecord {
    fn current(&self) -> &SavedRev {
        &self.revs[0]
    }

    fn rev(&self, id: &RevId) -> Option<&SavedRev> {
        self.revs.iter().find(|r| &r.rev_id == id)
    }

    fn change_entry(&self, doc_id: &DocId) -> ChangeEntry {
        let cur = self.current();
        ChangeEntry {
            sequence: cur.sequence,
            doc_id: doc_id.clone(),
            rev_id: cur.rev_id.clone(),
            flags: cur.flags,
            body_size: cur.body.as_ref().map(|b| b.size() as u64).unwrap_or(0),
            expiration: self.expiration,
        }
    }
}

/// Does `new` win over `cur` as the document's current revision?
///
/// Deletions lose to live revisions; otherwise the higher generation wins,
/// ties broken on the rendered ID so both peers pick the same winner.
fn wins_over(new: &SavedRev, cur: &SavedRev) -> bool {
    if let (RevId::Vector(a), RevId::Vector(b)) = (&new.rev_id, &cur.rev_id) {
        if a.dominates(b) {
            return true;
        }
        if b.dominates(a) {
            return false;
        }
    }
    let key = |r: &SavedRev| {
        (
            !r.flags.contains(RevFlags::DELETED),
            r.rev_id.generation(),
            r.rev_id.to_string(),
        )
    };
    key(new) > key(cur)
}

impl Storage for MemStorage {
    fn begin_transaction(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.tx.is_some() {
            return Err(Error::TransactionOpen);
        }
        inner.tx = Some(Snapshot {
            collections: inner.collections.clone(),
            raw: inner.raw.clone(),
            queues: inner
                .observers
                .iter()
                .map(|(id, o)| (*id, o.queue.clone()))
                .collect(),
        });
        Ok(())
    }

    fn commit_transaction(&self) -> Result<(), Error> {
        let notify = {
            let mut inner = self.inner.lock();
            inner.tx.take().ok_or(Error::NotInTransaction)?;
            inner
                .observers
                .values()
                .filter(|o| !o.queue.is_empty())
                .map(|o| Arc::clone(&o.notify))
                .collect::<Vec<_>>()
        };
        // Outside the lock: observers typically re-enter storage to drain.
        for cb in notify {
            cb()
        }
        Ok(())
    }

    fn abort_transaction(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let snap = inner.tx.take().ok_or(Error::NotInTransaction)?;
        inner.collections = snap.collections;
        inner.raw = snap.raw;
        for (id, queue) in snap.queues {
            if let Some(obs) = inner.observers.get_mut(&id) {
                obs.queue = queue;
            }
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.inner.lock().tx.is_some()
    }

    fn has_collection(&self, coll: &CollectionSpec) -> bool {
        self.inner.lock().collections.contains_key(coll)
    }

    fn create_collection(&self, coll: &CollectionSpec) -> Result<(), Error> {
        self.inner
            .lock()
            .collections
            .entry(coll.clone())
            .or_default();
        Ok(())
    }

    fn last_sequence(&self, coll: &CollectionSpec) -> Result<Sequence, Error> {
        Ok(self.inner.lock().coll(coll)?.last_sequence)
    }

    fn get_doc(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        content: ContentLevel,
    ) -> Result<Option<Document>, Error> {
        let inner = self.inner.lock();
        let record = match inner.coll(coll)?.docs.get(doc_id) {
            Some(r) => r,
            None => return Ok(None),
        };
        let revs = record
            .revs
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let body = match content {
                    ContentLevel::Metadata => None,
                    ContentLevel::CurrentRev => (i == 0).then(|| r.body.clone()).flatten(),
                    ContentLevel::All => r.body.clone(),
                };
                SavedRev {
                    body,
                    ..r.clone()
                }
            })
            .collect();
        Ok(Some(Document {
            id: doc_id.clone(),
            flags: record.flags,
            revs,
            remote_ancestors: record.remote_ancestors.clone(),
            expiration: record.expiration,
        }))
    }

    fn put_rev(&self, coll: &CollectionSpec, put: PutRequest) -> Result<Sequence, Error> {
        let mut inner = self.inner.lock();
        inner.require_tx()?;

        let new_rev_id = put
            .history
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidParameter("empty history".into()))?;

        // Resolve the body first: a delta is applied against the stored base
        // inside this transaction.
        let base_body = match &put.body {
            NewBody::Delta { base, .. } => Some(
                inner
                    .coll(coll)?
                    .docs
                    .get(&put.doc_id)
                    .and_then(|d| d.rev(base))
                    .and_then(|r| r.body.clone())
                    .ok_or(Error::NotFound)?,
            ),
            NewBody::Full(_) => None,
        };
        let body = match put.body {
            NewBody::Full(body) => body,
            NewBody::Delta { apply, .. } => apply(&base_body.expect("delta has base"))?,
        };

        let external = put.remote_db_id.is_none();
        let collection = inner.coll_mut(coll)?;
        collection
            .docs
            .entry(put.doc_id.clone())
            .or_insert_with(|| DocRecord {
                flags: DocFlags::default(),
                revs: Vec::new(),
                remote_ancestors: BTreeMap::new(),
                expiration: 0,
            });

        let (empty, extends_current, old_seq) = {
            let record = &collection.docs[&put.doc_id];
            if let Some(existing) = record.rev(&new_rev_id) {
                return Ok(existing.sequence);
            }
            let empty = record.revs.is_empty();
            (
                empty,
                empty || put.history.contains(&record.current().rev_id),
                (!empty).then(|| record.current().sequence),
            )
        };
        if !extends_current && !put.allow_conflict {
            return Err(Error::Conflict);
        }

        let sequence = collection.last_sequence.next();
        collection.last_sequence = sequence;

        let mut flags = put.flags.with(RevFlags::LEAF);
        if !extends_current {
            flags = flags.with(RevFlags::IS_CONFLICT);
        }
        let new_rev = SavedRev {
            rev_id: new_rev_id.clone(),
            flags,
            sequence,
            parent: put.history.get(1).cloned(),
            body: Some(body),
        };
        let becomes_current = extends_current
            || wins_over(&new_rev, collection.docs[&put.doc_id].current());

        let entry = {
            let record = collection.docs.get_mut(&put.doc_id).expect("just inserted");

            // Materialize missing ancestors as bodiless links.
            for (i, ancestor) in put.history.iter().enumerate().skip(1) {
                if record.rev(ancestor).is_none() {
                    record.revs.push(SavedRev {
                        rev_id: ancestor.clone(),
                        flags: RevFlags::default(),
                        sequence: Sequence::ZERO,
                        parent: put.history.get(i + 1).cloned(),
                        body: None,
                    });
                }
            }

            if becomes_current {
                record.revs.insert(0, new_rev);
            } else {
                record.revs.push(new_rev);
            }

            let mut doc_flags = record.flags.with(DocFlags::EXISTS).without(DocFlags::SYNCED);
            doc_flags = if record.current().is_deleted() {
                doc_flags.with(DocFlags::DELETED)
            } else {
                doc_flags.without(DocFlags::DELETED)
            };
            if !extends_current {
                doc_flags = doc_flags.with(DocFlags::CONFLICTED);
            }
            if record.current().flags.contains(RevFlags::HAS_ATTACHMENTS) {
                doc_flags = doc_flags.with(DocFlags::HAS_ATTACHMENTS);
            }
            record.flags = doc_flags;

            if let Some(remote) = put.remote_db_id {
                record.remote_ancestors.insert(remote, new_rev_id);
                if becomes_current {
                    record.flags = record.flags.with(DocFlags::SYNCED);
                }
            }

            record.change_entry(&put.doc_id)
        };

        if becomes_current {
            if let Some(old) = old_seq {
                collection.by_sequence.remove(&old.0);
            }
            collection.by_sequence.insert(sequence.0, put.doc_id.clone());
        }

        inner.record_change(coll, entry, external);
        Ok(sequence)
    }

    fn purge_doc(&self, coll: &CollectionSpec, doc_id: &DocId) -> Result<bool, Error> {
        let mut inner = self.inner.lock();
        inner.require_tx()?;
        let collection = inner.coll_mut(coll)?;
        match collection.docs.remove(doc_id) {
            Some(record) => {
                collection.by_sequence.remove(&record.current().sequence.0);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn set_expiration(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        expiration: u64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let record = inner
            .coll_mut(coll)?
            .docs
            .get_mut(doc_id)
            .ok_or(Error::NotFound)?;
        record.expiration = expiration;
        Ok(())
    }

    fn changes_since(
        &self,
        coll: &CollectionSpec,
        since: Sequence,
        limit: usize,
        opts: &EnumerateOptions,
    ) -> Result<Vec<ChangeEntry>, Error> {
        let inner = self.inner.lock();
        let collection = inner.coll(coll)?;
        let mut out = Vec::new();
        for doc_id in collection.by_sequence.range(since.0 + 1..).map(|(_, d)| d) {
            if out.len() >= limit {
                break;
            }
            let record = &collection.docs[doc_id];
            if record.current().is_deleted() && !opts.include_deleted {
                continue;
            }
            let entry = record.change_entry(doc_id);
            if entry.expiration != 0 && entry.expiration <= now_secs() {
                continue;
            }
            out.push(entry);
        }
        Ok(out)
    }

    fn add_observer(
        &self,
        coll: &CollectionSpec,
        notify: Box<dyn Fn() + Send + Sync>,
    ) -> Result<ObserverId, Error> {
        let mut inner = self.inner.lock();
        if !inner.collections.contains_key(coll) {
            return Err(Error::NotFound);
        }
        let id = inner.next_observer;
        inner.next_observer += 1;
        inner.observers.insert(
            id,
            Observer {
                coll: coll.clone(),
                queue: VecDeque::new(),
                notify: Arc::from(notify),
            },
        );
        Ok(ObserverId(id))
    }

    fn remove_observer(&self, id: ObserverId) {
        self.inner.lock().observers.remove(&id.0);
    }

    fn observed_changes(
        &self,
        id: ObserverId,
        max: usize,
    ) -> Result<(Vec<ChangeEntry>, bool), Error> {
        let mut inner = self.inner.lock();
        let obs = inner.observers.get_mut(&id.0).ok_or(Error::NotFound)?;
        let mut out = Vec::new();
        let mut external = true;
        while out.len() < max {
            match obs.queue.front() {
                Some((_, ext)) => {
                    // Batches do not mix origins.
                    if !out.is_empty() && *ext != external {
                        break;
                    }
                    external = *ext;
                    let (entry, _) = obs.queue.pop_front().expect("front exists");
                    out.push(entry);
                },
                None => break,
            }
        }
        Ok((out, external))
    }

    fn remote_ancestor(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        remote: RemoteDbId,
    ) -> Result<Option<RevId>, Error> {
        let inner = self.inner.lock();
        Ok(inner
            .coll(coll)?
            .docs
            .get(doc_id)
            .and_then(|d| d.remote_ancestors.get(&remote).cloned()))
    }

    fn set_remote_ancestor(
        &self,
        coll: &CollectionSpec,
        doc_id: &DocId,
        remote: RemoteDbId,
        rev_id: &RevId,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        inner.require_tx()?;
        let record = inner
            .coll_mut(coll)?
            .docs
            .get_mut(doc_id)
            .ok_or(Error::NotFound)?;
        if record.rev(rev_id).is_none() {
            return Err(Error::NotFound);
        }
        record.remote_ancestors.insert(remote, rev_id.clone());
        if &record.current().rev_id == rev_id {
            record.flags = record.flags.with(DocFlags::SYNCED);
        }
        Ok(())
    }

    fn get_raw(&self, store: &str, key: &str) -> Result<Option<RawDoc>, Error> {
        let inner = self.inner.lock();
        Ok(inner.raw.get(store).and_then(|s| s.get(key)).cloned())
    }

    fn put_raw(
        &self,
        store: &str,
        key: &str,
        meta: Option<&str>,
        body: Option<&[u8]>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        inner.require_tx()?;
        let entries = inner.raw.entry(store.to_owned()).or_default();
        match body {
            Some(body) => {
                entries.insert(
                    key.to_owned(),
                    RawDoc {
                        key: key.to_owned(),
                        meta: meta.unwrap_or("").to_owned(),
                        body: Bytes::copy_from_slice(body),
                    },
                );
            },
            None => {
                entries.remove(key);
            },
        }
        Ok(())
    }

    fn private_uuid(&self) -> String {
        self.private_uuid.clone()
    }

    fn public_uuid(&self) -> String {
        self.public_uuid.clone()
    }

    fn previous_private_uuid(&self) -> Option<String> {
        self.previous_private_uuid.lock().clone()
    }

    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    fn remote_db_id(&self, unique_id: &str) -> Result<RemoteDbId, Error> {
        let mut inner = self.inner.lock();
        let next = RemoteDbId(inner.remotes.len() as u32 + 1);
        Ok(*inner.remotes.entry(unique_id.to_owned()).or_insert(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;

    fn setup() -> (MemStorage, CollectionSpec) {
        let store = MemStorage::new("test-db");
        let coll = CollectionSpec::default_collection();
        store.create_collection(&coll).unwrap();
        (store, coll)
    }

    fn put_json(
        store: &MemStorage,
        coll: &CollectionSpec,
        doc: &str,
        history: &[&str],
        json: &str,
    ) -> Sequence {
        store.begin_transaction().unwrap();
        let seq = store
            .put_rev(
                coll,
                PutRequest {
                    doc_id: doc.parse().unwrap(),
                    history: history.iter().map(|r| r.parse().unwrap()).collect(),
                    flags: RevFlags::default(),
                    allow_conflict: false,
                    remote_db_id: None,
                    body: NewBody::Full(Body::from_json(json).unwrap()),
                },
            )
            .unwrap();
        store.commit_transaction().unwrap();
        seq
    }

    #[test]
    fn put_assigns_dense_sequences() {
        let (store, coll) = setup();
        assert_eq!(put_json(&store, &coll, "a", &["1-aa"], r#"{"x":1}"#), Sequence(1));
        assert_eq!(put_json(&store, &coll, "b", &["1-bb"], r#"{"x":2}"#), Sequence(2));
        assert_eq!(
            put_json(&store, &coll, "a", &["2-cc", "1-aa"], r#"{"x":3}"#),
            Sequence(3)
        );
        assert_eq!(store.last_sequence(&coll).unwrap(), Sequence(3));

        let changes = store
            .changes_since(&coll, Sequence::ZERO, 10, &EnumerateOptions::default())
            .unwrap();
        // Doc `a` appears once, at its latest sequence.
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].doc_id.as_str(), "b");
        assert_eq!(changes[1].sequence, Sequence(3));
    }

    #[test]
    fn conflicting_put_requires_permission() {
        let (store, coll) = setup();
        put_json(&store, &coll, "a", &["1-aa"], r#"{"x":1}"#);
        put_json(&store, &coll, "a", &["2-bb", "1-aa"], r#"{"x":2}"#);

        store.begin_transaction().unwrap();
        let err = store
            .put_rev(
                &coll,
                PutRequest {
                    doc_id: "a".parse().unwrap(),
                    history: vec!["2-zz".parse().unwrap(), "1-aa".parse().unwrap()],
                    flags: RevFlags::default(),
                    allow_conflict: false,
                    remote_db_id: None,
                    body: NewBody::Full(Body::from_json(r#"{"x":9}"#).unwrap()),
                },
            )
            .unwrap_err();
        store.abort_transaction().unwrap();
        assert_eq!(err, Error::Conflict);
    }

    #[test]
    fn aborted_transaction_rolls_back() {
        let (store, coll) = setup();
        store.begin_transaction().unwrap();
        store
            .put_rev(
                &coll,
                PutRequest {
                    doc_id: "a".parse().unwrap(),
                    history: vec!["1-aa".parse().unwrap()],
                    flags: RevFlags::default(),
                    allow_conflict: false,
                    remote_db_id: None,
                    body: NewBody::Full(Body::from_json(r#"{"x":1}"#).unwrap()),
                },
            )
            .unwrap();
        store.abort_transaction().unwrap();
        assert!(store
            .get_doc(&coll, &"a".parse().unwrap(), ContentLevel::Metadata)
            .unwrap()
            .is_none());
        assert_eq!(store.last_sequence(&coll).unwrap(), Sequence::ZERO);
    }

    #[test]
    fn observers_see_external_origin() {
        let (store, coll) = setup();
        let observer = store.add_observer(&coll, Box::new(|| ())).unwrap();

        put_json(&store, &coll, "a", &["1-aa"], r#"{"x":1}"#);
        let (batch, external) = store.observed_changes(observer, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(external);

        store.begin_transaction().unwrap();
        store
            .put_rev(
                &coll,
                PutRequest {
                    doc_id: "b".parse().unwrap(),
                    history: vec!["1-bb".parse().unwrap()],
                    flags: RevFlags::default(),
                    allow_conflict: false,
                    remote_db_id: Some(RemoteDbId(1)),
                    body: NewBody::Full(Body::from_json(r#"{"y":1}"#).unwrap()),
                },
            )
            .unwrap();
        store.commit_transaction().unwrap();
        let (batch, external) = store.observed_changes(observer, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!external);
    }

    #[test]
    fn remote_ancestor_must_exist_in_history() {
        let (store, coll) = setup();
        put_json(&store, &coll, "a", &["1-aa"], r#"{"x":1}"#);
        let doc_id: DocId = "a".parse().unwrap();

        store.begin_transaction().unwrap();
        assert_eq!(
            store.set_remote_ancestor(&coll, &doc_id, RemoteDbId(1), &"9-ff".parse().unwrap()),
            Err(Error::NotFound)
        );
        store
            .set_remote_ancestor(&coll, &doc_id, RemoteDbId(1), &"1-aa".parse().unwrap())
            .unwrap();
        store.commit_transaction().unwrap();

        let doc = store
            .get_doc(&coll, &doc_id, ContentLevel::Metadata)
            .unwrap()
            .unwrap();
        assert!(doc.flags.contains(DocFlags::SYNCED));
        assert_eq!(
            doc.remote_ancestors.get(&RemoteDbId(1)),
            Some(&"1-aa".parse().unwrap())
        );
    }

    #[test]
    fn delta_put_applies_against_base() {
        let (store, coll) = setup();
        put_json(&store, &coll, "a", &["1-aa"], r#"{"x":1}"#);

        store.begin_transaction().unwrap();
        store
            .put_rev(
                &coll,
                PutRequest {
                    doc_id: "a".parse().unwrap(),
                    history: vec!["2-bb".parse().unwrap(), "1-aa".parse().unwrap()],
                    flags: RevFlags::default(),
                    allow_conflict: false,
                    remote_db_id: Some(RemoteDbId(1)),
                    body: NewBody::Delta {
                        base: "1-aa".parse().unwrap(),
                        apply: Box::new(|base| {
                            let mut v = base.to_value()?;
                            v["x"] = serde_json::json!(2);
                            Ok(Body::from_value(&v))
                        }),
                    },
                },
            )
            .unwrap();
        store.commit_transaction().unwrap();

        let doc = store
            .get_doc(&coll, &"a".parse().unwrap(), ContentLevel::CurrentRev)
            .unwrap()
            .unwrap();
        assert_eq!(
            doc.current().body.as_ref().unwrap().to_value().unwrap(),
            serde_json::json!({"x": 2})
        );
    }

    #[test]
    fn remote_db_ids_are_stable() {
        let store = MemStorage::new("db");
        let a = store.remote_db_id("wss://peer/db").unwrap();
        let b = store.remote_db_id("wss://other/db").unwrap();
        assert_eq!(store.remote_db_id("wss://peer/db").unwrap(), a);
        assert_ne!(a, b);
    }
}
