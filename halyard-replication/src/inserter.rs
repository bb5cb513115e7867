// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::sync::Arc;

use bytes::Bytes;
use halyard_async::{Spawner, Task};
use halyard_store::{Body, CollectionSpec, DocId, NewBody, PutRequest, RevFlags, RevId, Storage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    db::DbAccess,
    delta,
    error::{Error, Result},
    tuning,
};

/// An accepted incoming revision, ready to be written.
#[derive(Debug)]
pub struct RevToInsert {
    pub doc_id: DocId,
    pub rev_id: RevId,
    /// Revision IDs newest first, starting with `rev_id`.
    pub history: Vec<RevId>,
    pub flags: RevFlags,
    pub body: Option<Body>,
    /// An unapplied delta: base revision plus delta bytes. Applied against
    /// the stored base inside the insertion transaction.
    pub delta: Option<(RevId, Bytes)>,
    /// Remove the document instead of inserting (`_removed` pulls).
    pub purge: bool,
    /// Resolved with the insertion outcome after the batch commits.
    pub done: oneshot::Sender<Result<()>>,
}

/// Batches accepted revisions and applies each batch in one transaction.
///
/// A batch flushes when it reaches [`tuning::INSERTION_BATCH_SIZE`] or when
/// the oldest queued revision has waited [`tuning::INSERTION_DELAY`].
pub struct Inserter {
    tx: mpsc::UnboundedSender<RevToInsert>,
    _task: Task<()>,
}

impl Inserter {
    pub fn spawn(
        spawner: &Spawner,
        db: Arc<DbAccess>,
        coll: CollectionSpec,
        no_incoming_conflicts: bool,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawner.spawn(run(db, coll, no_incoming_conflicts, rx));
        Self { tx, _task: task }
    }

    /// Queue a revision. Its `done` channel fires when the enclosing batch
    /// commits (or fails).
    pub fn insert(&self, rev: RevToInsert) {
        if let Err(mpsc::error::SendError(rev)) = self.tx.send(rev) {
            let _ = rev.done.send(Err(Error::Unexpected("inserter stopped".into())));
        }
    }
}

async fn run(
    db: Arc<DbAccess>,
    coll: CollectionSpec,
    no_incoming_conflicts: bool,
    mut rx: mpsc::UnboundedReceiver<RevToInsert>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = halyard_async::sleep(tuning::INSERTION_DELAY);
        tokio::pin!(deadline);
        loop {
            if batch.len() >= tuning::INSERTION_BATCH_SIZE {
                break;
            }
            tokio::select! {
                more = rx.recv() => match more {
                    Some(rev) => batch.push(rev),
                    None => break,
                },
                () = &mut deadline => break,
            }
        }
        flush(&db, &coll, no_incoming_conflicts, batch);
    }
}

fn flush(db: &DbAccess, coll: &CollectionSpec, no_incoming_conflicts: bool, batch: Vec<RevToInsert>) {
    debug!(count = batch.len(), collection = %coll, "inserting batch of revs");
    let mut senders = Vec::with_capacity(batch.len());
    let mut payloads = Vec::with_capacity(batch.len());
    for rev in batch {
        let RevToInsert {
            doc_id,
            rev_id,
            history,
            flags,
            body,
            delta,
            purge,
            done,
        } = rev;
        senders.push(done);
        payloads.push((doc_id, rev_id, history, flags, body, delta, purge));
    }

    let remote_id = db.remote_id();
    let outcome: Result<Vec<Result<()>>> = db.in_transaction(|storage| {
        // Flush remote-ancestor marks first, so the puts below read fresh
        // ancestry.
        db.flush_mark_synced(storage)?;
        let mut per_rev = Vec::with_capacity(payloads.len());
        for (doc_id, rev_id, history, flags, body, delta, purge) in payloads.drain(..) {
            let had_delta = delta.is_some();
            let result = insert_one(
                storage,
                coll,
                remote_id,
                no_incoming_conflicts,
                doc_id,
                rev_id,
                history,
                flags,
                body,
                delta,
                purge,
            )
            .map_err(|e| remap_delta_errors(had_delta, e));
            per_rev.push(result);
        }
        Ok(per_rev)
    });

    match outcome {
        Ok(per_rev) => {
            for (done, result) in senders.into_iter().zip(per_rev) {
                let _ = done.send(result);
            }
        },
        Err(tx_error) => {
            warn!(error = %tx_error, "insertion transaction failed");
            for done in senders {
                let _ = done.send(Err(tx_error.clone()));
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_one(
    storage: &dyn Storage,
    coll: &CollectionSpec,
    remote_id: halyard_store::RemoteDbId,
    no_incoming_conflicts: bool,
    doc_id: DocId,
    rev_id: RevId,
    history: Vec<RevId>,
    flags: RevFlags,
    body: Option<Body>,
    delta: Option<(RevId, Bytes)>,
    purge: bool,
) -> Result<()> {
    if purge {
        storage.purge_doc(coll, &doc_id)?;
        return Ok(());
    }

    let new_body = match (body, delta) {
        (_, Some((base, delta_bytes))) => NewBody::Delta {
            base,
            apply: Box::new(move |base_body| apply_delta_body(base_body, &delta_bytes)),
        },
        (Some(body), None) => NewBody::Full(body),
        (None, None) => {
            return Err(Error::body(format!("rev {} of {} has no body", rev_id, doc_id)))
        },
    };

    let mut history = history;
    if history.first() != Some(&rev_id) {
        history.insert(0, rev_id);
    }

    storage.put_rev(
        coll,
        PutRequest {
            doc_id,
            history,
            flags,
            allow_conflict: !no_incoming_conflicts,
            remote_db_id: Some(remote_id),
            body: new_body,
        },
    )?;
    Ok(())
}

/// The delta is applied by the storage layer inside the transaction; this is
/// the closure it calls.
fn apply_delta_body(base: &Body, delta_bytes: &[u8]) -> Result<Body, halyard_store::Error> {
    let corrupt =
        |why: String| halyard_store::Error::CorruptRevisionData(format!("delta: {}", why));
    let delta: serde_json::Value =
        serde_json::from_slice(delta_bytes).map_err(|e| corrupt(e.to_string()))?;
    let base = base.to_value()?;
    let new = delta::apply_delta(&base, &delta).map_err(|e| corrupt(e.to_string()))?;
    Ok(Body::from_value(&new))
}

/// When a delta was involved, storage-level failures gain a delta-specific
/// meaning on the wire.
fn remap_delta_errors(had_delta: bool, error: Error) -> Error {
    if !had_delta {
        return error;
    }
    match error {
        Error::Store(halyard_store::Error::NotFound) => {
            Error::DeltaBaseUnknown("delta base revision not stored locally".into())
        },
        Error::Store(halyard_store::Error::CorruptRevisionData(msg)) if msg.starts_with("delta:") => {
            Error::CorruptDelta(msg)
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use halyard_store::{ContentLevel, MemStorage};
    use serde_json::json;

    use super::*;

    fn setup() -> (Arc<DbAccess>, CollectionSpec) {
        let storage = MemStorage::new("inserter-test");
        let coll = CollectionSpec::default_collection();
        storage.create_collection(&coll).unwrap();
        (
            Arc::new(DbAccess::new(Arc::new(storage), "wss://peer/db").unwrap()),
            coll,
        )
    }

    fn rev(
        doc: &str,
        history: &[&str],
        body: Option<&str>,
        delta: Option<(&str, &str)>,
    ) -> (RevToInsert, oneshot::Receiver<Result<()>>) {
        let (done, done_rx) = oneshot::channel();
        (
            RevToInsert {
                doc_id: doc.parse().unwrap(),
                rev_id: history[0].parse().unwrap(),
                history: history.iter().map(|r| r.parse().unwrap()).collect(),
                flags: RevFlags::default(),
                body: body.map(|b| Body::from_json(b).unwrap()),
                delta: delta.map(|(base, d)| {
                    (base.parse().unwrap(), Bytes::copy_from_slice(d.as_bytes()))
                }),
                purge: false,
                done,
            },
            done_rx,
        )
    }

    #[tokio::test]
    async fn batches_commit_and_mark_remote_ancestors() {
        let (db, coll) = setup();
        let spawner = Spawner::from_current().unwrap();
        let inserter = Inserter::spawn(&spawner, Arc::clone(&db), coll.clone(), false);

        let (a, a_done) = rev("a", &["1-aa"], Some(r#"{"n":1}"#), None);
        let (b, b_done) = rev("b", &["1-bb"], Some(r#"{"n":2}"#), None);
        inserter.insert(a);
        inserter.insert(b);
        a_done.await.unwrap().unwrap();
        b_done.await.unwrap().unwrap();

        let doc = db
            .get_doc(&coll, &"a".parse().unwrap(), ContentLevel::CurrentRev)
            .unwrap()
            .unwrap();
        assert_eq!(db.remote_ancestor_of(&doc), Some("1-aa".parse().unwrap()));
    }

    #[tokio::test]
    async fn delta_against_stored_base() {
        let (db, coll) = setup();
        let spawner = Spawner::from_current().unwrap();
        let inserter = Inserter::spawn(&spawner, Arc::clone(&db), coll.clone(), false);

        let (base, base_done) = rev("doc", &["1-aa"], Some(r#"{"x":1,"y":2}"#), None);
        inserter.insert(base);
        base_done.await.unwrap().unwrap();

        let (second, second_done) = rev(
            "doc",
            &["2-bb", "1-aa"],
            None,
            Some(("1-aa", r#"{"y":[3]}"#)),
        );
        inserter.insert(second);
        second_done.await.unwrap().unwrap();

        let doc = db
            .get_doc(&coll, &"doc".parse().unwrap(), ContentLevel::CurrentRev)
            .unwrap()
            .unwrap();
        assert_eq!(
            doc.current().body.as_ref().unwrap().to_value().unwrap(),
            json!({"x": 1, "y": 3})
        );
    }

    #[tokio::test]
    async fn unknown_delta_base_is_typed() {
        let (db, coll) = setup();
        let spawner = Spawner::from_current().unwrap();
        let inserter = Inserter::spawn(&spawner, Arc::clone(&db), coll, false);

        let (orphan, done) = rev(
            "doc",
            &["2-bb", "1-zz"],
            None,
            Some(("1-zz", r#"{"y":[3]}"#)),
        );
        inserter.insert(orphan);
        assert!(matches!(
            done.await.unwrap(),
            Err(Error::DeltaBaseUnknown(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_delta_is_typed() {
        let (db, coll) = setup();
        let spawner = Spawner::from_current().unwrap();
        let inserter = Inserter::spawn(&spawner, Arc::clone(&db), coll, false);

        let (base, base_done) = rev("doc", &["1-aa"], Some(r#"{"x":1}"#), None);
        inserter.insert(base);
        base_done.await.unwrap().unwrap();

        let (bad, done) = rev("doc", &["2-bb", "1-aa"], None, Some(("1-aa", "{nope")));
        inserter.insert(bad);
        assert!(matches!(done.await.unwrap(), Err(Error::CorruptDelta(_))));
    }
}
