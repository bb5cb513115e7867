// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{collections::HashSet, sync::Arc};

use halyard_store::{
    ChangeEntry, CollectionSpec, ContentLevel, DocId, EnumerateOptions, ObserverId, RevFlags,
    RevId, Sequence,
};
use tracing::{debug, trace};

use crate::{
    db::DbAccess,
    error::{Error, Result},
    options::CollectionOptions,
};

/// A local revision on its way to the peer.
#[derive(Clone, Debug)]
pub struct RevToSend {
    pub sequence: Sequence,
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub flags: RevFlags,
    pub body_size: u64,
    /// The revision the remote is known to already have, from the
    /// remote-ancestor map: the delta-base candidate.
    pub remote_ancestor: Option<RevId>,
    /// Ancestors the peer reported holding in its `changes` reply; any of
    /// these may serve as the delta base too.
    pub ancestors_on_peer: Vec<RevId>,
    /// Set after the peer failed to apply a delta: re-send the full body.
    pub no_delta: bool,
    pub retries: u32,
}

impl RevToSend {
    fn new(entry: &ChangeEntry) -> Self {
        Self {
            sequence: entry.sequence,
            doc_id: entry.doc_id.clone(),
            rev_id: entry.rev_id.clone(),
            flags: entry.flags,
            body_size: entry.body_size,
            remote_ancestor: None,
            ancestors_on_peer: Vec::new(),
            no_delta: false,
            retries: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }
}

/// A change the feed decided cannot be pushed (propose-mode conflict).
#[derive(Clone, Debug)]
pub struct DocFailure {
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub error: Error,
}

/// One batch of enumerated changes.
#[derive(Debug, Default)]
pub struct Changes {
    pub revs: Vec<RevToSend>,
    pub failures: Vec<DocFailure>,
    /// The full sequence interval the batch covers, including filtered
    /// sequences (the checkpointer completes those right away).
    pub first: Sequence,
    pub last: Sequence,
    /// Whether this drained history to its end.
    pub finished_history: bool,
}

/// Produces the ordered stream of local changes for the pusher: a single
/// historical pass of the sequence index, then (continuous mode) batches
/// from the storage change observer.
pub struct ChangesFeed {
    db: Arc<DbAccess>,
    coll: CollectionOptions,
    /// Propose mode consults the remote-ancestor map per candidate.
    get_foreign_ancestors: bool,
    doc_ids: Option<HashSet<String>>,
    max_pushed: Sequence,
    observer: Option<ObserverId>,
    caught_up: bool,
}

impl ChangesFeed {
    pub fn new(db: Arc<DbAccess>, coll: CollectionOptions, since: Sequence) -> Self {
        let doc_ids = coll
            .doc_ids
            .as_ref()
            .map(|ids| ids.iter().map(|d| d.as_str().to_owned()).collect());
        Self {
            get_foreign_ancestors: coll.propose_changes,
            db,
            coll,
            doc_ids,
            max_pushed: since,
            observer: None,
            caught_up: false,
        }
    }

    pub fn collection(&self) -> &CollectionSpec {
        &self.coll.spec
    }

    pub fn caught_up(&self) -> bool {
        self.caught_up
    }

    /// Narrow the docID filter (passive mode: the peer's `subChanges` may
    /// carry one). Intersects with any existing filter.
    pub fn filter_by_doc_ids(&mut self, ids: impl IntoIterator<Item = DocId>) {
        let incoming: HashSet<String> = ids.into_iter().map(|d| d.as_str().to_owned()).collect();
        self.doc_ids = Some(match self.doc_ids.take() {
            Some(existing) => existing.intersection(&incoming).cloned().collect(),
            None => incoming,
        });
    }

    pub fn set_skip_deleted(&mut self, skip: bool) {
        self.coll.skip_deleted = skip;
    }

    /// Pull the next batch: historical sequence enumeration until history is
    /// drained, then whatever the observer has buffered.
    pub fn get_more_changes(&mut self, limit: usize) -> Result<Changes> {
        if self.observer.is_some() {
            return self.get_observed_changes(limit);
        }

        if self.get_foreign_ancestors {
            self.db.mark_revs_synced_now()?;
        }

        let first = self.max_pushed.next();
        trace!(since = %self.max_pushed, limit, "reading local changes");
        let entries = self.db.changes_since(
            &self.coll.spec,
            self.max_pushed,
            limit,
            &EnumerateOptions {
                include_deleted: !self.coll.skip_deleted,
            },
        )?;

        let mut changes = Changes {
            first,
            last: self.max_pushed,
            finished_history: entries.len() < limit,
            ..Default::default()
        };
        for entry in entries {
            self.max_pushed = self.max_pushed.max(entry.sequence);
            changes.last = self.max_pushed;
            self.screen(entry, &mut changes)?;
        }
        if changes.finished_history {
            self.caught_up = true;
        }
        Ok(changes)
    }

    /// Start tailing the change observer; called once history is drained in
    /// continuous mode. `notify` fires on the writer's thread whenever new
    /// changes are buffered.
    pub fn start_observer(&mut self, notify: Box<dyn Fn() + Send + Sync>) -> Result<()> {
        if self.observer.is_none() {
            self.observer = Some(self.db.add_observer(&self.coll.spec, notify)?);
            debug!(collection = %self.coll.spec, "started db observer");
        }
        Ok(())
    }

    pub fn stop_observer(&mut self) {
        if let Some(id) = self.observer.take() {
            self.db.remove_observer(id);
        }
    }

    fn get_observed_changes(&mut self, limit: usize) -> Result<Changes> {
        let observer = self.observer.expect("observing");
        let mut foreign_ancestors_fresh = false;
        let mut changes = Changes {
            first: self.max_pushed.next(),
            last: self.max_pushed,
            finished_history: true,
            ..Default::default()
        };
        loop {
            let (batch, external) = self.db.observed_changes(observer, limit)?;
            if batch.is_empty() {
                break;
            }
            if !external {
                // Changes this replicator made itself: remember we saw them,
                // don't echo them back.
                self.max_pushed = batch.last().expect("non-empty").sequence.max(self.max_pushed);
                continue;
            }
            if self.get_foreign_ancestors && !foreign_ancestors_fresh {
                self.db.mark_revs_synced_now()?;
                foreign_ancestors_fresh = true;
            }
            for entry in batch {
                if entry.sequence <= self.max_pushed {
                    continue;
                }
                self.max_pushed = entry.sequence;
                changes.last = self.max_pushed;
                self.screen(entry, &mut changes)?;
            }
            if changes.revs.len() >= limit {
                break;
            }
        }
        changes.last = changes.last.max(self.max_pushed);
        Ok(changes)
    }

    /// Apply the outbound gates to one candidate; a passing candidate lands
    /// in `changes.revs`, a conflicting one in `changes.failures`.
    fn screen(&self, entry: ChangeEntry, changes: &mut Changes) -> Result<()> {
        if entry.expiration != 0 && entry.expiration <= now_secs() {
            trace!(doc = %entry.doc_id, "skipping expired doc");
            return Ok(());
        }

        if let Some(ids) = &self.doc_ids {
            if !ids.contains(entry.doc_id.as_str()) {
                return Ok(());
            }
        }

        let mut rev = RevToSend::new(&entry);

        if self.get_foreign_ancestors {
            let doc = self
                .db
                .get_doc(&self.coll.spec, &entry.doc_id, ContentLevel::Metadata)?;
            if let Some(doc) = doc {
                if let Some(remote_rev) = self.db.remote_ancestor_of(&doc) {
                    if remote_rev == entry.rev_id {
                        // The remote already has this exact revision.
                        return Ok(());
                    }
                    if remote_rev.generation() > entry.rev_id.generation() {
                        changes.failures.push(DocFailure {
                            doc_id: entry.doc_id,
                            rev_id: entry.rev_id,
                            error: Error::http(409, "conflicts with newer server revision"),
                        });
                        return Ok(());
                    }
                    rev.remote_ancestor = Some(remote_rev);
                }
            }
        }

        if let Some(filter) = &self.coll.push_filter {
            let body = self
                .db
                .get_doc(&self.coll.spec, &entry.doc_id, ContentLevel::CurrentRev)?
                .and_then(|d| d.current().body.clone())
                .unwrap_or_default();
            if !filter(&self.coll.spec, &rev.doc_id, &rev.rev_id, rev.flags, &body) {
                trace!(doc = %rev.doc_id, "push filter skipped doc");
                return Ok(());
            }
        }

        changes.revs.push(rev);
        Ok(())
    }
}

impl Drop for ChangesFeed {
    fn drop(&mut self) {
        self.stop_observer()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use halyard_store::{Body, CollectionSpec, MemStorage, NewBody, PutRequest, Storage};

    use super::*;
    use crate::options::Mode;

    fn put(db: &MemStorage, coll: &CollectionSpec, doc: &str, history: &[&str], json: &str) {
        db.begin_transaction().unwrap();
        db.put_rev(
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
        db.commit_transaction().unwrap();
    }

    fn feed_with(coll_opts: CollectionOptions) -> (Arc<DbAccess>, ChangesFeed) {
        let storage = MemStorage::new("feed-test");
        let coll = CollectionSpec::default_collection();
        storage.create_collection(&coll).unwrap();
        put(&storage, &coll, "a", &["1-aa"], r#"{"n":1}"#);
        put(&storage, &coll, "b", &["1-bb"], r#"{"n":2}"#);
        put(&storage, &coll, "c", &["1-cc"], r#"{"n":3}"#);
        let db = Arc::new(DbAccess::new(Arc::new(storage), "wss://peer/db").unwrap());
        let feed = ChangesFeed::new(Arc::clone(&db), coll_opts, Sequence::ZERO);
        (db, feed)
    }

    fn coll_opts() -> CollectionOptions {
        CollectionOptions::new(CollectionSpec::default_collection()).with_push(Mode::OneShot)
    }

    #[test]
    fn historical_pass_in_sequence_order() {
        let (_db, mut feed) = feed_with(coll_opts());
        let changes = feed.get_more_changes(100).unwrap();
        assert_eq!(changes.revs.len(), 3);
        assert!(changes.finished_history);
        assert_eq!(changes.first, Sequence(1));
        assert_eq!(changes.last, Sequence(3));
        let seqs: Vec<u64> = changes.revs.iter().map(|r| r.sequence.0).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        // Second pass: nothing new.
        let more = feed.get_more_changes(100).unwrap();
        assert!(more.revs.is_empty());
    }

    #[test]
    fn doc_id_filter_gates_candidates() {
        let mut opts = coll_opts();
        opts.doc_ids = Some(vec!["b".parse().unwrap()]);
        let (_db, mut feed) = feed_with(opts);
        let changes = feed.get_more_changes(100).unwrap();
        assert_eq!(changes.revs.len(), 1);
        assert_eq!(changes.revs[0].doc_id.as_str(), "b");
        // The interval still covers everything enumerated.
        assert_eq!(changes.last, Sequence(3));
    }

    #[test]
    fn push_filter_gates_candidates() {
        let mut opts = coll_opts();
        opts.push_filter = Some(Arc::new(|_, doc_id, _, _, body| {
            assert!(!body.is_empty());
            doc_id.as_str() != "b"
        }));
        let (_db, mut feed) = feed_with(opts);
        let changes = feed.get_more_changes(100).unwrap();
        let ids: Vec<&str> = changes.revs.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn propose_mode_skips_and_conflicts() {
        let mut opts = coll_opts();
        opts.propose_changes = true;
        let (db, mut feed) = feed_with(opts);
        let coll = CollectionSpec::default_collection();

        // The remote already has b's current revision: skip.
        db.in_transaction(|storage| {
            storage
                .set_remote_ancestor(
                    &coll,
                    &"b".parse().unwrap(),
                    db.remote_id(),
                    &"1-bb".parse().unwrap(),
                )
                .map_err(Error::from)
        })
        .unwrap();

        // c advances locally to 2-cc2, while the remote holds a separate
        // generation-3 tombstone branch: the branch loses the winner
        // election, c's current stays 2-cc2, and the remote ancestor is
        // strictly newer than what we would offer.
        db.in_transaction(|storage| {
            storage
                .put_rev(
                    &coll,
                    PutRequest {
                        doc_id: "c".parse().unwrap(),
                        history: vec!["2-cc2".parse().unwrap(), "1-cc".parse().unwrap()],
                        flags: RevFlags::default(),
                        allow_conflict: false,
                        remote_db_id: None,
                        body: NewBody::Full(Body::from_json(r#"{"n":31}"#).unwrap()),
                    },
                )
                .map_err(Error::from)
        })
        .unwrap();
        db.in_transaction(|storage| {
            storage
                .put_rev(
                    &coll,
                    PutRequest {
                        doc_id: "c".parse().unwrap(),
                        history: vec![
                            "3-cd".parse().unwrap(),
                            "2-cd".parse().unwrap(),
                            "1-cc".parse().unwrap(),
                        ],
                        flags: RevFlags::DELETED,
                        allow_conflict: true,
                        remote_db_id: Some(db.remote_id()),
                        body: NewBody::Full(Body::from_json(r#"{}"#).unwrap()),
                    },
                )
                .map_err(Error::from)
        })
        .unwrap();

        let changes = feed.get_more_changes(100).unwrap();
        let ids: Vec<&str> = changes.revs.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        let failed: Vec<&str> = changes
            .failures
            .iter()
            .map(|f| f.doc_id.as_str())
            .collect();
        assert_eq!(failed, vec!["c"]);
        assert!(matches!(
            changes.failures[0].error,
            Error::Http { status: 409, .. }
        ));
    }
}
