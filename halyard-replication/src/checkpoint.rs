// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{collections::BTreeSet, time::Duration};

use halyard_async::{Debounce, Spawner};
use halyard_store::{stores, CollectionSpec, Sequence};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha1::{Digest as _, Sha1};
use tracing::debug;

use crate::{
    db::DbAccess,
    error::{Error, Result},
    options::{CollectionOptions, Options},
    remote_seq::RemoteSequence,
};

/// Persisted sync progress with one peer for one collection.
///
/// `local` is the highest sequence below which every local revision has been
/// offered to the peer and completed; `local_completed` lists completed
/// ranges above it (out-of-order acknowledgements surviving a restart);
/// `remote` is the latest fully-processed remote sequence.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Checkpoint {
    pub local: Sequence,
    pub local_completed: Vec<(u64, u64)>,
    pub remote: RemoteSequence,
}

impl Checkpoint {
    pub fn to_json(&self) -> Value {
        let mut doc = serde_json::Map::new();
        if self.local != Sequence::ZERO {
            doc.insert("local".into(), json!(self.local.0));
        }
        if !self.local_completed.is_empty() {
            let ranges: Vec<Value> = self
                .local_completed
                .iter()
                .map(|(a, b)| json!([a, b]))
                .collect();
            doc.insert("localCompleted".into(), Value::Array(ranges));
        }
        if !self.remote.is_none() {
            doc.insert("remote".into(), self.remote.to_json_value());
        }
        Value::Object(doc)
    }

    pub fn from_json(value: &Value) -> Self {
        let local = Sequence(value.get("local").and_then(Value::as_u64).unwrap_or(0));
        let local_completed = value
            .get("localCompleted")
            .and_then(Value::as_array)
            .map(|ranges| {
                ranges
                    .iter()
                    .filter_map(|r| {
                        let r = r.as_array()?;
                        Some((r.first()?.as_u64()?, r.get(1)?.as_u64()?))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let remote = value
            .get("remote")
            .map(RemoteSequence::from_json_value)
            .unwrap_or_default();
        Self {
            local,
            local_completed,
            remote,
        }
    }

    pub fn to_body(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_json()).expect("checkpoint encodes")
    }

    pub fn from_body(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::body(format!("unreadable checkpoint: {}", e)))?;
        Ok(Self::from_json(&value))
    }
}

/// Derive the deterministic checkpoint document ID.
///
/// SHA-1 over the canonical JSON array of everything that, when changed,
/// must start progress over: local DB UUID, remote identity, channels,
/// filter, and the docID filter. Base64, prefixed `cp-`.
pub fn checkpoint_id(local_uuid: &str, options: &Options, coll: &CollectionOptions) -> String {
    let mut key = vec![json!(local_uuid), json!(options.remote_identity())];
    if !coll.spec.is_default() {
        key.push(json!(coll.spec.path()));
    }
    if !coll.channels.is_empty() {
        key.push(json!(coll.channels));
    }
    if let Some(filter) = &options.filter_name {
        key.push(json!(filter));
        key.push(options.filter_params.clone().unwrap_or(Value::Null));
    }
    if let Some(doc_ids) = &coll.doc_ids {
        key.push(json!(doc_ids
            .iter()
            .map(|d| d.as_str().to_owned())
            .collect::<Vec<_>>()));
    }
    let canonical = serde_json::to_vec(&Value::Array(key)).expect("key encodes");
    let digest = Sha1::digest(&canonical);
    format!("cp-{}", base64::encode(digest))
}

struct Inner {
    checkpoint: Checkpoint,
    /// Push sequences offered but not yet known persisted remotely.
    pending: BTreeSet<u64>,
    /// Completed sequences above `checkpoint.local`.
    completed_above: BTreeSet<u64>,
    max_offered: u64,
    dirty: bool,
    /// Peer-side revision of our checkpoint doc, for `setCheckpoint` MVCC.
    remote_rev: Option<String>,
}

/// Tracks one collection's push and pull progress, and persists it.
pub struct Checkpointer {
    collection: CollectionSpec,
    id: String,
    inner: Mutex<Inner>,
    autosave: Mutex<Option<Debounce>>,
}

impl Checkpointer {
    pub fn new(local_uuid: &str, options: &Options, coll: &CollectionOptions) -> Self {
        Self {
            collection: coll.spec.clone(),
            id: checkpoint_id(local_uuid, options, coll),
            inner: Mutex::new(Inner {
                checkpoint: Checkpoint::default(),
                pending: BTreeSet::new(),
                completed_above: BTreeSet::new(),
                max_offered: 0,
                dirty: false,
                remote_rev: None,
            }),
            autosave: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }

    /// Load the locally-persisted checkpoint. Falls back to the ID derived
    /// from the database's previous UUID (pre-copy) when the primary is
    /// absent. Returns whether a stored checkpoint was found.
    pub fn read(&self, db: &DbAccess, options: &Options, coll: &CollectionOptions, reset: bool) -> Result<bool> {
        let mut raw = db.get_raw(stores::LOCAL_CHECKPOINTS, &self.id)?;
        if raw.is_none() {
            if let Some(previous) = db.previous_private_uuid() {
                let old_id = checkpoint_id(&previous, options, coll);
                raw = db.get_raw(stores::LOCAL_CHECKPOINTS, &old_id)?;
                if raw.is_some() {
                    debug!(collection = %self.collection, "migrating checkpoint from pre-copy UUID");
                }
            }
        }
        let existed = raw.is_some();
        if !existed {
            // First run against this peer: persist the zero baseline at the
            // next save, so both ends agree a sync happened.
            self.inner.lock().dirty = true;
        }
        if !reset {
            if let Some(raw) = raw {
                let checkpoint = Checkpoint::from_body(&raw.body)?;
                let mut inner = self.inner.lock();
                inner.max_offered = checkpoint
                    .local_completed
                    .last()
                    .map(|&(_, b)| b)
                    .unwrap_or(checkpoint.local.0);
                inner.completed_above = checkpoint
                    .local_completed
                    .iter()
                    .flat_map(|&(a, b)| a..=b)
                    .collect();
                inner.checkpoint = checkpoint;
            }
        }
        Ok(existed)
    }

    /// Compare against the copy the peer holds. A mismatch means one side
    /// lost state: progress must restart from zero.
    pub fn validate_with(&self, remote: &Checkpoint) -> bool {
        let mut inner = self.inner.lock();
        if inner.checkpoint.local == remote.local && inner.checkpoint.remote == remote.remote {
            true
        } else {
            debug!(
                collection = %self.collection,
                ours = ?inner.checkpoint, theirs = ?remote,
                "checkpoint mismatch, resetting"
            );
            inner.checkpoint = Checkpoint::default();
            inner.pending.clear();
            inner.completed_above.clear();
            inner.max_offered = 0;
            inner.dirty = true;
            false
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let mut inner = self.inner.lock();
        let ranges = ranges_of(&inner.completed_above);
        inner.checkpoint.local_completed = ranges;
        inner.checkpoint.clone()
    }

    pub fn local_min(&self) -> Sequence {
        self.inner.lock().checkpoint.local
    }

    pub fn remote(&self) -> RemoteSequence {
        self.inner.lock().checkpoint.remote.clone()
    }

    pub fn remote_rev(&self) -> Option<String> {
        self.inner.lock().remote_rev.clone()
    }

    pub fn set_remote_rev(&self, rev: Option<String>) {
        self.inner.lock().remote_rev = rev;
    }

    /// Record a batch of enumerated sequences: `pending` were turned into
    /// revs to send; everything else in `first..=last` was filtered or
    /// skipped and counts as completed right away.
    pub fn add_pending_sequences(
        &self,
        pending: impl IntoIterator<Item = Sequence>,
        first: Sequence,
        last: Sequence,
    ) {
        let mut inner = self.inner.lock();
        let pending: BTreeSet<u64> = pending.into_iter().map(|s| s.0).collect();
        for seq in first.0..=last.0 {
            if seq > inner.checkpoint.local.0 && !pending.contains(&seq) {
                inner.completed_above.insert(seq);
            }
        }
        inner.pending.extend(pending.iter().copied());
        inner.max_offered = inner.max_offered.max(last.0);
        advance(&mut inner);
        drop(inner);
        self.mutated();
    }

    /// A pushed revision is now known persisted remotely.
    pub fn complete_pending(&self, seq: Sequence) {
        let mut inner = self.inner.lock();
        if inner.pending.remove(&seq.0) && seq.0 > inner.checkpoint.local.0 {
            inner.completed_above.insert(seq.0);
        }
        advance(&mut inner);
        drop(inner);
        self.mutated();
    }

    pub fn is_sequence_completed(&self, seq: Sequence) -> bool {
        let inner = self.inner.lock();
        seq <= inner.checkpoint.local || inner.completed_above.contains(&seq.0)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Record pull progress: `seq` and everything announced before it has
    /// been fully processed.
    pub fn set_remote(&self, seq: RemoteSequence) {
        {
            let mut inner = self.inner.lock();
            if inner.checkpoint.remote == seq {
                return;
            }
            inner.checkpoint.remote = seq;
            inner.dirty = true;
        }
        self.mutated();
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Persist locally. Runs its own transaction on `db`.
    pub fn save_local(&self, db: &DbAccess) -> Result<()> {
        let body = self.checkpoint().to_body();
        db.in_transaction(|storage| {
            storage
                .put_raw(stores::LOCAL_CHECKPOINTS, &self.id, None, Some(&body))
                .map_err(Error::from)
        })?;
        self.inner.lock().dirty = false;
        Ok(())
    }

    /// After any mutation, schedule a save `delay` later unless one is
    /// already scheduled.
    pub fn enable_autosave<F>(&self, spawner: &Spawner, delay: Duration, on_save: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.autosave.lock() = Some(Debounce::new(spawner, delay, on_save));
    }

    /// Disarm autosave, firing a final save if one was due.
    pub fn stop_autosave(&self) {
        if let Some(debounce) = self.autosave.lock().take() {
            if self.is_dirty() {
                debounce.flush();
            }
        }
    }

    fn mutated(&self) {
        self.inner.lock().dirty = true;
        if let Some(debounce) = &*self.autosave.lock() {
            debounce.schedule();
        }
    }
}

fn advance(inner: &mut Inner) {
    while inner.completed_above.remove(&(inner.checkpoint.local.0 + 1)) {
        inner.checkpoint.local = inner.checkpoint.local.next();
        inner.dirty = true;
    }
}

fn ranges_of(set: &BTreeSet<u64>) -> Vec<(u64, u64)> {
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for &seq in set {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == seq => *end = seq,
            _ => ranges.push((seq, seq)),
        }
    }
    ranges
}

/// Read a checkpoint stored on behalf of a peer (passive role).
/// Returns `(rev, body)`.
pub fn read_peer_checkpoint(db: &DbAccess, client_id: &str) -> Result<Option<(String, Vec<u8>)>> {
    Ok(db
        .get_raw(stores::PEER_CHECKPOINTS, client_id)?
        .map(|raw| (raw.meta, raw.body.to_vec())))
}

/// Store a peer's checkpoint under MVCC: the caller must present the current
/// `rev` (absent for creation); the new rev is `<generation>-cc`.
pub fn save_peer_checkpoint(
    db: &DbAccess,
    client_id: &str,
    body: &[u8],
    expected_rev: Option<&str>,
) -> Result<String> {
    let current = db.get_raw(stores::PEER_CHECKPOINTS, client_id)?;
    let current_rev = current.as_ref().map(|raw| raw.meta.as_str());
    if current_rev != expected_rev {
        return Err(Error::Store(halyard_store::Error::Conflict));
    }
    let generation = expected_rev
        .and_then(|r| r.split_once('-'))
        .and_then(|(gen, _)| gen.parse::<u64>().ok())
        .unwrap_or(0);
    let new_rev = format!("{}-cc", generation + 1);
    db.in_transaction(|storage| {
        storage
            .put_raw(
                stores::PEER_CHECKPOINTS,
                client_id,
                Some(&new_rev),
                Some(body),
            )
            .map_err(Error::from)
    })?;
    Ok(new_rev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_store::DocId;

    fn options() -> Options {
        Options::new("wss://example.org/db")
    }

    fn coll_options() -> CollectionOptions {
        CollectionOptions::new(CollectionSpec::default_collection())
    }

    #[test]
    fn checkpoint_json_roundtrip() {
        let cp = Checkpoint {
            local: Sequence(42),
            local_completed: vec![(44, 45), (48, 48)],
            remote: RemoteSequence::Int(1234),
        };
        let back = Checkpoint::from_body(&cp.to_body()).unwrap();
        assert_eq!(back, cp);

        assert_eq!(
            Checkpoint::default().to_json(),
            serde_json::json!({})
        );
    }

    #[test]
    fn id_is_stable_and_sensitive() {
        let base = checkpoint_id("uuid-1", &options(), &coll_options());
        assert!(base.starts_with("cp-"));
        assert_eq!(base, checkpoint_id("uuid-1", &options(), &coll_options()));

        assert_ne!(base, checkpoint_id("uuid-2", &options(), &coll_options()));
        assert_ne!(
            base,
            checkpoint_id("uuid-1", &Options::new("wss://other/db"), &coll_options())
        );
        let mut filtered = coll_options();
        filtered.doc_ids = Some(vec!["a".parse::<DocId>().unwrap()]);
        assert_ne!(base, checkpoint_id("uuid-1", &options(), &filtered));
        let mut channels = coll_options();
        channels.channels = vec!["ch1".into()];
        assert_ne!(base, checkpoint_id("uuid-1", &options(), &channels));
    }

    #[test]
    fn pending_sequences_advance_with_gaps() {
        let cp = Checkpointer::new("uuid", &options(), &coll_options());
        // Sequences 1..=5 enumerated; 2 and 4 became revs, rest filtered.
        cp.add_pending_sequences([Sequence(2), Sequence(4)], Sequence(1), Sequence(5));
        assert_eq!(cp.local_min(), Sequence(1));
        assert!(!cp.is_sequence_completed(Sequence(2)));
        assert!(cp.is_sequence_completed(Sequence(3)));

        // Completing out of order does not skip the stuck sequence.
        cp.complete_pending(Sequence(4));
        assert_eq!(cp.local_min(), Sequence(1));
        assert!(cp.is_sequence_completed(Sequence(4)));

        cp.complete_pending(Sequence(2));
        assert_eq!(cp.local_min(), Sequence(5));
        assert_eq!(cp.pending_count(), 0);
    }

    #[test]
    fn completed_ranges_survive_snapshot() {
        let cp = Checkpointer::new("uuid", &options(), &coll_options());
        cp.add_pending_sequences(
            [Sequence(1), Sequence(2), Sequence(3)],
            Sequence(1),
            Sequence(3),
        );
        cp.complete_pending(Sequence(3));
        let snapshot = cp.checkpoint();
        assert_eq!(snapshot.local, Sequence::ZERO);
        assert_eq!(snapshot.local_completed, vec![(3, 3)]);
    }

    #[test]
    fn validation_resets_on_mismatch() {
        let cp = Checkpointer::new("uuid", &options(), &coll_options());
        cp.add_pending_sequences([Sequence(1)], Sequence(1), Sequence(1));
        cp.complete_pending(Sequence(1));
        assert_eq!(cp.local_min(), Sequence(1));

        let theirs = Checkpoint {
            local: Sequence(7),
            ..Default::default()
        };
        assert!(!cp.validate_with(&theirs));
        assert_eq!(cp.local_min(), Sequence::ZERO);

        let ours = cp.checkpoint();
        assert!(cp.validate_with(&ours));
    }
}
