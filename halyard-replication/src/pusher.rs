// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use halyard_async::{Backoff, Spawner, Task};
use halyard_blip::{
    profiles, properties, Connection, MessageBuilder, MessageIn, ReplyError, Response,
};
use halyard_store::{BlobStore, Body, ContentLevel, DocId, RevId, Sequence};
use hmac::{Hmac, Mac as _};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    attachments,
    changes_feed::{Changes, ChangesFeed, RevToSend},
    checkpoint::Checkpointer,
    db::DbAccess,
    delta,
    error::Error,
    options::{CollectionOptions, Mode, Options},
    status::{ActivityLevel, DocumentEnded, Progress, WorkerEvent},
    tuning,
};

pub enum PusherInput {
    /// Begin pushing (active mode).
    Start,
    /// The storage observer buffered new changes.
    DbChanged,
    ChangesReplied {
        revs: Vec<RevToSend>,
        result: Result<Response, ReplyError>,
    },
    RevReplied {
        rev: RevToSend,
        sent_bytes: u64,
        result: Result<Response, ReplyError>,
    },
    /// A transiently-failed revision's backoff elapsed.
    Retry(RevToSend),
    /// Peer subscribes to our changes (passive mode).
    SubChanges(MessageIn),
    /// Peer requests a blob body.
    Attachment(MessageIn),
    /// Peer asks us to prove we hold a blob.
    ProveAttachment(MessageIn),
    Stop,
}

pub struct PusherHandle {
    pub tx: mpsc::UnboundedSender<PusherInput>,
    _task: Task<()>,
}

impl PusherHandle {
    pub fn send(&self, input: PusherInput) {
        let _ = self.tx.send(input);
    }
}

/// Drives the push half for one collection.
pub struct Pusher {
    db: Arc<DbAccess>,
    blobs: Arc<dyn BlobStore>,
    conn: Arc<Connection>,
    coll: CollectionOptions,
    options: Arc<Options>,
    checkpointer: Arc<Checkpointer>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    spawner: Spawner,
    self_tx: mpsc::UnboundedSender<PusherInput>,

    feed: ChangesFeed,
    proposed: bool,
    started: bool,
    caught_up: bool,
    announced_caught_up: bool,
    observing: bool,
    stopping: bool,

    change_lists_in_flight: usize,
    queued: VecDeque<RevToSend>,
    revs_in_flight: usize,
    rev_bytes_awaiting_reply: u64,
    /// Per-doc serialization: a doc with an in-flight revision stashes any
    /// newer one until the first completes.
    pushing_docs: HashMap<DocId, Option<RevToSend>>,

    /// Negotiated with the peer via `changes` reply properties.
    peer_max_history: usize,
    peer_accepts_deltas: bool,
    peer_supports_blobs: bool,

    /// A passive peer's `subChanges`, answered once history is drained.
    pending_sub_changes: Option<MessageIn>,
    pending_sub_changes_continuous: bool,

    progress: Progress,
    last_level: Option<ActivityLevel>,
}

impl Pusher {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        spawner: &Spawner,
        db: Arc<DbAccess>,
        blobs: Arc<dyn BlobStore>,
        conn: Arc<Connection>,
        coll: CollectionOptions,
        options: Arc<Options>,
        checkpointer: Arc<Checkpointer>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> PusherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = ChangesFeed::new(
            Arc::clone(&db),
            coll.clone(),
            checkpointer.local_min(),
        );
        let pusher = Self {
            proposed: coll.propose_changes,
            db,
            blobs,
            conn,
            coll,
            options,
            checkpointer,
            events,
            spawner: spawner.clone(),
            self_tx: tx.clone(),
            feed,
            started: false,
            caught_up: false,
            announced_caught_up: false,
            observing: false,
            stopping: false,
            change_lists_in_flight: 0,
            queued: VecDeque::new(),
            revs_in_flight: 0,
            rev_bytes_awaiting_reply: 0,
            pushing_docs: HashMap::new(),
            peer_max_history: tuning::DEFAULT_MAX_HISTORY,
            // Both start pessimistic until the peer's changes replies
            // negotiate them.
            peer_accepts_deltas: false,
            peer_supports_blobs: false,
            pending_sub_changes: None,
            pending_sub_changes_continuous: false,
            progress: Progress::default(),
            last_level: None,
        };
        let task = spawner.spawn(pusher.run(rx));
        PusherHandle { tx, _task: task }
    }

    #[instrument(skip_all, fields(collection = %self.coll.spec))]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PusherInput>) {
        while let Some(input) = rx.recv().await {
            match input {
                PusherInput::Start => self.start(),
                PusherInput::DbChanged => {
                    if self.observing {
                        self.maybe_get_more_changes()
                    }
                },
                PusherInput::ChangesReplied { revs, result } => {
                    self.handle_changes_reply(revs, result)
                },
                PusherInput::RevReplied {
                    rev,
                    sent_bytes,
                    result,
                } => self.handle_rev_reply(rev, sent_bytes, result),
                PusherInput::Retry(rev) => {
                    self.queued.push_back(rev);
                    self.maybe_send_revs();
                },
                PusherInput::SubChanges(msg) => self.handle_sub_changes(msg),
                PusherInput::Attachment(msg) => self.handle_get_attachment(msg),
                PusherInput::ProveAttachment(msg) => self.handle_prove_attachment(msg),
                PusherInput::Stop => break,
            }
            self.publish_status();
        }
        debug!("pusher stopped");
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!(since = %self.checkpointer.local_min(), proposed = self.proposed, "starting push");
        self.maybe_get_more_changes();
    }

    /// Keep pulling change batches from the feed while the caps allow.
    fn maybe_get_more_changes(&mut self) {
        while self.started
            && !self.stopping
            && self.change_lists_in_flight < tuning::MAX_CHANGE_LISTS_IN_FLIGHT
            && self.queued.len() < tuning::MAX_REVS_QUEUED
        {
            let changes = match self.feed.get_more_changes(tuning::CHANGES_BATCH_SIZE) {
                Ok(changes) => changes,
                Err(e) => {
                    self.fatal(e);
                    return;
                },
            };
            self.register_batch(&changes);
            let empty = changes.revs.is_empty();
            if !empty {
                self.send_changes(changes.revs);
            }
            if changes.finished_history {
                self.reached_end_of_history();
                if empty {
                    break;
                }
            } else if empty {
                break;
            }
        }
    }

    fn register_batch(&mut self, changes: &Changes) {
        if changes.last >= changes.first {
            self.checkpointer.add_pending_sequences(
                changes.revs.iter().map(|r| r.sequence),
                changes.first,
                changes.last,
            );
            let _ = self.events.send(WorkerEvent::CheckpointChanged {
                collection: self.coll.spec.clone(),
            });
        }
        for rev in &changes.revs {
            self.progress.total += rev.body_size;
        }
        if !changes.failures.is_empty() {
            let ended: Vec<DocumentEnded> = changes
                .failures
                .iter()
                .map(|f| DocumentEnded {
                    collection: self.coll.spec.clone(),
                    doc_id: f.doc_id.clone(),
                    rev_id: f.rev_id.clone(),
                    pushing: true,
                    purged: false,
                    error: Some(f.error.clone()),
                    error_is_transient: false,
                })
                .collect();
            let _ = self.events.send(WorkerEvent::DocumentsEnded(ended));
        }
    }

    fn reached_end_of_history(&mut self) {
        if !self.caught_up {
            self.caught_up = true;
            info!("push drained history");
            // An empty changes message tells the peer we are caught up.
            if !self.announced_caught_up {
                self.announced_caught_up = true;
                self.send_changes(Vec::new());
            }
            if let Some(mut sub) = self.pending_sub_changes.take() {
                sub.respond_ok();
            }
            let _ = self.events.send(WorkerEvent::CheckpointChanged {
                collection: self.coll.spec.clone(),
            });
        }
        if self.continuous() && !self.observing {
            let tx = self.self_tx.clone();
            let result = self
                .feed
                .start_observer(Box::new(move || {
                    let _ = tx.send(PusherInput::DbChanged);
                }));
            match result {
                Ok(()) => self.observing = true,
                Err(e) => self.fatal(e),
            }
        }
    }

    fn continuous(&self) -> bool {
        self.coll.push == Mode::Continuous
            || (self.coll.push == Mode::Passive && self.pending_sub_changes_continuous)
    }

    fn send_changes(&mut self, revs: Vec<RevToSend>) {
        self.change_lists_in_flight += 1;
        let profile = if self.proposed {
            profiles::PROPOSE_CHANGES
        } else {
            profiles::CHANGES
        };
        let rows: Vec<Value> = revs.iter().map(|rev| self.change_row(rev)).collect();
        let mut msg = MessageBuilder::new(profile)
            .compressed()
            .json_body(&Value::Array(rows));
        if tuning::CHANGE_MESSAGES_ARE_URGENT {
            msg = msg.urgent();
        }
        if !self.coll.spec.is_default() {
            msg = msg.property(properties::COLLECTION, self.coll.spec.path());
        }
        debug!(count = revs.len(), profile, "sending change list");

        match self.conn.send_request(msg) {
            Err(_) => {
                self.change_lists_in_flight -= 1;
            },
            Ok(pending) => {
                let tx = self.self_tx.clone();
                self.spawner
                    .spawn(async move {
                        let result = pending.await;
                        let _ = tx.send(PusherInput::ChangesReplied { revs, result });
                    })
                    .detach();
            },
        }
    }

    fn change_row(&self, rev: &RevToSend) -> Value {
        if self.proposed {
            let parent = rev
                .remote_ancestor
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default();
            json!([rev.doc_id.as_str(), rev.rev_id.to_string(), parent, rev.body_size])
        } else {
            json!([
                rev.sequence.0,
                rev.doc_id.as_str(),
                rev.rev_id.to_string(),
                if rev.is_deleted() { 1 } else { 0 },
                rev.body_size
            ])
        }
    }

    fn handle_changes_reply(
        &mut self,
        revs: Vec<RevToSend>,
        result: Result<Response, ReplyError>,
    ) {
        self.change_lists_in_flight = self.change_lists_in_flight.saturating_sub(1);
        let response = match result {
            Ok(response) => response,
            Err(ReplyError::Disconnected) => return,
            Err(ReplyError::Wire(wire)) => {
                // A rejected change list is a connection-level failure.
                self.fatal(Error::from(wire));
                return;
            },
            Err(_) => return,
        };

        // Adopt what the peer negotiated.
        if let Some(depth) = response.properties.get_u64(properties::MAX_HISTORY) {
            self.peer_max_history = (depth as usize).clamp(1, tuning::DEFAULT_MAX_HISTORY);
        }
        if response.properties.get(properties::DELTAS) == Some("false") {
            self.peer_accepts_deltas = false;
        } else if response.properties.get(properties::DELTAS) == Some("true") {
            self.peer_accepts_deltas = true;
        }
        if response.properties.get_bool(properties::BLOBS) {
            self.peer_supports_blobs = true;
        }

        let body = response.json_body().ok();
        let verdicts = body.as_ref().and_then(Value::as_array);
        let elided = Value::Null;
        for (i, rev) in revs.into_iter().enumerate() {
            let verdict = verdicts.and_then(|v| v.get(i)).unwrap_or(&elided);
            self.handle_change_verdict(rev, verdict);
        }
        self.maybe_send_revs();
        self.maybe_get_more_changes();
    }

    fn handle_change_verdict(&mut self, mut rev: RevToSend, verdict: &Value) {
        match verdict {
            // Trailing entries the peer elided mean "wanted".
            Value::Null => self.queue_rev(rev),
            Value::Number(n) => match n.as_u64().unwrap_or(0) {
                0 => self.queue_rev(rev),
                304 => {
                    // Peer already has it: record and move on, no body send.
                    trace!(doc = %rev.doc_id, rev = %rev.rev_id, "peer already has rev");
                    self.db
                        .mark_synced(&self.coll.spec, rev.doc_id.clone(), rev.rev_id.clone());
                    self.complete_rev(&rev);
                },
                status => {
                    let error = Error::http(status as u16, "change rejected by peer");
                    self.doc_failed(rev, error, false);
                },
            },
            Value::Array(ancestors) => {
                rev.ancestors_on_peer = ancestors
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse().ok())
                    .collect();
                self.queue_rev(rev);
            },
            _ => self.queue_rev(rev),
        }
    }

    /// Serialize per document: only one in-flight revision per doc.
    fn queue_rev(&mut self, rev: RevToSend) {
        match self.pushing_docs.get_mut(&rev.doc_id) {
            Some(stash) => {
                trace!(doc = %rev.doc_id, "stashing newer rev behind in-flight one");
                *stash = Some(rev);
            },
            None => {
                self.pushing_docs.insert(rev.doc_id.clone(), None);
                self.queued.push_back(rev);
            },
        }
    }

    fn maybe_send_revs(&mut self) {
        while self.revs_in_flight < tuning::MAX_REVS_IN_FLIGHT
            && self.rev_bytes_awaiting_reply < tuning::MAX_REV_BYTES_AWAITING_REPLY
        {
            let rev = match self.queued.pop_front() {
                Some(rev) => rev,
                None => break,
            };
            self.send_rev(rev);
        }
    }

    fn send_rev(&mut self, rev: RevToSend) {
        let doc = match self
            .db
            .get_doc(&self.coll.spec, &rev.doc_id, ContentLevel::All)
        {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                // Purged since enumeration: obsolete, drop without retry.
                self.complete_rev(&rev);
                self.release_doc_slot(&rev.doc_id);
                return;
            },
            Err(e) => {
                self.doc_failed(rev, e, false);
                return;
            },
        };
        let body = match doc.rev(&rev.rev_id).and_then(|r| r.body.clone()) {
            Some(body) => body,
            None => {
                trace!(doc = %rev.doc_id, rev = %rev.rev_id, "rev body gone, obsolete");
                self.complete_rev(&rev);
                self.release_doc_slot(&rev.doc_id);
                return;
            },
        };

        // Vector IDs may carry the `*` local-peer placeholder, which never
        // goes on the wire.
        let wire_rev_id = match &rev.rev_id {
            RevId::Vector(vv) if vv.versions().iter().any(|v| v.is_local_placeholder()) => {
                RevId::Vector(vv.resolve_local(&self.db.local_peer_id()))
            },
            other => other.clone(),
        };
        let mut msg = MessageBuilder::new(profiles::REV)
            .compressed()
            .property(properties::ID, rev.doc_id.as_str())
            .property(properties::REV, wire_rev_id.to_string())
            .property(properties::SEQUENCE, rev.sequence.0.to_string());
        if rev.is_deleted() {
            msg = msg.property(properties::DELETED, "true");
        }
        if self.proposed {
            msg = msg.property(properties::NO_CONFLICTS, "true");
        }
        if !self.coll.spec.is_default() {
            msg = msg.property(properties::COLLECTION, self.coll.spec.path());
        }

        let history = self.assemble_history(&doc, &rev);
        if !history.is_empty() {
            msg = msg.property(properties::HISTORY, history.join(","));
        }

        // Try to send a delta instead of the whole body.
        let mut payload: Option<(Vec<u8>, Option<RevId>)> = None;
        if self.peer_accepts_deltas
            && !self.options.disable_deltas
            && !rev.no_delta
            && body.size() >= tuning::MIN_BODY_SIZE_FOR_DELTA
        {
            payload = self.try_delta(&doc, &rev, &body);
        }
        let (bytes, delta_src) = match payload {
            Some((bytes, src)) => (bytes, src),
            None => {
                let value = match body.to_value() {
                    Ok(v) => v,
                    Err(e) => {
                        self.doc_failed(rev, Error::from(e), false);
                        return;
                    },
                };
                let value = if self.needs_legacy_attachments(&value) {
                    attachments::encode_legacy_attachments(&value, rev.rev_id.generation())
                } else {
                    value
                };
                (Body::from_value(&value).as_bytes().to_vec(), None)
            },
        };
        if let Some(src) = delta_src {
            msg = msg.property(properties::DELTA_SRC, src.to_string());
        }

        let sent_bytes = bytes.len() as u64;
        msg = msg.body(bytes);

        match self.conn.send_request(msg) {
            Err(_) => {
                // Connection gone; the rev stays pending for the next run.
            },
            Ok(pending) => {
                self.revs_in_flight += 1;
                self.rev_bytes_awaiting_reply += sent_bytes;
                trace!(doc = %rev.doc_id, rev = %rev.rev_id, sent_bytes, "sent rev");
                let tx = self.self_tx.clone();
                self.spawner
                    .spawn(async move {
                        let result = pending.await;
                        let _ = tx.send(PusherInput::RevReplied {
                            rev,
                            sent_bytes,
                            result,
                        });
                    })
                    .detach();
            },
        }
    }

    /// Up to `peer_max_history` ancestor IDs, newest first. Gaps left by
    /// pruned ancestors are padded with synthetic placeholders that carry
    /// the generation without exposing a real ID.
    fn assemble_history(&self, doc: &halyard_store::Document, rev: &RevToSend) -> Vec<String> {
        let mut out = Vec::new();
        if let RevId::Tree { generation, .. } = &rev.rev_id {
            let ancestry = doc.ancestry_of(&rev.rev_id);
            let mut expected = generation.saturating_sub(1);
            for ancestor in ancestry {
                if out.len() >= self.peer_max_history {
                    break;
                }
                let gen = ancestor.rev_id.generation();
                while expected > gen && out.len() < self.peer_max_history {
                    out.push(format!("{}-faded000000000000000000", expected));
                    expected -= 1;
                }
                out.push(ancestor.rev_id.to_string());
                expected = gen.saturating_sub(1);
            }
        } else if let RevId::Vector(_) = &rev.rev_id {
            // Version vectors carry their own ancestry.
        }
        out
    }

    fn try_delta(
        &self,
        doc: &halyard_store::Document,
        rev: &RevToSend,
        body: &Body,
    ) -> Option<(Vec<u8>, Option<RevId>)> {
        let mut candidates: Vec<&RevId> = Vec::new();
        if let Some(ancestor) = &rev.remote_ancestor {
            candidates.push(ancestor);
        }
        candidates.extend(rev.ancestors_on_peer.iter());

        for base_rev in candidates {
            let base_body = match doc.rev(base_rev).and_then(|r| r.body.as_ref()) {
                Some(b) => b,
                None => continue,
            };
            let (old, new) = match (base_body.to_value(), body.to_value()) {
                (Ok(old), Ok(new)) => (old, new),
                _ => continue,
            };
            let delta = delta::create_delta(&old, &new)?;
            let bytes = serde_json::to_vec(&delta).ok()?;
            let limit = (body.size() as f64 * tuning::MAX_DELTA_RATIO) as usize;
            if bytes.len() <= limit {
                trace!(
                    doc = %rev.doc_id, base = %base_rev,
                    delta_size = bytes.len(), body_size = body.size(),
                    "sending delta"
                );
                return Some((bytes, Some((*base_rev).clone())));
            }
            return None;
        }
        None
    }

    fn needs_legacy_attachments(&self, value: &Value) -> bool {
        (!self.peer_supports_blobs || self.options.disable_blob_support)
            && attachments::may_contain_blobs(value)
    }

    fn handle_rev_reply(
        &mut self,
        mut rev: RevToSend,
        sent_bytes: u64,
        result: Result<Response, ReplyError>,
    ) {
        self.revs_in_flight = self.revs_in_flight.saturating_sub(1);
        self.rev_bytes_awaiting_reply = self.rev_bytes_awaiting_reply.saturating_sub(sent_bytes);

        match result {
            Ok(_) => {
                trace!(doc = %rev.doc_id, rev = %rev.rev_id, "rev accepted by peer");
                self.db
                    .mark_synced(&self.coll.spec, rev.doc_id.clone(), rev.rev_id.clone());
                self.progress.completed += rev.body_size;
                self.progress.document_count += 1;
                let ended = DocumentEnded {
                    collection: self.coll.spec.clone(),
                    doc_id: rev.doc_id.clone(),
                    rev_id: rev.rev_id.clone(),
                    pushing: true,
                    purged: false,
                    error: None,
                    error_is_transient: false,
                };
                let _ = self.events.send(WorkerEvent::DocumentsEnded(vec![ended]));
                self.complete_rev(&rev);
                self.release_doc_slot(&rev.doc_id);
            },
            Err(ReplyError::Disconnected) => {
                // The rev stays pending; the checkpoint must not advance.
            },
            Err(ReplyError::Wire(wire)) => {
                let error = Error::from(wire);
                if matches!(error, Error::DeltaBaseUnknown(_) | Error::CorruptDelta(_)) {
                    // The peer could not apply our delta; re-send in full.
                    debug!(doc = %rev.doc_id, %error, "peer rejected delta, resending full body");
                    rev.no_delta = true;
                    self.queued.push_front(rev);
                } else if error.is_transient() && rev.retries < tuning::MAX_REV_RETRIES {
                    rev.retries += 1;
                    let mut backoff =
                        Backoff::new(tuning::RETRY_BASE_DELAY, tuning::RETRY_MAX_DELAY);
                    for _ in 0..rev.retries {
                        backoff.next_delay();
                    }
                    let delay = backoff.next_delay();
                    debug!(
                        doc = %rev.doc_id, retries = rev.retries, ?delay, %error,
                        "transient rev failure, retrying"
                    );
                    let tx = self.self_tx.clone();
                    self.spawner
                        .spawn(async move {
                            halyard_async::sleep(delay).await;
                            let _ = tx.send(PusherInput::Retry(rev));
                        })
                        .detach();
                } else {
                    self.doc_failed_in_flight(rev, error);
                }
            },
            Err(_) => {
                // The rev stays pending; the checkpoint must not advance.
            },
        }
        self.maybe_send_revs();
        self.maybe_get_more_changes();
    }

    /// A revision that never got a doc slot failed (change-list verdicts).
    fn doc_failed(&mut self, rev: RevToSend, error: Error, transient: bool) {
        warn!(doc = %rev.doc_id, rev = %rev.rev_id, %error, "doc failed to push");
        let ended = DocumentEnded {
            collection: self.coll.spec.clone(),
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.clone(),
            pushing: true,
            purged: false,
            error: Some(error),
            error_is_transient: transient,
        };
        let _ = self.events.send(WorkerEvent::DocumentsEnded(vec![ended]));
        // Permanent failures advance the checkpoint, so they aren't retried
        // forever.
        self.complete_rev(&rev);
        self.release_doc_slot(&rev.doc_id);
    }

    fn doc_failed_in_flight(&mut self, rev: RevToSend, error: Error) {
        self.progress.completed += rev.body_size;
        self.doc_failed(rev, error, false);
    }

    fn complete_rev(&mut self, rev: &RevToSend) {
        self.checkpointer.complete_pending(rev.sequence);
        let _ = self.events.send(WorkerEvent::CheckpointChanged {
            collection: self.coll.spec.clone(),
        });
    }

    fn release_doc_slot(&mut self, doc_id: &DocId) {
        if let Some(stashed) = self.pushing_docs.remove(doc_id) {
            if let Some(newer) = stashed {
                self.queue_rev(newer);
                self.maybe_send_revs();
            }
        }
    }

    // Passive side

    fn handle_sub_changes(&mut self, msg: MessageIn) {
        let since = Sequence(
            msg.property(properties::SINCE)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        );
        let continuous = msg.properties.get_bool(properties::CONTINUOUS);
        let active_only = msg.properties.get_bool(properties::ACTIVE_ONLY);
        info!(%since, continuous, "peer subscribed to our changes");

        let mut coll = self.coll.clone();
        if active_only {
            coll.skip_deleted = true;
        }
        self.feed = ChangesFeed::new(Arc::clone(&self.db), coll, since);
        if let Ok(body) = msg.json_body() {
            if let Some(ids) = body.get("docIDs").and_then(Value::as_array) {
                self.feed.filter_by_doc_ids(
                    ids.iter()
                        .filter_map(Value::as_str)
                        .filter_map(|s| s.parse().ok()),
                );
            }
        }
        self.pending_sub_changes_continuous = continuous;
        self.pending_sub_changes = Some(msg);
        self.started = true;
        self.caught_up = false;
        self.announced_caught_up = false;
        // The previous feed (and its observer) is gone; a fresh drain
        // decides again whether to observe.
        self.observing = false;
        self.maybe_get_more_changes();
    }

    fn handle_get_attachment(&mut self, mut msg: MessageIn) {
        let digest = msg
            .property(properties::DIGEST)
            .and_then(|d| d.parse::<halyard_store::BlobDigest>().ok());
        let content = digest.and_then(|d| self.blobs.content(&d).ok().flatten());
        match content {
            Some(bytes) => {
                trace!(size = bytes.len(), "serving attachment");
                msg.respond(Response::empty().with_body(bytes));
            },
            None => msg.respond_error(Error::Store(halyard_store::Error::NotFound).to_wire()),
        }
    }

    /// Respond with an HMAC over the blob content, keyed by the peer's
    /// nonce: possession without transfer.
    fn handle_prove_attachment(&mut self, mut msg: MessageIn) {
        let digest = msg
            .property(properties::DIGEST)
            .and_then(|d| d.parse::<halyard_store::BlobDigest>().ok());
        let content = digest.and_then(|d| self.blobs.content(&d).ok().flatten());
        match content {
            Some(bytes) => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&msg.body)
                    .expect("HMAC accepts any key length");
                mac.update(&bytes);
                let proof = base64::encode(mac.finalize().into_bytes());
                msg.respond(Response::empty().with_body(proof.into_bytes()));
            },
            None => msg.respond_error(Error::Store(halyard_store::Error::NotFound).to_wire()),
        }
    }

    fn level(&self) -> ActivityLevel {
        if self.stopping {
            ActivityLevel::Stopped
        } else if !self.started {
            if self.coll.push.is_active() {
                ActivityLevel::Connecting
            } else {
                ActivityLevel::Stopped
            }
        } else if self.change_lists_in_flight > 0
            || !self.queued.is_empty()
            || self.revs_in_flight > 0
            || !self.caught_up
            || self.checkpointer.pending_count() > 0
        {
            ActivityLevel::Busy
        } else if self.continuous() || self.coll.push == Mode::Passive {
            ActivityLevel::Idle
        } else {
            ActivityLevel::Stopped
        }
    }

    fn publish_status(&mut self) {
        let level = self.level();
        if self.last_level != Some(level) {
            self.last_level = Some(level);
            let _ = self.events.send(WorkerEvent::Status {
                collection: self.coll.spec.clone(),
                pushing: true,
                level,
                progress: self.progress,
            });
        }
    }

    fn fatal(&self, error: Error) {
        let _ = self.events.send(WorkerEvent::Fatal {
            collection: self.coll.spec.clone(),
            error,
        });
    }
}
