// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{collections::VecDeque, sync::Arc};

use halyard_async::{Spawner, Task};
use halyard_blip::{profiles, properties, Connection, MessageBuilder, MessageIn, Response};
use halyard_store::BlobStore;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    checkpoint::Checkpointer,
    db::DbAccess,
    error::Error,
    incoming_rev::{self, IncomingContext, RevOutcome},
    inserter::Inserter,
    options::{CollectionOptions, Mode, Options},
    remote_seq::{RemoteSequence, RemoteSequenceSet},
    rev_finder::RevFinder,
    status::{ActivityLevel, DocumentEnded, Progress, WorkerEvent},
    tuning,
};

pub enum PullerInput {
    /// Subscribe to the peer's changes (active mode only).
    Start,
    /// An inbound `changes` or `proposeChanges` request.
    Changes(MessageIn),
    /// An inbound `rev`.
    Rev(MessageIn),
    /// An inbound `norev`.
    NoRev(MessageIn),
    Stop,
}

pub struct PullerHandle {
    pub tx: mpsc::UnboundedSender<PullerInput>,
    _task: Task<()>,
}

impl PullerHandle {
    pub fn send(&self, input: PullerInput) {
        let _ = self.tx.send(input);
    }
}

/// Drives the pull half for one collection.
pub struct Puller {
    db: Arc<DbAccess>,
    conn: Arc<Connection>,
    coll: CollectionOptions,
    options: Arc<Options>,
    checkpointer: Arc<Checkpointer>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    spawner: Spawner,
    finder: RevFinder,
    inserter: Arc<Inserter>,
    blobs: Arc<dyn BlobStore>,

    last_sequence: RemoteSequence,
    missing: RemoteSequenceSet,
    pending_rev_messages: usize,
    active_incoming: usize,
    unfinished_incoming: usize,
    waiting_revs: VecDeque<MessageIn>,
    deferred_changes: VecDeque<(MessageIn, Vec<(&'static str, String)>, Vec<Value>)>,
    caught_up: bool,
    stopping: bool,
    progress: Progress,
    last_level: Option<ActivityLevel>,

    outcome_tx: mpsc::UnboundedSender<RevOutcome>,
}

impl Puller {
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
    ) -> PullerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let finder = RevFinder::new(Arc::clone(&db), coll.spec.clone(), &options);
        let inserter = Arc::new(Inserter::spawn(
            spawner,
            Arc::clone(&db),
            coll.spec.clone(),
            options.no_incoming_conflicts,
        ));
        let last_sequence = checkpointer.remote();
        let mut missing = RemoteSequenceSet::new();
        missing.clear(last_sequence.clone());
        let puller = Self {
            db,
            conn,
            coll,
            options,
            checkpointer,
            events,
            spawner: spawner.clone(),
            finder,
            inserter,
            blobs,
            last_sequence,
            missing,
            pending_rev_messages: 0,
            active_incoming: 0,
            unfinished_incoming: 0,
            waiting_revs: VecDeque::new(),
            deferred_changes: VecDeque::new(),
            caught_up: false,
            stopping: false,
            progress: Progress::default(),
            last_level: None,
            outcome_tx,
        };
        let task = spawner.spawn(puller.run(rx, outcome_rx));
        PullerHandle { tx, _task: task }
    }

    #[instrument(skip_all, fields(collection = %self.coll.spec))]
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PullerInput>,
        mut outcomes: mpsc::UnboundedReceiver<RevOutcome>,
    ) {
        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    None | Some(PullerInput::Stop) => break,
                    Some(PullerInput::Start) => self.start(),
                    Some(PullerInput::Changes(msg)) => self.handle_changes(msg),
                    Some(PullerInput::Rev(msg)) => self.handle_rev(msg),
                    Some(PullerInput::NoRev(msg)) => self.handle_no_rev(msg),
                },
                outcome = outcomes.recv() => match outcome {
                    None => break,
                    Some(outcome) => self.handle_outcome(outcome),
                },
            }
            self.publish_status();
        }
        debug!("puller stopped");
    }

    /// Send the opening `subChanges`.
    fn start(&mut self) {
        let mut msg = MessageBuilder::new(profiles::SUB_CHANGES);
        if !self.last_sequence.is_none() {
            msg = msg.property(properties::SINCE, self.last_sequence.to_string());
        }
        if self.coll.pull == Mode::Continuous {
            msg = msg.property(properties::CONTINUOUS, "true");
        }
        msg = msg.property(properties::BATCH, tuning::CHANGES_BATCH_SIZE.to_string());
        if self.coll.skip_deleted {
            msg = msg.property(properties::ACTIVE_ONLY, "true");
        }
        if let Some(filter) = &self.options.filter_name {
            msg = msg.property(properties::FILTER, filter.clone());
            if filter == "sync_gateway/bychannel" {
                msg = msg.property(properties::CHANNELS, self.coll.channels.join(","));
            }
        } else if !self.coll.channels.is_empty() {
            msg = msg.property(properties::FILTER, "sync_gateway/bychannel");
            msg = msg.property(properties::CHANNELS, self.coll.channels.join(","));
        }
        if !self.coll.spec.is_default() {
            msg = msg.property(properties::COLLECTION, self.coll.spec.path());
        }
        if let Some(doc_ids) = &self.coll.doc_ids {
            let ids: Vec<&str> = doc_ids.iter().map(|d| d.as_str()).collect();
            msg = msg.json_body(&json!({ "docIDs": ids }));
        }
        info!(since = %self.last_sequence, "subscribing to peer changes");

        match self.conn.send_request(msg) {
            Err(_) => self.fatal(Error::WebSocket {
                code: 1006,
                message: "connection closed before subChanges".into(),
            }),
            Ok(pending) => {
                let events = self.events.clone();
                let collection = self.coll.spec.clone();
                self.spawner
                    .spawn(async move {
                        if let Err(halyard_blip::ReplyError::Wire(wire)) = pending.await {
                            let _ = events.send(WorkerEvent::Fatal {
                                collection,
                                error: Error::from(wire),
                            });
                        }
                    })
                    .detach();
            },
        }
    }

    /// Triage an inbound change list and reply with the wanted-bits vector.
    fn handle_changes(&mut self, mut msg: MessageIn) {
        let proposed = msg.profile() == profiles::PROPOSE_CHANGES;
        let body = match msg.json_body() {
            Ok(body) => body,
            Err(e) => {
                msg.respond_error(Error::body(format!("bad changes body: {}", e)).to_wire());
                return;
            },
        };
        let items = match RevFinder::parse_changes(proposed, &body) {
            Ok(items) => items,
            Err(e) => {
                msg.respond_error(e.to_wire());
                return;
            },
        };

        if items.is_empty() {
            if !self.caught_up {
                info!("caught up with peer changes");
                self.caught_up = true;
            }
            msg.respond_ok();
            return;
        }

        let verdicts = match self.finder.find_revs(proposed, &items) {
            Ok(verdicts) => verdicts,
            Err(e) => {
                msg.respond_error(e.to_wire());
                return;
            },
        };

        for (item, verdict) in items.iter().zip(&verdicts) {
            if verdict.wanted() {
                if !item.remote_seq.is_none() {
                    self.missing.add(item.remote_seq.clone(), item.body_size);
                    self.progress.total += item.body_size;
                }
                self.pending_rev_messages += 1;
            } else if !item.remote_seq.is_none() {
                // Rejected or already present: the checkpoint may advance
                // past it immediately.
                self.missing.add(item.remote_seq.clone(), 0);
                self.completed_sequence(&item.remote_seq.clone());
            }
        }

        let response_props = self.finder.response_properties();
        let response_body: Vec<Value> = verdicts.iter().map(|v| v.to_json()).collect();
        if self.over_capacity() {
            // Backpressure: holding the reply throttles the peer's sender.
            trace!("deferring changes reply, incoming revs saturated");
            self.deferred_changes
                .push_back((msg, response_props, response_body));
        } else {
            respond_to_changes(&mut msg, response_props, response_body);
        }
    }

    fn handle_rev(&mut self, msg: MessageIn) {
        self.pending_rev_messages = self.pending_rev_messages.saturating_sub(1);
        if self.active_incoming >= tuning::MAX_ACTIVE_INCOMING_REVS
            || self.unfinished_incoming >= tuning::MAX_INCOMING_REVS
        {
            self.waiting_revs.push_back(msg);
            return;
        }
        self.start_incoming_rev(msg);
    }

    fn start_incoming_rev(&mut self, msg: MessageIn) {
        self.active_incoming += 1;
        self.unfinished_incoming += 1;
        let ctx = IncomingContext {
            db: Arc::clone(&self.db),
            blobs: Arc::clone(&self.blobs),
            conn: Arc::clone(&self.conn),
            coll: self.coll.clone(),
            options: Arc::clone(&self.options),
            inserter: Arc::clone(&self.inserter),
            spawner: self.spawner.clone(),
            outcomes: self.outcome_tx.clone(),
        };
        if incoming_rev::needs_async_processing(&msg, &self.coll, &self.options) {
            // Expensive work (blob fetches, filters, big bodies) runs on its
            // own worker so this loop stays responsive.
            self.spawner.spawn(incoming_rev::handle_rev(ctx, msg)).detach();
        } else {
            incoming_rev::handle_rev_inline(ctx, msg);
        }
    }

    fn handle_no_rev(&mut self, mut msg: MessageIn) {
        self.pending_rev_messages = self.pending_rev_messages.saturating_sub(1);
        let seq = RemoteSequence::from_property(
            msg.property(properties::SEQUENCE).unwrap_or_default(),
        );
        debug!(%seq, "peer replaced announced rev with norev");
        if !seq.is_none() {
            self.completed_sequence(&seq);
        }
        msg.respond_ok();
    }

    fn handle_outcome(&mut self, outcome: RevOutcome) {
        self.active_incoming = self.active_incoming.saturating_sub(1);
        self.unfinished_incoming = self.unfinished_incoming.saturating_sub(1);
        // Progress is credited even when the revision failed transiently:
        // the bytes did transfer.
        self.progress.completed += outcome.body_size;
        self.progress.document_count += 1;

        let transient = outcome
            .result
            .as_ref()
            .err()
            .map(Error::is_transient)
            .unwrap_or(false);
        match &outcome.result {
            Ok(()) => {
                if !outcome.remote_seq.is_none() {
                    self.completed_sequence(&outcome.remote_seq);
                }
            },
            Err(error) if transient => {
                // Leave the sequence outstanding: the checkpoint must not
                // advance past it, and a later sync retries it.
                warn!(seq = %outcome.remote_seq, %error, "transient failure pulling rev");
            },
            Err(error) => {
                warn!(seq = %outcome.remote_seq, %error, "permanent failure pulling rev");
                if !outcome.remote_seq.is_none() {
                    self.completed_sequence(&outcome.remote_seq);
                }
            },
        }

        if let (Some(doc_id), Some(rev_id)) = (outcome.doc_id, outcome.rev_id) {
            let ended = DocumentEnded {
                collection: self.coll.spec.clone(),
                doc_id,
                rev_id,
                pushing: false,
                purged: outcome.purged,
                error: outcome.result.err(),
                error_is_transient: transient,
            };
            let _ = self.events.send(WorkerEvent::DocumentsEnded(vec![ended]));
        }

        // Free capacity: unpark revs first, then release deferred replies.
        while !self.over_active_capacity() {
            match self.waiting_revs.pop_front() {
                Some(msg) => self.start_incoming_rev(msg),
                None => break,
            }
        }
        while !self.over_capacity() {
            match self.deferred_changes.pop_front() {
                Some((mut msg, props, body)) => respond_to_changes(&mut msg, props, body),
                None => break,
            }
        }
    }

    fn completed_sequence(&mut self, seq: &RemoteSequence) {
        if let Some((was_earliest, _size)) = self.missing.remove(seq) {
            if was_earliest {
                self.last_sequence = self.missing.since();
                trace!(checkpoint = %self.last_sequence, "pull checkpoint advanced");
                self.checkpointer.set_remote(self.last_sequence.clone());
                let _ = self.events.send(WorkerEvent::CheckpointChanged {
                    collection: self.coll.spec.clone(),
                });
            }
        }
    }

    fn over_capacity(&self) -> bool {
        self.unfinished_incoming >= tuning::MAX_INCOMING_REVS || !self.waiting_revs.is_empty()
    }

    fn over_active_capacity(&self) -> bool {
        self.active_incoming >= tuning::MAX_ACTIVE_INCOMING_REVS
            || self.unfinished_incoming >= tuning::MAX_INCOMING_REVS
    }

    fn level(&self) -> ActivityLevel {
        if self.stopping {
            ActivityLevel::Stopped
        } else if !self.missing.is_empty()
            || self.pending_rev_messages > 0
            || self.unfinished_incoming > 0
            || !self.caught_up
        {
            ActivityLevel::Busy
        } else if self.coll.pull == Mode::Continuous || self.coll.pull == Mode::Passive {
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
                pushing: false,
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

fn respond_to_changes(
    msg: &mut MessageIn,
    props: Vec<(&'static str, String)>,
    body: Vec<Value>,
) {
    let mut response = Response::empty().with_json_body(&Value::Array(body));
    for (name, value) in props {
        response = response.with_property(name, value);
    }
    msg.respond(response);
}
