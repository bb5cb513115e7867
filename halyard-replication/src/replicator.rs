// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{sync::Arc, time::Instant};

use halyard_async::{Spawner, Task};
use halyard_blip::{
    profiles, properties, Close, Connection, MessageBuilder, MessageIn, ReplyError, Response,
    WireError,
};
use halyard_store::{BlobStore, CollectionSpec, Storage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::{
    checkpoint::{self, Checkpoint, Checkpointer},
    db::DbAccess,
    error::{Error, Result},
    options::{CollectionOptions, Mode, Options, ProgressLevel},
    puller::{Puller, PullerHandle, PullerInput},
    pusher::{Pusher, PusherHandle, PusherInput},
    status::{ActivityLevel, Event, Progress, Status, WorkerEvent},
    tuning,
};

/// Everything needed to start a replicator.
pub struct Config {
    pub storage: Arc<dyn Storage>,
    pub blobs: Arc<dyn BlobStore>,
    pub options: Options,
}

/// Top-level supervisor: owns the connection, negotiates collections and
/// checkpoints, routes incoming requests, aggregates status.
pub struct Replicator {
    tx: mpsc::UnboundedSender<Input>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    status_rx: watch::Receiver<Status>,
    _task: Task<()>,
}

enum Input {
    Worker(WorkerEvent),
    SaveCheckpoints,
    NotifyStatus,
    PeerClosed(Option<Close>),
    Stop,
}

impl Replicator {
    /// Open the replicator on an established connection and start it.
    pub fn start(spawner: &Spawner, conn: Connection, config: Config) -> Result<Self> {
        let Config {
            storage,
            blobs,
            options,
        } = config;
        let options = Arc::new(options);
        let db = Arc::new(DbAccess::new(storage, options.remote_identity())?);
        let conn = Arc::new(conn);

        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            level: ActivityLevel::Connecting,
            ..Status::default()
        });

        let actor = Actor {
            db,
            blobs,
            conn,
            options,
            spawner: spawner.clone(),
            self_tx: tx.clone(),
            events_tx,
            status_tx,
            collections: Vec::new(),
            last_notify: Instant::now() - tuning::MIN_DELEGATE_CALL_INTERVAL,
            notify_scheduled: false,
            stopping: false,
            fatal_error: None,
        };
        let task = spawner.spawn(actor.run(rx));
        Ok(Self {
            tx,
            events: Mutex::new(Some(events_rx)),
            status_rx,
            _task: task,
        })
    }

    /// The delegate event stream. Yields `None` after the final status.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.events.lock().take()
    }

    pub fn status(&self) -> Status {
        self.status_rx.borrow().clone()
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Input::Stop);
    }

    /// Wait until the replicator reaches `Stopped`, returning the final
    /// status.
    pub async fn wait_stopped(&self) -> Status {
        let mut rx = self.status_rx.clone();
        loop {
            {
                let status = rx.borrow();
                if status.level == ActivityLevel::Stopped {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.status_rx.borrow().clone();
            }
        }
    }
}

struct CollectionState {
    options: CollectionOptions,
    checkpointer: Arc<Checkpointer>,
    pusher: Option<PusherHandle>,
    puller: Option<PullerHandle>,
    push_level: ActivityLevel,
    pull_level: ActivityLevel,
    push_progress: Progress,
    pull_progress: Progress,
}

struct Actor {
    db: Arc<DbAccess>,
    blobs: Arc<dyn BlobStore>,
    conn: Arc<Connection>,
    options: Arc<Options>,
    spawner: Spawner,
    self_tx: mpsc::UnboundedSender<Input>,
    events_tx: mpsc::UnboundedSender<Event>,
    status_tx: watch::Sender<Status>,
    collections: Vec<CollectionState>,
    last_notify: Instant,
    notify_scheduled: bool,
    stopping: bool,
    fatal_error: Option<Error>,
}

impl Actor {
    #[instrument(skip_all, fields(remote = %self.options.remote_url))]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        let mut incoming = self
            .conn
            .take_incoming()
            .expect("connection handed to a single replicator");
        let mut incoming_open = true;
        let mut peer_closed = self.conn.peer_closed();
        let mut watch_open = true;

        if let Err(error) = self.setup().await {
            warn!(%error, "replicator failed to start");
            self.finish(Some(error)).await;
            return;
        }

        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    None => break,
                    Some(Input::Stop) => {
                        info!("stop requested");
                        break;
                    },
                    Some(Input::Worker(event)) => {
                        if self.handle_worker_event(event) {
                            break;
                        }
                    },
                    Some(Input::SaveCheckpoints) => self.save_checkpoints().await,
                    Some(Input::NotifyStatus) => {
                        self.notify_scheduled = false;
                        self.publish_status(true);
                    },
                    Some(Input::PeerClosed(close)) => {
                        info!(?close, "peer closed connection");
                        break;
                    },
                },
                msg = incoming.recv(), if incoming_open => match msg {
                    None => {
                        incoming_open = false;
                        let _ = self.self_tx.send(Input::PeerClosed(None));
                    },
                    Some(msg) => self.route(msg),
                },
                changed = peer_closed.changed(), if watch_open => match changed {
                    Err(_) => watch_open = false,
                    Ok(()) => {
                        let close = peer_closed.borrow().clone();
                        if close.is_some() {
                            let _ = self.self_tx.send(Input::PeerClosed(close));
                        }
                    },
                },
            }
        }

        let error = self.fatal_error.take();
        self.finish(error).await;
    }

    /// Verify collections, load checkpoints, negotiate with the peer, and
    /// spawn the per-collection workers.
    async fn setup(&mut self) -> Result<()> {
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let forward = self.self_tx.clone();
        self.spawner
            .spawn(async move {
                while let Some(event) = worker_rx.recv().await {
                    if forward.send(Input::Worker(event)).is_err() {
                        break;
                    }
                }
            })
            .detach();

        let local_uuid = self.db.private_uuid();
        let mut active_collections = Vec::new();
        for coll in &self.options.collections {
            if !coll.push.is_enabled() && !coll.pull.is_enabled() {
                continue;
            }
            if !self.db.has_collection(&coll.spec) {
                return Err(Error::Unexpected(format!(
                    "collection {} does not exist locally",
                    coll.spec
                )));
            }
            let checkpointer = Arc::new(Checkpointer::new(&local_uuid, &self.options, coll));
            checkpointer.read(&self.db, &self.options, coll, false)?;
            if coll.push.is_active() || coll.pull.is_active() {
                active_collections.push(self.collections.len());
            }
            let initial = |mode: Mode| match mode {
                Mode::Disabled => ActivityLevel::Stopped,
                Mode::Passive => ActivityLevel::Idle,
                Mode::OneShot | Mode::Continuous => ActivityLevel::Connecting,
            };
            self.collections.push(CollectionState {
                push_level: initial(coll.push),
                pull_level: initial(coll.pull),
                options: coll.clone(),
                checkpointer,
                pusher: None,
                puller: None,
                push_progress: Progress::default(),
                pull_progress: Progress::default(),
            });
        }

        if !active_collections.is_empty() {
            self.negotiate_checkpoints(&active_collections).await?;
        }

        for state in &mut self.collections {
            let coll = state.options.clone();
            if coll.push.is_enabled() {
                state.pusher = Some(Pusher::spawn(
                    &self.spawner,
                    Arc::clone(&self.db),
                    Arc::clone(&self.blobs),
                    Arc::clone(&self.conn),
                    coll.clone(),
                    Arc::clone(&self.options),
                    Arc::clone(&state.checkpointer),
                    worker_tx.clone(),
                ));
            }
            if coll.pull.is_enabled() {
                state.puller = Some(Puller::spawn(
                    &self.spawner,
                    Arc::clone(&self.db),
                    Arc::clone(&self.blobs),
                    Arc::clone(&self.conn),
                    coll.clone(),
                    Arc::clone(&self.options),
                    Arc::clone(&state.checkpointer),
                    worker_tx.clone(),
                ));
            }

            let save_tx = self.self_tx.clone();
            state.checkpointer.enable_autosave(
                &self.spawner,
                self.options.checkpoint_save_delay,
                move || {
                    let _ = save_tx.send(Input::SaveCheckpoints);
                },
            );

            if coll.push.is_active() {
                state.push_level = ActivityLevel::Connecting;
                if let Some(pusher) = &state.pusher {
                    pusher.send(PusherInput::Start);
                }
            }
            if coll.pull.is_active() {
                state.pull_level = ActivityLevel::Connecting;
                if let Some(puller) = &state.puller {
                    puller.send(PullerInput::Start);
                }
            }
        }
        self.publish_status(false);
        Ok(())
    }

    /// `getCollections` with the 3.0 `getCheckpoint` fallback; validates
    /// each remote checkpoint against ours.
    async fn negotiate_checkpoints(&mut self, active: &[usize]) -> Result<()> {
        let checkpoint_ids: Vec<String> = active
            .iter()
            .map(|&i| self.collections[i].checkpointer.id().to_owned())
            .collect();
        let paths: Vec<String> = active
            .iter()
            .map(|&i| self.collections[i].options.spec.path())
            .collect();

        let request = MessageBuilder::new(profiles::GET_COLLECTIONS).json_body(&json!({
            "checkpoint_ids": checkpoint_ids,
            "collections": paths,
        }));
        let reply = self
            .conn
            .send_request(request)
            .map_err(|_| disconnected())?
            .await;

        match reply {
            Ok(response) => {
                let body = response
                    .json_body()
                    .map_err(|e| Error::body(format!("bad getCollections reply: {}", e)))?;
                let entries = body
                    .as_array()
                    .ok_or_else(|| Error::body("getCollections reply must be an array"))?;
                for (slot, &i) in active.iter().enumerate() {
                    let state = &self.collections[i];
                    match entries.get(slot) {
                        None | Some(Value::Null) => {
                            return Err(Error::Unexpected(format!(
                                "peer does not recognize collection {}",
                                state.options.spec
                            )));
                        },
                        Some(entry) => self.adopt_remote_checkpoint(i, entry),
                    }
                }
                Ok(())
            },
            Err(ReplyError::Wire(wire)) if wire.code == 404 => {
                // 3.0-compatible peer: per-collection getCheckpoint against
                // the default collection only.
                debug!("peer lacks getCollections, falling back to getCheckpoint");
                let default_only = active.len() == 1
                    && self.collections[active[0]].options.spec.is_default();
                if !default_only {
                    return Err(Error::RemoteError(
                        "peer does not support named collections".into(),
                    ));
                }
                self.get_checkpoint_fallback(active[0]).await
            },
            Err(ReplyError::Wire(wire)) => Err(Error::from(wire)),
            Err(ReplyError::Disconnected) => Err(disconnected()),
            Err(_) => Err(disconnected()),
        }
    }

    async fn get_checkpoint_fallback(&mut self, index: usize) -> Result<()> {
        let id = self.collections[index].checkpointer.id().to_owned();
        let request =
            MessageBuilder::new(profiles::GET_CHECKPOINT).property(properties::CLIENT, id);
        let reply = self
            .conn
            .send_request(request)
            .map_err(|_| disconnected())?
            .await;
        match reply {
            Ok(response) => {
                let mut entry = response.json_body().unwrap_or_else(|_| json!({}));
                if !entry.is_object() {
                    entry = json!({});
                }
                if let Some(rev) = response.properties.get(properties::REV) {
                    entry["rev"] = json!(rev);
                }
                self.adopt_remote_checkpoint(index, &entry);
                Ok(())
            },
            Err(ReplyError::Wire(wire)) if wire.code == 404 => {
                self.adopt_remote_checkpoint(index, &json!({}));
                Ok(())
            },
            Err(ReplyError::Wire(wire)) => Err(Error::from(wire)),
            Err(ReplyError::Disconnected) => Err(disconnected()),
            Err(_) => Err(disconnected()),
        }
    }

    fn adopt_remote_checkpoint(&mut self, index: usize, entry: &Value) {
        let state = &mut self.collections[index];
        let remote = Checkpoint::from_json(entry);
        state
            .checkpointer
            .set_remote_rev(entry.get("rev").and_then(Value::as_str).map(String::from));
        if !state.checkpointer.validate_with(&remote) {
            info!(
                collection = %state.options.spec,
                "remote checkpoint mismatch, starting over"
            );
        }
    }

    /// Route one inbound request to the right worker.
    fn route(&mut self, mut msg: MessageIn) {
        let profile = msg.profile().to_owned();
        debug!(%profile, "routing inbound request");
        match profile.as_str() {
            profiles::GET_CHECKPOINT => self.serve_get_checkpoint(msg),
            profiles::SET_CHECKPOINT => self.serve_set_checkpoint(msg),
            profiles::GET_COLLECTIONS => self.serve_get_collections(msg),
            profiles::SUB_CHANGES => {
                match self.collection_for(&msg) {
                    Ok(index) => {
                        let state = &self.collections[index];
                        if !state.options.push.is_enabled() {
                            msg.respond_error(forbidden("push is disabled"));
                        } else if let Some(pusher) = &state.pusher {
                            pusher.send(PusherInput::SubChanges(msg));
                        }
                    },
                    Err(e) => msg.respond_error(e),
                }
            },
            profiles::CHANGES | profiles::PROPOSE_CHANGES | profiles::REV | profiles::NO_REV => {
                match self.collection_for(&msg) {
                    Ok(index) => {
                        let state = &self.collections[index];
                        if !state.options.pull.is_enabled() {
                            msg.respond_error(forbidden("pull is disabled"));
                        } else if let Some(puller) = &state.puller {
                            let input = match profile.as_str() {
                                profiles::REV => PullerInput::Rev(msg),
                                profiles::NO_REV => PullerInput::NoRev(msg),
                                _ => PullerInput::Changes(msg),
                            };
                            puller.send(input);
                        }
                    },
                    Err(e) => msg.respond_error(e),
                }
            },
            profiles::GET_ATTACHMENT | profiles::PROVE_ATTACHMENT => {
                match self.collection_for(&msg) {
                    Ok(index) => {
                        let state = &self.collections[index];
                        match (&state.pusher, profile.as_str()) {
                            (Some(pusher), profiles::GET_ATTACHMENT) => {
                                pusher.send(PusherInput::Attachment(msg))
                            },
                            (Some(pusher), _) => pusher.send(PusherInput::ProveAttachment(msg)),
                            (None, _) => msg.respond_error(forbidden("push is disabled")),
                        }
                    },
                    Err(e) => msg.respond_error(e),
                }
            },
            _ => {
                warn!(%profile, "unknown message profile");
                msg.respond_error(WireError::http(404, "unknown message profile"));
            },
        }
    }

    /// Resolve the `collection` property. Its absence is legal only when
    /// exactly one (default) collection is configured.
    fn collection_for(&self, msg: &MessageIn) -> std::result::Result<usize, WireError> {
        match msg.property(properties::COLLECTION) {
            None => {
                if self.collections.len() == 1 {
                    Ok(0)
                } else {
                    Err(WireError::http(
                        400,
                        "collection property required with multiple collections",
                    ))
                }
            },
            Some(path) => {
                let spec = CollectionSpec::parse_path(path)
                    .map_err(|_| WireError::http(400, "malformed collection"))?;
                self.collections
                    .iter()
                    .position(|c| c.options.spec == spec)
                    .ok_or_else(|| WireError::http(404, "unknown collection"))
            },
        }
    }

    // Passive checkpoint service

    fn serve_get_checkpoint(&mut self, mut msg: MessageIn) {
        let client = msg.property(properties::CLIENT).unwrap_or_default().to_owned();
        match checkpoint::read_peer_checkpoint(&self.db, &client) {
            Ok(Some((rev, body))) => {
                msg.respond(
                    Response::empty()
                        .with_property(properties::REV, rev)
                        .with_body(body),
                );
            },
            Ok(None) => msg.respond_error(WireError::http(404, "no checkpoint")),
            Err(e) => msg.respond_error(e.to_wire()),
        }
    }

    fn serve_set_checkpoint(&mut self, mut msg: MessageIn) {
        let client = msg.property(properties::CLIENT).unwrap_or_default().to_owned();
        let expected_rev = msg.property(properties::REV).map(String::from);
        match checkpoint::save_peer_checkpoint(
            &self.db,
            &client,
            &msg.body,
            expected_rev.as_deref(),
        ) {
            Ok(new_rev) => {
                msg.respond(Response::empty().with_property(properties::REV, new_rev))
            },
            Err(e) => msg.respond_error(e.to_wire()),
        }
    }

    fn serve_get_collections(&mut self, mut msg: MessageIn) {
        let body = match msg.json_body() {
            Ok(body) => body,
            Err(e) => {
                msg.respond_error(WireError::http(400, format!("bad body: {}", e)));
                return;
            },
        };
        let ids = body
            .get("checkpoint_ids")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let paths = body
            .get("collections")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(paths.len());
        for (path, id) in paths.iter().zip(ids.iter()) {
            let known = path
                .as_str()
                .and_then(|p| CollectionSpec::parse_path(p).ok())
                .map(|spec| self.db.has_collection(&spec))
                .unwrap_or(false);
            if !known {
                entries.push(Value::Null);
                continue;
            }
            let id = id.as_str().unwrap_or_default();
            match checkpoint::read_peer_checkpoint(&self.db, id) {
                Ok(Some((rev, body))) => {
                    let mut entry: Value =
                        serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
                    if !entry.is_object() {
                        entry = json!({});
                    }
                    entry["rev"] = json!(rev);
                    entries.push(entry);
                },
                Ok(None) => entries.push(json!({})),
                Err(_) => entries.push(json!({})),
            }
        }
        msg.respond(Response::empty().with_json_body(&Value::Array(entries)));
    }

    // Worker events

    /// Returns true when the replicator is done and should tear down.
    fn handle_worker_event(&mut self, event: WorkerEvent) -> bool {
        match event {
            WorkerEvent::Status {
                collection,
                pushing,
                level,
                progress,
            } => {
                if let Some(state) = self
                    .collections
                    .iter_mut()
                    .find(|c| c.options.spec == collection)
                {
                    if pushing {
                        state.push_level = level;
                        state.push_progress = progress;
                    } else {
                        state.pull_level = level;
                        state.pull_progress = progress;
                    }
                }
                self.publish_status(false);
                self.all_work_finished()
            },
            WorkerEvent::DocumentsEnded(ended) => {
                let forwarded: Vec<_> = ended
                    .into_iter()
                    .filter(|d| {
                        d.error.is_some()
                            || d.purged
                            || self.options.progress_level != ProgressLevel::Summary
                    })
                    .collect();
                if !forwarded.is_empty() {
                    let _ = self.events_tx.send(Event::DocumentsEnded(forwarded));
                }
                false
            },
            WorkerEvent::CheckpointChanged { .. } => {
                self.publish_status(false);
                false
            },
            WorkerEvent::Fatal { collection, error } => {
                warn!(%collection, %error, "fatal worker error");
                self.fatal_error = Some(error);
                true
            },
        }
    }

    /// One-shot replications stop once every worker reports `Stopped`.
    fn all_work_finished(&self) -> bool {
        let any_active = self
            .collections
            .iter()
            .any(|c| c.options.push.is_active() || c.options.pull.is_active());
        if !any_active || self.collections.is_empty() {
            return false;
        }
        self.collections
            .iter()
            .filter(|c| c.options.push.is_active() || c.options.pull.is_active())
            .all(|c| {
                c.push_level == ActivityLevel::Stopped && c.pull_level == ActivityLevel::Stopped
            })
    }

    // Checkpoint persistence

    async fn save_checkpoints(&mut self) {
        for i in 0..self.collections.len() {
            let (dirty, active) = {
                let state = &self.collections[i];
                (
                    state.checkpointer.is_dirty(),
                    state.options.push.is_active() || state.options.pull.is_active(),
                )
            };
            if !dirty {
                continue;
            }
            let checkpointer = Arc::clone(&self.collections[i].checkpointer);
            if let Err(error) = checkpointer.save_local(&self.db) {
                warn!(%error, "failed to save local checkpoint");
                continue;
            }
            if active {
                self.save_remote_checkpoint(&checkpointer).await;
            }
        }
    }

    async fn save_remote_checkpoint(&self, checkpointer: &Checkpointer) {
        let body = checkpointer.checkpoint().to_body();
        let mut request = MessageBuilder::new(profiles::SET_CHECKPOINT)
            .property(properties::CLIENT, checkpointer.id())
            .body(body.clone());
        if let Some(rev) = checkpointer.remote_rev() {
            request = request.property(properties::REV, rev);
        }
        let pending = match self.conn.send_request(request) {
            Ok(p) => p,
            Err(_) => return,
        };
        match pending.await {
            Ok(response) => {
                checkpointer
                    .set_remote_rev(response.properties.get(properties::REV).map(String::from));
            },
            Err(ReplyError::Wire(wire)) if wire.code == 409 => {
                // Someone else wrote our checkpoint doc. Re-read the current
                // rev and retry once.
                debug!("setCheckpoint conflict, re-reading peer rev");
                let get = MessageBuilder::new(profiles::GET_CHECKPOINT)
                    .property(properties::CLIENT, checkpointer.id());
                if let Ok(pending) = self.conn.send_request(get) {
                    if let Ok(response) = pending.await {
                        checkpointer.set_remote_rev(
                            response.properties.get(properties::REV).map(String::from),
                        );
                        let mut retry = MessageBuilder::new(profiles::SET_CHECKPOINT)
                            .property(properties::CLIENT, checkpointer.id())
                            .body(body);
                        if let Some(rev) = checkpointer.remote_rev() {
                            retry = retry.property(properties::REV, rev);
                        }
                        if let Ok(pending) = self.conn.send_request(retry) {
                            if let Ok(response) = pending.await {
                                checkpointer.set_remote_rev(
                                    response
                                        .properties
                                        .get(properties::REV)
                                        .map(String::from),
                                );
                            }
                        }
                    }
                }
            },
            Err(error) => {
                debug!(%error, "failed to save remote checkpoint");
            },
        }
    }

    // Status aggregation

    fn aggregate_status(&self) -> Status {
        let mut level = ActivityLevel::Stopped;
        let mut progress = Progress::default();
        for state in &self.collections {
            level = level.max(state.push_level).max(state.pull_level);
            progress.add(state.push_progress);
            progress.add(state.pull_progress);
        }
        if self.stopping {
            level = ActivityLevel::Stopped;
        }
        Status {
            level,
            progress,
            error: self.fatal_error.clone(),
        }
    }

    /// Delegate notifications are rate-limited; the watch channel always
    /// carries the latest status.
    fn publish_status(&mut self, force: bool) {
        let status = self.aggregate_status();
        let _ = self.status_tx.send(status.clone());

        let elapsed = self.last_notify.elapsed();
        if force || elapsed >= tuning::MIN_DELEGATE_CALL_INTERVAL {
            self.last_notify = Instant::now();
            let _ = self.events_tx.send(Event::StatusChanged(status));
        } else if !self.notify_scheduled {
            self.notify_scheduled = true;
            let tx = self.self_tx.clone();
            let wait = tuning::MIN_DELEGATE_CALL_INTERVAL - elapsed;
            self.spawner
                .spawn(async move {
                    halyard_async::sleep(wait).await;
                    let _ = tx.send(Input::NotifyStatus);
                })
                .detach();
        }
    }

    /// Tear down: stop workers, flush checkpoints, close the connection,
    /// fire the final status.
    async fn finish(&mut self, error: Option<Error>) {
        self.stopping = true;
        if error.is_some() {
            self.fatal_error = error;
        }
        for state in &self.collections {
            if let Some(pusher) = &state.pusher {
                pusher.send(PusherInput::Stop);
            }
            if let Some(puller) = &state.puller {
                puller.send(PullerInput::Stop);
            }
            state.checkpointer.stop_autosave();
        }
        // Give the mark-synced queue a final flush so the saved state is
        // consistent with what the peer acknowledged.
        if let Err(e) = self.db.mark_revs_synced_now() {
            warn!(error = %e, "final mark-synced flush failed");
        }
        self.save_checkpoints().await;

        let close = match &self.fatal_error {
            None => Close::normal(),
            Some(e) if e.is_transient() || e.is_network_dependent() => {
                Close::going_away(e.to_string())
            },
            Some(e) => Close {
                code: 1008,
                message: e.to_string(),
            },
        };
        self.conn.close(close);

        let mut status = self.aggregate_status();
        status.level = ActivityLevel::Stopped;
        let _ = self.status_tx.send(status.clone());
        let _ = self.events_tx.send(Event::StatusChanged(status));
        info!("replicator stopped");
    }
}

fn disconnected() -> Error {
    Error::WebSocket {
        code: 1006,
        message: "connection closed".into(),
    }
}

fn forbidden(message: &str) -> WireError {
    WireError::http(403, message)
}
