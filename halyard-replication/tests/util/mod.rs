// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

#![allow(dead_code)]

use std::sync::Arc;

use halyard_async::Spawner;
use halyard_blip::Connection;
use halyard_replication::{
    CollectionOptions, Config, Event, Mode, Options, Replicator,
};
use halyard_store::{
    Body, CollectionSpec, MemBlobStore, MemStorage, NewBody, PutRequest, RevFlags, Sequence,
    Storage,
};
use parking_lot::Mutex;

pub struct TestPeer {
    pub storage: Arc<MemStorage>,
    pub blobs: Arc<MemBlobStore>,
}

/// Route `tracing` output through the test harness, once.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn peer(name: &str) -> TestPeer {
    init_tracing();
    let storage = MemStorage::new(name);
    storage
        .create_collection(&CollectionSpec::default_collection())
        .unwrap();
    TestPeer {
        storage: Arc::new(storage),
        blobs: Arc::new(MemBlobStore::new()),
    }
}

pub fn put_doc(peer: &TestPeer, doc: &str, history: &[&str], json: &str) -> Sequence {
    put_doc_flags(peer, doc, history, json, RevFlags::default())
}

pub fn put_doc_flags(
    peer: &TestPeer,
    doc: &str,
    history: &[&str],
    json: &str,
    flags: RevFlags,
) -> Sequence {
    let coll = CollectionSpec::default_collection();
    peer.storage.begin_transaction().unwrap();
    let seq = peer
        .storage
        .put_rev(
            &coll,
            PutRequest {
                doc_id: doc.parse().unwrap(),
                history: history.iter().map(|r| r.parse().unwrap()).collect(),
                flags,
                allow_conflict: false,
                remote_db_id: None,
                body: NewBody::Full(Body::from_json(json).unwrap()),
            },
        )
        .unwrap();
    peer.storage.commit_transaction().unwrap();
    seq
}

pub fn one_shot_push(remote: &str) -> Options {
    Options::new(remote).with_collection(
        CollectionOptions::new(CollectionSpec::default_collection()).with_push(Mode::OneShot),
    )
}

pub fn one_shot_pull(remote: &str) -> Options {
    Options::new(remote).with_collection(
        CollectionOptions::new(CollectionSpec::default_collection()).with_pull(Mode::OneShot),
    )
}

pub fn passive(remote: &str) -> Options {
    Options::new(remote).with_collection(
        CollectionOptions::new(CollectionSpec::default_collection())
            .with_push(Mode::Passive)
            .with_pull(Mode::Passive),
    )
}

pub fn start(spawner: &Spawner, conn: Connection, peer: &TestPeer, options: Options) -> Replicator {
    Replicator::start(
        spawner,
        conn,
        Config {
            storage: Arc::clone(&peer.storage) as Arc<dyn Storage>,
            blobs: Arc::clone(&peer.blobs) as Arc<dyn halyard_store::BlobStore>,
            options,
        },
    )
    .expect("replicator starts")
}

/// Collect delegate events in the background; read them after the
/// replicator stopped.
pub fn collect_events(spawner: &Spawner, repl: &Replicator) -> Arc<Mutex<Vec<Event>>> {
    let mut rx = repl.take_events().expect("events not yet taken");
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    spawner
        .spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.lock().push(event);
            }
        })
        .detach();
    collected
}

pub fn ended_docs(events: &[Event]) -> Vec<halyard_replication::DocumentEnded> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::DocumentsEnded(docs) => Some(docs.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}
