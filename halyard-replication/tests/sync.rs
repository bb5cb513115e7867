// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! End-to-end replication over an in-memory connection: both ends run a
//! real replicator against a real in-memory store.

mod util;

use std::sync::Arc;

use halyard_async::Spawner;
use halyard_blip::pipe;
use halyard_replication::{
    checkpoint::{checkpoint_id, Checkpoint},
    ActivityLevel, Error, Options, ProgressLevel, Status,
};
use halyard_store::{stores, CollectionSpec, ContentLevel, Sequence, Storage};
use pretty_assertions::assert_eq;

use util::TestPeer;

/// Run `client_options` against a passive server until the client stops.
async fn replicate(client: &TestPeer, server: &TestPeer, client_options: Options) -> (Status, Vec<halyard_replication::DocumentEnded>) {
    let spawner = Spawner::from_current().unwrap();
    let (c_conn, s_conn) = pipe();
    let server_repl = util::start(&spawner, s_conn, server, util::passive("active-peer"));
    let client_repl = util::start(&spawner, c_conn, client, client_options);
    let events = util::collect_events(&spawner, &client_repl);

    let status = client_repl.wait_stopped().await;
    server_repl.wait_stopped().await;
    let ended = util::ended_docs(&events.lock());
    (status, ended)
}

fn doc_body(peer: &TestPeer, doc: &str) -> serde_json::Value {
    peer.storage
        .get_doc(
            &CollectionSpec::default_collection(),
            &doc.parse().unwrap(),
            ContentLevel::CurrentRev,
        )
        .unwrap()
        .unwrap()
        .current()
        .body
        .as_ref()
        .unwrap()
        .to_value()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_push_saves_zero_checkpoints() {
    let client = util::peer("empty-client");
    let server = util::peer("empty-server");
    let options = util::one_shot_push("wss://server/db");

    let (status, ended) = replicate(&client, &server, options.clone()).await;
    assert_eq!(status.level, ActivityLevel::Stopped);
    assert!(status.error.is_none());
    assert!(ended.is_empty());
    assert_eq!(
        server
            .storage
            .last_sequence(&CollectionSpec::default_collection())
            .unwrap(),
        Sequence::ZERO
    );

    // Both ends persisted a (zero) checkpoint under the derived ID.
    let id = checkpoint_id(
        &client.storage.private_uuid(),
        &options,
        &options.collections[0],
    );
    let local = client
        .storage
        .get_raw(stores::LOCAL_CHECKPOINTS, &id)
        .unwrap()
        .expect("local checkpoint saved");
    assert_eq!(Checkpoint::from_body(&local.body).unwrap(), Checkpoint::default());
    assert!(server
        .storage
        .get_raw(stores::PEER_CHECKPOINTS, &id)
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_transfers_documents() {
    let client = util::peer("push-client");
    let server = util::peer("push-server");
    util::put_doc(&client, "a", &["1-aa"], r#"{"n":1}"#);
    util::put_doc(&client, "b", &["1-bb"], r#"{"n":2}"#);
    util::put_doc(&client, "b", &["2-bc", "1-bb"], r#"{"n":3}"#);

    let (status, _) = replicate(&client, &server, util::one_shot_push("wss://server/db")).await;
    assert!(status.error.is_none(), "error: {:?}", status.error);

    assert_eq!(doc_body(&server, "a"), serde_json::json!({"n": 1}));
    assert_eq!(doc_body(&server, "b"), serde_json::json!({"n": 3}));

    // The client's checkpoint covers everything it offered.
    let options = util::one_shot_push("wss://server/db");
    let id = checkpoint_id(
        &client.storage.private_uuid(),
        &options,
        &options.collections[0],
    );
    let local = client
        .storage
        .get_raw(stores::LOCAL_CHECKPOINTS, &id)
        .unwrap()
        .unwrap();
    assert_eq!(
        Checkpoint::from_body(&local.body).unwrap().local,
        Sequence(3)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_transfers_documents() {
    let client = util::peer("pull-client");
    let server = util::peer("pull-server");
    util::put_doc(&server, "x", &["1-xx"], r#"{"from":"server"}"#);
    util::put_doc(&server, "y", &["1-yy"], r#"{"n":7}"#);

    let (status, _) = replicate(&client, &server, util::one_shot_pull("wss://server/db")).await;
    assert!(status.error.is_none(), "error: {:?}", status.error);

    assert_eq!(doc_body(&client, "x"), serde_json::json!({"from": "server"}));
    assert_eq!(doc_body(&client, "y"), serde_json::json!({"n": 7}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bidirectional_sync_merges_both_sides() {
    let client = util::peer("bidi-client");
    let server = util::peer("bidi-server");
    util::put_doc(&client, "mine", &["1-aa"], r#"{"side":"client"}"#);
    util::put_doc(&server, "theirs", &["1-bb"], r#"{"side":"server"}"#);

    let mut options = util::one_shot_push("wss://server/db");
    options.collections[0].pull = halyard_replication::Mode::OneShot;
    let (status, _) = replicate(&client, &server, options).await;
    assert!(status.error.is_none(), "error: {:?}", status.error);

    assert_eq!(doc_body(&client, "theirs"), serde_json::json!({"side": "server"}));
    assert_eq!(doc_body(&server, "mine"), serde_json::json!({"side": "client"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_conflict_surfaces_and_leaves_server_alone() {
    let client = util::peer("conflict-client");
    let server = util::peer("conflict-server");

    // Both sides diverged from 1-aaaa; the client also advanced.
    util::put_doc(&client, "A", &["1-aaaa"], r#"{"v":1}"#);
    util::put_doc(&client, "A", &["2-bbbb", "1-aaaa"], r#"{"v":2}"#);
    util::put_doc(&client, "A", &["3-dddd", "2-bbbb"], r#"{"v":3}"#);
    util::put_doc(&server, "A", &["1-aaaa"], r#"{"v":1}"#);
    util::put_doc(&server, "A", &["2-cccc", "1-aaaa"], r#"{"v":9}"#);

    // Simulate the earlier sync that told the client the server had 2-bbbb.
    let remote = client.storage.remote_db_id("wss://server/db").unwrap();
    client.storage.begin_transaction().unwrap();
    client
        .storage
        .set_remote_ancestor(
            &CollectionSpec::default_collection(),
            &"A".parse().unwrap(),
            remote,
            &"2-bbbb".parse().unwrap(),
        )
        .unwrap();
    client.storage.commit_transaction().unwrap();

    let mut options = util::one_shot_push("wss://server/db");
    options.collections[0].propose_changes = true;
    let (status, ended) = replicate(&client, &server, options).await;
    assert!(status.error.is_none(), "error: {:?}", status.error);

    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].doc_id.as_str(), "A");
    assert_eq!(ended[0].rev_id.to_string(), "3-dddd");
    assert!(matches!(
        ended[0].error,
        Some(Error::Http { status: 409, .. })
    ));
    // Server keeps its own revision.
    assert_eq!(doc_body(&server, "A"), serde_json::json!({"v": 9}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_push_resumes_from_checkpoint() {
    let client = util::peer("resume-client");
    let server = util::peer("resume-server");
    for i in 1..=3 {
        util::put_doc(
            &client,
            &format!("doc{}", i),
            &["1-aaaa"],
            &format!(r#"{{"n":{}}}"#, i),
        );
    }

    let mut options = util::one_shot_push("wss://server/db");
    options.progress_level = ProgressLevel::PerDocument;

    let (status, ended) = replicate(&client, &server, options.clone()).await;
    assert!(status.error.is_none());
    assert_eq!(ended.len(), 3);

    // Two more local edits; a fresh replicator (same stores, fresh
    // connection) transfers exactly those two.
    util::put_doc(&client, "doc4", &["1-aaaa"], r#"{"n":4}"#);
    util::put_doc(&client, "doc1", &["2-bbbb", "1-aaaa"], r#"{"n":11}"#);
    let server_seq_before = server
        .storage
        .last_sequence(&CollectionSpec::default_collection())
        .unwrap();

    let (status, ended) = replicate(&client, &server, options.clone()).await;
    assert!(status.error.is_none());
    let mut pushed: Vec<String> = ended.iter().map(|d| d.doc_id.to_string()).collect();
    pushed.sort();
    assert_eq!(pushed, vec!["doc1", "doc4"]);
    assert_eq!(doc_body(&server, "doc1"), serde_json::json!({"n": 11}));

    // A third run with no changes transfers nothing at all.
    let server_seq_after = server
        .storage
        .last_sequence(&CollectionSpec::default_collection())
        .unwrap();
    assert_eq!(server_seq_after, server_seq_before + 2);

    let (status, ended) = replicate(&client, &server, options).await;
    assert!(status.error.is_none());
    assert!(ended.is_empty(), "re-run pushed: {:?}", ended);
    assert_eq!(
        server
            .storage
            .last_sequence(&CollectionSpec::default_collection())
            .unwrap(),
        server_seq_after
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_local_collection_is_fatal() {
    let spawner = Spawner::from_current().unwrap();
    let client = util::peer("fatal-client");
    let server = util::peer("fatal-server");

    let mut options = util::one_shot_push("wss://server/db");
    options.collections[0].spec = halyard_store::CollectionSpec {
        scope: "other".into(),
        name: "things".into(),
    };

    let (c_conn, s_conn) = pipe();
    let _server_repl = util::start(&spawner, s_conn, &server, util::passive("peer"));
    let client_repl = util::start(&spawner, c_conn, &client, options);
    let status = client_repl.wait_stopped().await;
    assert!(matches!(status.error, Some(Error::Unexpected(_))));
}
