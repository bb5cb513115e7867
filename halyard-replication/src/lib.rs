// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! The replication core of the halyard embedded document database.
//!
//! Synchronizes a local versioned document store ([`halyard_store`]) with a
//! remote peer over a multiplexed framed message protocol
//! ([`halyard_blip`]): revisions are exchanged and reconciled against
//! divergent edit histories, bodies are compressed as deltas against known
//! common ancestors, binary attachments travel out-of-band, and progress
//! persists through checkpoints on both ends.
//!
//! [`Replicator`] is the entry point; it owns one ([`pusher`], [`puller`],
//! [`Checkpointer`][checkpoint::Checkpointer]) trio per synchronized
//! collection.

pub mod attachments;
pub mod changes_feed;
pub mod checkpoint;
pub mod db;
pub mod delta;
pub mod error;
pub mod incoming_rev;
pub mod inserter;
pub mod options;
pub mod puller;
pub mod pusher;
pub mod remote_seq;
pub mod rev_finder;
pub mod status;
pub mod tuning;

mod replicator;

pub use db::DbAccess;
pub use error::Error;
pub use options::{CollectionOptions, Mode, Options, ProgressLevel, ReplicationFilter};
pub use remote_seq::{RemoteSequence, RemoteSequenceSet};
pub use replicator::{Config, Replicator};
pub use status::{ActivityLevel, DocumentEnded, Event, Progress, Status};
