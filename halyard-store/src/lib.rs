// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Data model of the versioned document store, plus the seams through which
//! the replication core reaches storage and blob content.
//!
//! The production storage engine lives elsewhere; the replicator only ever
//! sees the [`Storage`] and [`BlobStore`] traits. [`MemStorage`] and
//! [`MemBlobStore`] implement them in memory, which is what the test-suite
//! (and peer-to-peer loopback setups) run against.

pub mod error;
pub use error::Error;

mod types;
pub use types::{CollectionSpec, DocFlags, DocId, PeerId, RemoteDbId, RevFlags, Sequence};

mod revid;
pub use revid::{RevId, Version, VersionVector};

mod body;
pub use body::Body;

mod storage;
pub use storage::{
    stores, ChangeEntry, ContentLevel, Document, EnumerateOptions, NewBody, ObserverId,
    PutRequest, RawDoc, SavedRev, Storage,
};

mod memory;
pub use memory::MemStorage;

mod blob;
pub use blob::{BlobDigest, BlobStore, BlobWriter, MemBlobStore};
