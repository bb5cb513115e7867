// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! The framed, multiplexed request/response layer the replicator speaks.
//!
//! Only the surface the replication core consumes is defined here: messages
//! are requests or responses carrying a profile string, a flat string
//! property dictionary and an optional (possibly compressed) body. The
//! in-memory [`pipe`] stands in for a production transport, delivering
//! requests to the peer's incoming stream and replies back through oneshot
//! handles.

pub mod error;
pub use error::{ReplyError, SendError, WireError};

mod message;
pub use message::{properties, profiles, MessageBuilder, MessageIn, Properties, Response};

mod connection;
pub use connection::{pipe, Close, Connection, PendingReply};
