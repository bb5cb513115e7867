// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use thiserror::Error;

/// An error reply received from (or sent to) the peer.
///
/// Carried on the wire as the `Error-Domain` / `Error-Code` reply properties
/// plus an optional message body.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{domain} error {code}: {message}")]
pub struct WireError {
    pub domain: String,
    pub code: i32,
    pub message: String,
}

impl WireError {
    pub fn new(domain: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    pub fn http(code: i32, message: impl Into<String>) -> Self {
        Self::new("HTTP", code, message)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendError {
    #[error("connection closed")]
    Closed,
}

/// How a pending reply can fail to produce a [`crate::Response`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplyError {
    /// The peer answered with an error reply.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The connection went away before the reply arrived. In-flight requests
    /// observe this as their synthetic disconnect event.
    #[error("disconnected before a reply arrived")]
    Disconnected,
}
