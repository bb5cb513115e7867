// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("document revision conflict")]
    Conflict,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("database is busy")]
    Busy,

    #[error("no transaction is open")]
    NotInTransaction,

    #[error("a transaction is already open on this handle")]
    TransactionOpen,

    #[error("bad document ID: {0:?}")]
    BadDocId(String),

    #[error("corrupt revision data: {0}")]
    CorruptRevisionData(String),

    #[error("unexpected storage error: {0}")]
    Unexpected(String),
}
