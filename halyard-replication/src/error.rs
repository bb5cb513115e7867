// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use halyard_blip::WireError;
use thiserror::Error;

/// POSIX error numbers the classifier cares about.
pub mod posix {
    pub const ENETDOWN: i32 = 100;
    pub const ENETUNREACH: i32 = 101;
    pub const ENETRESET: i32 = 102;
    pub const ECONNABORTED: i32 = 103;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const EHOSTDOWN: i32 = 112;
    pub const EHOSTUNREACH: i32 = 113;
}

/// Wire codes of the storage ("LiteCore") domain.
mod store_codes {
    pub const CORRUPT_REVISION_DATA: i32 = 5;
    pub const NOT_FOUND: i32 = 7;
    pub const CONFLICT: i32 = 8;
    pub const INVALID_PARAMETER: i32 = 9;
    pub const UNEXPECTED: i32 = 10;
    pub const BUSY: i32 = 16;
    pub const NOT_IN_TRANSACTION: i32 = 17;
    pub const REMOTE_ERROR: i32 = 26;
    pub const BAD_DOC_ID: i32 = 29;
    pub const DELTA_BASE_UNKNOWN: i32 = 31;
    pub const CORRUPT_DELTA: i32 = 32;
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum NetworkCause {
    #[error("DNS lookup failed")]
    DnsFailure,
    #[error("unknown host")]
    UnknownHost,
    #[error("connection timed out")]
    Timeout,
}

/// Domain-tagged replication error.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] halyard_store::Error),

    #[error("delta base revision is not known: {0}")]
    DeltaBaseUnknown(String),

    #[error("corrupt delta: {0}")]
    CorruptDelta(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("POSIX error {errno}")]
    Posix { errno: i32 },

    #[error(transparent)]
    Network(NetworkCause),

    #[error("WebSocket error {code}: {message}")]
    WebSocket { code: u16, message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Body-format domain: undecodable or ill-typed message bodies.
    #[error("malformed body: {0}")]
    Body(String),
}

impl Error {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn body(message: impl Into<String>) -> Self {
        Self::Body(message.into())
    }

    /// Transient errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        use posix::*;
        match self {
            Self::Posix { errno } => matches!(
                *errno,
                ECONNRESET | ETIMEDOUT | ECONNREFUSED | ENETRESET | ECONNABORTED
            ),
            Self::WebSocket { code, .. } => {
                matches!(code, 408 | 429 | 502 | 503 | 504 | 1001 | 1006)
            },
            Self::Network(NetworkCause::DnsFailure) | Self::Network(NetworkCause::Timeout) => true,
            Self::Store(halyard_store::Error::Busy) => true,
            _ => false,
        }
    }

    /// Errors which may resolve when connectivity changes.
    pub fn is_network_dependent(&self) -> bool {
        use posix::*;
        match self {
            Self::Posix { errno } => matches!(
                *errno,
                ENETDOWN | ENETUNREACH | EHOSTUNREACH | EHOSTDOWN
            ),
            Self::Network(NetworkCause::UnknownHost)
            | Self::Network(NetworkCause::DnsFailure) => true,
            _ => false,
        }
    }

    /// Errors which stop the whole replicator rather than a single revision.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_)
                | Self::RemoteError(_)
                | Self::Unexpected(_)
                | Self::Http { status: 503, .. }
        )
    }

    /// Encode for an error reply on the wire.
    pub fn to_wire(&self) -> WireError {
        use store_codes::*;
        let message = self.to_string();
        match self {
            Self::Store(e) => {
                let code = match e {
                    halyard_store::Error::NotFound => NOT_FOUND,
                    halyard_store::Error::Conflict => CONFLICT,
                    halyard_store::Error::InvalidParameter(_) => INVALID_PARAMETER,
                    halyard_store::Error::Busy => BUSY,
                    halyard_store::Error::NotInTransaction
                    | halyard_store::Error::TransactionOpen => NOT_IN_TRANSACTION,
                    halyard_store::Error::BadDocId(_) => BAD_DOC_ID,
                    halyard_store::Error::CorruptRevisionData(_) => CORRUPT_REVISION_DATA,
                    halyard_store::Error::Unexpected(_) => UNEXPECTED,
                    _ => UNEXPECTED,
                };
                WireError::new("LiteCore", code, message)
            },
            Self::DeltaBaseUnknown(_) => WireError::new("LiteCore", DELTA_BASE_UNKNOWN, message),
            Self::CorruptDelta(_) => WireError::new("LiteCore", CORRUPT_DELTA, message),
            Self::RemoteError(_) => WireError::new("LiteCore", REMOTE_ERROR, message),
            Self::Unexpected(_) => WireError::new("LiteCore", UNEXPECTED, message),
            Self::Unauthorized(_) => WireError::new("HTTP", 401, message),
            Self::Posix { errno } => WireError::new("POSIX", *errno, message),
            Self::Network(_) => WireError::new("Network", 0, message),
            Self::WebSocket { code, .. } => WireError::new("WebSocket", i32::from(*code), message),
            Self::Http { status, .. } => WireError::new("HTTP", i32::from(*status), message),
            Self::Body(_) => WireError::new("Fleece", 0, message),
        }
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        use store_codes::*;
        match wire.domain.as_str() {
            "LiteCore" => match wire.code {
                NOT_FOUND => Self::Store(halyard_store::Error::NotFound),
                CONFLICT => Self::Store(halyard_store::Error::Conflict),
                BUSY => Self::Store(halyard_store::Error::Busy),
                BAD_DOC_ID => Self::Store(halyard_store::Error::BadDocId(wire.message)),
                CORRUPT_REVISION_DATA => {
                    Self::Store(halyard_store::Error::CorruptRevisionData(wire.message))
                },
                DELTA_BASE_UNKNOWN => Self::DeltaBaseUnknown(wire.message),
                CORRUPT_DELTA => Self::CorruptDelta(wire.message),
                REMOTE_ERROR => Self::RemoteError(wire.message),
                _ => Self::Unexpected(wire.message),
            },
            "POSIX" => Self::Posix { errno: wire.code },
            "WebSocket" => Self::WebSocket {
                code: wire.code as u16,
                message: wire.message,
            },
            "HTTP" => match wire.code {
                401 => Self::Unauthorized(wire.message),
                status => Self::Http {
                    status: status as u16,
                    message: wire.message,
                },
            },
            "Fleece" => Self::Body(wire.message),
            _ => Self::RemoteError(format!("{} {}: {}", wire.domain, wire.code, wire.message)),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_tables() {
        assert!(Error::Posix {
            errno: posix::ECONNRESET
        }
        .is_transient());
        assert!(Error::WebSocket {
            code: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!Error::http(403, "forbidden").is_transient());
        assert!(Error::Posix {
            errno: posix::ENETDOWN
        }
        .is_network_dependent());
        assert!(Error::Unauthorized("nope".into()).is_fatal());
        assert!(!Error::Store(halyard_store::Error::Conflict).is_fatal());
    }

    #[test]
    fn wire_roundtrip() {
        let errors = vec![
            Error::Store(halyard_store::Error::NotFound),
            Error::DeltaBaseUnknown("1-aaaa".into()),
            Error::CorruptDelta("truncated".into()),
            Error::Posix { errno: 104 },
            Error::http(409, "conflicts with newer server revision"),
        ];
        for e in errors {
            let back = Error::from(e.to_wire());
            assert_eq!(
                std::mem::discriminant(&back),
                std::mem::discriminant(&e),
                "{:?} -> {:?}",
                e,
                back
            );
        }
    }
}
