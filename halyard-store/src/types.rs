// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{fmt, ops::Add, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A document identifier: UTF-8, 1..=240 bytes, not starting with `_`
/// (reserved for meta documents).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct DocId(String);

pub const MAX_DOC_ID_LENGTH: usize = 240;

impl DocId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DocId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_DOC_ID_LENGTH || s.starts_with('_') {
            return Err(Error::BadDocId(s.into()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DocId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A named collection within a scope. The default collection is
/// `_default._default`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub scope: String,
    pub name: String,
}

impl CollectionSpec {
    pub fn default_collection() -> Self {
        Self {
            scope: "_default".into(),
            name: "_default".into(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.scope == "_default" && self.name == "_default"
    }

    /// The `scope.name` path used in `getCollections` bodies and the
    /// `collection` message property.
    pub fn path(&self) -> String {
        format!("{}.{}", self.scope, self.name)
    }

    pub fn parse_path(path: &str) -> Result<Self, Error> {
        match path.split_once('.') {
            Some((scope, name)) if !scope.is_empty() && !name.is_empty() => Ok(Self {
                scope: scope.into(),
                name: name.into(),
            }),
            // A bare name addresses the default scope.
            None if !path.is_empty() => Ok(Self {
                scope: "_default".into(),
                name: path.into(),
            }),
            _ => Err(Error::InvalidParameter(format!(
                "malformed collection path {:?}",
                path
            ))),
        }
    }
}

impl fmt::Display for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.scope, self.name)
    }
}

/// The stable identifier of a peer, as it appears in version-vector entries.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(',') || s.contains('@') {
            return Err(Error::InvalidParameter(format!("malformed peer ID {:?}", s)));
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dense per-collection insertion counter; the primary replication cursor.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Add<u64> for Sequence {
    type Output = Sequence;

    fn add(self, rhs: u64) -> Sequence {
        Sequence(self.0 + rhs)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Small integer naming a remote database in per-document remote-ancestor
/// records, assigned by the remote-URL registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteDbId(pub u32);

macro_rules! flag_set {
    ($(#[$doc:meta])* $name:ident { $($(#[$fdoc:meta])* $flag:ident = $bit:expr;)+ }) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            $($(#[$fdoc])* pub const $flag: $name = $name($bit);)+

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            #[must_use]
            pub fn with(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            #[must_use]
            pub fn without(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                self.with(rhs)
            }
        }
    };
}

flag_set! {
    /// Flags carried by a single revision.
    RevFlags {
        DELETED = 0x01;
        LEAF = 0x02;
        HAS_ATTACHMENTS = 0x04;
        KEEP_BODY = 0x08;
        IS_CONFLICT = 0x10;
        /// Tombstone closing a conflicted branch.
        CLOSED = 0x20;
    }
}

flag_set! {
    /// Flags summarizing a document across its revisions.
    DocFlags {
        EXISTS = 0x01;
        DELETED = 0x02;
        CONFLICTED = 0x04;
        HAS_ATTACHMENTS = 0x08;
        /// The current revision has been acknowledged by some remote.
        SYNCED = 0x10;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_validation() {
        assert!("doc1".parse::<DocId>().is_ok());
        assert!("".parse::<DocId>().is_err());
        assert!("_design/x".parse::<DocId>().is_err());
        assert!("x".repeat(241).parse::<DocId>().is_err());
        assert!("x".repeat(240).parse::<DocId>().is_ok());
    }

    #[test]
    fn collection_paths() {
        let spec = CollectionSpec::parse_path("scope1.coll1").unwrap();
        assert_eq!(spec.path(), "scope1.coll1");
        let bare = CollectionSpec::parse_path("coll2").unwrap();
        assert_eq!(bare.scope, "_default");
        assert!(CollectionSpec::parse_path(".x").is_err());
    }

    #[test]
    fn flags_compose() {
        let f = RevFlags::DELETED | RevFlags::LEAF;
        assert!(f.contains(RevFlags::DELETED));
        assert!(!f.contains(RevFlags::IS_CONFLICT));
        assert!(!f.without(RevFlags::DELETED).contains(RevFlags::DELETED));
    }
}
