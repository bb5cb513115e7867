// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::Error, types::PeerId};

/// A single version-vector entry: a logical timestamp scoped to a peer.
///
/// The peer `*` stands for "this local peer" and must be resolved to the
/// database's stable peer ID before transmission.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Version {
    pub time: u64,
    pub peer: PeerId,
}

impl Version {
    pub fn is_local_placeholder(&self) -> bool {
        self.peer.as_str() == "*"
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.time, self.peer)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (time, peer) = s
            .split_once('@')
            .ok_or_else(|| malformed_rev(s, "missing '@'"))?;
        let time = time
            .parse()
            .map_err(|_| malformed_rev(s, "bad logical time"))?;
        let peer = peer
            .parse()
            .map_err(|_| malformed_rev(s, "bad peer ID"))?;
        Ok(Self { time, peer })
    }
}

/// A version vector: entries youngest first, at most one per peer.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct VersionVector(Vec<Version>);

impl VersionVector {
    pub fn new(versions: Vec<Version>) -> Result<Self, Error> {
        if versions.is_empty() {
            return Err(Error::CorruptRevisionData("empty version vector".into()));
        }
        Ok(Self(versions))
    }

    /// The youngest entry, ie. the edit this vector identifies.
    pub fn current(&self) -> &Version {
        &self.0[0]
    }

    pub fn versions(&self) -> &[Version] {
        &self.0
    }

    /// The logical time recorded for `peer`, zero if absent.
    pub fn time_of(&self, peer: &PeerId) -> u64 {
        self.0
            .iter()
            .find(|v| &v.peer == peer)
            .map(|v| v.time)
            .unwrap_or(0)
    }

    /// Replace `*` entries with the local peer's stable ID.
    #[must_use]
    pub fn resolve_local(&self, local: &PeerId) -> Self {
        Self(
            self.0
                .iter()
                .map(|v| Version {
                    time: v.time,
                    peer: if v.is_local_placeholder() {
                        local.clone()
                    } else {
                        v.peer.clone()
                    },
                })
                .collect(),
        )
    }

    /// Incoming vectors are accepted in any entry order; writes store the
    /// canonical permutation: by time descending, ties by peer.
    #[must_use]
    pub fn canonicalized(&self) -> Self {
        let mut versions = self.0.clone();
        versions.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.peer.cmp(&b.peer)));
        Self(versions)
    }

    /// True if every entry of `other` is covered by an equal-or-newer entry
    /// here, and at least one entry here is strictly newer.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        let covers = other.0.iter().all(|v| self.time_of(&v.peer) >= v.time);
        covers && self.0.iter().any(|v| v.time > other.time_of(&v.peer))
    }

    /// Neither vector dominates the other and they are not equal.
    pub fn concurrent_with(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self) && self.canonicalized() != other.canonicalized()
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

/// A revision identifier, in either of the two supported schemes.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum RevId {
    /// `<generation>-<digest>`: generation is the parent's plus one, the
    /// digest lowercase hex over the revision content.
    Tree { generation: u64, digest: String },
    /// A version vector, youngest entry first.
    Vector(VersionVector),
}

impl RevId {
    /// The generation number: the tree generation, or the youngest logical
    /// time of a vector.
    pub fn generation(&self) -> u64 {
        match self {
            Self::Tree { generation, .. } => *generation,
            Self::Vector(vv) => vv.current().time,
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_))
    }

    pub fn as_vector(&self) -> Option<&VersionVector> {
        match self {
            Self::Vector(vv) => Some(vv),
            Self::Tree { .. } => None,
        }
    }

    /// Compare generations only; digests are not ordered.
    pub fn cmp_generation(&self, other: &RevId) -> Ordering {
        self.generation().cmp(&other.generation())
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tree { generation, digest } => write!(f, "{}-{}", generation, digest),
            Self::Vector(vv) => write!(f, "{}", vv),
        }
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('@') {
            let versions = s
                .split(',')
                .map(Version::from_str)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Self::Vector(VersionVector::new(versions)?))
        } else {
            let (generation, digest) = s
                .split_once('-')
                .ok_or_else(|| malformed_rev(s, "missing '-'"))?;
            let generation: u64 = generation
                .parse()
                .map_err(|_| malformed_rev(s, "bad generation"))?;
            if generation == 0 {
                return Err(malformed_rev(s, "generation must be positive"));
            }
            if digest.is_empty()
                || !digest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            {
                return Err(malformed_rev(s, "bad digest"));
            }
            Ok(Self::Tree {
                generation,
                digest: digest.to_owned(),
            })
        }
    }
}

fn malformed_rev(s: &str, why: &str) -> Error {
    Error::CorruptRevisionData(format!("malformed revision ID {:?}: {}", s, why))
}

impl Serialize for RevId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    #[test]
    fn tree_rev_roundtrip() {
        let r = rev("3-deadbeef");
        assert_eq!(r.generation(), 3);
        assert_eq!(r.to_string(), "3-deadbeef");
    }

    #[test]
    fn tree_rev_rejects_garbage() {
        assert!("".parse::<RevId>().is_err());
        assert!("abc".parse::<RevId>().is_err());
        assert!("0-beef".parse::<RevId>().is_err());
        assert!("2-BEEF".parse::<RevId>().is_err());
        assert!("2-".parse::<RevId>().is_err());
    }

    #[test]
    fn vector_roundtrip_and_generation() {
        let r = rev("7@alice,3@bob");
        assert_eq!(r.generation(), 7);
        assert_eq!(r.to_string(), "7@alice,3@bob");
    }

    #[test]
    fn local_placeholder_resolution() {
        let local: PeerId = "p-local".parse().unwrap();
        let vv = rev("9@*,3@bob").as_vector().unwrap().resolve_local(&local);
        assert_eq!(vv.to_string(), "9@p-local,3@bob");
    }

    #[test]
    fn dominance() {
        let a = rev("7@alice,3@bob");
        let b = rev("5@alice,3@bob");
        let c = rev("6@carol");
        let (a, b, c) = (
            a.as_vector().unwrap().clone(),
            b.as_vector().unwrap().clone(),
            c.as_vector().unwrap().clone(),
        );
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.concurrent_with(&c));
    }

    #[test]
    fn permutations_canonicalize_equal() {
        let a = rev("7@alice,3@bob").as_vector().unwrap().canonicalized();
        let b = rev("3@bob,7@alice").as_vector().unwrap().canonicalized();
        assert_eq!(a, b);
        assert!(!a.concurrent_with(&b));
    }
}
