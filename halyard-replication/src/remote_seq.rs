// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{collections::BTreeMap, fmt};

use serde_json::Value;

/// A sequence received from a remote peer.
///
/// Opaque: any JSON value, optimized for non-negative integers. Never
/// reinterpreted, only echoed back; ordering is by insertion into a
/// [`RemoteSequenceSet`], not by value.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RemoteSequence {
    #[default]
    None,
    Int(u64),
    Json(String),
}

impl RemoteSequence {
    pub fn from_json_value(value: &Value) -> Self {
        match value.as_u64() {
            Some(n) => Self::Int(n),
            None if value.is_null() => Self::None,
            None => Self::Json(value.to_string()),
        }
    }

    /// Parse a property string: decimal integers stay integers, anything
    /// else is carried verbatim.
    pub fn from_property(s: &str) -> Self {
        if s.is_empty() {
            Self::None
        } else {
            match s.parse::<u64>() {
                Ok(n) => Self::Int(n),
                Err(_) => Self::Json(s.to_owned()),
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn to_json_value(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Int(n) => Value::from(*n),
            Self::Json(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
            },
        }
    }
}

impl fmt::Display for RemoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Int(n) => write!(f, "{}", n),
            Self::Json(s) => f.write_str(s),
        }
    }
}

struct Entry {
    /// Chronological order in which the sequence was added.
    order: u64,
    /// The sequence added immediately before this one.
    prev: RemoteSequence,
    /// Approximate doc size, credited to progress on completion.
    body_size: u64,
}

/// The set of remote sequences still being processed, in insertion order.
///
/// `since()` is the newest sequence below every outstanding one: the value
/// the checkpoint may safely record.
#[derive(Default)]
pub struct RemoteSequenceSet {
    sequences: BTreeMap<RemoteSequence, Entry>,
    next_order: u64,
    last_added: RemoteSequence,
}

impl RemoteSequenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the set, as if `since` had just been processed.
    pub fn clear(&mut self, since: RemoteSequence) {
        self.sequences.clear();
        self.next_order = 0;
        self.last_added = since;
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// The sequence before the earliest one still outstanding.
    pub fn since(&self) -> RemoteSequence {
        match self.earliest() {
            Some((_, entry)) => entry.prev.clone(),
            None => self.last_added.clone(),
        }
    }

    pub fn add(&mut self, seq: RemoteSequence, body_size: u64) {
        let entry = Entry {
            order: self.next_order,
            prev: std::mem::replace(&mut self.last_added, seq.clone()),
            body_size,
        };
        self.next_order += 1;
        self.sequences.insert(seq, entry);
    }

    /// Remove `seq` if present. Returns `(was_earliest, body_size)`.
    pub fn remove(&mut self, seq: &RemoteSequence) -> Option<(bool, u64)> {
        let earliest_order = self.earliest().map(|(_, e)| e.order);
        let entry = self.sequences.remove(seq)?;
        Some((earliest_order == Some(entry.order), entry.body_size))
    }

    pub fn body_size_of(&self, seq: &RemoteSequence) -> u64 {
        self.sequences.get(seq).map(|e| e.body_size).unwrap_or(0)
    }

    fn earliest(&self) -> Option<(&RemoteSequence, &Entry)> {
        // Insertion order, not key order.
        self.sequences.iter().min_by_key(|(_, e)| e.order)
    }
}
