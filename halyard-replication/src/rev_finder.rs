// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::sync::Arc;

use halyard_store::{CollectionSpec, ContentLevel, DocFlags, DocId, RevId};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    db::DbAccess,
    error::{Error, Result},
    options::Options,
    remote_seq::RemoteSequence,
    tuning,
};

/// One entry of a `changes` / `proposeChanges` message.
#[derive(Clone, Debug)]
pub struct ChangeItem {
    pub remote_seq: RemoteSequence,
    pub doc_id: DocId,
    pub rev_id: RevId,
    /// `proposeChanges` only: the parent the sender will build on.
    pub parent: Option<RevId>,
    pub deleted: bool,
    pub body_size: u64,
}

/// The receiver's verdict on one announced change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Send it; `ancestors` are revisions of the doc we already hold, usable
    /// as a delta base (tree mode, capped at ten).
    Wanted { ancestors: Vec<RevId> },
    /// A status code: 304 already-have, 409 conflict.
    Status(i32),
}

impl Verdict {
    pub fn wanted(&self) -> bool {
        matches!(self, Self::Wanted { .. })
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Wanted { ancestors } if ancestors.is_empty() => Value::from(0),
            Self::Wanted { ancestors } => Value::Array(
                ancestors
                    .iter()
                    .map(|r| Value::String(r.to_string()))
                    .collect(),
            ),
            Self::Status(code) => Value::from(*code),
        }
    }
}

/// Decides which announced changes the local side wants.
pub struct RevFinder {
    db: Arc<DbAccess>,
    coll: CollectionSpec,
    disable_deltas: bool,
    disable_blobs: bool,
    announced_delta_support: bool,
}

impl RevFinder {
    pub fn new(db: Arc<DbAccess>, coll: CollectionSpec, options: &Options) -> Self {
        Self {
            db,
            coll,
            disable_deltas: options.disable_deltas,
            disable_blobs: options.disable_blob_support,
            announced_delta_support: false,
        }
    }

    /// Parse the body of a `changes` (`[seq, docID, revID, deleted?,
    /// bodySize?]`) or `proposeChanges` (`[docID, revID, parentRevID?,
    /// bodySize?]`) message. Malformed entries are dropped with a warning.
    pub fn parse_changes(proposed: bool, body: &Value) -> Result<Vec<ChangeItem>> {
        let rows = body
            .as_array()
            .ok_or_else(|| Error::body("changes body must be an array"))?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::parse_row(proposed, row) {
                Some(item) => items.push(item),
                None => warn!(?row, "invalid entry in changes message"),
            }
        }
        Ok(items)
    }

    fn parse_row(proposed: bool, row: &Value) -> Option<ChangeItem> {
        let row = row.as_array()?;
        if proposed {
            let doc_id: DocId = row.first()?.as_str()?.parse().ok()?;
            let rev_id: RevId = row.get(1)?.as_str()?.parse().ok()?;
            let parent = match row.get(2).and_then(Value::as_str) {
                Some("") | None => None,
                Some(s) => Some(s.parse().ok()?),
            };
            Some(ChangeItem {
                remote_seq: RemoteSequence::None,
                doc_id,
                rev_id,
                parent,
                deleted: false,
                body_size: row.get(3).and_then(Value::as_u64).unwrap_or(0),
            })
        } else {
            let remote_seq = RemoteSequence::from_json_value(row.first()?);
            let doc_id: DocId = row.get(1)?.as_str()?.parse().ok()?;
            let rev_id: RevId = row.get(2)?.as_str()?.parse().ok()?;
            let deleted = match row.get(3) {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
                _ => false,
            };
            Some(ChangeItem {
                remote_seq,
                doc_id,
                rev_id,
                parent: None,
                deleted,
                body_size: row.get(4).and_then(Value::as_u64).unwrap_or(0),
            })
        }
    }

    /// Reply properties for a `changes` response: our history depth, blob
    /// support, and (once per connection) delta support.
    pub fn response_properties(&mut self) -> Vec<(&'static str, String)> {
        let mut props = vec![(
            halyard_blip::properties::MAX_HISTORY,
            tuning::DEFAULT_MAX_HISTORY.to_string(),
        )];
        if !self.disable_blobs {
            props.push((halyard_blip::properties::BLOBS, "true".into()));
        }
        if !self.disable_deltas && !self.announced_delta_support {
            props.push((halyard_blip::properties::DELTAS, "true".into()));
            self.announced_delta_support = true;
        }
        props
    }

    /// Produce one verdict per announced change.
    pub fn find_revs(&mut self, proposed: bool, items: &[ChangeItem]) -> Result<Vec<Verdict>> {
        if !proposed {
            // Ancestor reads below must observe every queued mark.
            self.db.mark_revs_synced_now()?;
        }
        let mut verdicts = Vec::with_capacity(items.len());
        let mut wanted = 0usize;
        for item in items {
            let verdict = if proposed {
                self.find_proposed(item)?
            } else {
                self.find_announced(item)?
            };
            if verdict.wanted() {
                wanted += 1;
            }
            trace!(doc = %item.doc_id, rev = %item.rev_id, ?verdict, "triaged change");
            verdicts.push(verdict);
        }
        debug!(
            total = items.len(),
            wanted, proposed, "triaged announced changes"
        );
        Ok(verdicts)
    }

    fn find_announced(&self, item: &ChangeItem) -> Result<Verdict> {
        let doc = self
            .db
            .get_doc(&self.coll, &item.doc_id, ContentLevel::Metadata)?;
        let doc = match doc {
            None => return Ok(Verdict::Wanted { ancestors: vec![] }),
            Some(doc) => doc,
        };

        if doc.contains(&item.rev_id) {
            // Already have it. Make sure the remote-ancestor map knows the
            // peer has it too, so we never push it back.
            if self.db.remote_ancestor_of(&doc).as_ref() != Some(&item.rev_id) {
                self.db
                    .mark_synced(&self.coll, item.doc_id.clone(), item.rev_id.clone());
            }
            return Ok(Verdict::Status(304));
        }

        if let (Some(theirs), RevId::Vector(ours)) =
            (item.rev_id.as_vector(), &doc.current().rev_id)
        {
            if ours.dominates(theirs) {
                // Their announcement is already part of our history.
                return Ok(Verdict::Status(304));
            }
        }

        let mut ancestors: Vec<RevId> = doc
            .revs
            .iter()
            .filter(|r| r.rev_id.generation() < item.rev_id.generation())
            .map(|r| r.rev_id.clone())
            .collect();
        ancestors.truncate(tuning::MAX_POSSIBLE_ANCESTORS);
        Ok(Verdict::Wanted { ancestors })
    }

    fn find_proposed(&self, item: &ChangeItem) -> Result<Verdict> {
        let doc = self
            .db
            .get_doc(&self.coll, &item.doc_id, ContentLevel::Metadata)?;
        let doc = match doc {
            None => return Ok(Verdict::Wanted { ancestors: vec![] }),
            Some(doc) => doc,
        };

        if doc.contains(&item.rev_id) {
            return Ok(Verdict::Status(304));
        }

        let current = &doc.current().rev_id;
        let accepted = match (&item.parent, item.rev_id.as_vector()) {
            // A vector proposal is acceptable iff it dominates what we have.
            (_, Some(theirs)) => match current.as_vector() {
                Some(ours) => theirs.dominates(ours),
                None => false,
            },
            (None, None) => doc.flags.contains(DocFlags::DELETED) || !doc.flags.contains(DocFlags::EXISTS),
            (Some(parent), None) => parent == current,
        };
        if accepted {
            Ok(Verdict::Wanted { ancestors: vec![] })
        } else {
            Ok(Verdict::Status(409))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use halyard_store::{Body, MemStorage, NewBody, PutRequest, RevFlags, Storage};
    use serde_json::json;

    use super::*;

    fn setup() -> (Arc<DbAccess>, RevFinder) {
        let storage = MemStorage::new("revfinder-test");
        let coll = CollectionSpec::default_collection();
        storage.create_collection(&coll).unwrap();
        let db = Arc::new(DbAccess::new(Arc::new(storage), "wss://peer/db").unwrap());
        let finder = RevFinder::new(
            Arc::clone(&db),
            coll,
            &Options::new("wss://peer/db"),
        );
        (db, finder)
    }

    fn put(db: &DbAccess, doc: &str, history: &[&str], deleted: bool) {
        let coll = CollectionSpec::default_collection();
        db.in_transaction(|storage| {
            storage
                .put_rev(
                    &coll,
                    PutRequest {
                        doc_id: doc.parse().unwrap(),
                        history: history.iter().map(|r| r.parse().unwrap()).collect(),
                        flags: if deleted {
                            RevFlags::DELETED
                        } else {
                            RevFlags::default()
                        },
                        allow_conflict: false,
                        remote_db_id: None,
                        body: NewBody::Full(Body::from_json("{}").unwrap()),
                    },
                )
                .map_err(Error::from)
        })
        .unwrap();
    }

    fn item(doc: &str, rev: &str, parent: Option<&str>) -> ChangeItem {
        ChangeItem {
            remote_seq: RemoteSequence::Int(1),
            doc_id: doc.parse().unwrap(),
            rev_id: rev.parse().unwrap(),
            parent: parent.map(|p| p.parse().unwrap()),
            deleted: false,
            body_size: 0,
        }
    }

    #[test]
    fn parses_both_wire_shapes() {
        let changes = RevFinder::parse_changes(
            false,
            &json!([[7, "doc1", "2-beef", 0, 523], ["8:x", "doc2", "1-cafe"]]),
        )
        .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].remote_seq, RemoteSequence::Int(7));
        assert_eq!(changes[0].body_size, 523);
        assert_eq!(changes[1].remote_seq, RemoteSequence::Json("\"8:x\"".into()));

        let proposed = RevFinder::parse_changes(
            true,
            &json!([["doc1", "3-aaaa", "2-beef"], ["doc2", "1-cafe", ""]]),
        )
        .unwrap();
        assert_eq!(proposed[0].parent, Some("2-beef".parse().unwrap()));
        assert_eq!(proposed[1].parent, None);

        // Malformed rows are dropped, not fatal.
        let lax = RevFinder::parse_changes(false, &json!([[1, "", "1-aa"], [2, "ok", "1-aa"]]))
            .unwrap();
        assert_eq!(lax.len(), 1);
    }

    #[test]
    fn announced_changes_triage() {
        let (db, mut finder) = setup();
        put(&db, "have", &["2-bb", "1-aa"], false);
        put(&db, "old", &["1-xx"], false);

        let verdicts = finder
            .find_revs(
                false,
                &[
                    item("new", "1-zz", None),
                    item("have", "2-bb", None),
                    item("old", "3-yy", None),
                ],
            )
            .unwrap();

        assert_eq!(verdicts[0], Verdict::Wanted { ancestors: vec![] });
        assert_eq!(verdicts[1], Verdict::Status(304));
        match &verdicts[2] {
            Verdict::Wanted { ancestors } => {
                assert_eq!(ancestors, &vec!["1-xx".parse().unwrap()])
            },
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn ancestor_lists_are_capped() {
        let (db, mut finder) = setup();
        let mut history: Vec<String> = Vec::new();
        for generation in 1..=15 {
            history.insert(0, format!("{}-aaaa{:02}", generation, generation));
            let refs: Vec<&str> = history.iter().map(String::as_str).collect();
            put(&db, "deep", &refs, false);
        }
        let verdicts = finder
            .find_revs(false, &[item("deep", "20-ffff", None)])
            .unwrap();
        match &verdicts[0] {
            Verdict::Wanted { ancestors } => {
                assert_eq!(ancestors.len(), tuning::MAX_POSSIBLE_ANCESTORS)
            },
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn proposed_changes_triage() {
        let (db, mut finder) = setup();
        put(&db, "mine", &["2-bb", "1-aa"], false);
        put(&db, "gone", &["1-dd"], true);

        let verdicts = finder
            .find_revs(
                true,
                &[
                    // Extends our current rev: accepted.
                    item("mine", "3-cc", Some("2-bb")),
                    // Based on a stale parent: conflict.
                    item("mine", "3-ee", Some("1-aa")),
                    // We already have it.
                    item("mine", "2-bb", Some("1-aa")),
                    // New doc: accepted.
                    item("fresh", "1-ff", None),
                    // Tombstoned locally, no parent: accepted.
                    item("gone", "1-gg", None),
                ],
            )
            .unwrap();
        let expect = [
            Verdict::Wanted { ancestors: vec![] },
            Verdict::Status(409),
            Verdict::Status(304),
            Verdict::Wanted { ancestors: vec![] },
            Verdict::Wanted { ancestors: vec![] },
        ];
        assert_eq!(verdicts, expect);
    }

    #[test]
    fn verdict_wire_encoding() {
        assert_eq!(Verdict::Wanted { ancestors: vec![] }.to_json(), json!(0));
        assert_eq!(Verdict::Status(304).to_json(), json!(304));
        assert_eq!(
            Verdict::Wanted {
                ancestors: vec!["1-aa".parse().unwrap()]
            }
            .to_json(),
            json!(["1-aa"])
        );
    }
}
