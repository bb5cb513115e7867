// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Processing of a single inbound `rev` message: parse, apply deltas,
//! decrypt, fetch missing blobs, filter, and hand off to the inserter.

use std::sync::Arc;

use bytes::Bytes;
use halyard_blip::{profiles, properties, Connection, MessageBuilder, MessageIn};
use halyard_store::{BlobStore, Body, ContentLevel, DocId, RevFlags, RevId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{
    attachments,
    db::DbAccess,
    error::{Error, Result},
    inserter::{Inserter, RevToInsert},
    options::{CollectionOptions, Options},
    remote_seq::RemoteSequence,
    tuning,
};

/// What one revision's processing ended as; reported back to the puller.
#[derive(Debug)]
pub struct RevOutcome {
    pub remote_seq: RemoteSequence,
    pub doc_id: Option<DocId>,
    pub rev_id: Option<RevId>,
    pub purged: bool,
    pub body_size: u64,
    pub result: Result<()>,
}

/// Everything a rev worker needs; cheap to clone per revision.
#[derive(Clone)]
pub struct IncomingContext {
    pub db: Arc<DbAccess>,
    pub blobs: Arc<dyn BlobStore>,
    pub conn: Arc<Connection>,
    pub coll: CollectionOptions,
    pub options: Arc<Options>,
    pub inserter: Arc<Inserter>,
    pub spawner: halyard_async::Spawner,
    pub outcomes: mpsc::UnboundedSender<RevOutcome>,
}

/// Whether this `rev` must be processed off the puller's message loop:
/// large bodies, possible blob fetches, decryption and pull filters all
/// take real time. Everything else runs synchronously on the puller's
/// thread, with only the insertion commit awaited off-loop.
pub fn needs_async_processing(msg: &MessageIn, coll: &CollectionOptions, options: &Options) -> bool {
    msg.body.len() > tuning::MAX_INLINE_REV_SIZE
        || coll.pull_filter.is_some()
        || options.property_decryptor.is_some()
        || bytes_contain(&msg.body, b"\"@type\"")
        || bytes_contain(&msg.body, b"\"digest\"")
}

/// The fully-async worker path.
pub async fn handle_rev(ctx: IncomingContext, msg: MessageIn) {
    let header = Header::of(&msg);
    let staged = match stage(&ctx, &msg, &header) {
        Ok(staged) => staged,
        Err(e) => {
            finish(&ctx, &header, msg, false, Err(e));
            return;
        },
    };
    let staged = match fetch_blobs_if_needed(&ctx, staged).await {
        Ok(staged) => staged,
        Err(e) => {
            finish(&ctx, &header, msg, false, Err(e));
            return;
        },
    };
    match staged {
        Staged::AlreadyDone { purged } => finish(&ctx, &header, msg, purged, Ok(())),
        Staged::Insert(rev) => {
            let purged = rev.purge;
            let done_rx = submit(&ctx, rev);
            let result = done_rx
                .await
                .unwrap_or_else(|_| Err(Error::Unexpected("inserter dropped the revision".into())));
            finish(&ctx, &header, msg, purged, result);
        },
    }
}

/// The synchronous fast path: everything except the insertion commit runs
/// on the caller's (the puller's) thread. Must only be used when
/// [`needs_async_processing`] returned false.
pub fn handle_rev_inline(ctx: IncomingContext, msg: MessageIn) {
    let header = Header::of(&msg);
    match stage(&ctx, &msg, &header) {
        Err(e) => finish(&ctx, &header, msg, false, Err(e)),
        Ok(Staged::AlreadyDone { purged }) => finish(&ctx, &header, msg, purged, Ok(())),
        Ok(Staged::Insert(rev)) => {
            let purged = rev.purge;
            let done_rx = submit(&ctx, rev);
            let waiter_ctx = ctx.clone();
            ctx.spawner
                .spawn(async move {
                    let result = done_rx.await.unwrap_or_else(|_| {
                        Err(Error::Unexpected("inserter dropped the revision".into()))
                    });
                    finish(&waiter_ctx, &header, msg, purged, result);
                })
                .detach();
        },
    }
}

/// The rev message's identifying properties.
#[derive(Clone)]
struct Header {
    remote_seq: RemoteSequence,
    doc_id: Option<DocId>,
    rev_id: Option<RevId>,
    body_size: u64,
}

impl Header {
    fn of(msg: &MessageIn) -> Self {
        Self {
            remote_seq: RemoteSequence::from_property(
                msg.property(properties::SEQUENCE).unwrap_or_default(),
            ),
            doc_id: msg.property(properties::ID).and_then(|s| s.parse().ok()),
            rev_id: msg.property(properties::REV).and_then(|s| s.parse().ok()),
            body_size: msg.body.len() as u64,
        }
    }
}

enum Staged {
    /// Nothing to insert (revoked doc with auto-purge off).
    AlreadyDone { purged: bool },
    Insert(RevToInsert),
}

/// Parse and validate the revision, expand or defer its delta, decrypt,
/// strip meta properties, apply the pull filter. Synchronous by design; the
/// only async step (blob fetching) happens afterwards.
fn stage(ctx: &IncomingContext, msg: &MessageIn, header: &Header) -> Result<Staged> {
    let doc_id = header
        .doc_id
        .clone()
        .ok_or_else(|| Error::body("rev message lacks a valid id property"))?;
    let rev_id = header
        .rev_id
        .clone()
        .ok_or_else(|| Error::body("rev message lacks a valid rev property"))?;

    let deleted = msg.properties.get_bool(properties::DELETED);
    let delta_src: Option<RevId> = match msg.property(properties::DELTA_SRC) {
        Some(s) => Some(
            s.parse()
                .map_err(|_| Error::body(format!("bad deltaSrc {:?}", s)))?,
        ),
        None => None,
    };
    let ancestors: Vec<RevId> = match msg.property(properties::HISTORY) {
        Some(h) if !h.is_empty() => h
            .split(',')
            .map(|r| {
                r.parse()
                    .map_err(|_| Error::body(format!("bad history entry {:?}", r)))
            })
            .collect::<Result<_>>()?,
        _ => Vec::new(),
    };
    let mut history = Vec::with_capacity(ancestors.len() + 1);
    history.push(rev_id.clone());
    history.extend(ancestors);

    let mut flags = RevFlags::default();
    if deleted {
        flags = flags.with(RevFlags::DELETED);
    }

    // A delta may ride through to the insertion transaction unless a later
    // step needs the expanded body.
    let must_expand_delta = delta_src.is_some()
        && (ctx.coll.pull_filter.is_some()
            || ctx.options.property_decryptor.is_some()
            || bytes_contain(&msg.body, b"digest"));

    let mut value = match &delta_src {
        Some(base_rev) if must_expand_delta => {
            let base = load_base_body(ctx, &doc_id, base_rev)?;
            Some(ctx.db.apply_delta(&base, &msg.body)?.to_value()?)
        },
        Some(base_rev) => {
            // Check the base now, so the failure is the typed
            // `DeltaBaseUnknown` the peer knows how to recover from.
            load_base_body(ctx, &doc_id, base_rev)?;
            None
        },
        None => Some(Body::from_bytes(msg.body.clone()).to_value()?),
    };

    if let Some(body_value) = value.take() {
        let body_value = match &ctx.options.property_decryptor {
            Some(decryptor) => decryptor(&doc_id, body_value)?,
            None => body_value,
        };
        let (body_value, _changed) = attachments::strip_meta_properties(&body_value);

        if attachments::is_removed(&body_value) {
            if !ctx.options.auto_purge {
                return Ok(Staged::AlreadyDone { purged: true });
            }
            trace!(doc = %doc_id, "peer revoked doc, purging");
            return Ok(Staged::Insert(make_rev(
                doc_id, rev_id, history, flags, None, None, true,
            )));
        }

        if !attachments::collect_blob_digests(&body_value).is_empty() {
            flags = flags.with(RevFlags::HAS_ATTACHMENTS);
        }

        if let Some(filter) = &ctx.coll.pull_filter {
            let body = Body::from_value(&body_value);
            if !filter(&ctx.coll.spec, &doc_id, &rev_id, flags, &body) {
                return Err(Error::http(403, "rejected by validation function"));
            }
        }

        let body = Body::from_value(&body_value);
        Ok(Staged::Insert(make_rev(
            doc_id,
            rev_id,
            history,
            flags,
            Some(body),
            None,
            false,
        )))
    } else {
        let base = delta_src.expect("deferred delta has a base");
        Ok(Staged::Insert(make_rev(
            doc_id,
            rev_id,
            history,
            flags,
            None,
            Some((base, msg.body.clone())),
            false,
        )))
    }
}

fn make_rev(
    doc_id: DocId,
    rev_id: RevId,
    history: Vec<RevId>,
    flags: RevFlags,
    body: Option<Body>,
    delta: Option<(RevId, Bytes)>,
    purge: bool,
) -> RevToInsert {
    let (done, _) = oneshot::channel();
    RevToInsert {
        doc_id,
        rev_id,
        history,
        flags,
        body,
        delta,
        purge,
        done,
    }
}

/// Replace the placeholder completion channel and queue the revision,
/// returning the receiver to await.
fn submit(ctx: &IncomingContext, mut rev: RevToInsert) -> oneshot::Receiver<Result<()>> {
    let (done, done_rx) = oneshot::channel();
    rev.done = done;
    ctx.inserter.insert(rev);
    done_rx
}

async fn fetch_blobs_if_needed(ctx: &IncomingContext, staged: Staged) -> Result<Staged> {
    if let Staged::Insert(rev) = &staged {
        if rev.flags.contains(RevFlags::HAS_ATTACHMENTS) && !ctx.options.disable_blob_support {
            if let Some(body) = &rev.body {
                let digests = attachments::collect_blob_digests(&body.to_value()?);
                fetch_missing_blobs(ctx, &digests).await?;
            }
        }
    }
    Ok(staged)
}

fn finish(ctx: &IncomingContext, header: &Header, mut msg: MessageIn, purged: bool, result: Result<()>) {
    match &result {
        Ok(()) => msg.respond_ok(),
        Err(e) => {
            debug!(error = %e, doc = ?header.doc_id, "incoming rev failed");
            msg.respond_error(e.to_wire())
        },
    }
    let _ = ctx.outcomes.send(RevOutcome {
        remote_seq: header.remote_seq.clone(),
        doc_id: header.doc_id.clone(),
        rev_id: header.rev_id.clone(),
        purged,
        body_size: header.body_size,
        result,
    });
}

fn load_base_body(ctx: &IncomingContext, doc_id: &DocId, base_rev: &RevId) -> Result<Body> {
    let doc = ctx
        .db
        .get_doc(&ctx.coll.spec, doc_id, ContentLevel::All)?
        .ok_or_else(|| Error::DeltaBaseUnknown(format!("no local doc {}", doc_id)))?;
    doc.rev(base_rev)
        .and_then(|r| r.body.clone())
        .ok_or_else(|| {
            Error::DeltaBaseUnknown(format!("base {} of {} not stored", base_rev, doc_id))
        })
}

/// Download every referenced blob we don't hold, streaming each into the
/// blob store and installing it under its expected digest.
async fn fetch_missing_blobs(
    ctx: &IncomingContext,
    digests: &[halyard_store::BlobDigest],
) -> Result<()> {
    for digest in digests {
        if ctx.blobs.contains(digest) {
            continue;
        }
        trace!(%digest, "requesting attachment");
        let mut request = MessageBuilder::new(profiles::GET_ATTACHMENT)
            .property(properties::DIGEST, digest.to_string());
        if !ctx.coll.spec.is_default() {
            request = request.property(properties::COLLECTION, ctx.coll.spec.path());
        }
        let reply = ctx
            .conn
            .send_request(request)
            .map_err(|_| Error::WebSocket {
                code: 1006,
                message: "connection closed while fetching attachment".into(),
            })?
            .await
            .map_err(|e| match e {
                halyard_blip::ReplyError::Wire(w) => Error::from(w),
                halyard_blip::ReplyError::Disconnected => Error::WebSocket {
                    code: 1006,
                    message: "disconnected while fetching attachment".into(),
                },
                _ => Error::WebSocket {
                    code: 1006,
                    message: "disconnected while fetching attachment".into(),
                },
            })?;

        let mut writer = ctx.blobs.open_write()?;
        writer.write(&reply.body)?;
        writer.install(Some(digest))?;
    }
    Ok(())
}

fn bytes_contain(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
