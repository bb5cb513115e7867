// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::FutureExt as _;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    error::{ReplyError, SendError, WireError},
    message::{MessageBuilder, MessageIn, Response},
};

/// A close frame, as sent over the underlying socket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Close {
    pub code: u16,
    pub message: String,
}

impl Close {
    pub fn normal() -> Self {
        Self {
            code: 1000,
            message: String::new(),
        }
    }

    pub fn going_away(message: impl Into<String>) -> Self {
        Self {
            code: 1001,
            message: message.into(),
        }
    }
}

/// One end of a multiplexed message connection.
///
/// Production deployments back this with a framed socket; the [`pipe`]
/// constructor yields a connected in-process pair with identical semantics,
/// which is all the replication core ever assumes.
pub struct Connection {
    tx: Mutex<Option<mpsc::UnboundedSender<MessageIn>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<MessageIn>>>,
    close_tx: watch::Sender<Option<Close>>,
    peer_close: watch::Receiver<Option<Close>>,
}

/// Create a connected pair of [`Connection`]s.
pub fn pipe() -> (Connection, Connection) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let (a_close_tx, a_close_rx) = watch::channel(None);
    let (b_close_tx, b_close_rx) = watch::channel(None);
    (
        Connection {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(Some(a_rx)),
            close_tx: a_close_tx,
            peer_close: b_close_rx,
        },
        Connection {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(Some(b_rx)),
            close_tx: b_close_tx,
            peer_close: a_close_rx,
        },
    )
}

impl Connection {
    /// Send a request, returning a handle on the eventual reply.
    ///
    /// For `noreply` messages the handle resolves immediately with an empty
    /// response once the message is on the wire.
    pub fn send_request(&self, msg: MessageBuilder) -> Result<PendingReply, SendError> {
        let no_reply = msg.no_reply;
        let (reply_tx, reply_rx) = oneshot::channel();
        let out = MessageIn {
            properties: msg.properties,
            body: msg.body,
            urgent: msg.urgent,
            reply: (!no_reply).then_some(reply_tx),
        };
        match &*self.tx.lock() {
            Some(tx) => tx.send(out).map_err(|_| SendError::Closed)?,
            None => return Err(SendError::Closed),
        }
        if no_reply {
            let _ = reply_rx;
            Ok(PendingReply::immediate())
        } else {
            Ok(PendingReply::waiting(reply_rx))
        }
    }

    /// Take the stream of incoming requests. Yields `None` once for each
    /// connection; the supervisor owns routing.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<MessageIn>> {
        self.rx.lock().take()
    }

    /// Close this end: the peer's incoming stream ends, its in-flight
    /// requests resolve with [`ReplyError::Disconnected`], and the close
    /// frame becomes observable via [`Connection::peer_closed`] over there.
    pub fn close(&self, close: Close) {
        self.tx.lock().take();
        self.rx.lock().take();
        let _ = self.close_tx.send(Some(close));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Watch for the peer's close frame.
    pub fn peer_closed(&self) -> watch::Receiver<Option<Close>> {
        self.peer_close.clone()
    }
}

enum ReplyState {
    Immediate(Option<Response>),
    Waiting(oneshot::Receiver<Result<Response, WireError>>),
}

/// Future resolving to the peer's reply.
pub struct PendingReply(ReplyState);

impl PendingReply {
    fn immediate() -> Self {
        Self(ReplyState::Immediate(Some(Response::empty())))
    }

    fn waiting(rx: oneshot::Receiver<Result<Response, WireError>>) -> Self {
        Self(ReplyState::Waiting(rx))
    }
}

impl Future for PendingReply {
    type Output = Result<Response, ReplyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.0 {
            ReplyState::Immediate(resp) => {
                Poll::Ready(Ok(resp.take().expect("polled after completion")))
            },
            ReplyState::Waiting(rx) => rx.poll_unpin(cx).map(|res| match res {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(wire)) => Err(ReplyError::Wire(wire)),
                Err(_) => Err(ReplyError::Disconnected),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::profiles;

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let (client, server) = pipe();
        let mut incoming = server.take_incoming().unwrap();

        let pending = client
            .send_request(MessageBuilder::new(profiles::GET_CHECKPOINT).property("client", "cp-x"))
            .unwrap();

        let mut req = incoming.recv().await.unwrap();
        assert_eq!(req.profile(), profiles::GET_CHECKPOINT);
        assert_eq!(req.property("client"), Some("cp-x"));
        req.respond(Response::empty().with_property("rev", "1-cc"));

        let resp = pending.await.unwrap();
        assert_eq!(resp.properties.get("rev"), Some("1-cc"));
    }

    #[tokio::test]
    async fn close_disconnects_in_flight() {
        let (client, server) = pipe();
        let _incoming = server.take_incoming().unwrap();

        let pending = client
            .send_request(MessageBuilder::new(profiles::SUB_CHANGES))
            .unwrap();
        server.close(Close::going_away("shutting down"));
        drop(_incoming);

        assert!(matches!(pending.await, Err(ReplyError::Disconnected)));
        let peer_close = client.peer_closed();
        let close = peer_close.borrow().clone();
        assert_eq!(close.map(|c| c.code), Some(1001));
    }

    #[tokio::test]
    async fn error_reply_surfaces_domain_and_code() {
        let (client, server) = pipe();
        let mut incoming = server.take_incoming().unwrap();

        let pending = client
            .send_request(MessageBuilder::new(profiles::REV))
            .unwrap();
        let mut req = incoming.recv().await.unwrap();
        req.respond_error(WireError::new("LiteCore", 409, "conflict"));

        match pending.await {
            Err(ReplyError::Wire(e)) => {
                assert_eq!(e.domain, "LiteCore");
                assert_eq!(e.code, 409);
            },
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
