//! Per-connection session engine for the chat service.
//!
//! A [`Session`] is the shared handle other parts of the system hold: the
//! server's session table, the user manager and the dispatcher's weak
//! references all point at the same `Arc<Session>`. The socket itself lives
//! in a [`SessionHandler`] task pinned to one io-pool worker, which serializes
//! every read, write and state change for the connection.

use crate::dispatch::LogicNode;
use crate::frame::{Frame, MsgId};
use crate::{Connection, Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bound on the egress FIFO. A peer that cannot drain this many frames is
/// either gone or hopeless; further frames are dropped with a warning, as
/// the egress queue must never grow without bound.
pub const SEND_QUEUE_DEPTH: usize = 1000;

/// Shared state of one live client connection.
#[derive(Debug)]
pub struct Session {
    /// Opaque globally-unique id, minted on accept.
    id: String,
    /// Bound uid after a successful login; 0 before.
    user_id: AtomicI64,
    /// Egress FIFO feeding the connection task.
    outbound: mpsc::Sender<Frame>,
    /// Seconds-since-epoch stamp of the last inbound frame.
    last_heartbeat: AtomicI64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    /// Create the shared handle and the egress receiver for its handler.
    pub fn new() -> (Arc<Session>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            user_id: AtomicI64::new(0),
            outbound: tx,
            last_heartbeat: AtomicI64::new(now_secs()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id.load(Ordering::Acquire)
    }

    pub fn set_user_id(&self, uid: i64) {
        self.user_id.store(uid, Ordering::Release);
    }

    /// Stamp the heartbeat clock. Called for every inbound frame.
    pub fn touch(&self) {
        self.last_heartbeat.store(now_secs(), Ordering::Release);
    }

    /// Seconds since the last inbound frame.
    pub fn idle_secs(&self) -> i64 {
        (now_secs() - self.last_heartbeat.load(Ordering::Acquire)).max(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the connection task to stop. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    pub(crate) fn closed_signal(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Queue a frame whose body is the JSON encoding of `value`.
    pub fn send_json<T: Serialize>(&self, id: MsgId, value: &T) -> Result<()> {
        self.send_frame(Frame::json(id, value)?)
    }

    /// Queue a frame for writing.
    ///
    /// Frames are written in queue order by the single connection task, so
    /// there is never more than one write in flight per session and the byte
    /// stream never interleaves or reorders.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    session = self.id.as_str(),
                    id = frame.id,
                    "send queue full, dropping frame"
                );
                Err(Error::SendQueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::SessionClosed),
        }
    }
}

/// The connection task: one per socket, on its affinitized worker loop.
///
/// Runs the ingress state machine (read header, read body, hand the frame to
/// the dispatcher) and drains the egress queue, in a single `select!` loop so
/// all connection state is touched from one task only.
#[derive(Debug)]
pub struct SessionHandler<S> {
    session: Arc<Session>,
    connection: Connection<S>,
    outbound_rx: mpsc::Receiver<Frame>,
    dispatch: mpsc::UnboundedSender<LogicNode>,
    /// Server-wide stop token; cancelled once, observed by every session.
    stop: CancellationToken,
}

impl<S: crate::connection::ConnectionStream> SessionHandler<S> {
    pub fn new(
        session: Arc<Session>,
        connection: Connection<S>,
        outbound_rx: mpsc::Receiver<Frame>,
        dispatch: mpsc::UnboundedSender<LogicNode>,
        stop: CancellationToken,
    ) -> SessionHandler<S> {
        SessionHandler {
            session,
            connection,
            outbound_rx,
            dispatch,
            stop,
        }
    }

    /// Process the connection until the peer goes away, the session is
    /// closed, or the server-wide stop token fires.
    ///
    /// A protocol violation (oversize header, torn frame) surfaces as `Err`
    /// and the caller tears the session down; nothing of the bad input
    /// reaches the dispatcher.
    pub async fn run(&mut self) -> Result<()> {
        while !self.stop.is_cancelled() && !self.session.is_closed() {
            tokio::select! {
                res = self.connection.read_frame() => {
                    let Some(frame) = res? else {
                        debug!(session = self.session.id(), "peer closed the connection");
                        return Ok(());
                    };
                    self.session.touch();
                    if self.dispatch.send(LogicNode::new(&self.session, frame)).is_err() {
                        // Dispatcher has stopped; the server is going down.
                        return Ok(());
                    }
                }
                maybe = self.outbound_rx.recv() => {
                    match maybe {
                        Some(frame) => self.connection.write_frame(&frame).await?,
                        None => return Ok(()),
                    }
                }
                _ = self.session.closed_signal() => {
                    return Ok(());
                }
                _ = self.stop.cancelled() => {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    fn wire(id: u16, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u16(id);
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, _rx) = Session::new();
        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(matches!(
            session.send_frame(Frame::new(MsgId::HeartbeatRsp, Bytes::new())),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn test_send_queue_overflow_drops_frame() {
        let (session, mut rx) = Session::new();
        for _ in 0..SEND_QUEUE_DEPTH {
            session
                .send_frame(Frame::new(MsgId::HeartbeatRsp, Bytes::new()))
                .unwrap();
        }
        assert!(matches!(
            session.send_frame(Frame::new(MsgId::HeartbeatRsp, Bytes::new())),
            Err(Error::SendQueueFull)
        ));
        // The queued frames are intact and ordered.
        assert_eq!(rx.try_recv().unwrap().id, MsgId::HeartbeatRsp as u16);
    }

    #[tokio::test]
    async fn test_egress_fifo_single_writer() {
        let (session, outbound_rx) = Session::new();
        let (dispatch_tx, _dispatch_rx) = mpsc::unbounded_channel();

        let a = Frame::new(MsgId::LoginRsp, Bytes::from_static(b"a"));
        let b = Frame::new(MsgId::SearchRsp, Bytes::from_static(b"bb"));
        let c = Frame::new(MsgId::ChatTextRsp, Bytes::from_static(b"ccc"));

        // The mock asserts both content and order of the writes.
        let stream = tokio_test::io::Builder::new()
            .write(&wire(a.id, &a.body))
            .write(&wire(b.id, &b.body))
            .write(&wire(c.id, &c.body))
            .build();

        session.send_frame(a).unwrap();
        session.send_frame(b).unwrap();
        session.send_frame(c).unwrap();

        let mut handler = SessionHandler::new(
            session,
            Connection::new(stream),
            outbound_rx,
            dispatch_tx,
            CancellationToken::new(),
        );
        handler.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_dispatcher_in_order() {
        let (session, outbound_rx) = Session::new();
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();

        let mut bytes = wire(MsgId::LoginReq as u16, br#"{"uid":1}"#);
        bytes.extend_from_slice(&wire(MsgId::HeartbeatReq as u16, b""));

        let stream = tokio_test::io::Builder::new().read(&bytes).build();
        let mut handler = SessionHandler::new(
            session.clone(),
            Connection::new(stream),
            outbound_rx,
            dispatch_tx,
            CancellationToken::new(),
        );
        handler.run().await.unwrap();

        let first = dispatch_rx.recv().await.unwrap();
        let second = dispatch_rx.recv().await.unwrap();
        assert_eq!(first.frame.id, MsgId::LoginReq as u16);
        assert_eq!(second.frame.id, MsgId::HeartbeatReq as u16);
        // The node points back at the producing session.
        assert_eq!(
            first.session.upgrade().unwrap().id(),
            session.id()
        );
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_before_dispatch() {
        let (session, outbound_rx) = Session::new();
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();

        let mut bytes = Vec::new();
        bytes.put_u16(9999);
        bytes.put_u16(0xFFFF);

        let stream = tokio_test::io::Builder::new().read(&bytes).build();
        let mut handler = SessionHandler::new(
            session,
            Connection::new(stream),
            outbound_rx,
            dispatch_tx,
            CancellationToken::new(),
        );

        assert!(matches!(
            handler.run().await,
            Err(Error::FrameTooLarge(_))
        ));
        drop(handler);
        assert!(dispatch_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_token_stops_the_handler() {
        let (session, outbound_rx) = Session::new();
        let (dispatch_tx, _dispatch_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        // A live duplex peer that never sends: only the stop token can end
        // the loop.
        let (peer, stream) = tokio::io::duplex(64);
        let mut handler = SessionHandler::new(
            session,
            Connection::new(stream),
            outbound_rx,
            dispatch_tx,
            stop.clone(),
        );

        stop.cancel();
        handler.run().await.unwrap();
        drop(peer);
    }
}
