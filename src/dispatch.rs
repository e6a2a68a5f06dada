//! The logic dispatcher: a single consumer task draining a FIFO of decoded
//! frames and running every application handler serially.
//!
//! Producers are the session tasks; they enqueue one [`LogicNode`] per
//! received frame. Because each session's ingress loop hands over frames one
//! at a time, the dispatcher sees — and therefore processes — every session's
//! frames in arrival order. Handlers run on this one task, so application
//! logic needs no locks of its own; database and RPC awaits block the queue
//! by design and cap throughput at the dispatcher's rate.

use crate::cache::Cache;
use crate::config::OfflinePolicy;
use crate::frame::Frame;
use crate::handlers::Inbound;
use crate::rpc::{PeerClient, StatusClient};
use crate::session::Session;
use crate::store::Store;
use crate::users::UserMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One unit of work for the dispatcher: a frame plus a non-owning reference
/// to the session it arrived on. The session may die between enqueue and
/// dequeue; the dispatcher tolerates that.
#[derive(Debug)]
pub struct LogicNode {
    pub session: Weak<Session>,
    pub frame: Frame,
}

impl LogicNode {
    pub fn new(session: &Arc<Session>, frame: Frame) -> LogicNode {
        LogicNode {
            session: Arc::downgrade(session),
            frame,
        }
    }
}

/// Everything the chat handlers reach for, built once at startup and passed
/// explicitly instead of living in globals.
#[derive(Debug)]
pub struct ChatContext {
    pub store: Store,
    pub cache: Cache,
    pub users: Arc<UserMap>,
    pub status: StatusClient,
    /// Peer chat instances by name, for forwarding to remotely-owned users.
    pub peers: HashMap<String, PeerClient>,
    /// This instance's name; routing entries naming it mean "local".
    pub self_name: String,
    pub offline_policy: OfflinePolicy,
}

/// Start the dispatcher task. Returns the producer handle and the task.
///
/// The task drains the queue and exits once every producer handle is gone.
pub fn start(ctx: Arc<ChatContext>) -> (mpsc::UnboundedSender<LogicNode>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        run_with(rx, |session, frame| {
            let ctx = Arc::clone(&ctx);
            async move { dispatch(&ctx, session, frame).await }
        })
        .await;
        debug!("logic dispatcher drained and stopped");
    });
    (tx, task)
}

/// The consumer loop, generic over the handler so tests can observe ordering.
pub(crate) async fn run_with<F, Fut>(mut rx: mpsc::UnboundedReceiver<LogicNode>, mut handle: F)
where
    F: FnMut(Arc<Session>, Frame) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(node) = rx.recv().await {
        let Some(session) = node.session.upgrade() else {
            debug!(id = node.frame.id, "session gone before dispatch, frame dropped");
            continue;
        };
        handle(session, node.frame).await;
    }
}

/// Decode one frame and run its handler.
async fn dispatch(ctx: &ChatContext, session: Arc<Session>, frame: Frame) {
    match Inbound::from_frame(&frame) {
        Ok(Some(request)) => {
            let name = request.name();
            if let Err(err) = request.apply(ctx, &session).await {
                warn!(handler = name, session = session.id(), error = %err, "handler failed");
            }
        }
        // Unknown id: log and drop the frame, keep the connection.
        Ok(None) => warn!(id = frame.id, "unknown message id, frame dropped"),
        Err(err) => warn!(id = frame.id, error = %err, "malformed message body, frame dropped"),
    }
}
