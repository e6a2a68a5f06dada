//! Framed RPC between the services.
//!
//! Requests and replies ride the same length-prefixed codec as the chat
//! stream, with JSON bodies carried opaquely. The client side keeps a pool of
//! connected stubs; a stub that fails mid-call is discarded so the next call
//! starts from a fresh connection. Callers see every transport problem as a
//! single error shape and map it to the `RpcFailed` reply code.

use crate::connection::Connection;
use crate::frame::{Frame, MsgId};
use crate::pool::{Manager, Pool};
use crate::session::Session;
use crate::users::UserMap;
use crate::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stubs kept per remote service.
const STUB_POOL_SIZE: usize = 5;

/// Opens framed stub connections for the pool.
#[derive(Debug)]
pub struct RpcManager {
    addr: String,
}

impl Manager for RpcManager {
    type Conn = Connection<TcpStream>;

    async fn connect(&self) -> Result<Connection<TcpStream>> {
        let socket = TcpStream::connect(&self.addr).await?;
        Ok(Connection::new(socket))
    }

    // Stubs are not probed; a broken one fails its next call, gets
    // discarded, and lazy reconnect replaces it.
    async fn check(&self, _conn: &mut Connection<TcpStream>) -> Result<()> {
        Ok(())
    }
}

/// A pooled client for one remote service.
#[derive(Debug, Clone)]
pub struct RpcClient {
    service: &'static str,
    pool: Pool<RpcManager>,
}

impl RpcClient {
    /// Stubs connect lazily, so the remote side may come up after us.
    pub fn new(service: &'static str, addr: String) -> RpcClient {
        RpcClient {
            service,
            pool: Pool::new(RpcManager { addr }, STUB_POOL_SIZE),
        }
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// One request/reply exchange.
    pub async fn call<T: Serialize>(
        &self,
        req_id: MsgId,
        rsp_id: MsgId,
        req: &T,
    ) -> Result<serde_json::Value> {
        let service = self.service;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::Rpc(service, e.to_string()))?;

        let frame = Frame::json(req_id, req)?;
        match exchange(&mut conn, &frame, rsp_id).await {
            Ok(value) => Ok(value),
            Err(e) => {
                // The stream may hold half a reply; never reuse it.
                conn.discard();
                Err(Error::Rpc(service, e.to_string()))
            }
        }
    }
}

async fn exchange(
    conn: &mut Connection<TcpStream>,
    frame: &Frame,
    rsp_id: MsgId,
) -> Result<serde_json::Value> {
    conn.write_frame(frame).await?;
    let Some(reply) = conn.read_frame().await? else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "service closed the connection before replying",
        )));
    };
    if reply.id != rsp_id as u16 {
        return Err(Error::Protocol(format!(
            "expected reply id {}, got {}",
            rsp_id as u16, reply.id
        )));
    }
    reply.body_json()
}

fn error_code(reply: &serde_json::Value) -> i32 {
    reply["error"].as_i64().unwrap_or(ErrorCode::RpcFailed as i64) as i32
}

/// Placement assigned by the status service.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatServerInfo {
    pub host: String,
    pub port: u16,
    pub token: String,
}

/// Typed client for the status service.
#[derive(Debug, Clone)]
pub struct StatusClient {
    rpc: RpcClient,
}

impl StatusClient {
    pub fn new(addr: String) -> StatusClient {
        StatusClient {
            rpc: RpcClient::new("status", addr),
        }
    }

    pub fn close(&self) {
        self.rpc.close();
    }

    /// Ask for a chat-server assignment and login token for `uid`.
    pub async fn get_chat_server(&self, uid: i64) -> Result<ChatServerInfo> {
        let reply = self
            .rpc
            .call(
                MsgId::GetChatServerReq,
                MsgId::GetChatServerRsp,
                &json!({ "uid": uid }),
            )
            .await?;
        if error_code(&reply) != ErrorCode::Success as i32 {
            return Err(Error::Rpc("status", format!("placement refused: {reply}")));
        }
        Ok(serde_json::from_value(reply)?)
    }

    /// Check a login token. The reply is the service-level error code.
    pub async fn verify_token(&self, uid: i64, token: &str) -> Result<i32> {
        let reply = self
            .rpc
            .call(
                MsgId::VerifyTokenReq,
                MsgId::VerifyTokenRsp,
                &json!({ "uid": uid, "token": token }),
            )
            .await?;
        Ok(error_code(&reply))
    }
}

/// Typed client for one peer chat instance's notification listener.
#[derive(Debug, Clone)]
pub struct PeerClient {
    rpc: RpcClient,
}

impl PeerClient {
    pub fn new(addr: String) -> PeerClient {
        PeerClient {
            rpc: RpcClient::new("peer-chat", addr),
        }
    }

    pub fn close(&self) {
        self.rpc.close();
    }

    pub async fn notify_add_friend(&self, payload: &serde_json::Value) -> Result<()> {
        self.notify(MsgId::PeerAddFriendReq, MsgId::PeerAddFriendRsp, payload)
            .await
    }

    pub async fn notify_auth_friend(&self, payload: &serde_json::Value) -> Result<()> {
        self.notify(MsgId::PeerAuthFriendReq, MsgId::PeerAuthFriendRsp, payload)
            .await
    }

    pub async fn notify_chat_text(&self, payload: &serde_json::Value) -> Result<()> {
        self.notify(MsgId::PeerChatTextReq, MsgId::PeerChatTextRsp, payload)
            .await
    }

    async fn notify(
        &self,
        req_id: MsgId,
        rsp_id: MsgId,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let reply = self.rpc.call(req_id, rsp_id, payload).await?;
        if error_code(&reply) != ErrorCode::Success as i32 {
            return Err(Error::Rpc("peer-chat", format!("peer refused: {reply}")));
        }
        Ok(())
    }
}

/// Typed client for the external verification/mail service.
#[derive(Debug, Clone)]
pub struct VerifyClient {
    rpc: RpcClient,
}

impl VerifyClient {
    pub fn new(addr: String) -> VerifyClient {
        VerifyClient {
            rpc: RpcClient::new("verify", addr),
        }
    }

    pub fn close(&self) {
        self.rpc.close();
    }

    /// Ask the mail service to generate and send a code. Returns the
    /// service-level error code.
    pub async fn get_verify_code(&self, email: &str) -> Result<i32> {
        let reply = self
            .rpc
            .call(
                MsgId::GetVerifyCodeReq,
                MsgId::GetVerifyCodeRsp,
                &json!({ "email": email }),
            )
            .await?;
        Ok(error_code(&reply))
    }
}

/// The chat instance's peer-notification listener.
///
/// Peers forward add-friend, auth-friend and chat-text pushes here when the
/// routing entry for a user names this instance. Each notification is
/// delivered to the local session, if one is still bound, and acknowledged
/// either way.
pub async fn serve_peer_notifications(
    listener: TcpListener,
    users: Arc<UserMap>,
    shutdown: impl std::future::Future,
) {
    let stop = CancellationToken::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let accept_loop = async {
        loop {
            let (socket, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "peer listener accept failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            debug!(%remote, "peer connection established");

            let users = Arc::clone(&users);
            let stop = stop.clone();
            let _complete = shutdown_complete_tx.clone();
            tokio::spawn(async move {
                let _complete = _complete;
                let mut conn = Connection::new(socket);
                if let Err(err) = serve_peer_connection(&mut conn, &users, &stop).await {
                    error!(cause = %err, "peer connection error");
                }
            });
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = shutdown => {
            info!("peer listener shutting down");
        }
    }

    stop.cancel();
    drop(shutdown_complete_tx);
    let _ = shutdown_complete_rx.recv().await;
}

async fn serve_peer_connection(
    conn: &mut Connection<TcpStream>,
    users: &UserMap,
    stop: &CancellationToken,
) -> Result<()> {
    loop {
        let maybe_frame = tokio::select! {
            res = conn.read_frame() => res?,
            _ = stop.cancelled() => return Ok(()),
        };
        let Some(frame) = maybe_frame else {
            return Ok(());
        };

        // Each peer request maps to the client-facing push id it carries.
        let (push_id, rsp_id) = match frame.msg_id() {
            Some(MsgId::PeerAddFriendReq) => (MsgId::NotifyAddFriend, MsgId::PeerAddFriendRsp),
            Some(MsgId::PeerAuthFriendReq) => (MsgId::NotifyAuthFriend, MsgId::PeerAuthFriendRsp),
            Some(MsgId::PeerChatTextReq) => (MsgId::NotifyChatText, MsgId::PeerChatTextRsp),
            _ => {
                warn!(id = frame.id, "unknown peer message id, frame dropped");
                continue;
            }
        };

        let payload: serde_json::Value = frame.body_json()?;
        let delivered = deliver_local(users, push_id, &payload);
        let reply = Frame::json(
            rsp_id,
            &json!({ "error": ErrorCode::Success as i32, "delivered": delivered }),
        )?;
        conn.write_frame(&reply).await?;
    }
}

/// Push a notification to the local session the payload addresses.
///
/// Returns whether a live session took it; the addressee may have gone away
/// since the peer consulted the routing table.
fn deliver_local(users: &UserMap, push_id: MsgId, payload: &serde_json::Value) -> bool {
    let Some(to_uid) = payload["touid"].as_i64() else {
        warn!("peer payload without touid, dropped");
        return false;
    };
    let Some(session) = users.find(to_uid) else {
        debug!(to_uid, "peer notification for a user no longer here");
        return false;
    };
    match session.send_json(push_id, payload) {
        Ok(()) => true,
        Err(err) => {
            warn!(to_uid, error = %err, "failed to push peer notification");
            false
        }
    }
}
