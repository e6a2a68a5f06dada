//! The status service: chat-server placement and login-token issuance.
//!
//! The gate asks `GetChatServer` where a freshly authenticated user should
//! connect; the chat service asks `VerifyToken` whether the token a client
//! presented is the one minted here. Both ride the framed RPC codec. Tokens
//! live in the shared cache so any number of status replicas agree.

use crate::cache::Cache;
use crate::config::Peer;
use crate::connection::Connection;
use crate::frame::{Frame, MsgId};
use crate::{ErrorCode, Result};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Placement and token state shared by every status connection.
#[derive(Debug)]
pub struct StatusState {
    cache: Cache,
    /// Chat servers in assignment order.
    servers: Vec<Peer>,
    /// Round-robin cursor over `servers`.
    next: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct PlacementRequest {
    uid: i64,
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    uid: i64,
    token: String,
}

impl StatusState {
    pub fn new(cache: Cache, servers: Vec<Peer>) -> StatusState {
        assert!(!servers.is_empty(), "placement needs at least one chat server");
        StatusState {
            cache,
            servers,
            next: AtomicUsize::new(0),
        }
    }

    /// The next chat server, round robin.
    fn pick(&self) -> &Peer {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        &self.servers[i]
    }

    /// Assign a chat server and mint a login token for `uid`.
    async fn place(&self, uid: i64) -> serde_json::Value {
        let server = self.pick();
        let token = Uuid::new_v4().simple().to_string();

        if let Err(err) = self.cache.set_login_token(uid, &token).await {
            error!(uid, error = %err, "failed to store login token");
            return json!({ "error": ErrorCode::RpcFailed as i32 });
        }

        debug!(uid, server = server.name.as_str(), "user placed");
        json!({
            "error": ErrorCode::Success as i32,
            "host": server.host,
            "port": server.port,
            "token": token,
        })
    }

    /// Check a presented token against the minted one.
    async fn verify(&self, uid: i64, token: &str) -> serde_json::Value {
        let code = match self.cache.login_token(uid).await {
            Ok(Some(minted)) if minted == token => ErrorCode::Success,
            Ok(_) => ErrorCode::TokenInvalid,
            Err(err) => {
                error!(uid, error = %err, "token lookup failed");
                ErrorCode::RpcFailed
            }
        };
        json!({ "error": code as i32 })
    }
}

/// Run the status service until `shutdown` completes.
pub async fn run(listener: TcpListener, state: Arc<StatusState>, shutdown: impl Future) {
    let stop = CancellationToken::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let accept_loop = async {
        loop {
            let (socket, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "status accept failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            debug!(%remote, "status connection established");

            let state = Arc::clone(&state);
            let stop = stop.clone();
            let complete = shutdown_complete_tx.clone();
            tokio::spawn(async move {
                let _complete = complete;
                let mut conn = Connection::new(socket);
                if let Err(err) = serve_connection(&mut conn, &state, &stop).await {
                    error!(cause = %err, "status connection error");
                }
            });
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = shutdown => {
            info!("status service shutting down");
        }
    }

    stop.cancel();
    drop(shutdown_complete_tx);
    let _ = shutdown_complete_rx.recv().await;
}

async fn serve_connection(
    conn: &mut Connection<TcpStream>,
    state: &StatusState,
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

        let (rsp_id, reply) = match frame.msg_id() {
            Some(MsgId::GetChatServerReq) => {
                let req: PlacementRequest = frame.body_json()?;
                (MsgId::GetChatServerRsp, state.place(req.uid).await)
            }
            Some(MsgId::VerifyTokenReq) => {
                let req: TokenRequest = frame.body_json()?;
                (MsgId::VerifyTokenRsp, state.verify(req.uid, &req.token).await)
            }
            _ => {
                warn!(id = frame.id, "unknown status message id, frame dropped");
                continue;
            }
        };

        conn.write_frame(&Frame::json(rsp_id, &reply)?).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<Peer> {
        (0..n)
            .map(|i| Peer {
                name: format!("chat{i}"),
                host: "127.0.0.1".into(),
                port: 8090 + i as u16,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_placement_cycles() {
        // A lazy cache never connects; `pick` does no I/O.
        let state = StatusState::new(Cache::new("127.0.0.1:6379".into(), 1), peers(3));
        let picked: Vec<String> = (0..6).map(|_| state.pick().name.clone()).collect();
        assert_eq!(picked, ["chat0", "chat1", "chat2", "chat0", "chat1", "chat2"]);
    }

    #[test]
    fn test_minted_tokens_are_unique() {
        let a = Uuid::new_v4().simple().to_string();
        let b = Uuid::new_v4().simple().to_string();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
