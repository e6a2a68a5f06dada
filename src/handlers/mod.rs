//! Chat message handlers, one module per message id.
//!
//! Mirrors the shape of the wire protocol: a request type per inbound id,
//! decoded from the JSON body, then applied against the [`ChatContext`].
//! The decode table below is fixed at compile time; there is nothing to
//! register or lock at runtime.

use crate::dispatch::ChatContext;
use crate::frame::{Frame, MsgId};
use crate::session::Session;
use crate::{ErrorCode, Result};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

pub mod login;
pub use login::LoginRequest;

pub mod search;
pub use search::SearchRequest;

pub mod add_friend;
pub use add_friend::AddFriendRequest;

pub mod auth_friend;
pub use auth_friend::AuthFriendRequest;

pub mod chat_text;
pub use chat_text::ChatTextRequest;

pub mod heartbeat;
pub use heartbeat::HeartbeatRequest;

pub(crate) trait Handler {
    /// Decode the request out of a frame body.
    fn from_body(body: &[u8]) -> Result<Self>
    where
        Self: Sized;

    /// Run the request. Replies and pushes go through `session` and the
    /// context; errors bubble to the dispatcher for logging only, after the
    /// peer has already received its error reply where one applies.
    fn apply(
        self,
        ctx: &ChatContext,
        session: &Arc<Session>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// All inbound chat requests.
#[derive(Debug)]
pub enum Inbound {
    Login(LoginRequest),
    Search(SearchRequest),
    AddFriend(AddFriendRequest),
    AuthFriend(AuthFriendRequest),
    ChatText(ChatTextRequest),
    Heartbeat(HeartbeatRequest),
}

impl Inbound {
    /// Decode a frame into a request.
    ///
    /// `Ok(None)` means the id is not a client request this listener
    /// handles; the caller logs and drops the frame without closing the
    /// connection.
    pub fn from_frame(frame: &Frame) -> Result<Option<Inbound>> {
        let Some(id) = frame.msg_id() else {
            return Ok(None);
        };

        let inbound = match id {
            MsgId::LoginReq => Inbound::Login(LoginRequest::from_body(&frame.body)?),
            MsgId::SearchReq => Inbound::Search(SearchRequest::from_body(&frame.body)?),
            MsgId::AddFriendReq => Inbound::AddFriend(AddFriendRequest::from_body(&frame.body)?),
            MsgId::AuthFriendReq => {
                Inbound::AuthFriend(AuthFriendRequest::from_body(&frame.body)?)
            }
            MsgId::ChatTextReq => Inbound::ChatText(ChatTextRequest::from_body(&frame.body)?),
            MsgId::HeartbeatReq => Inbound::Heartbeat(HeartbeatRequest::from_body(&frame.body)?),
            _ => return Ok(None),
        };
        Ok(Some(inbound))
    }

    pub(crate) async fn apply(self, ctx: &ChatContext, session: &Arc<Session>) -> Result<()> {
        use Inbound as I;

        match self {
            I::Login(req) => req.apply(ctx, session).await,
            I::Search(req) => req.apply(ctx, session).await,
            I::AddFriend(req) => req.apply(ctx, session).await,
            I::AuthFriend(req) => req.apply(ctx, session).await,
            I::ChatText(req) => req.apply(ctx, session).await,
            I::Heartbeat(req) => req.apply(ctx, session).await,
        }
    }

    pub fn name(&self) -> &'static str {
        use Inbound as I;
        match self {
            I::Login(_) => "login",
            I::Search(_) => "search",
            I::AddFriend(_) => "add_friend",
            I::AuthFriend(_) => "auth_friend",
            I::ChatText(_) => "chat_text",
            I::Heartbeat(_) => "heartbeat",
        }
    }
}

/// Send a bare `{error}` reply; failures only get logged, the session is on
/// its way out anyway when this cannot be queued.
pub(crate) fn reply_error(session: &Session, id: MsgId, code: ErrorCode) {
    if let Err(err) = session.send_json(id, &json!({ "error": code as i32 })) {
        warn!(session = session.id(), error = %err, "failed to queue error reply");
    }
}

/// Cached-or-stored profile lookup: the cache entry wins, a store hit
/// refills the cache. `None` means the uid does not exist.
pub(crate) async fn base_profile(
    ctx: &ChatContext,
    uid: i64,
) -> Result<Option<serde_json::Value>> {
    if let Some(profile) = ctx.cache.profile(uid).await? {
        return Ok(Some(profile));
    }
    let Some(user) = ctx.store.user_by_uid(uid).await? else {
        return Ok(None);
    };
    if let Err(err) = ctx.cache.cache_profile(&user).await {
        warn!(uid, error = %err, "failed to cache profile");
    }
    Ok(Some(serde_json::to_value(&user)?))
}

/// Deliver a push to `touid`: locally when the session is here, through the
/// routed peer otherwise. The peer RPC is called exactly once; `Ok(false)`
/// means the user is connected nowhere.
pub(crate) async fn push_to_user(
    ctx: &ChatContext,
    touid: i64,
    push_id: MsgId,
    payload: &serde_json::Value,
) -> Result<bool> {
    if let Some(target) = ctx.users.find(touid) {
        target.send_json(push_id, payload)?;
        return Ok(true);
    }

    match ctx.cache.route(touid).await? {
        // A routing entry naming this instance with no local session is a
        // leftover from a session that just died; the user is offline.
        Some(server) if server == ctx.self_name => Ok(false),
        Some(server) => match ctx.peers.get(&server) {
            Some(peer) => {
                match push_id {
                    MsgId::NotifyAddFriend => peer.notify_add_friend(payload).await?,
                    MsgId::NotifyAuthFriend => peer.notify_auth_friend(payload).await?,
                    MsgId::NotifyChatText => peer.notify_chat_text(payload).await?,
                    other => {
                        warn!(?other, "not a forwardable push id");
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            None => {
                warn!(touid, server, "routing entry names an unknown peer");
                Ok(false)
            }
        },
        None => Ok(false),
    }
}
