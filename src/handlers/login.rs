//! Implement the login handler.
use super::{base_profile, reply_error, Handler};
use crate::dispatch::ChatContext;
use crate::frame::MsgId;
use crate::session::Session;
use crate::{ErrorCode, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// First message on every connection: the uid plus the one-shot token the
/// status service handed out during the HTTP login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub uid: i64,
    pub token: String,
}

impl Handler for LoginRequest {
    fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Verify the token with the status service, bind the uid to this
    /// session, and reply with the profile plus friends and pending applies.
    #[tracing::instrument(skip_all, fields(uid = self.uid))]
    async fn apply(self, ctx: &ChatContext, session: &Arc<Session>) -> Result<()> {
        let code = match ctx.status.verify_token(self.uid, &self.token).await {
            Ok(code) => code,
            Err(err) => {
                warn!(error = %err, "token verification unreachable");
                reply_error(session, MsgId::LoginRsp, ErrorCode::RpcFailed);
                return Ok(());
            }
        };
        if code != ErrorCode::Success as i32 {
            debug!(code, "token rejected");
            if let Err(err) = session.send_json(MsgId::LoginRsp, &json!({ "error": code })) {
                warn!(error = %err, "failed to queue login reply");
            }
            return Ok(());
        }

        let profile = match base_profile(ctx, self.uid).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                reply_error(session, MsgId::LoginRsp, ErrorCode::UidInvalid);
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "profile lookup failed");
                reply_error(session, MsgId::LoginRsp, ErrorCode::RpcFailed);
                return Ok(());
            }
        };

        let friends = match ctx.store.friend_list(self.uid).await {
            Ok(friends) => friends,
            Err(err) => {
                warn!(error = %err, "friend list lookup failed");
                reply_error(session, MsgId::LoginRsp, ErrorCode::RpcFailed);
                return Ok(());
            }
        };
        let applies = match ctx.store.apply_list(self.uid).await {
            Ok(applies) => applies,
            Err(err) => {
                warn!(error = %err, "apply list lookup failed");
                reply_error(session, MsgId::LoginRsp, ErrorCode::RpcFailed);
                return Ok(());
            }
        };

        session.set_user_id(self.uid);
        if let Err(err) = ctx.users.bind(self.uid, Arc::clone(session)).await {
            // The local binding holds; only the shared routing entry is
            // stale, and the next bind or unbind rewrites it.
            warn!(error = %err, "failed to publish routing entry");
        }

        let mut reply = json!({
            "error": ErrorCode::Success as i32,
            "uid": self.uid,
            "friends": friends,
            "applies": applies,
        });
        for field in ["name", "nick", "icon", "sex", "email", "desc"] {
            reply[field] = profile[field].clone();
        }
        info!(session = session.id(), "user logged in");
        session.send_json(MsgId::LoginRsp, &reply)?;
        Ok(())
    }
}
