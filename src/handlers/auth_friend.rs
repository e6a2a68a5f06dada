//! Implement the auth-friend (accept) handler.
use super::{base_profile, push_to_user, reply_error, Handler};
use crate::dispatch::ChatContext;
use crate::frame::MsgId;
use crate::session::Session;
use crate::{ErrorCode, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Acceptance of a pending apply: `touid` (the acceptor) confirms the
/// request `fromuid` made earlier.
#[derive(Debug, Deserialize)]
pub struct AuthFriendRequest {
    pub fromuid: i64,
    pub touid: i64,
    /// Remark name the acceptor keeps for the new friend.
    #[serde(default)]
    pub back_name: String,
}

impl Handler for AuthFriendRequest {
    fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Mark the apply accepted, persist the friendship both ways, reply with
    /// the applicant's profile, then notify the applicant.
    #[tracing::instrument(skip_all, fields(from = self.fromuid, to = self.touid))]
    async fn apply(self, ctx: &ChatContext, session: &Arc<Session>) -> Result<()> {
        if let Err(err) = ctx
            .store
            .confirm_friend_apply(self.fromuid, self.touid, &self.back_name)
            .await
        {
            warn!(error = %err, "failed to confirm apply");
            reply_error(session, MsgId::AuthFriendRsp, ErrorCode::RpcFailed);
            return Ok(());
        }

        // The acceptor gets the applicant's profile back, so the new friend
        // shows up fully drawn.
        let mut reply = json!({
            "error": ErrorCode::Success as i32,
            "uid": self.fromuid,
        });
        match base_profile(ctx, self.fromuid).await {
            Ok(Some(profile)) => {
                for field in ["name", "nick", "icon", "sex"] {
                    reply[field] = profile[field].clone();
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "applicant profile lookup failed"),
        }
        session.send_json(MsgId::AuthFriendRsp, &reply)?;

        // Tell the applicant they were accepted; the payload carries the
        // acceptor's profile.
        let mut payload = json!({
            "error": ErrorCode::Success as i32,
            "fromuid": self.touid,
            "touid": self.fromuid,
        });
        match base_profile(ctx, self.touid).await {
            Ok(Some(profile)) => {
                for field in ["name", "nick", "icon", "sex"] {
                    payload[field] = profile[field].clone();
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "acceptor profile lookup failed"),
        }

        match push_to_user(ctx, self.fromuid, MsgId::NotifyAuthFriend, &payload).await {
            Ok(delivered) => debug!(delivered, "acceptance notification handled"),
            Err(err) => warn!(error = %err, "failed to forward acceptance notification"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accept_body() {
        let req =
            AuthFriendRequest::from_body(br#"{"fromuid":1,"touid":2,"back_name":"al"}"#).unwrap();
        assert_eq!((req.fromuid, req.touid), (1, 2));
        assert_eq!(req.back_name, "al");
    }
}
