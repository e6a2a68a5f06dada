//! Implement the add-friend (apply) handler.
use super::{base_profile, push_to_user, reply_error, Handler};
use crate::dispatch::ChatContext;
use crate::frame::MsgId;
use crate::session::Session;
use crate::store::ApplyOutcome;
use crate::{ErrorCode, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// A friend request from `uid` to `touid`.
#[derive(Debug, Deserialize)]
pub struct AddFriendRequest {
    pub uid: i64,
    pub touid: i64,
    /// The name the applicant shows the target.
    #[serde(default)]
    pub applyname: String,
    /// The remark name the applicant keeps for the target.
    #[serde(default)]
    pub bakname: String,
}

impl Handler for AddFriendRequest {
    fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Persist the pending apply, acknowledge the sender, then push the
    /// notification to wherever the target is connected.
    #[tracing::instrument(skip_all, fields(from = self.uid, to = self.touid))]
    async fn apply(self, ctx: &ChatContext, session: &Arc<Session>) -> Result<()> {
        match ctx.store.add_friend_apply(self.uid, self.touid).await {
            Ok(ApplyOutcome::Stored) => {}
            Ok(ApplyOutcome::CapExceeded) => {
                debug!("target has too many pending applies");
                reply_error(session, MsgId::AddFriendRsp, ErrorCode::RpcFailed);
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "failed to persist apply");
                reply_error(session, MsgId::AddFriendRsp, ErrorCode::RpcFailed);
                return Ok(());
            }
        }

        session.send_json(
            MsgId::AddFriendRsp,
            &json!({ "error": ErrorCode::Success as i32 }),
        )?;

        // The push carries the applicant's profile so the target can render
        // the request without a lookup of its own.
        let mut payload = json!({
            "error": ErrorCode::Success as i32,
            "applyuid": self.uid,
            "touid": self.touid,
            "name": self.applyname,
            "bakname": self.bakname,
        });
        match base_profile(ctx, self.uid).await {
            Ok(Some(profile)) => {
                for field in ["nick", "icon", "sex", "desc"] {
                    payload[field] = profile[field].clone();
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "applicant profile lookup failed"),
        }

        match push_to_user(ctx, self.touid, MsgId::NotifyAddFriend, &payload).await {
            Ok(delivered) => debug!(delivered, "apply notification handled"),
            Err(err) => warn!(error = %err, "failed to forward apply notification"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_optional_names() {
        let req = AddFriendRequest::from_body(br#"{"uid":1,"touid":2}"#).unwrap();
        assert_eq!((req.uid, req.touid), (1, 2));
        assert!(req.applyname.is_empty());

        let req = AddFriendRequest::from_body(
            br#"{"uid":1,"touid":2,"applyname":"al","bakname":"bo"}"#,
        )
        .unwrap();
        assert_eq!(req.applyname, "al");
        assert_eq!(req.bakname, "bo");
    }
}
