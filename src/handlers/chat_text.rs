//! Implement the chat-text handler.
use super::{push_to_user, reply_error, Handler};
use crate::config::OfflinePolicy;
use crate::dispatch::ChatContext;
use crate::frame::MsgId;
use crate::session::Session;
use crate::{ErrorCode, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// A batch of text messages from `fromuid` to `touid`.
///
/// The message content is carried opaquely; the server routes it, it does
/// not interpret it.
#[derive(Debug, Deserialize)]
pub struct ChatTextRequest {
    pub fromuid: i64,
    pub touid: i64,
    #[serde(default)]
    pub msgs: serde_json::Value,
}

impl Handler for ChatTextRequest {
    fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Echo the batch back to the sender, then deliver it to the addressee's
    /// session here or on the routed peer. An addressee connected nowhere
    /// falls under the configured offline policy.
    #[tracing::instrument(skip_all, fields(from = self.fromuid, to = self.touid))]
    async fn apply(self, ctx: &ChatContext, session: &Arc<Session>) -> Result<()> {
        let payload = json!({
            "error": ErrorCode::Success as i32,
            "fromuid": self.fromuid,
            "touid": self.touid,
            "msgs": self.msgs,
        });

        session.send_json(MsgId::ChatTextRsp, &payload)?;

        let delivered = match push_to_user(ctx, self.touid, MsgId::NotifyChatText, &payload).await {
            Ok(delivered) => delivered,
            Err(err) => {
                // The sender keeps its echo; the payload falls under the
                // offline policy like any other undeliverable batch.
                warn!(error = %err, "failed to forward chat text");
                false
            }
        };

        if !delivered {
            match ctx.offline_policy {
                OfflinePolicy::Drop => {
                    debug!("addressee offline, payload dropped");
                }
                OfflinePolicy::Store => {
                    if let Err(err) = ctx
                        .store
                        .save_offline_message(self.fromuid, self.touid, &payload["msgs"])
                        .await
                    {
                        warn!(error = %err, "failed to store offline payload");
                        reply_error(session, MsgId::ChatTextRsp, ErrorCode::RpcFailed);
                    }
                }
            }
        }
        Ok(())
    }
}
