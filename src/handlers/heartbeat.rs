//! Implement the heartbeat handler.
use super::Handler;
use crate::dispatch::ChatContext;
use crate::frame::MsgId;
use crate::session::Session;
use crate::{ErrorCode, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Explicit keep-alive. The read loop already stamped the session's
/// heartbeat clock when this frame arrived; all that is left is the ack.
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {}

impl Handler for HeartbeatRequest {
    fn from_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(HeartbeatRequest::default());
        }
        Ok(serde_json::from_slice(body)?)
    }

    async fn apply(self, _ctx: &ChatContext, session: &Arc<Session>) -> Result<()> {
        session.send_json(
            MsgId::HeartbeatRsp,
            &json!({ "error": ErrorCode::Success as i32 }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_json_bodies_both_parse() {
        assert!(HeartbeatRequest::from_body(b"").is_ok());
        assert!(HeartbeatRequest::from_body(b"{}").is_ok());
        assert!(HeartbeatRequest::from_body(b"not json").is_err());
    }
}
