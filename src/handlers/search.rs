//! Implement the user-search handler.
use super::{reply_error, Handler};
use crate::dispatch::ChatContext;
use crate::frame::MsgId;
use crate::session::Session;
use crate::store::UserInfo;
use crate::{ErrorCode, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Look a user up by uid or by exact name.
///
/// The client sends one text field; an all-digits term is treated as a uid,
/// anything else as a name.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub uid: String,
}

impl SearchRequest {
    fn term(&self) -> SearchTerm<'_> {
        if !self.uid.is_empty() && self.uid.bytes().all(|b| b.is_ascii_digit()) {
            match self.uid.parse::<i64>() {
                Ok(uid) => SearchTerm::Uid(uid),
                Err(_) => SearchTerm::Name(&self.uid),
            }
        } else {
            SearchTerm::Name(&self.uid)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SearchTerm<'a> {
    Uid(i64),
    Name(&'a str),
}

impl Handler for SearchRequest {
    fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    #[tracing::instrument(skip_all, fields(term = %self.uid))]
    async fn apply(self, ctx: &ChatContext, session: &Arc<Session>) -> Result<()> {
        let found = match self.term() {
            SearchTerm::Uid(uid) => ctx.store.user_by_uid(uid).await,
            SearchTerm::Name(name) => ctx.store.user_by_name(name).await,
        };

        match found {
            Ok(Some(user)) => session.send_json(MsgId::SearchRsp, &search_reply(&user))?,
            Ok(None) => reply_error(session, MsgId::SearchRsp, ErrorCode::UidInvalid),
            Err(err) => {
                warn!(error = %err, "search lookup failed");
                reply_error(session, MsgId::SearchRsp, ErrorCode::RpcFailed);
            }
        }
        Ok(())
    }
}

fn search_reply(user: &UserInfo) -> serde_json::Value {
    json!({
        "error": ErrorCode::Success as i32,
        "uid": user.uid,
        "name": user.name,
        "nick": user.nick,
        "desc": user.desc,
        "sex": user.sex,
        "icon": user.icon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digit_terms_search_by_uid() {
        let req = SearchRequest { uid: "1001".into() };
        assert_eq!(req.term(), SearchTerm::Uid(1001));
    }

    #[test]
    fn test_text_terms_search_by_name() {
        for term in ["alice", "alice2", "10a01", ""] {
            let req = SearchRequest { uid: term.into() };
            assert_eq!(req.term(), SearchTerm::Name(term));
        }
    }

    #[test]
    fn test_absurdly_long_digit_string_falls_back_to_name() {
        let term = "9".repeat(30);
        let req = SearchRequest { uid: term.clone() };
        assert_eq!(req.term(), SearchTerm::Name(term.as_str()));
    }

    #[test]
    fn test_search_reply_has_no_credentials() {
        let user = UserInfo {
            uid: 7,
            name: "bob".into(),
            email: "bob@example.com".into(),
            pwd: "digest".into(),
            nick: "b".into(),
            desc: String::new(),
            sex: 1,
            icon: String::new(),
        };
        let reply = search_reply(&user);
        assert_eq!(reply["uid"], 7);
        assert!(reply.get("pwd").is_none());
        assert!(reply.get("email").is_none());
    }
}
