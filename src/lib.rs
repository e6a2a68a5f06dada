//! A multi-tier instant-messaging backend.
//!
//! Three cooperating services share this crate: the gate (HTTP front door for
//! account and verification flows), the status service (chat-server placement
//! and token issuance) and the chat service itself (the persistent TCP message
//! stream). The chat wire protocol is length-prefixed binary frames carrying
//! JSON bodies; the internal service-to-service RPC rides the same codec.

pub mod cache;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod gate;
pub mod handlers;
pub mod io_pool;
pub mod pool;
pub mod rpc;
pub mod server;
pub mod session;
pub mod status;
pub mod store;
pub mod users;

pub use connection::Connection;
pub use error::Error;
pub use frame::{Frame, MsgId};

/// Hard cap on the body of a single frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024;
/// Byte size of the `[id: u16][len: u16]` frame header.
pub const FRAME_HEADER_LEN: usize = 4;

pub const DEFAULT_HOST: &str = "0.0.0.0";

pub type Result<T> = std::result::Result<T, Error>;

/// Service-level reply codes carried in the `error` field of every JSON
/// reply, on the chat stream and on the gate's HTTP surface alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    JsonParse = 1001,
    RpcFailed = 1002,
    VerifyExpired = 1003,
    VerifyCodeErr = 1004,
    UserExist = 1005,
    PasswdErr = 1006,
    EmailNotMatch = 1007,
    PasswdUpdateFailed = 1008,
    PasswdInvalid = 1009,
    TokenInvalid = 1010,
    UidInvalid = 1011,
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> i32 {
        code as i32
    }
}
