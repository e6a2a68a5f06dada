use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("incomplete frame")]
    IncompleteFrame,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("frame body of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
    #[error("malformed message body: {0}")]
    /// The body of a frame could not be decoded into the type its id promises.
    BadBody(#[from] serde_json::Error),
    #[error("resource pool is closed")]
    /// Returned to waiters woken by [`Pool::close`](crate::pool::Pool::close).
    PoolClosed,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("rpc to {0} failed: {1}")]
    Rpc(&'static str, String),
    #[error("send queue full, frame dropped")]
    SendQueueFull,
    #[error("session is closed")]
    SessionClosed,
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}
