//! Client for the shared session cache.
//!
//! The cache holds login tokens, verification codes, cached user profiles and
//! the routing entries that say which chat instance owns a user's session.
//! It speaks the textual RESP subset the cache server understands: inline
//! array commands out, simple/bulk/integer/error replies back. Connections
//! are pooled like every other backend handle.

use crate::pool::{Manager, Pool};
use crate::store::UserInfo;
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

/// Connections kept to the cache server.
pub const POOL_SIZE: usize = 5;
/// Lifetime of a login token entry.
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Lifetime of a cached user profile.
const PROFILE_TTL: Duration = Duration::from_secs(60 * 60);

/// One reply from the cache server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Bulk(Bytes),
    Null,
    Int(i64),
    Error(String),
}

/// A single cache connection: buffered stream plus reply parser.
#[derive(Debug)]
pub struct CacheConn<S = TcpStream> {
    stream: BufWriter<S>,
    buffer: BytesMut,
}

impl<S: crate::connection::ConnectionStream> CacheConn<S> {
    pub fn new(socket: S) -> CacheConn<S> {
        CacheConn {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Send one command and wait for its reply.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply> {
        self.stream.write_all(&encode_command(args)).await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        loop {
            let mut cursor = Cursor::new(&self.buffer[..]);
            match parse_reply(&mut cursor) {
                Ok(reply) => {
                    let len = cursor.position() as usize;
                    self.buffer.advance(len);
                    return Ok(reply);
                }
                Err(Error::IncompleteFrame) => {}
                Err(e) => return Err(e),
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "cache server closed the connection mid reply",
                )));
            }
        }
    }
}

fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

fn parse_reply(src: &mut Cursor<&[u8]>) -> Result<Reply> {
    if !src.has_remaining() {
        return Err(Error::IncompleteFrame);
    }
    let kind = src.get_u8();

    match kind {
        b'+' => Ok(Reply::Simple(String::from_utf8(crlf_line(src)?.to_vec())?)),
        b'-' => Ok(Reply::Error(String::from_utf8(crlf_line(src)?.to_vec())?)),
        b':' => {
            let line = crlf_line(src)?;
            let text = std::str::from_utf8(line)
                .map_err(|e| Error::Protocol(e.to_string()))?;
            text.parse()
                .map(Reply::Int)
                .map_err(|_| Error::Protocol(format!("bad integer reply `{text}`")))
        }
        b'$' => {
            let line = crlf_line(src)?;
            if line == b"-1" {
                return Ok(Reply::Null);
            }
            let len: usize = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Protocol("bad bulk length".into()))?;
            if src.remaining() < len + 2 {
                return Err(Error::IncompleteFrame);
            }
            let data = Bytes::copy_from_slice(&src.chunk()[..len]);
            src.advance(len + 2);
            Ok(Reply::Bulk(data))
        }
        other => Err(Error::Protocol(format!(
            "unexpected cache reply byte `{other}`"
        ))),
    }
}

/// Split the next CRLF-terminated line off the cursor, terminator excluded.
fn crlf_line<'a>(src: &'a mut Cursor<&[u8]>) -> Result<&'a [u8]> {
    let start = src.position() as usize;
    let rest = &src.get_ref()[start..];

    match rest.windows(2).position(|pair| pair == b"\r\n") {
        Some(at) => {
            src.set_position((start + at + 2) as u64);
            Ok(&src.get_ref()[start..start + at])
        }
        None => Err(Error::IncompleteFrame),
    }
}

/// Opens and pings cache connections for the pool.
#[derive(Debug)]
pub struct CacheManager {
    addr: String,
}

impl Manager for CacheManager {
    type Conn = CacheConn;

    async fn connect(&self) -> Result<CacheConn> {
        let socket = TcpStream::connect(&self.addr).await?;
        Ok(CacheConn::new(socket))
    }

    async fn check(&self, conn: &mut CacheConn) -> Result<()> {
        match conn.command(&[b"PING"]).await? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(Error::Cache(format!("unexpected ping reply: {other:?}"))),
        }
    }
}

/// Pooled, typed view of the shared cache.
#[derive(Debug, Clone)]
pub struct Cache {
    pool: Pool<CacheManager>,
}

impl Cache {
    /// Connect eagerly, so a bad cache address fails at startup.
    pub async fn connect(addr: String, pool_size: usize) -> Result<Cache> {
        let pool = Pool::connect(CacheManager { addr }, pool_size).await?;
        Ok(Cache { pool })
    }

    /// Lazy variant: connections open on first use.
    pub fn new(addr: String, pool_size: usize) -> Cache {
        Cache {
            pool: Pool::new(CacheManager { addr }, pool_size),
        }
    }

    pub fn close(&self) {
        self.pool.close();
    }

    async fn command(&self, args: &[&[u8]]) -> Result<Reply> {
        let mut conn = self.pool.acquire().await?;
        match conn.command(args).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // A transport failure leaves the stream desynced; a fresh
                // handle takes this one's place on the next acquire.
                conn.discard();
                Err(e)
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.command(&[b"GET", key.as_bytes()]).await? {
            Reply::Bulk(data) => Ok(Some(data)),
            Reply::Null => Ok(None),
            Reply::Error(e) => Err(Error::Cache(e)),
            other => Err(Error::Cache(format!("unexpected GET reply: {other:?}"))),
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let reply = match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().to_string();
                self.command(&[b"SET", key.as_bytes(), value, b"EX", secs.as_bytes()])
                    .await?
            }
            None => self.command(&[b"SET", key.as_bytes(), value]).await?,
        };
        match reply {
            Reply::Simple(s) if s == "OK" => Ok(()),
            Reply::Error(e) => Err(Error::Cache(e)),
            other => Err(Error::Cache(format!("unexpected SET reply: {other:?}"))),
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        match self.command(&[b"DEL", key.as_bytes()]).await? {
            Reply::Int(_) => Ok(()),
            Reply::Error(e) => Err(Error::Cache(e)),
            other => Err(Error::Cache(format!("unexpected DEL reply: {other:?}"))),
        }
    }

    // Typed key helpers. Key shapes are shared between the status service
    // (writer) and the chat/gate services (readers).

    pub async fn set_login_token(&self, uid: i64, token: &str) -> Result<()> {
        self.set(&format!("token_{uid}"), token.as_bytes(), Some(TOKEN_TTL))
            .await
    }

    pub async fn login_token(&self, uid: i64) -> Result<Option<String>> {
        let data = self.get(&format!("token_{uid}")).await?;
        Ok(data.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Verification code previously mailed to `email`; written by the verify
    /// service, read here.
    pub async fn verify_code(&self, email: &str) -> Result<Option<String>> {
        let data = self.get(&format!("code_{email}")).await?;
        Ok(data.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub async fn cache_profile(&self, user: &UserInfo) -> Result<()> {
        let json = serde_json::to_vec(user)?;
        self.set(&format!("ubase_{}", user.uid), &json, Some(PROFILE_TTL))
            .await
    }

    /// Cached profile, if the entry is present and still parses.
    pub async fn profile(&self, uid: i64) -> Result<Option<serde_json::Value>> {
        let Some(data) = self.get(&format!("ubase_{uid}")).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                debug!(uid, error = %e, "evicting unparsable cached profile");
                self.del(&format!("ubase_{uid}")).await?;
                Ok(None)
            }
        }
    }

    /// Record which chat instance owns `uid`'s session.
    pub async fn set_route(&self, uid: i64, server_name: &str) -> Result<()> {
        self.set(&format!("route_{uid}"), server_name.as_bytes(), None)
            .await
    }

    pub async fn route(&self, uid: i64) -> Result<Option<String>> {
        let data = self.get(&format!("route_{uid}")).await?;
        Ok(data.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub async fn del_route(&self, uid: i64) -> Result<()> {
        self.del(&format!("route_{uid}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let bytes = encode_command(&[b"SET", b"k", b"v", b"EX", b"60"]);
        assert_eq!(
            bytes,
            b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nEX\r\n$2\r\n60\r\n"
        );
    }

    #[test]
    fn test_parse_replies() {
        let cases: &[(&[u8], Reply)] = &[
            (b"+OK\r\n", Reply::Simple("OK".into())),
            (b"+PONG\r\n", Reply::Simple("PONG".into())),
            (b"-ERR nope\r\n", Reply::Error("ERR nope".into())),
            (b":42\r\n", Reply::Int(42)),
            (b"$5\r\nhello\r\n", Reply::Bulk(Bytes::from_static(b"hello"))),
            (b"$0\r\n\r\n", Reply::Bulk(Bytes::new())),
            (b"$-1\r\n", Reply::Null),
        ];
        for (bytes, expected) in cases {
            let mut cursor = Cursor::new(*bytes);
            assert_eq!(&parse_reply(&mut cursor).unwrap(), expected);
            assert_eq!(cursor.position() as usize, bytes.len());
        }
    }

    #[test]
    fn test_parse_incomplete_reply() {
        for bytes in [&b"$5\r\nhel"[..], b"+OK\r", b":4", b"$"] {
            let mut cursor = Cursor::new(bytes);
            assert!(matches!(
                parse_reply(&mut cursor),
                Err(Error::IncompleteFrame)
            ));
        }
    }

    #[tokio::test]
    async fn test_command_over_mock_stream() {
        let request = encode_command(&[b"GET", b"token_1001"]);
        let stream = tokio_test::io::Builder::new()
            .write(&request)
            .read(b"$3\r\nabc\r\n")
            .build();

        let mut conn = CacheConn::new(stream);
        let reply = conn.command(&[b"GET", b"token_1001"]).await.unwrap();
        assert_eq!(reply, Reply::Bulk(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_reply_split_between_every_byte() {
        let request = encode_command(&[b"PING"]);
        let reply_bytes = b"+PONG\r\n";

        let mut builder = tokio_test::io::Builder::new();
        builder.write(&request);
        for b in reply_bytes {
            builder.read(std::slice::from_ref(b));
        }

        let mut conn = CacheConn::new(builder.build());
        let reply = conn.command(&[b"PING"]).await.unwrap();
        assert_eq!(reply, Reply::Simple("PONG".into()));
    }
}
