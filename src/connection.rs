//! A module for handling a framed stream, usually a remote peer via a [`TcpStream`].
//!
//! [`TcpStream`]: tokio::net::TcpStream
use crate::frame::Frame;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, error};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Send and receive [`Frame`] values from a remote peer.
///
/// To read frames, the `Connection` uses an internal buffer, which is filled
/// up until there are enough bytes to create a full frame. Once this happens,
/// the `Connection` creates the frame and returns it to the caller. Partial
/// reads therefore cost nothing: a frame split between every byte pair still
/// comes out whole.
///
/// When sending frames, the header and body are written through a buffered
/// writer and flushed once per frame.
#[derive(Debug)]
pub struct Connection<S> {
    /// Stream wrapped with a `BufWriter` for buffering writes.
    stream: BufWriter<S>,
    /// Buffer used for reading frames.
    buffer: BytesMut,
}

/// A trait for types that can be used as a connection stream.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

impl<S: ConnectionStream> Connection<S> {
    /// Create a new `Connection` from a socket.
    ///
    /// The connection is internally buffered, with a default buffer size of 16KB.
    pub fn new(socket: S) -> Self {
        Self {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Read a single [`Frame`] from the connection.
    ///
    /// Buffers socket data until at least one whole frame is present, then
    /// decodes it off the front; whatever follows stays buffered for the next
    /// call.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the peer disconnects cleanly between frames. An
    /// announced body length above the cap surfaces as
    /// [`Error::FrameTooLarge`] from the header alone, before any body bytes
    /// arrive.
    #[tracing::instrument(skip_all)]
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                debug!(id = frame.id, len = frame.body.len(), "frame received");
                return Ok(Some(frame));
            }

            // Not a whole frame yet; pull more off the socket. A zero-byte
            // read is EOF, which is only orderly on a frame boundary.
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                error!(pending = self.buffer.len(), "peer went away inside a frame");
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer closed the connection inside a frame",
                )));
            }
        }
    }

    /// Decode one frame from the head of the buffer, if it is all there.
    ///
    /// A short buffer is not an error at this level, so the decoder's
    /// [`Error::IncompleteFrame`] turns into `Ok(None)` and the caller reads
    /// on. Hard protocol errors pass through untouched.
    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        let mut cursor = Cursor::new(&self.buffer[..]);

        match Frame::parse(&mut cursor) {
            Ok(frame) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            Err(Error::IncompleteFrame) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a frame to the connection's underlying stream.
    ///
    /// The header and body go through the buffered writer and reach the socket
    /// in one flush, so a frame is never interleaved with another written from
    /// the same connection.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        debug_assert!(frame.body.len() <= crate::MAX_FRAME_LEN);

        self.stream.write_u16(frame.id).await?;
        self.stream.write_u16(frame.body.len() as u16).await?;
        self.stream.write_all(&frame.body).await?;
        self.stream.flush().await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MsgId, FRAME_HEADER_LEN};
    use bytes::{BufMut, Bytes};

    fn wire(id: u16, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_u16(id);
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(body);
        buf
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_read_write_frame() {
        let frames = [
            Frame::new(MsgId::LoginReq, Bytes::from_static(br#"{"uid":1001}"#)),
            Frame::new(MsgId::HeartbeatReq, Bytes::new()),
            Frame::new(MsgId::ChatTextReq, Bytes::from_static(b"payload")),
        ];

        // create a mock stream that expects the bytes in the test to be both read and written
        let stream = frames
            .iter()
            .fold(tokio_test::io::Builder::new(), |mut acc, f| {
                let bytes = wire(f.id, &f.body);
                acc.read(&bytes);
                acc.write(&bytes);
                acc
            })
            .build();
        let mut conn = Connection::new(stream);

        for frame in &frames {
            let received = conn.read_frame().await.unwrap().unwrap();
            assert_eq!(received, *frame);
            conn.write_frame(frame).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_frame_split_between_every_byte() {
        // Adversarial segmentation: each byte arrives in its own read.
        let bytes = wire(1005, br#"{"uid":1001,"token":"abc"}"#);

        let mut builder = tokio_test::io::Builder::new();
        for b in &bytes {
            builder.read(std::slice::from_ref(b));
        }
        let mut conn = Connection::new(builder.build());

        let frame = conn.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.id, 1005);
        assert_eq!(&frame.body[..], br#"{"uid":1001,"token":"abc"}"#);

        // Clean EOF afterwards.
        assert!(conn.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_frames_in_one_segment() {
        let mut bytes = wire(1021, b"");
        bytes.extend_from_slice(&wire(1017, b"hi"));

        let stream = tokio_test::io::Builder::new().read(&bytes).build();
        let mut conn = Connection::new(stream);

        assert_eq!(conn.read_frame().await.unwrap().unwrap().id, 1021);
        assert_eq!(conn.read_frame().await.unwrap().unwrap().id, 1017);
        assert!(conn.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_header_errors_before_body() {
        // Announce a 0xFFFF body; the reader must fail on the header alone.
        let mut bytes = Vec::new();
        bytes.put_u16(9999);
        bytes.put_u16(0xFFFF);

        let stream = tokio_test::io::Builder::new().read(&bytes).build();
        let mut conn = Connection::new(stream);

        match conn.read_frame().await {
            Err(Error::FrameTooLarge(len)) => assert_eq!(len, 0xFFFF),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let bytes = wire(1017, b"truncated");
        let stream = tokio_test::io::Builder::new()
            .read(&bytes[..bytes.len() - 3])
            .build();
        let mut conn = Connection::new(stream);

        assert!(matches!(conn.read_frame().await, Err(Error::Io(_))));
    }
}
