use crate::{Error, Result, FRAME_HEADER_LEN, MAX_FRAME_LEN};
use bytes::{Buf, Bytes};
use serde::{de::DeserializeOwned, Serialize};
use std::io::Cursor;

/// One message unit on the chat TCP stream.
///
/// Wire layout is `[id: u16 BE][len: u16 BE][body: bytes len]` with
/// `len <= MAX_FRAME_LEN`. The body is carried opaquely; every id defined by
/// this crate puts JSON in it, but the codec does not care.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message id. Kept raw so unknown ids can be logged and skipped.
    pub id: u16,
    /// Message body.
    pub body: Bytes,
}

impl Frame {
    pub fn new(id: MsgId, body: Bytes) -> Frame {
        Frame { id: id as u16, body }
    }

    /// Build a frame whose body is the JSON encoding of `value`.
    pub fn json<T: Serialize>(id: MsgId, value: &T) -> Result<Frame> {
        let body = serde_json::to_vec(value)?;
        Ok(Frame {
            id: id as u16,
            body: Bytes::from(body),
        })
    }

    /// Decode the body as JSON into `T`.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Parse a frame out of `src`, advancing the cursor past it.
    ///
    /// An undersized buffer is reported as [`Error::IncompleteFrame`] so the
    /// caller can read more and retry; a body length above the cap is a hard
    /// protocol violation, diagnosable from the header alone.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame> {
        let id = get_u16(src)?;
        let len = usize::from(get_u16(src)?);
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        if src.remaining() < len {
            return Err(Error::IncompleteFrame);
        }
        let body = Bytes::copy_from_slice(&src.chunk()[..len]);
        skip(src, len)?;
        Ok(Frame { id, body })
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.len()
    }

    /// The typed id, when this frame carries one this crate knows.
    pub fn msg_id(&self) -> Option<MsgId> {
        MsgId::from_u16(self.id)
    }
}

fn get_u16(src: &mut Cursor<&[u8]>) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(Error::IncompleteFrame);
    }
    Ok(src.get_u16())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<()> {
    if src.remaining() < n {
        return Err(Error::IncompleteFrame);
    }
    src.advance(n);
    Ok(())
}

/// Message ids understood by the chat and service listeners.
///
/// The 1000 range is the client-facing chat protocol; the 2000 range is the
/// internal RPC surface (status placement, peer forwarding, verify codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgId {
    LoginReq = 1005,
    LoginRsp = 1006,
    SearchReq = 1007,
    SearchRsp = 1008,
    AddFriendReq = 1009,
    AddFriendRsp = 1010,
    NotifyAddFriend = 1011,
    AuthFriendReq = 1013,
    AuthFriendRsp = 1014,
    NotifyAuthFriend = 1015,
    ChatTextReq = 1017,
    ChatTextRsp = 1018,
    NotifyChatText = 1019,
    HeartbeatReq = 1021,
    HeartbeatRsp = 1022,

    GetChatServerReq = 2001,
    GetChatServerRsp = 2002,
    VerifyTokenReq = 2003,
    VerifyTokenRsp = 2004,
    PeerAddFriendReq = 2101,
    PeerAddFriendRsp = 2102,
    PeerAuthFriendReq = 2103,
    PeerAuthFriendRsp = 2104,
    PeerChatTextReq = 2105,
    PeerChatTextRsp = 2106,
    GetVerifyCodeReq = 2201,
    GetVerifyCodeRsp = 2202,
}

impl MsgId {
    pub fn from_u16(v: u16) -> Option<MsgId> {
        use MsgId::*;
        let id = match v {
            1005 => LoginReq,
            1006 => LoginRsp,
            1007 => SearchReq,
            1008 => SearchRsp,
            1009 => AddFriendReq,
            1010 => AddFriendRsp,
            1011 => NotifyAddFriend,
            1013 => AuthFriendReq,
            1014 => AuthFriendRsp,
            1015 => NotifyAuthFriend,
            1017 => ChatTextReq,
            1018 => ChatTextRsp,
            1019 => NotifyChatText,
            1021 => HeartbeatReq,
            1022 => HeartbeatRsp,
            2001 => GetChatServerReq,
            2002 => GetChatServerRsp,
            2003 => VerifyTokenReq,
            2004 => VerifyTokenRsp,
            2101 => PeerAddFriendReq,
            2102 => PeerAddFriendRsp,
            2103 => PeerAuthFriendReq,
            2104 => PeerAuthFriendRsp,
            2105 => PeerChatTextReq,
            2106 => PeerChatTextRsp,
            2201 => GetVerifyCodeReq,
            2202 => GetVerifyCodeRsp,
            _ => return None,
        };
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn encode(id: u16, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_u16(id);
        buf.put_u16(body.len() as u16);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn test_parse_roundtrip() {
        let body = br#"{"uid":1001,"token":"abc"}"#;
        let bytes = encode(1005, body);

        let mut cursor = Cursor::new(&bytes[..]);
        let frame = Frame::parse(&mut cursor).unwrap();
        assert_eq!(cursor.position() as usize, bytes.len());
        assert_eq!(frame.id, 1005);
        assert_eq!(frame.msg_id(), Some(MsgId::LoginReq));
        assert_eq!(&frame.body[..], body);
    }

    #[test]
    fn test_empty_body() {
        let bytes = encode(1021, b"");
        let mut cursor = Cursor::new(&bytes[..]);
        let frame = Frame::parse(&mut cursor).unwrap();
        assert_eq!(frame.id, 1021);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_incomplete_at_every_split() {
        let bytes = encode(1017, b"hello world");
        // Every strict prefix must report Incomplete, never a hard error.
        for split in 0..bytes.len() {
            let mut cursor = Cursor::new(&bytes[..split]);
            match Frame::parse(&mut cursor) {
                Err(Error::IncompleteFrame) => {}
                other => panic!("prefix of {split} bytes gave {other:?}"),
            }
        }
        let mut cursor = Cursor::new(&bytes[..]);
        assert!(Frame::parse(&mut cursor).is_ok());
    }

    #[test]
    fn test_oversize_is_hard_error() {
        // Header announcing a 0xFFFF-byte body must fail on header parse
        // alone, before any body bytes arrive.
        let mut buf = BytesMut::new();
        buf.put_u16(9999);
        buf.put_u16(0xFFFF);

        let mut cursor = Cursor::new(&buf[..]);
        match Frame::parse(&mut cursor) {
            Err(Error::FrameTooLarge(len)) => assert_eq!(len, 0xFFFF),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_max_len_body_is_accepted() {
        let body = vec![0x42u8; MAX_FRAME_LEN];
        let bytes = encode(1017, &body);
        let mut cursor = Cursor::new(&bytes[..]);
        let frame = Frame::parse(&mut cursor).unwrap();
        assert_eq!(frame.body.len(), MAX_FRAME_LEN);
    }

    #[test]
    fn test_unknown_id_still_parses() {
        // Unknown ids are a dispatch concern, not a codec concern.
        let bytes = encode(4242, b"whatever");
        let mut cursor = Cursor::new(&bytes[..]);
        let frame = Frame::parse(&mut cursor).unwrap();
        assert_eq!(frame.id, 4242);
        assert_eq!(frame.msg_id(), None);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut bytes = encode(1005, b"first");
        bytes.extend_from_slice(&encode(1007, b"second"));

        let mut cursor = Cursor::new(&bytes[..]);
        let a = Frame::parse(&mut cursor).unwrap();
        let b = Frame::parse(&mut cursor).unwrap();
        assert_eq!((a.id, &a.body[..]), (1005, &b"first"[..]));
        assert_eq!((b.id, &b.body[..]), (1007, &b"second"[..]));
    }

    #[test]
    fn test_json_body_helpers() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Ping {
            n: u32,
        }

        let frame = Frame::json(MsgId::HeartbeatReq, &Ping { n: 7 }).unwrap();
        let back: Ping = frame.body_json().unwrap();
        assert_eq!(back, Ping { n: 7 });
    }
}
