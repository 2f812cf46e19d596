//! Length-prefixed frame codec
//!
//! Header layout (big endian): kind `u8`, stream id `u64`, payload length
//! `u32`, followed by the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::TransportError;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 1 + 8 + 4;

/// Largest payload accepted by default
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Agent introduction, payload is a JSON [`crate::Hello`]
    Hello = 0,
    /// Open a stream to the `host:port` in the payload
    Dial = 1,
    /// Dial result; empty payload on success, otherwise the error text
    DialAck = 2,
    /// Stream bytes
    Data = 3,
    /// Stream finished
    Close = 4,
    /// Keepalive probe
    Ping = 5,
    /// Keepalive reply
    Pong = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Hello,
            1 => Self::Dial,
            2 => Self::DialAck,
            3 => Self::Data,
            4 => Self::Close,
            5 => Self::Ping,
            6 => Self::Pong,
            other => return Err(TransportError::UnknownKind(other)),
        })
    }
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub kind: FrameKind,
    /// Stream the frame belongs to; 0 for connection-level frames
    pub stream_id: u64,
    /// Frame body
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(kind: FrameKind, stream_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream_id,
            payload: payload.into(),
        }
    }

    /// Request a stream to `target`
    pub fn dial(stream_id: u64, target: &str) -> Self {
        Self::new(FrameKind::Dial, stream_id, Bytes::copy_from_slice(target.as_bytes()))
    }

    /// Answer a dial; `None` means success
    pub fn dial_ack(stream_id: u64, error: Option<&str>) -> Self {
        let payload = error
            .map(|e| Bytes::copy_from_slice(e.as_bytes()))
            .unwrap_or_default();
        Self::new(FrameKind::DialAck, stream_id, payload)
    }

    /// Carry stream bytes
    pub fn data(stream_id: u64, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, stream_id, payload)
    }

    /// Finish a stream
    pub fn close(stream_id: u64) -> Self {
        Self::new(FrameKind::Close, stream_id, Bytes::new())
    }

    /// Keepalive probe
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, 0, Bytes::new())
    }

    /// Keepalive reply
    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, 0, Bytes::new())
    }
}

/// Encoder and decoder for [`Frame`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Codec with the default payload limit
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD)
    }

    /// Codec rejecting payloads larger than `max_payload`
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[9..HEADER_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_payload {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let kind = FrameKind::try_from(src.get_u8())?;
        let stream_id = src.get_u64();
        src.advance(4);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            kind,
            stream_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.kind as u8);
        dst.put_u64(frame.stream_id);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        FrameCodec::new()
            .encode(Frame::data(7, Bytes::from_static(b"hi")), &mut buf)
            .expect("encode");

        assert_eq!(
            &buf[..],
            &[3, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 2, b'h', b'i'][..]
        );
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        codec
            .encode(Frame::dial(1, "10.0.0.1:443"), &mut encoded)
            .expect("encode");

        let mut src = BytesMut::new();
        src.extend_from_slice(&encoded[..5]);
        assert!(codec.decode(&mut src).expect("decode").is_none());
        src.extend_from_slice(&encoded[5..HEADER_LEN + 3]);
        assert!(codec.decode(&mut src).expect("decode").is_none());
        src.extend_from_slice(&encoded[HEADER_LEN + 3..]);

        let frame = codec.decode(&mut src).expect("decode").expect("frame");
        assert_eq!(frame, Frame::dial(1, "10.0.0.1:443"));
        assert!(src.is_empty());
    }

    #[test]
    fn test_back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut src = BytesMut::new();
        codec.encode(Frame::ping(), &mut src).expect("encode");
        codec.encode(Frame::close(9), &mut src).expect("encode");

        assert_eq!(codec.decode(&mut src).expect("decode"), Some(Frame::ping()));
        assert_eq!(codec.decode(&mut src).expect("decode"), Some(Frame::close(9)));
        assert_eq!(codec.decode(&mut src).expect("decode"), None);
    }

    #[test]
    fn test_oversized_payload_is_rejected_before_buffering() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut src = BytesMut::from(&[3u8, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 5][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(TransportError::FrameTooLarge { len: 5, max: 4 })
        ));

        let mut dst = BytesMut::new();
        assert!(codec
            .encode(Frame::data(1, Bytes::from_static(b"12345")), &mut dst)
            .is_err());
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let mut src = BytesMut::from(&[42u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameCodec::new().decode(&mut src),
            Err(TransportError::UnknownKind(42))
        ));
    }

    #[test]
    fn test_dial_ack_payload() {
        assert!(Frame::dial_ack(3, None).payload.is_empty());
        assert_eq!(
            Frame::dial_ack(3, Some("connection refused")).payload,
            Bytes::from_static(b"connection refused")
        );
    }
}
