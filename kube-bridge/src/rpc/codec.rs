//! Frame format of the control connection
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────┬─────────────┐
//! │ Frame length │ Header length│ JSON header │ Raw payload │
//! │  u32 BE      │  u32 BE      │  Envelope   │  bytes      │
//! └──────────────┴──────────────┴─────────────┴─────────────┘
//! ```
//!
//! The outer length prefix is handled by [`LengthDelimitedCodec`]; stream
//! content rides in the payload so it is never JSON encoded.

use crate::wire::{Envelope, Reply, Request, StreamBlock, StreamFlag};
use crate::{Error, StreamId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted in either direction (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub envelope: Envelope,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(id: u64, request: Request, payload: Bytes) -> Self {
        Self {
            envelope: Envelope::Request { id, request },
            payload,
        }
    }

    pub fn reply(id: u64, reply: Reply) -> Self {
        Self {
            envelope: Envelope::Reply { id, reply },
            payload: Bytes::new(),
        }
    }

    /// A `Block` reply carrying the block's content as payload.
    pub fn block(id: u64, block: StreamBlock) -> Self {
        Self {
            envelope: Envelope::Reply {
                id,
                reply: Reply::Block {
                    stream_id: block.stream_id,
                    flag: block.flag,
                },
            },
            payload: block.content.unwrap_or_default(),
        }
    }

    pub fn id(&self) -> u64 {
        match &self.envelope {
            Envelope::Request { id, .. } | Envelope::Reply { id, .. } => *id,
        }
    }
}

/// Rebuild the block carried by a `Block` reply.
pub fn into_block(stream_id: StreamId, flag: StreamFlag, payload: Bytes) -> StreamBlock {
    match flag {
        StreamFlag::Data => StreamBlock::data(stream_id, payload),
        StreamFlag::Connected => StreamBlock::connected(stream_id),
        StreamFlag::Closed => StreamBlock::closed(stream_id),
    }
}

#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if body.len() < HEADER_LEN_SIZE {
            return Err(Error::Protocol(format!("frame of {} bytes has no header", body.len())));
        }
        let header_len = body.get_u32() as usize;
        if header_len > body.len() {
            return Err(Error::Protocol(format!(
                "header length {} exceeds frame body of {} bytes",
                header_len,
                body.len()
            )));
        }
        let header = body.split_to(header_len);
        let envelope: Envelope = serde_json::from_slice(&header)
            .map_err(|e| Error::Protocol(format!("malformed frame header: {}", e)))?;

        Ok(Some(Frame {
            envelope,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let header = serde_json::to_vec(&frame.envelope)?;
        let mut body = BytesMut::with_capacity(HEADER_LEN_SIZE + header.len() + frame.payload.len());
        body.put_u32(header.len() as u32);
        body.put_slice(&header);
        body.put_slice(&frame.payload);
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_carried_raw() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::block(4, StreamBlock::data(2, Bytes::from_static(b"\x00\xffraw")));

        codec.encode(frame.clone(), &mut buf).unwrap();
        assert!(buf.windows(5).any(|w| w == b"\x00\xffraw"));

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Frame::request(1, Request::Ping, Bytes::new()), &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.id(), 1);
    }

    #[test]
    fn malformed_header_is_a_protocol_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut body = BytesMut::new();
        body.put_u32(3);
        body.put_slice(b"{{{");
        LengthDelimitedCodec::new().encode(body.freeze(), &mut buf).unwrap();

        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_flag_in_block_is_rejected() {
        let mut codec = FrameCodec::new();
        let header = br#"{"id":1,"reply":{"reply":"block","stream_id":1,"flag":5}}"#;
        let mut body = BytesMut::new();
        body.put_u32(header.len() as u32);
        body.put_slice(header);
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new().encode(body.freeze(), &mut buf).unwrap();

        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn block_payload_maps_back_to_content() {
        let block = into_block(3, StreamFlag::Data, Bytes::from_static(b"abc"));
        assert_eq!(block, StreamBlock::data(3, Bytes::from_static(b"abc")));
        assert_eq!(into_block(3, StreamFlag::Closed, Bytes::new()).content, None);
    }
}
