//! Length-delimited framing: `[u8 frame type][u32 BE length][payload]`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Handshake, Request, Response, StateFrame};

const HEADER_LEN: usize = 5;

/// Default cap on a single frame's payload.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

const FRAME_HANDSHAKE: u8 = 0;
const FRAME_REQUEST: u8 = 1;
const FRAME_RESPONSE: u8 = 2;
const FRAME_STATE: u8 = 3;

/// A decoded protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Handshake(Handshake),
    Request(Request),
    Response(Response),
    State(StateFrame),
}

impl Frame {
    fn frame_type(&self) -> u8 {
        match self {
            Frame::Handshake(_) => FRAME_HANDSHAKE,
            Frame::Request(_) => FRAME_REQUEST,
            Frame::Response(_) => FRAME_RESPONSE,
            Frame::State(_) => FRAME_STATE,
        }
    }
}

/// Frame codec for a protocol connection.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let frame_type = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let frame = match frame_type {
            FRAME_HANDSHAKE => Frame::Handshake(minicbor::decode(&payload)?),
            FRAME_REQUEST => Frame::Request(minicbor::decode(&payload)?),
            FRAME_RESPONSE => Frame::Response(minicbor::decode(&payload)?),
            FRAME_STATE => Frame::State(minicbor::decode(&payload)?),
            other => return Err(ProtocolError::UnknownFrame(other)),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = match &frame {
            Frame::Handshake(msg) => minicbor::to_vec(msg)?,
            Frame::Request(msg) => minicbor::to_vec(msg)?,
            Frame::Response(msg) => minicbor::to_vec(msg)?,
            Frame::State(msg) => minicbor::to_vec(msg)?,
        };
        if payload.len() > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(frame.frame_type());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, DriveRef, Operation};

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn frame_roundtrips() {
        let nonce = message::nonce();
        let handshake = Handshake {
            key: message::handshake_key(&nonce),
            nonce,
            ack: false,
        };
        assert_eq!(roundtrip(Frame::Handshake(handshake.clone())), Frame::Handshake(handshake));

        let request = Request {
            nonce: message::nonce(),
            operation: Operation::StatFile.code(),
            drive: Some(DriveRef {
                id: b"alice".to_vec(),
                key: vec![3; 32],
                secret_key: Vec::new(),
            }),
            buffer: b"payload".to_vec(),
        };
        assert_eq!(roundtrip(Frame::Request(request.clone())), Frame::Request(request.clone()));

        let response = Response {
            operation: request.operation,
            error_code: 0,
            nonce: message::response_nonce(&request.nonce),
            request,
            buffer: b"result".to_vec(),
            drive: None,
        };
        assert_eq!(roundtrip(Frame::Response(response.clone())), Frame::Response(response));

        let state = StateFrame {
            state: 0xA0,
            payload: Vec::new(),
        };
        assert_eq!(roundtrip(Frame::State(state.clone())), Frame::State(state));
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::State(StateFrame {
                    state: 1,
                    payload: vec![9; 64],
                }),
                &mut buf,
            )
            .unwrap();

        let mut partial = BytesMut::from(&buf[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let decoded = codec.decode(&mut buf).unwrap();
        assert!(decoded.is_some());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = FrameCodec::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let result = codec.encode(
            Frame::State(StateFrame {
                state: 1,
                payload: vec![0; 64],
            }),
            &mut buf,
        );
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge(_))));

        let mut bogus = BytesMut::new();
        bogus.put_u8(3);
        bogus.put_u32(1024);
        bogus.extend_from_slice(&[0; 1024]);
        assert!(matches!(
            codec.decode(&mut bogus),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u32(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownFrame(9))
        ));
    }
}
