//! # CFS wire protocol
//!
//! The authenticated binary protocol that exposes a CFS instance over a
//! byte stream:
//!
//! 1. a nonce-challenge handshake proves both ends speak the protocol
//!    (`key = hash(MAGIC ++ nonce)`),
//! 2. operation traffic flows as nonce-correlated request/response
//!    frames dispatched through a fixed operation table,
//! 3. replication runs through a session state machine (CONNECT, AUTH,
//!    STREAM_*) that ends in a raw bidirectional byte splice.
//!
//! The crate is transport agnostic: anything `AsyncRead + AsyncWrite`
//! carries a session. `cfs_node` supplies the TCP plumbing.

pub mod codec;
pub mod error;
pub mod message;
pub mod ops;
pub mod protocol;
pub mod server;
pub mod session;

pub use codec::{Frame, FrameCodec, MAX_FRAME_LENGTH};
pub use error::{ProtocolError, ProtocolResult, codes};
pub use message::{
    DriveRef, Handshake, ListResult, KeyPairResult, NONCE_SIZE, NumberResult, OpenOp, Operation,
    PROTOCOL_MAGIC, PathOp, ReadOp, Request, Response, StatResult, StateFrame, StringResult,
    error_code,
};
pub use protocol::{ClientSession, ProtocolClient, accept_handshake, handshake};
pub use server::{handle_request, serve_connection};
pub use session::{HistoryEntry, Session, SessionState};
