//! Wire messages and the fixed operation/error tables.
//!
//! Every frame payload is a CBOR map with small integer keys, so fields
//! can be added without breaking older peers.

use cfs_core::{DriveStat, FsError, Hash};
use minicbor::{CborLen, Decode, Encode};

/// Magic prefix mixed into every handshake key derivation.
pub const PROTOCOL_MAGIC: &[u8] = b"CFSNET1";

/// Size of handshake and request nonces.
pub const NONCE_SIZE: usize = 32;

/// Generates a fresh random nonce.
pub fn nonce() -> Vec<u8> {
    rand::random::<[u8; NONCE_SIZE]>().to_vec()
}

/// `hash(MAGIC ++ nonce)`, the proof sent alongside a handshake nonce.
pub fn handshake_key(nonce: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PROTOCOL_MAGIC.len() + nonce.len());
    buf.extend_from_slice(PROTOCOL_MAGIC);
    buf.extend_from_slice(nonce);
    Hash::new(&buf).as_bytes().to_vec()
}

/// `hash(request_nonce)`, echoed in the matching response.
pub fn response_nonce(request_nonce: &[u8]) -> Vec<u8> {
    Hash::new(request_nonce).as_bytes().to_vec()
}

/// Nonce-challenge handshake, sent by the client with `ack: false` and
/// echoed by the server with `ack: true`.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct Handshake {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub nonce: Vec<u8>,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub key: Vec<u8>,
    #[n(2)]
    pub ack: bool,
}

/// Reference to the filesystem a request targets.
#[derive(Encode, Decode, CborLen, Clone, Debug, Default, PartialEq, Eq)]
#[cbor(map)]
pub struct DriveRef {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub id: Vec<u8>,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub key: Vec<u8>,
    #[n(2)]
    #[cbor(with = "minicbor::bytes")]
    pub secret_key: Vec<u8>,
}

impl DriveRef {
    /// Scrubs write capability before the reference is echoed back.
    pub fn zeroed(mut self) -> Self {
        self.secret_key.clear();
        self
    }
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct Request {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub nonce: Vec<u8>,
    #[n(1)]
    pub operation: u32,
    #[n(2)]
    pub drive: Option<DriveRef>,
    #[n(3)]
    #[cbor(with = "minicbor::bytes")]
    pub buffer: Vec<u8>,
}

/// Response to a [`Request`]; `nonce` is `hash(request.nonce)` and the
/// echoed request has its buffer and secret key zeroed.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct Response {
    #[n(0)]
    pub operation: u32,
    #[n(1)]
    pub error_code: u32,
    #[n(2)]
    pub request: Request,
    #[n(3)]
    #[cbor(with = "minicbor::bytes")]
    pub buffer: Vec<u8>,
    #[n(4)]
    #[cbor(with = "minicbor::bytes")]
    pub nonce: Vec<u8>,
    #[n(5)]
    pub drive: Option<DriveRef>,
}

/// Session state machine frame: a state code plus an opaque payload.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct StateFrame {
    #[n(0)]
    pub state: u8,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub payload: Vec<u8>,
}

// Operation payloads.

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct PathOp {
    #[n(0)]
    pub path: String,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct OpenOp {
    #[n(0)]
    pub path: String,
    #[n(1)]
    pub flags: String,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, Default, PartialEq, Eq)]
#[cbor(map)]
pub struct ReadOp {
    #[n(0)]
    pub fd: u32,
    #[n(1)]
    pub offset: Option<u64>,
    #[n(2)]
    pub length: Option<u64>,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct CloseOp {
    #[n(0)]
    pub fd: u32,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct AccessOp {
    #[n(0)]
    pub path: String,
    #[n(1)]
    pub mode: u32,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct SeedOp {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub seed: Vec<u8>,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct WriteFileOp {
    #[n(0)]
    pub path: String,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub buffer: Vec<u8>,
}

// Result payloads.

#[derive(Encode, Decode, CborLen, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cbor(map)]
pub struct StatResult {
    #[n(0)]
    pub size: u64,
    #[n(1)]
    pub mode: u32,
    #[n(2)]
    pub is_directory: bool,
    #[n(3)]
    pub mtime: u64,
    #[n(4)]
    pub ctime: u64,
}

impl From<DriveStat> for StatResult {
    fn from(stat: DriveStat) -> Self {
        Self {
            size: stat.size,
            mode: stat.mode,
            is_directory: stat.is_directory,
            mtime: stat.mtime,
            ctime: stat.ctime,
        }
    }
}

impl From<StatResult> for DriveStat {
    fn from(stat: StatResult) -> Self {
        Self {
            size: stat.size,
            mode: stat.mode,
            is_directory: stat.is_directory,
            mtime: stat.mtime,
            ctime: stat.ctime,
        }
    }
}

#[derive(Encode, Decode, CborLen, Clone, Copy, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct NumberResult {
    #[n(0)]
    pub value: u64,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct StringResult {
    #[n(0)]
    pub value: String,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, Default, PartialEq, Eq)]
#[cbor(map)]
pub struct ListResult {
    #[n(0)]
    pub values: Vec<String>,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct KeyPairResult {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub public: Vec<u8>,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub secret: Vec<u8>,
    #[n(2)]
    #[cbor(with = "minicbor::bytes")]
    pub seed: Vec<u8>,
}

/// The fixed operation table. Codes are part of the wire format and
/// never reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    NoOperation = 0,
    AccessFile = 1,
    Close = 2,
    DownloadDirectory = 3,
    DownloadFile = 4,
    KeyPair = 5,
    ListDirectory = 6,
    MakeDirectory = 7,
    MakeDirectoryPath = 8,
    Open = 9,
    Read = 10,
    ReadFile = 11,
    RemoveDirectory = 12,
    RemoveDirectoryPath = 13,
    Resolve = 14,
    StatFile = 15,
    TouchFile = 16,
    UnlinkFile = 17,
    Write = 18,
    WriteFile = 19,
}

impl Operation {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::NoOperation,
            1 => Self::AccessFile,
            2 => Self::Close,
            3 => Self::DownloadDirectory,
            4 => Self::DownloadFile,
            5 => Self::KeyPair,
            6 => Self::ListDirectory,
            7 => Self::MakeDirectory,
            8 => Self::MakeDirectoryPath,
            9 => Self::Open,
            10 => Self::Read,
            11 => Self::ReadFile,
            12 => Self::RemoveDirectory,
            13 => Self::RemoveDirectoryPath,
            14 => Self::Resolve,
            15 => Self::StatFile,
            16 => Self::TouchFile,
            17 => Self::UnlinkFile,
            18 => Self::Write,
            19 => Self::WriteFile,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NoOperation => "NoOperation",
            Self::AccessFile => "AccessFile",
            Self::Close => "Close",
            Self::DownloadDirectory => "DownloadDirectory",
            Self::DownloadFile => "DownloadFile",
            Self::KeyPair => "KeyPair",
            Self::ListDirectory => "ListDirectory",
            Self::MakeDirectory => "MakeDirectory",
            Self::MakeDirectoryPath => "MakeDirectoryPath",
            Self::Open => "Open",
            Self::Read => "Read",
            Self::ReadFile => "ReadFile",
            Self::RemoveDirectory => "RemoveDirectory",
            Self::RemoveDirectoryPath => "RemoveDirectoryPath",
            Self::Resolve => "Resolve",
            Self::StatFile => "StatFile",
            Self::TouchFile => "TouchFile",
            Self::UnlinkFile => "UnlinkFile",
            Self::Write => "Write",
            Self::WriteFile => "WriteFile",
        }
    }
}

/// Response error codes, aligned with the filesystem's own error codes.
pub mod error_code {
    use super::FsError;

    pub const NO_ERROR: u32 = 0;
    pub const ACCESS_DENIED: u32 = 1;
    pub const BAD_REQUEST: u32 = 2;
    pub const NOT_FOUND: u32 = 3;
    pub const NOT_OPENED: u32 = 4;
    pub const NOT_SUPPORTED: u32 = 5;
    pub const NOT_IMPLEMENTED: u32 = 6;
    pub const INTERNAL: u32 = 7;

    pub fn from_fs(err: &FsError) -> u32 {
        err.code()
    }
}
