//! Core CFS types and traits.
//!
//! This crate defines the pieces shared by every other CFS crate:
//!
//! - the [`Hash`] type (BLAKE3, 32 bytes)
//! - identity and partition key derivation ([`keys`])
//! - the [`Drive`] trait, the interface every replicated-log backend
//!   implements (the in-memory backend lives in `cfs_drive_memory`)
//! - the error taxonomy ([`FsError`]) with its fixed wire codes
//! - pure path normalization ([`path::normalize_path`])
//!
//! Nothing in here touches the network or spawns tasks; the virtual
//! filesystem is built on top of these types in `cfs_fs`, and the wire
//! protocol in `cfs_protocol`.

pub mod drive;
pub mod error;
pub mod hash;
pub mod keys;
pub mod path;

pub use drive::{Drive, DriveEvent, DriveEventKind, DriveStat, OpenFlags, ReadOptions};
pub use error::{FsError, FsResult};
pub use hash::Hash;
pub use keys::{KeyPair, SecretKey, derive_keypair, discovery_key, partition_seed};

/// Size of a drive public key in bytes (Ed25519).
pub const KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;
