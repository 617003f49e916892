//! # CFS node
//!
//! TCP plumbing around [`cfs_protocol`]: a server that exposes a
//! [`CfsRegistry`](cfs_fs::CfsRegistry) of filesystems on a listening
//! socket, a typed [`CfsClient`] for remote operations, and a
//! [`replicate`] helper that authenticates a replication session and
//! hands back the raw byte stream.

pub mod client;
pub mod config;
pub mod server;

pub use client::{CfsClient, replicate};
pub use config::{CfsNodeConfig, NodeConfigIdentity, NodeConfigListen, load_secret_key};
pub use server::CfsServer;
