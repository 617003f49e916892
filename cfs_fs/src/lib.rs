//! # CFS virtual filesystem
//!
//! One logical POSIX-like file tree composed of independently-keyed,
//! independently-replicable partitions (`/etc`, `/lib`, `/tmp`, `/var`,
//! `/home`), presented behind a single path space and a single
//! file-descriptor table.
//!
//! ## Layers
//! 1. `partition` – the closed partition enumeration, the per-partition
//!    path rewrite, and the partition manager.
//! 2. `cfs`       – the façade applications use: the full operation
//!    surface plus descriptor bookkeeping.
//! 3. `create`    – provisioning: reserved directories and files,
//!    identity, epoch, signature.
//! 4. `events`    – the `/var/log/events` JSON-lines log and its
//!    periodic flush task.
//! 5. `registry`  – explicit lookup of open filesystems by key path,
//!    consumed by the protocol server.

mod cfs;
mod create;
mod events;
mod partition;
mod registry;

pub use cfs::{AccessMode, Cfs};
pub use create::{
    CFS_DIRECTORIES, CFS_EPOCH_FILE, CFS_FILES, CFS_ID_FILE, CFS_SIGNATURE_FILE, CfsOptions,
    create_cfs,
};
pub use events::{
    EVENT_FLUSH_INTERVAL, EVENT_FLUSH_THRESHOLD, EVENT_LOG_PATH, EventLog, EventRecord,
};
pub use partition::{DriveFactory, Partition, PartitionName, PartitionSet};
pub use registry::{CfsRegistry, key_path};
