//! Provisioning: turning a set of empty drives into a CFS instance.
//!
//! Creation is idempotent. Every reserved directory and file is created
//! only if missing, and the identity, epoch, and signature files are
//! write-once, so reopening an existing filesystem never rewrites its
//! provenance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cfs_core::{
    FsError, FsResult, Hash, KEY_SIZE, KeyPair,
    keys::{SecretKey, derive_keypair, generate_keypair, sign},
};
use chrono::Utc;
use tracing::{debug, warn};

use crate::cfs::{AccessMode, Cfs};
use crate::events::{EVENT_FLUSH_INTERVAL, EVENT_LOG_PATH, EventLog};
use crate::partition::{DriveFactory, PartitionName, PartitionSet};
use crate::registry::key_path;

/// Owner identifier, readable by anyone holding the filesystem.
pub const CFS_ID_FILE: &str = "/etc/cfs-id";

/// Creation time in decimal Unix seconds, written exactly once.
pub const CFS_EPOCH_FILE: &str = "/etc/cfs-epoch";

/// Raw Ed25519 signature binding the owner id to the root key, written
/// exactly once.
pub const CFS_SIGNATURE_FILE: &str = "/etc/cfs-signature";

/// Reserved directory tree, in creation order.
pub const CFS_DIRECTORIES: [&str; 8] = [
    "/",
    "/home",
    "/etc",
    "/lib",
    "/tmp",
    "/var",
    "/var/log",
    "/var/cache",
];

/// Reserved files, in creation order.
pub const CFS_FILES: [&str; 4] = [
    CFS_ID_FILE,
    CFS_EPOCH_FILE,
    CFS_SIGNATURE_FILE,
    EVENT_LOG_PATH,
];

/// Options for [`create_cfs`].
pub struct CfsOptions {
    /// Owner identifier; enables the `/home` identity scope and the
    /// identity files under `/etc`.
    pub id: Option<Bytes>,
    /// Explicit root public key; without it the root key pair is derived
    /// from `id`, or generated when there is no id either.
    pub key: Option<[u8; KEY_SIZE]>,
    /// Root secret key, granting write capability.
    pub secret_key: Option<SecretKey>,
    /// Explicit key pairs for individual partitions, for replicas that
    /// received them out of band.
    pub partition_keys: HashMap<PartitionName, KeyPair>,
    /// Interval between periodic event-log flushes.
    pub event_flush_interval: Duration,
}

impl Default for CfsOptions {
    fn default() -> Self {
        Self {
            id: None,
            key: None,
            secret_key: None,
            partition_keys: HashMap::new(),
            event_flush_interval: EVENT_FLUSH_INTERVAL,
        }
    }
}

impl CfsOptions {
    pub fn with_id(id: impl Into<Bytes>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    fn root_keypair(&self) -> KeyPair {
        match (self.key, &self.id) {
            (Some(public), _) => KeyPair {
                public,
                secret: self.secret_key.clone(),
            },
            (None, Some(id)) => derive_keypair(id),
            (None, None) => generate_keypair(),
        }
    }
}

/// Creates (or reopens) a CFS instance over drives built by `factory`.
///
/// All five mounted partitions are always created. When the root drive
/// is writable the reserved tree is provisioned and the event log is
/// flushed once, so a brand-new filesystem is immediately complete on
/// disk.
pub async fn create_cfs(mut opts: CfsOptions, factory: DriveFactory) -> FsResult<Arc<Cfs>> {
    let root_keys = opts.root_keypair();
    let root_public = root_keys.public;

    let root_drive = (factory)(PartitionName::Root, root_keys).await?;
    root_drive.ready().await?;

    let partitions = PartitionSet::new(root_drive, factory);
    for name in PartitionName::MOUNTED {
        partitions.create(name, opts.partition_keys.remove(&name)).await?;
    }

    let id_bytes = opts.id.clone().unwrap_or_default();
    let cfs = Arc::new(Cfs::new(
        opts.id.clone(),
        partitions,
        key_path(&id_bytes, &root_public),
    ));
    cfs.ready().await?;

    // Subscribe the event log before provisioning so the provisioning
    // writes themselves land in the first flush.
    let log = EventLog::spawn(cfs.clone(), opts.event_flush_interval);
    cfs.install_event_log(log).await;

    if cfs.writable() {
        provision(&cfs, opts.id.as_deref(), &root_public, opts.secret_key.as_ref()).await;
        cfs.flush_events().await;
    }

    debug!(key_path = cfs.key_path(), writable = cfs.writable(), "filesystem ready");
    Ok(cfs)
}

/// Lays out the reserved tree. Each step is best effort: a failure is
/// logged and the remaining steps still run, so a partially-provisioned
/// filesystem converges on the next open.
async fn provision(cfs: &Cfs, id: Option<&[u8]>, public: &[u8; KEY_SIZE], secret: Option<&SecretKey>) {
    for dir in CFS_DIRECTORIES {
        if cfs.access(dir, AccessMode::Exists).await.is_err() {
            if let Err(err) = cfs.mkdirp(dir).await {
                warn!(dir, %err, "failed to provision directory");
            }
        }
    }
    for file in CFS_FILES {
        if cfs.access(file, AccessMode::Exists).await.is_err() {
            if let Err(err) = cfs.touch(file).await {
                warn!(file, %err, "failed to provision file");
            }
        }
    }

    if let Some(id) = id {
        if let Err(err) = write_once(cfs, CFS_ID_FILE, Bytes::copy_from_slice(id)).await {
            warn!(%err, "failed to write identity file");
        }
    }

    let epoch = Utc::now().timestamp().max(0).to_string();
    if let Err(err) = write_once(cfs, CFS_EPOCH_FILE, Bytes::from(epoch)).await {
        warn!(%err, "failed to write epoch file");
    }

    if let (Some(id), Some(secret)) = (id, secret) {
        let mut message = Vec::with_capacity(id.len() + KEY_SIZE);
        message.extend_from_slice(id);
        message.extend_from_slice(public);
        let signature = sign(secret, Hash::new(&message).as_bytes());
        if let Err(err) =
            write_once(cfs, CFS_SIGNATURE_FILE, Bytes::copy_from_slice(&signature)).await
        {
            warn!(%err, "failed to write signature file");
        }
    }
}

/// Writes `data` only when the file is currently absent or empty.
async fn write_once(cfs: &Cfs, path: &str, data: Bytes) -> FsResult<()> {
    match cfs.read_file(path).await {
        Ok(existing) if !existing.is_empty() => Ok(()),
        Ok(_) | Err(FsError::NotFound(_)) => cfs.write_file(path, data).await,
        Err(err) => Err(err),
    }
}
