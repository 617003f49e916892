//! The `Cfs` façade: one path space, one descriptor space.
//!
//! Every path-taking operation follows the same shape: normalize the
//! path against `HOME`, resolve it to the owning partition, rewrite it
//! relative to that partition, and delegate to the identically-named
//! drive operation. The façade adds descriptor bookkeeping and mode
//! checks; it never retries and never rewrites drive errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use cfs_core::{
    Drive, DriveEvent, DriveStat, FsError, FsResult, KEY_SIZE, OpenFlags, ReadOptions,
    path::normalize_path,
};
use dashmap::DashMap;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::events::EventLog;
use crate::partition::{Partition, PartitionName, PartitionSet};

/// Requested access mode for [`Cfs::access`], mirroring the classic
/// `F_OK`/`R_OK`/`W_OK`/`X_OK` constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Exists,
    Read,
    Write,
    Execute,
}

impl AccessMode {
    pub const F_OK: u32 = 0;
    pub const X_OK: u32 = 1;
    pub const W_OK: u32 = 2;
    pub const R_OK: u32 = 4;

    /// Parses a numeric mode; anything outside the known constants is a
    /// bad request.
    pub fn from_mode(mode: u32) -> FsResult<Self> {
        match mode {
            Self::F_OK => Ok(AccessMode::Exists),
            Self::X_OK => Ok(AccessMode::Execute),
            Self::W_OK => Ok(AccessMode::Write),
            Self::R_OK => Ok(AccessMode::Read),
            other => Err(FsError::BadRequest(format!("bad access mode: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FdEntry {
    partition: PartitionName,
    drive_fd: u32,
}

/// The unified virtual filesystem over a root partition and the mounted
/// partitions.
pub struct Cfs {
    identifier: Option<Bytes>,
    home: Option<String>,
    partitions: PartitionSet,
    fds: DashMap<u32, FdEntry>,
    next_fd: AtomicU32,
    event_log: Mutex<Option<EventLog>>,
    key_path: String,
}

impl std::fmt::Debug for Cfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cfs")
            .field("key_path", &self.key_path)
            .field("home", &self.home)
            .field("open_fds", &self.fds.len())
            .finish()
    }
}

impl Cfs {
    pub(crate) fn new(
        identifier: Option<Bytes>,
        partitions: PartitionSet,
        key_path: String,
    ) -> Self {
        let home = identifier
            .as_ref()
            .map(|_| PartitionName::Home.mount_path().to_string());
        Self {
            identifier,
            home,
            partitions,
            fds: DashMap::new(),
            next_fd: AtomicU32::new(1),
            event_log: Mutex::new(None),
            key_path,
        }
    }

    /// The owner identifier this filesystem was provisioned with.
    pub fn identifier(&self) -> Option<&Bytes> {
        self.identifier.as_ref()
    }

    /// Mount point of the identity-scoped partition, when one exists.
    pub fn home(&self) -> Option<&str> {
        self.home.as_deref()
    }

    /// Registry key path of this filesystem (`hash(id ++ key)`).
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    pub fn key(&self) -> [u8; KEY_SIZE] {
        self.partitions.root().key()
    }

    pub fn writable(&self) -> bool {
        self.partitions.root().writable()
    }

    pub fn readable(&self) -> bool {
        self.partitions.root().readable()
    }

    pub fn partitions(&self) -> &PartitionSet {
        &self.partitions
    }

    /// Looks up a partition by name; root always exists.
    pub fn partition(&self, name: PartitionName) -> Option<Partition> {
        self.partitions.get(name)
    }

    pub(crate) async fn install_event_log(&self, log: EventLog) {
        *self.event_log.lock().await = Some(log);
    }

    /// Pure path normalization against `HOME`. Never touches storage.
    pub fn resolve(&self, path: &str) -> FsResult<String> {
        normalize_path(path, self.home.as_deref())
    }

    fn resolve_partition(&self, path: &str) -> FsResult<(Partition, String)> {
        let absolute = self.resolve(path)?;
        Ok(self.partitions.resolve(&absolute))
    }

    /// The partition that `history`/`replicate`/`update` default to: the
    /// identity-scoped home partition when present, root otherwise.
    fn default_partition(&self) -> Partition {
        if self.home.is_some()
            && let Some(home) = self.partitions.get(PartitionName::Home)
        {
            return home;
        }
        self.partitions.root().clone()
    }

    /// Resolves once every partition's drive reports ready.
    pub async fn ready(&self) -> FsResult<()> {
        self.partitions.root().drive().ready().await?;
        for partition in self.partitions.mounted() {
            partition.drive().ready().await?;
        }
        Ok(())
    }

    /// Opens `path` with the given flags and returns a positive file
    /// descriptor owned by this filesystem.
    pub async fn open(&self, path: &str, flags: OpenFlags) -> FsResult<u32> {
        let (partition, rel) = self.resolve_partition(path)?;
        if !partition.readable() {
            return Err(FsError::AccessDenied("not readable".into()));
        }

        if !flags.readonly {
            if !partition.writable() {
                return Err(FsError::AccessDenied("not writable".into()));
            }
            let exists = partition.drive().access(&rel).await.is_ok();
            if flags.exclusive && exists {
                return Err(FsError::AccessDenied(format!("file exists: '{path}'")));
            }
            if !exists {
                if flags.create_if_not_exists || flags.exclusive {
                    partition.drive().touch(&rel).await?;
                } else {
                    return Err(FsError::NotFound(path.to_string()));
                }
            }
            if flags.truncate_file {
                partition.drive().write_file(&rel, Bytes::new()).await?;
            }
        }

        let drive_fd = partition.drive().open(&rel).await?;
        if drive_fd == 0 {
            return Err(FsError::AccessDenied(format!("cannot open: '{path}'")));
        }
        let fd = self.next_fd.fetch_add(1, Ordering::AcqRel);
        self.fds.insert(
            fd,
            FdEntry {
                partition: partition.name(),
                drive_fd,
            },
        );
        debug!(fd, path, partition = %partition.name(), "open");
        Ok(fd)
    }

    fn fd_entry(&self, fd: u32) -> FsResult<FdEntry> {
        if fd == 0 {
            return Err(FsError::NotOpened("bad file descriptor".into()));
        }
        self.fds
            .get(&fd)
            .map(|e| *e)
            .ok_or_else(|| FsError::NotOpened(format!("fd {fd}")))
    }

    /// True if `fd` is a live descriptor of this filesystem.
    pub fn is_opened(&self, fd: u32) -> bool {
        self.fds.contains_key(&fd)
    }

    /// Reads from an open descriptor, routed to the partition that
    /// opened it.
    pub async fn read(&self, fd: u32, opts: ReadOptions) -> FsResult<Bytes> {
        let entry = self.fd_entry(fd)?;
        let partition = self
            .partitions
            .get(entry.partition)
            .ok_or_else(|| FsError::NotOpened(format!("fd {fd}")))?;
        partition.drive().read(entry.drive_fd, opts).await
    }

    /// Closes one descriptor.
    pub async fn close(&self, fd: u32) -> FsResult<()> {
        let entry = self.fd_entry(fd)?;
        let partition = self
            .partitions
            .get(entry.partition)
            .ok_or_else(|| FsError::NotOpened(format!("fd {fd}")))?;
        partition.drive().close_fd(entry.drive_fd).await?;
        self.fds.remove(&fd);
        Ok(())
    }

    /// Closes the entire filesystem: flushes the event log, then closes
    /// every partition and finally the root, strictly one at a time.
    /// Individual close failures are logged, never propagated, so the
    /// remaining partitions still shut down.
    pub async fn close_all(&self) {
        if let Some(log) = self.event_log.lock().await.take() {
            log.flush().await;
            log.shutdown().await;
        }
        self.fds.clear();
        for partition in self.partitions.mounted() {
            if let Err(err) = partition.drive().close().await {
                warn!(partition = %partition.name(), %err, "partition close failed");
            }
        }
        if let Err(err) = self.partitions.root().drive().close().await {
            warn!(%err, "root close failed");
        }
    }

    /// Stats a path. A partition's own mount point is served from the
    /// root partition when root is writable, so mount points behave as
    /// real directory entries.
    pub async fn stat(&self, path: &str) -> FsResult<DriveStat> {
        let absolute = self.resolve(path)?;
        if self.is_mount_point(&absolute) && self.partitions.root().writable() {
            return self.partitions.root().drive().stat(&absolute).await;
        }
        let (partition, rel) = self.partitions.resolve(&absolute);
        partition.drive().stat(&rel).await
    }

    pub async fn lstat(&self, path: &str) -> FsResult<DriveStat> {
        let absolute = self.resolve(path)?;
        if self.is_mount_point(&absolute) && self.partitions.root().writable() {
            return self.partitions.root().drive().lstat(&absolute).await;
        }
        let (partition, rel) = self.partitions.resolve(&absolute);
        partition.drive().lstat(&rel).await
    }

    fn is_mount_point(&self, absolute: &str) -> bool {
        PartitionName::MOUNTED
            .iter()
            .any(|name| name.mount_path() == absolute)
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().mkdir(&rel).await
    }

    /// Creates a directory and any missing ancestors.
    pub async fn mkdirp(&self, path: &str) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        let drive = partition.drive();
        let mut current = String::new();
        for segment in rel.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if drive.access(&current).await.is_err() {
                drive.mkdir(&current).await?;
            }
        }
        if current.is_empty() && drive.access("/").await.is_err() {
            drive.mkdir("/").await?;
        }
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().rmdir(&rel).await
    }

    /// Recursively removes a file or directory tree.
    pub async fn rimraf(&self, path: &str) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        rimraf_inner(partition.drive().clone(), rel).await
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().unlink(&rel).await
    }

    pub async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().readdir(&rel).await
    }

    pub async fn touch(&self, path: &str) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().touch(&rel).await
    }

    pub async fn read_file(&self, path: &str) -> FsResult<Bytes> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().read_file(&rel).await
    }

    pub async fn write_file(&self, path: &str, data: impl Into<Bytes>) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().write_file(&rel, data.into()).await
    }

    /// Opens a streaming reader over the file at `path`, routed to the
    /// owning partition.
    pub async fn create_read_stream(&self, path: &str) -> FsResult<DuplexStream> {
        let (partition, rel) = self.resolve_partition(path)?;
        if !partition.readable() {
            return Err(FsError::AccessDenied("not readable".into()));
        }
        partition.drive().create_read_stream(&rel).await
    }

    /// Opens a streaming writer whose contents replace `path` when the
    /// writer shuts down.
    pub async fn create_write_stream(&self, path: &str) -> FsResult<DuplexStream> {
        let (partition, rel) = self.resolve_partition(path)?;
        if !partition.writable() {
            return Err(FsError::AccessDenied("not writable".into()));
        }
        partition.drive().create_write_stream(&rel).await
    }

    /// Validates the requested mode against the partition's capabilities
    /// before delegating the existence check. `X_OK` is never supported.
    pub async fn access(&self, path: &str, mode: AccessMode) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        match mode {
            AccessMode::Execute => {
                return Err(FsError::NotSupported("execute access".into()));
            }
            AccessMode::Write => {
                if !partition.writable() {
                    return Err(FsError::AccessDenied("not writable".into()));
                }
            }
            AccessMode::Read => {
                if !partition.readable() {
                    return Err(FsError::AccessDenied("not readable".into()));
                }
            }
            AccessMode::Exists => {}
        }
        partition.drive().access(&rel).await
    }

    pub async fn download(&self, path: &str) -> FsResult<()> {
        let (partition, rel) = self.resolve_partition(path)?;
        partition.drive().download(&rel).await
    }

    /// Subscribes to a partition's history stream; defaults to the
    /// identity-scoped partition.
    pub fn history(&self, name: Option<PartitionName>) -> FsResult<broadcast::Receiver<DriveEvent>> {
        let partition = match name {
            Some(name) => self
                .partitions
                .get(name)
                .ok_or_else(|| FsError::NotFound(format!("partition '{name}'")))?,
            None => self.default_partition(),
        };
        Ok(partition.drive().history())
    }

    /// Opens a replication stream for a partition; defaults to the
    /// identity-scoped partition.
    pub async fn replicate(&self, name: Option<PartitionName>) -> FsResult<DuplexStream> {
        let partition = match name {
            Some(name) => self
                .partitions
                .get(name)
                .ok_or_else(|| FsError::NotFound(format!("partition '{name}'")))?,
            None => self.default_partition(),
        };
        partition.drive().replicate().await
    }

    /// Waits for the next remote update on a partition; defaults to the
    /// identity-scoped partition.
    pub async fn update(&self, name: Option<PartitionName>) -> FsResult<()> {
        let partition = match name {
            Some(name) => self
                .partitions
                .get(name)
                .ok_or_else(|| FsError::NotFound(format!("partition '{name}'")))?,
            None => self.default_partition(),
        };
        partition.drive().update().await
    }

    /// Flushes any buffered event-log records immediately.
    pub async fn flush_events(&self) {
        if let Some(log) = self.event_log.lock().await.as_ref() {
            log.flush().await;
        }
    }
}

fn rimraf_inner(
    drive: Arc<dyn Drive>,
    path: String,
) -> futures::future::BoxFuture<'static, FsResult<()>> {
    Box::pin(async move {
        let stat = drive.stat(&path).await?;
        if !stat.is_directory {
            return drive.unlink(&path).await;
        }
        for entry in drive.readdir(&path).await? {
            let child = if path == "/" {
                format!("/{entry}")
            } else {
                format!("{path}/{entry}")
            };
            rimraf_inner(drive.clone(), child).await?;
        }
        if path == "/" {
            Ok(())
        } else {
            drive.rmdir(&path).await
        }
    })
}
