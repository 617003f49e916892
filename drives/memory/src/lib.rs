//! In-process [`Drive`] backend.
//!
//! `MemoryDrive` implements the full drive contract against a concurrent
//! map: directory semantics, file descriptors, a history broadcast and a
//! loopback replication stream. It backs tests and local (non-replicated)
//! filesystems; a networked backend would sit behind the same trait.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tracing::debug;

use cfs_core::{
    Drive, DriveEvent, DriveEventKind, DriveStat, FsError, FsResult, KEY_SIZE, KeyPair,
    ReadOptions, keys::SecretKey,
};

const HISTORY_CAPACITY: usize = 256;
const REPLICATION_BUFFER: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct Node {
    /// `None` marks a directory.
    data: Option<Bytes>,
    mtime: u64,
    ctime: u64,
}

impl Node {
    fn dir(now: u64) -> Self {
        Self {
            data: None,
            mtime: now,
            ctime: now,
        }
    }

    fn is_directory(&self) -> bool {
        self.data.is_none()
    }
}

/// A [`Drive`] held entirely in memory.
///
/// The node map, version counter, and event channel are shared so that
/// detached stream tasks can commit after the drive handle moved on.
pub struct MemoryDrive {
    keypair: KeyPair,
    nodes: Arc<DashMap<String, Node>>,
    fds: DashMap<u32, String>,
    next_fd: AtomicU32,
    version: Arc<AtomicU64>,
    closed: AtomicBool,
    events: broadcast::Sender<DriveEvent>,
}

impl std::fmt::Debug for MemoryDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDrive")
            .field("key", &hex_prefix(&self.keypair.public))
            .field("entries", &self.nodes.len())
            .finish()
    }
}

fn hex_prefix(key: &[u8; KEY_SIZE]) -> String {
    key[..4].iter().map(|b| format!("{b:02x}")).collect()
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Stores `data` at `path`, preserving the creation time of an existing
/// entry, and records the mutation. Shared by `write_file` and the
/// write-stream commit task.
fn put_node(
    nodes: &DashMap<String, Node>,
    version: &AtomicU64,
    events: &broadcast::Sender<DriveEvent>,
    path: &str,
    data: Bytes,
) {
    let now = now_seconds();
    let ctime = nodes
        .get(path)
        .map(|node| node.ctime)
        .filter(|c| *c != 0)
        .unwrap_or(now);
    nodes.insert(
        path.to_string(),
        Node {
            data: Some(data),
            mtime: now,
            ctime,
        },
    );
    version.fetch_add(1, Ordering::AcqRel);
    let _ = events.send(DriveEvent {
        kind: DriveEventKind::Put,
        path: path.to_string(),
    });
}

impl MemoryDrive {
    /// Creates an empty drive owned by `keypair`.
    ///
    /// The root entry exists but carries zero timestamps, matching the
    /// uninitialized state of a freshly allocated replicated log.
    pub fn new(keypair: KeyPair) -> Self {
        let (events, _) = broadcast::channel(HISTORY_CAPACITY);
        let nodes = Arc::new(DashMap::new());
        nodes.insert(
            "/".to_string(),
            Node {
                data: None,
                mtime: 0,
                ctime: 0,
            },
        );
        Self {
            keypair,
            nodes,
            fds: DashMap::new(),
            next_fd: AtomicU32::new(1),
            version: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            events,
        }
    }

    fn ensure_open(&self) -> FsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::NotOpened("drive closed".into()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> FsResult<()> {
        if !self.writable() {
            return Err(FsError::AccessDenied("drive is not writable".into()));
        }
        Ok(())
    }

    fn emit(&self, kind: DriveEventKind, path: &str) {
        self.version.fetch_add(1, Ordering::AcqRel);
        let _ = self.events.send(DriveEvent {
            kind,
            path: path.to_string(),
        });
    }

    /// Implicitly creates missing parent directories of `path`.
    fn ensure_parents(&self, path: &str) {
        let mut missing = Vec::new();
        let mut cursor = path;
        while let Some(parent) = parent_of(cursor) {
            if self.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            cursor = parent;
        }
        let now = now_seconds();
        for dir in missing.into_iter().rev() {
            self.nodes.insert(dir.clone(), Node::dir(now));
            self.emit(DriveEventKind::Mkdir, &dir);
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .iter()
            .any(|entry| entry.key() != path && entry.key().starts_with(&prefix))
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    async fn ready(&self) -> FsResult<()> {
        self.ensure_open()
    }

    fn key(&self) -> [u8; KEY_SIZE] {
        self.keypair.public
    }

    fn secret_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.keypair.secret.as_ref().map(|s| *s.as_bytes())
    }

    fn writable(&self) -> bool {
        self.keypair.writable()
    }

    fn readable(&self) -> bool {
        true
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    async fn open(&self, path: &str) -> FsResult<u32> {
        self.ensure_open()?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.is_directory() {
            return Err(FsError::BadRequest(format!("not a file: '{path}'")));
        }
        drop(node);
        let fd = self.next_fd.fetch_add(1, Ordering::AcqRel);
        self.fds.insert(fd, path.to_string());
        debug!(fd, path, "memory drive open");
        Ok(fd)
    }

    async fn close_fd(&self, fd: u32) -> FsResult<()> {
        self.fds
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| FsError::NotOpened(format!("fd {fd}")))
    }

    async fn read(&self, fd: u32, opts: ReadOptions) -> FsResult<Bytes> {
        self.ensure_open()?;
        let path = self
            .fds
            .get(&fd)
            .map(|p| p.clone())
            .ok_or_else(|| FsError::NotOpened(format!("fd {fd}")))?;
        let node = self
            .nodes
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        let data = node
            .data
            .clone()
            .ok_or_else(|| FsError::BadRequest(format!("not a file: '{path}'")))?;
        let start = opts.offset.unwrap_or(0).min(data.len() as u64) as usize;
        let end = match opts.length {
            Some(len) => (start as u64 + len).min(data.len() as u64) as usize,
            None => data.len(),
        };
        Ok(data.slice(start..end))
    }

    async fn stat(&self, path: &str) -> FsResult<DriveStat> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(DriveStat {
            size: node.data.as_ref().map(|d| d.len() as u64).unwrap_or(0),
            mode: if node.is_directory() { 0o755 } else { 0o644 },
            is_directory: node.is_directory(),
            mtime: node.mtime,
            ctime: node.ctime,
        })
    }

    async fn lstat(&self, path: &str) -> FsResult<DriveStat> {
        // No symlinks in a memory drive.
        self.stat(path).await
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let now = now_seconds();
        if let Some(mut existing) = self.nodes.get_mut(path) {
            if !existing.is_directory() {
                return Err(FsError::BadRequest(format!("not a directory: '{path}'")));
            }
            // Repairing an uninitialized root stat is allowed; everything
            // else is a duplicate create.
            if existing.mtime == 0 && existing.ctime == 0 {
                existing.mtime = now;
                existing.ctime = now;
                drop(existing);
                self.emit(DriveEventKind::Mkdir, path);
                return Ok(());
            }
            return Err(FsError::BadRequest(format!("already exists: '{path}'")));
        }
        if let Some(parent) = parent_of(path)
            && !self.nodes.contains_key(parent)
        {
            return Err(FsError::NotFound(format!("no parent for '{path}'")));
        }
        self.nodes.insert(path.to_string(), Node::dir(now));
        self.emit(DriveEventKind::Mkdir, path);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        if path == "/" {
            return Err(FsError::BadRequest("cannot remove root".into()));
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !node.is_directory() {
            return Err(FsError::BadRequest(format!("not a directory: '{path}'")));
        }
        drop(node);
        if self.has_children(path) {
            return Err(FsError::BadRequest(format!(
                "directory is not empty: '{path}'"
            )));
        }
        self.nodes.remove(path);
        self.emit(DriveEventKind::Rmdir, path);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.is_directory() {
            return Err(FsError::BadRequest(format!("is a directory: '{path}'")));
        }
        drop(node);
        self.nodes.remove(path);
        self.emit(DriveEventKind::Del, path);
        Ok(())
    }

    async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !node.is_directory() {
            return Err(FsError::BadRequest(format!("not a directory: '{path}'")));
        }
        drop(node);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut entries: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|entry| {
                let key = entry.key();
                let rest = key.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    async fn access(&self, path: &str) -> FsResult<()> {
        if self.nodes.contains_key(path) {
            Ok(())
        } else {
            Err(FsError::NotFound(path.to_string()))
        }
    }

    async fn read_file(&self, path: &str) -> FsResult<Bytes> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        node.data
            .clone()
            .ok_or_else(|| FsError::BadRequest(format!("is a directory: '{path}'")))
    }

    async fn write_file(&self, path: &str, data: Bytes) -> FsResult<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        if let Some(existing) = self.nodes.get(path)
            && existing.is_directory()
        {
            return Err(FsError::BadRequest(format!("is a directory: '{path}'")));
        }
        self.ensure_parents(path);
        put_node(&self.nodes, &self.version, &self.events, path, data);
        Ok(())
    }

    async fn create_read_stream(&self, path: &str) -> FsResult<DuplexStream> {
        self.ensure_open()?;
        let data = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?
            .data
            .clone()
            .ok_or_else(|| FsError::BadRequest(format!("is a directory: '{path}'")))?;
        let (near, mut far) = tokio::io::duplex(REPLICATION_BUFFER);
        tokio::spawn(async move {
            let _ = far.write_all(&data).await;
            let _ = far.shutdown().await;
        });
        Ok(near)
    }

    async fn create_write_stream(&self, path: &str) -> FsResult<DuplexStream> {
        self.ensure_open()?;
        self.ensure_writable()?;
        if let Some(existing) = self.nodes.get(path)
            && existing.is_directory()
        {
            return Err(FsError::BadRequest(format!("is a directory: '{path}'")));
        }
        // Parents exist as soon as the handle is granted; the file
        // itself appears only when the writer shuts down cleanly.
        self.ensure_parents(path);
        let (near, mut far) = tokio::io::duplex(REPLICATION_BUFFER);
        let nodes = self.nodes.clone();
        let version = self.version.clone();
        let events = self.events.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let mut data = Vec::new();
            if far.read_to_end(&mut data).await.is_ok() {
                put_node(&nodes, &version, &events, &path, Bytes::from(data));
            }
        });
        Ok(near)
    }

    async fn download(&self, _path: &str) -> FsResult<()> {
        // Everything is already local.
        Ok(())
    }

    fn history(&self) -> broadcast::Receiver<DriveEvent> {
        self.events.subscribe()
    }

    async fn replicate(&self) -> FsResult<DuplexStream> {
        self.ensure_open()?;
        let (near, far) = tokio::io::duplex(REPLICATION_BUFFER);
        // Loopback peer: echo whatever the caller feeds in. A networked
        // backend would splice this with its wire replication stream.
        tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut rx, &mut tx).await;
        });
        Ok(near)
    }

    async fn update(&self) -> FsResult<()> {
        // No remote peers to wait on.
        Ok(())
    }

    async fn close(&self) -> FsResult<()> {
        self.closed.store(true, Ordering::Release);
        self.fds.clear();
        Ok(())
    }
}
