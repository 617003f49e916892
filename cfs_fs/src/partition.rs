//! Partitions and the partition manager.
//!
//! A partition is a named drive plus the rule that strips its mount
//! prefix from incoming paths. The manager owns the fixed set of
//! partitions and resolves any absolute path to the partition that
//! serves it; paths under no mount prefix belong to the root partition,
//! which also holds the mount-point directory entries themselves.

use std::sync::Arc;

use cfs_core::{
    Drive, FsError, FsResult, KEY_SIZE, KeyPair,
    keys::{SecretKey, derive_keypair, partition_seed},
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, warn};

/// Closed enumeration of partition names. Unknown names are rejected at
/// creation time; resolution walks this enum, never arbitrary strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionName {
    Root,
    Etc,
    Lib,
    Tmp,
    Var,
    Home,
}

impl PartitionName {
    /// Every partition name except the implicit root.
    pub const MOUNTED: [PartitionName; 5] = [
        PartitionName::Etc,
        PartitionName::Lib,
        PartitionName::Tmp,
        PartitionName::Var,
        PartitionName::Home,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionName::Root => "root",
            PartitionName::Etc => "etc",
            PartitionName::Lib => "lib",
            PartitionName::Tmp => "tmp",
            PartitionName::Var => "var",
            PartitionName::Home => "home",
        }
    }

    /// The absolute mount path of this partition.
    pub fn mount_path(&self) -> &'static str {
        match self {
            PartitionName::Root => "/",
            PartitionName::Etc => "/etc",
            PartitionName::Lib => "/lib",
            PartitionName::Tmp => "/tmp",
            PartitionName::Var => "/var",
            PartitionName::Home => "/home",
        }
    }

    /// Parses a partition name, rejecting anything outside the closed set.
    pub fn parse(name: &str) -> FsResult<Self> {
        match name {
            "root" => Ok(PartitionName::Root),
            "etc" => Ok(PartitionName::Etc),
            "lib" => Ok(PartitionName::Lib),
            "tmp" => Ok(PartitionName::Tmp),
            "var" => Ok(PartitionName::Var),
            "home" => Ok(PartitionName::Home),
            other => Err(FsError::BadRequest(format!(
                "unknown partition name: '{other}'"
            ))),
        }
    }

    /// Maps the first path segment of an absolute path onto a mounted
    /// partition, e.g. `"etc"` for `/etc/hosts`.
    pub fn from_mount_segment(segment: &str) -> Option<Self> {
        match segment {
            "etc" => Some(PartitionName::Etc),
            "lib" => Some(PartitionName::Lib),
            "tmp" => Some(PartitionName::Tmp),
            "var" => Some(PartitionName::Var),
            "home" => Some(PartitionName::Home),
            _ => None,
        }
    }
}

impl std::fmt::Display for PartitionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named drive with its mount-prefix rewrite rule.
#[derive(Clone, Debug)]
pub struct Partition {
    name: PartitionName,
    drive: Arc<dyn Drive>,
}

impl Partition {
    pub fn new(name: PartitionName, drive: Arc<dyn Drive>) -> Self {
        Self { name, drive }
    }

    pub fn name(&self) -> PartitionName {
        self.name
    }

    pub fn drive(&self) -> &Arc<dyn Drive> {
        &self.drive
    }

    pub fn readable(&self) -> bool {
        self.drive.readable()
    }

    pub fn writable(&self) -> bool {
        self.drive.writable()
    }

    pub fn key(&self) -> [u8; KEY_SIZE] {
        self.drive.key()
    }

    /// Rewrites an absolute path to this partition's own namespace by
    /// stripping the mount prefix. Root passes paths through unchanged.
    pub fn resolve(&self, path: &str) -> String {
        if self.name == PartitionName::Root {
            return path.to_string();
        }
        match path.strip_prefix(self.name.mount_path()) {
            Some("") | None => "/".to_string(),
            Some(rest) => rest.to_string(),
        }
    }

    /// Maps a partition-relative path back into the unified path space.
    pub fn unresolve(&self, path: &str) -> String {
        if self.name == PartitionName::Root {
            return path.to_string();
        }
        if path == "/" {
            self.name.mount_path().to_string()
        } else {
            format!("{}{}", self.name.mount_path(), path)
        }
    }
}

/// Async constructor for partition drives: given the partition name and
/// its key pair, produce a ready-to-use drive instance.
pub type DriveFactory =
    Arc<dyn Fn(PartitionName, KeyPair) -> BoxFuture<'static, FsResult<Arc<dyn Drive>>> + Send + Sync>;

/// Owns the root partition and the mounted partitions, and resolves
/// paths to their owning partition.
pub struct PartitionSet {
    root: Partition,
    parts: DashMap<PartitionName, Partition>,
    factory: DriveFactory,
}

impl std::fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSet")
            .field("root", &self.root)
            .field("mounted", &self.parts.len())
            .finish()
    }
}

impl PartitionSet {
    pub fn new(root_drive: Arc<dyn Drive>, factory: DriveFactory) -> Self {
        Self {
            root: Partition::new(PartitionName::Root, root_drive),
            parts: DashMap::new(),
            factory,
        }
    }

    pub fn root(&self) -> &Partition {
        &self.root
    }

    /// Returns the partition registered under `name`, if any. Root is
    /// always present.
    pub fn get(&self, name: PartitionName) -> Option<Partition> {
        if name == PartitionName::Root {
            return Some(self.root.clone());
        }
        self.parts.get(&name).map(|p| p.clone())
    }

    /// Resolves an absolute, normalized path to its owning partition and
    /// the partition-relative rewrite of the path.
    ///
    /// The longest (only) matching mount prefix wins; everything else,
    /// including `/` itself and the bare mount-point paths of partitions
    /// that were never created, falls through to root unchanged.
    pub fn resolve(&self, path: &str) -> (Partition, String) {
        if path == "/" {
            return (self.root.clone(), path.to_string());
        }
        let first_segment = path.trim_start_matches('/').split('/').next().unwrap_or("");
        if let Some(name) = PartitionName::from_mount_segment(first_segment)
            && let Some(partition) = self.parts.get(&name)
        {
            let rewritten = partition.resolve(path);
            return (partition.clone(), rewritten);
        }
        (self.root.clone(), path.to_string())
    }

    /// Creates and registers the partition `name` if it does not exist
    /// yet; repeat calls return the cached instance.
    ///
    /// Owner instances derive the partition key pair from the root
    /// secret key, so every instance opened with the same root secret
    /// agrees on partition identities. Replica instances must supply
    /// keys explicitly.
    pub async fn create(
        &self,
        name: PartitionName,
        keys: Option<KeyPair>,
    ) -> FsResult<Partition> {
        if name == PartitionName::Root {
            return Ok(self.root.clone());
        }
        if let Some(existing) = self.parts.get(&name) {
            return Ok(existing.clone());
        }

        let keypair = match keys {
            Some(keys) => keys,
            None => match self.root.drive.secret_key() {
                Some(secret) => {
                    derive_keypair(&partition_seed(name.as_str(), &SecretKey::new(secret)))
                }
                None => {
                    // Reader instance without supplied partition keys:
                    // derive a read-only identity from the root public
                    // key so resolution still works locally.
                    warn!(partition = %name, "no partition keys supplied; deriving reader keys");
                    let derived = derive_keypair(&partition_seed(
                        name.as_str(),
                        &SecretKey::new(self.root.drive.key()),
                    ));
                    KeyPair::public_only(derived.public)
                }
            },
        };

        let drive = (self.factory)(name, keypair).await?;
        drive.ready().await?;

        // A freshly allocated drive reports an uninitialized root stat;
        // give the partition a real top-level directory entry.
        let needs_init = match drive.stat("/").await {
            Ok(stat) => stat.is_uninitialized(),
            Err(FsError::NotFound(_)) => true,
            Err(err) => return Err(err),
        };
        if needs_init && drive.writable() {
            drive.mkdir("/").await?;
        }

        // The mount point itself is a directory entry in the root
        // partition, so listings of `/` behave like a real tree.
        if self.root.writable() {
            let mount = name.mount_path();
            if self.root.drive.access(mount).await.is_err() {
                if let Err(err) = self.root.drive.mkdir(mount).await {
                    warn!(partition = %name, %err, "failed to create mount directory");
                }
            }
        }

        debug!(partition = %name, writable = drive.writable(), "partition created");
        let partition = Partition::new(name, drive);
        self.parts.insert(name, partition.clone());
        Ok(partition)
    }

    /// All mounted partitions, in enum order.
    pub fn mounted(&self) -> Vec<Partition> {
        PartitionName::MOUNTED
            .iter()
            .filter_map(|name| self.parts.get(name).map(|p| p.clone()))
            .collect()
    }
}
