//! The replicated-log ("drive") interface.
//!
//! A drive is a per-partition durable, versioned, append-only byte store.
//! The virtual filesystem consumes this trait and never assumes anything
//! about the backend beyond what is declared here; replication transports
//! and storage engines live behind it.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;

use crate::{FsError, FsResult, KEY_SIZE, keys::discovery_key};

/// Metadata for a single drive entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriveStat {
    pub size: u64,
    pub mode: u32,
    pub is_directory: bool,
    /// Seconds since the epoch; zero means the entry was never written.
    pub mtime: u64,
    pub ctime: u64,
}

impl DriveStat {
    /// A freshly written entry never has zero timestamps; a zeroed stat
    /// marks a drive root that was allocated but never initialized.
    pub fn is_uninitialized(&self) -> bool {
        self.mtime == 0 && self.ctime == 0
    }
}

/// Kind of change recorded in a drive's history stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveEventKind {
    Put,
    Del,
    Mkdir,
    Rmdir,
}

impl DriveEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveEventKind::Put => "put",
            DriveEventKind::Del => "del",
            DriveEventKind::Mkdir => "mkdir",
            DriveEventKind::Rmdir => "rmdir",
        }
    }
}

/// One entry of a drive's append-only history.
#[derive(Clone, Debug)]
pub struct DriveEvent {
    pub kind: DriveEventKind,
    pub path: String,
}

/// Byte-range options for [`Drive::read`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub offset: Option<u64>,
    pub length: Option<u64>,
}

/// Parsed open-flag string (`r`, `r+`, `w`, `wx`, `a+`, ...).
///
/// The grammar matches the classic `fs.open` flag strings:
///
/// | flags          | readonly | create_if_not_exists | truncate_file |
/// |----------------|----------|----------------------|---------------|
/// | `r`            | yes      | no                   | no            |
/// | `r+`           | no       | no                   | no            |
/// | `w`, `w+`      | no       | yes                  | yes           |
/// | `wx`, `wx+`    | no       | no                   | yes           |
/// | `a`, `a+`      | no       | yes                  | no            |
/// | `ax`, `ax+`    | no       | no                   | no            |
///
/// Anything else is rejected with [`FsError::BadRequest`]. With an `x`
/// modifier the open fails when the path already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    pub readonly: bool,
    pub create_if_not_exists: bool,
    pub truncate_file: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    /// Read-only open (`"r"`).
    pub fn read() -> Self {
        Self {
            readonly: true,
            create_if_not_exists: false,
            truncate_file: false,
            exclusive: false,
        }
    }

    /// Write open with create + truncate (`"w+"`).
    pub fn write() -> Self {
        Self {
            readonly: false,
            create_if_not_exists: true,
            truncate_file: true,
            exclusive: false,
        }
    }

    /// Parses a flag string against the grammar above.
    pub fn parse(flags: &str) -> FsResult<Self> {
        let bad = || FsError::BadRequest(format!("bad flags: '{flags}'"));
        match flags {
            "r" => Ok(Self::read()),
            "r+" => Ok(Self {
                readonly: false,
                create_if_not_exists: false,
                truncate_file: false,
                exclusive: false,
            }),
            "w" | "w+" => Ok(Self::write()),
            "wx" | "wx+" => Ok(Self {
                readonly: false,
                create_if_not_exists: false,
                truncate_file: true,
                exclusive: true,
            }),
            "a" | "a+" => Ok(Self {
                readonly: false,
                create_if_not_exists: true,
                truncate_file: false,
                exclusive: false,
            }),
            "ax" | "ax+" => Ok(Self {
                readonly: false,
                create_if_not_exists: false,
                truncate_file: false,
                exclusive: true,
            }),
            "" => Err(FsError::BadRequest("expecting open flags".into())),
            _ => Err(bad()),
        }
    }
}

/// Interface of a replicated append-only drive.
///
/// Implementations must be safe for concurrent use; the virtual
/// filesystem calls into one drive from many operations at once.
#[async_trait]
pub trait Drive: Send + Sync + std::fmt::Debug {
    /// Resolves once the drive has loaded its keys and is usable.
    async fn ready(&self) -> FsResult<()>;

    /// The drive's public key.
    fn key(&self) -> [u8; KEY_SIZE];

    /// The drive's secret key, when this instance holds write capability.
    fn secret_key(&self) -> Option<[u8; KEY_SIZE]>;

    /// Public value used by peers to locate this drive's swarm.
    fn discovery_key(&self) -> [u8; KEY_SIZE] {
        discovery_key(&self.key())
    }

    fn writable(&self) -> bool;

    fn readable(&self) -> bool;

    /// Monotonic version counter, bumped on every mutation.
    fn version(&self) -> u64;

    /// Opens `path` for reading, returning a positive file descriptor.
    async fn open(&self, path: &str) -> FsResult<u32>;

    /// Releases a descriptor returned by [`Drive::open`].
    async fn close_fd(&self, fd: u32) -> FsResult<()>;

    /// Reads a byte range from an open descriptor.
    async fn read(&self, fd: u32, opts: ReadOptions) -> FsResult<Bytes>;

    async fn stat(&self, path: &str) -> FsResult<DriveStat>;

    async fn lstat(&self, path: &str) -> FsResult<DriveStat>;

    async fn mkdir(&self, path: &str) -> FsResult<()>;

    async fn rmdir(&self, path: &str) -> FsResult<()>;

    async fn unlink(&self, path: &str) -> FsResult<()>;

    async fn readdir(&self, path: &str) -> FsResult<Vec<String>>;

    /// Existence check; `Ok(())` iff the path exists.
    async fn access(&self, path: &str) -> FsResult<()>;

    async fn read_file(&self, path: &str) -> FsResult<Bytes>;

    async fn write_file(&self, path: &str, data: Bytes) -> FsResult<()>;

    /// Opens a byte stream over the contents of the file at `path`.
    async fn create_read_stream(&self, path: &str) -> FsResult<DuplexStream>;

    /// Opens a byte stream whose contents replace `path` once the
    /// writer shuts down.
    async fn create_write_stream(&self, path: &str) -> FsResult<DuplexStream>;

    /// Creates an empty file at `path` if nothing exists there.
    async fn touch(&self, path: &str) -> FsResult<()> {
        if self.access(path).await.is_err() {
            self.write_file(path, Bytes::new()).await?;
        }
        Ok(())
    }

    /// Ensures the byte ranges behind `path` are locally available.
    async fn download(&self, path: &str) -> FsResult<()>;

    /// Subscribes to the drive's history event stream.
    fn history(&self) -> broadcast::Receiver<DriveEvent>;

    /// Opens a replication byte stream for this drive.
    async fn replicate(&self) -> FsResult<DuplexStream>;

    /// Waits for the next remote update, if any.
    async fn update(&self) -> FsResult<()>;

    async fn close(&self) -> FsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flag_grammar() {
        let w = OpenFlags::parse("w+").unwrap();
        assert!(!w.readonly && w.create_if_not_exists && w.truncate_file);

        let r = OpenFlags::parse("r").unwrap();
        assert!(r.readonly && !r.create_if_not_exists && !r.truncate_file);

        let rp = OpenFlags::parse("r+").unwrap();
        assert!(!rp.readonly && !rp.truncate_file);

        let wx = OpenFlags::parse("wx").unwrap();
        assert!(wx.exclusive && wx.truncate_file && !wx.create_if_not_exists);

        let a = OpenFlags::parse("a+").unwrap();
        assert!(a.create_if_not_exists && !a.truncate_file);

        for bad in ["", "z", "rw", "r++", "wxx", "a+x", "x"] {
            assert!(OpenFlags::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn uninitialized_stat() {
        assert!(DriveStat::default().is_uninitialized());
        let live = DriveStat {
            mtime: 1,
            ..Default::default()
        };
        assert!(!live.is_uninitialized());
    }
}
