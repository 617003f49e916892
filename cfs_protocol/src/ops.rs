//! The operation dispatch table.
//!
//! Each handler decodes its typed payload, validates required fields,
//! calls exactly one virtual-filesystem method, and encodes the typed
//! result. Handler failures become `(code, message)` pairs in the
//! response; they never tear down the connection.

use cfs_core::{FsError, FsResult, OpenFlags, ReadOptions, keys::derive_keypair};
use cfs_fs::{AccessMode, Cfs};
use tracing::debug;

use crate::message::{
    AccessOp, CloseOp, ListResult, KeyPairResult, NumberResult, OpenOp, Operation, PathOp, ReadOp,
    SeedOp, StatResult, StringResult, WriteFileOp,
};

fn decode<'b, T: minicbor::Decode<'b, ()>>(buffer: &'b [u8]) -> FsResult<T> {
    minicbor::decode(buffer).map_err(|err| FsError::BadRequest(format!("bad payload: {err}")))
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> FsResult<Vec<u8>> {
    minicbor::to_vec(value).map_err(|err| FsError::Internal(format!("encode: {err}")))
}

fn require_path(path: &str) -> FsResult<()> {
    if path.is_empty() {
        return Err(FsError::BadRequest("bad file path".into()));
    }
    Ok(())
}

/// The filesystem a path operation targets; absent when the request
/// named no registered drive.
fn require(cfs: Option<&Cfs>) -> FsResult<&Cfs> {
    cfs.ok_or_else(|| FsError::NotFound("filesystem not registered".into()))
}

/// Runs one decoded operation against a filesystem.
///
/// `Write` and `DownloadDirectory` sit in the table without a handler
/// and report `NotImplemented`. `NoOperation` and `KeyPair` never touch
/// a filesystem.
pub async fn dispatch(operation: Operation, cfs: Option<&Cfs>, buffer: &[u8]) -> FsResult<Vec<u8>> {
    debug!(operation = operation.name(), "dispatch");
    match operation {
        Operation::NoOperation => Ok(Vec::new()),
        Operation::AccessFile => access_file(require(cfs)?, buffer).await,
        Operation::Close => close(require(cfs)?, buffer).await,
        Operation::DownloadFile => download_file(require(cfs)?, buffer).await,
        Operation::KeyPair => key_pair(buffer),
        Operation::ListDirectory => list_directory(require(cfs)?, buffer).await,
        Operation::MakeDirectory => make_directory(require(cfs)?, buffer).await,
        Operation::MakeDirectoryPath => make_directory_path(require(cfs)?, buffer).await,
        Operation::Open => open(require(cfs)?, buffer).await,
        Operation::Read => read(require(cfs)?, buffer).await,
        Operation::ReadFile => read_file(require(cfs)?, buffer).await,
        Operation::RemoveDirectory => remove_directory(require(cfs)?, buffer).await,
        Operation::RemoveDirectoryPath => remove_directory_path(require(cfs)?, buffer).await,
        Operation::Resolve => resolve(require(cfs)?, buffer),
        Operation::StatFile => stat_file(require(cfs)?, buffer).await,
        Operation::TouchFile => touch_file(require(cfs)?, buffer).await,
        Operation::UnlinkFile => unlink_file(require(cfs)?, buffer).await,
        Operation::Write | Operation::DownloadDirectory => Err(FsError::NotImplemented(
            format!("not implemented: {}", operation.name()),
        )),
        Operation::WriteFile => write_file(require(cfs)?, buffer).await,
    }
}

async fn access_file(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: AccessOp = decode(buffer)?;
    require_path(&op.path)?;
    let mode = AccessMode::from_mode(op.mode)?;
    cfs.access(&op.path, mode).await?;
    Ok(Vec::new())
}

async fn close(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: CloseOp = decode(buffer)?;
    if op.fd == 0 {
        return Err(FsError::BadRequest("bad file descriptor".into()));
    }
    if !cfs.is_opened(op.fd) {
        return Err(FsError::NotOpened("file descriptor not opened".into()));
    }
    cfs.close(op.fd).await?;
    Ok(Vec::new())
}

async fn download_file(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.download(&op.path).await?;
    Ok(Vec::new())
}

fn key_pair(buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: SeedOp = decode(buffer)?;
    let pair = derive_keypair(&op.seed);
    encode(&KeyPairResult {
        public: pair.public.to_vec(),
        secret: pair
            .secret
            .as_ref()
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default(),
        seed: op.seed,
    })
}

async fn list_directory(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    let stat = cfs.stat(&op.path).await?;
    if !stat.is_directory {
        return Err(FsError::BadRequest(format!(
            "not a directory: '{}'",
            op.path
        )));
    }
    let values = cfs.readdir(&op.path).await?;
    encode(&ListResult { values })
}

async fn make_directory(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.mkdir(&op.path).await?;
    Ok(Vec::new())
}

async fn make_directory_path(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.mkdirp(&op.path).await?;
    Ok(Vec::new())
}

async fn open(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: OpenOp = decode(buffer)?;
    require_path(&op.path)?;
    let flags = OpenFlags::parse(&op.flags)?;
    let fd = cfs.open(&op.path, flags).await?;
    encode(&NumberResult { value: fd as u64 })
}

async fn read(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: ReadOp = decode(buffer)?;
    // Descriptors are positive on the wire; zero is the invalid value.
    if op.fd == 0 {
        return Err(FsError::BadRequest("bad file descriptor".into()));
    }
    if !cfs.is_opened(op.fd) {
        return Err(FsError::NotOpened("file descriptor not opened".into()));
    }
    let data = cfs
        .read(
            op.fd,
            ReadOptions {
                offset: op.offset,
                length: op.length,
            },
        )
        .await?;
    Ok(data.to_vec())
}

async fn read_file(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.access(&op.path, AccessMode::Exists).await?;
    let data = cfs.read_file(&op.path).await?;
    Ok(data.to_vec())
}

async fn remove_directory(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.rmdir(&op.path).await?;
    Ok(Vec::new())
}

async fn remove_directory_path(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.rimraf(&op.path).await?;
    Ok(Vec::new())
}

fn resolve(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    let value = cfs.resolve(&op.path)?;
    encode(&StringResult { value })
}

async fn stat_file(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    let stat = cfs.stat(&op.path).await?;
    encode(&StatResult::from(stat))
}

async fn touch_file(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.touch(&op.path).await?;
    Ok(Vec::new())
}

async fn unlink_file(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: PathOp = decode(buffer)?;
    require_path(&op.path)?;
    cfs.unlink(&op.path).await?;
    Ok(Vec::new())
}

async fn write_file(cfs: &Cfs, buffer: &[u8]) -> FsResult<Vec<u8>> {
    let op: WriteFileOp = decode(buffer)?;
    require_path(&op.path)?;
    if !cfs.writable() {
        return Err(FsError::AccessDenied("not writable".into()));
    }
    cfs.write_file(&op.path, op.buffer).await?;
    Ok(Vec::new())
}
