//! Typed TCP client for a remote CFS.

use bytes::BytesMut;
use cfs_core::{DriveStat, KEY_SIZE};
use cfs_protocol::message::{
    AccessOp, CloseOp, KeyPairResult, ListResult, NumberResult, OpenOp, PathOp, ReadOp, SeedOp,
    StatResult, StringResult, WriteFileOp,
};
use cfs_protocol::{
    ClientSession, DriveRef, FrameCodec, Operation, ProtocolClient, ProtocolResult, handshake,
};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

/// Operation client bound to one remote filesystem.
///
/// Every method is one request/response round trip; calls may run
/// concurrently over the same connection.
#[derive(Debug)]
pub struct CfsClient {
    client: ProtocolClient,
    drive: DriveRef,
}

impl CfsClient {
    /// Connects, performs the handshake, and binds the client to the
    /// filesystem identified by `(id, key)`.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        id: impl Into<Vec<u8>>,
        key: [u8; KEY_SIZE],
    ) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, FrameCodec::new());
        handshake(&mut framed).await?;
        Ok(Self {
            client: ProtocolClient::spawn(framed),
            drive: DriveRef {
                id: id.into(),
                key: key.to_vec(),
                secret_key: Vec::new(),
            },
        })
    }

    async fn call(&self, operation: Operation, buffer: Vec<u8>) -> ProtocolResult<Vec<u8>> {
        self.client
            .call(operation, Some(self.drive.clone()), buffer)
            .await
    }

    async fn path_op(&self, operation: Operation, path: &str) -> ProtocolResult<Vec<u8>> {
        self.call(operation, minicbor::to_vec(PathOp { path: path.into() })?)
            .await
    }

    pub async fn noop(&self) -> ProtocolResult<()> {
        self.client
            .call(Operation::NoOperation, None, Vec::new())
            .await?;
        Ok(())
    }

    pub async fn stat_file(&self, path: &str) -> ProtocolResult<DriveStat> {
        let buffer = self.path_op(Operation::StatFile, path).await?;
        let stat: StatResult = minicbor::decode(&buffer)?;
        Ok(stat.into())
    }

    pub async fn access_file(&self, path: &str, mode: u32) -> ProtocolResult<()> {
        self.call(
            Operation::AccessFile,
            minicbor::to_vec(AccessOp {
                path: path.into(),
                mode,
            })?,
        )
        .await?;
        Ok(())
    }

    pub async fn resolve(&self, path: &str) -> ProtocolResult<String> {
        let buffer = self.path_op(Operation::Resolve, path).await?;
        let resolved: StringResult = minicbor::decode(&buffer)?;
        Ok(resolved.value)
    }

    pub async fn open(&self, path: &str, flags: &str) -> ProtocolResult<u32> {
        let buffer = self
            .call(
                Operation::Open,
                minicbor::to_vec(OpenOp {
                    path: path.into(),
                    flags: flags.into(),
                })?,
            )
            .await?;
        let fd: NumberResult = minicbor::decode(&buffer)?;
        Ok(fd.value as u32)
    }

    pub async fn read(
        &self,
        fd: u32,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> ProtocolResult<Vec<u8>> {
        self.call(Operation::Read, minicbor::to_vec(ReadOp { fd, offset, length })?)
            .await
    }

    pub async fn close(&self, fd: u32) -> ProtocolResult<()> {
        self.call(Operation::Close, minicbor::to_vec(CloseOp { fd })?)
            .await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> ProtocolResult<Vec<u8>> {
        self.path_op(Operation::ReadFile, path).await
    }

    pub async fn write_file(&self, path: &str, data: impl Into<Vec<u8>>) -> ProtocolResult<()> {
        self.call(
            Operation::WriteFile,
            minicbor::to_vec(WriteFileOp {
                path: path.into(),
                buffer: data.into(),
            })?,
        )
        .await?;
        Ok(())
    }

    pub async fn touch_file(&self, path: &str) -> ProtocolResult<()> {
        self.path_op(Operation::TouchFile, path).await?;
        Ok(())
    }

    pub async fn unlink_file(&self, path: &str) -> ProtocolResult<()> {
        self.path_op(Operation::UnlinkFile, path).await?;
        Ok(())
    }

    pub async fn list_directory(&self, path: &str) -> ProtocolResult<Vec<String>> {
        let buffer = self.path_op(Operation::ListDirectory, path).await?;
        let listing: ListResult = minicbor::decode(&buffer)?;
        Ok(listing.values)
    }

    pub async fn make_directory(&self, path: &str) -> ProtocolResult<()> {
        self.path_op(Operation::MakeDirectory, path).await?;
        Ok(())
    }

    pub async fn make_directory_path(&self, path: &str) -> ProtocolResult<()> {
        self.path_op(Operation::MakeDirectoryPath, path).await?;
        Ok(())
    }

    pub async fn remove_directory(&self, path: &str) -> ProtocolResult<()> {
        self.path_op(Operation::RemoveDirectory, path).await?;
        Ok(())
    }

    pub async fn remove_directory_path(&self, path: &str) -> ProtocolResult<()> {
        self.path_op(Operation::RemoveDirectoryPath, path).await?;
        Ok(())
    }

    pub async fn download_file(&self, path: &str) -> ProtocolResult<()> {
        self.path_op(Operation::DownloadFile, path).await?;
        Ok(())
    }

    /// Derives a key pair server side from a seed.
    pub async fn key_pair(&self, seed: impl Into<Vec<u8>>) -> ProtocolResult<KeyPairResult> {
        let buffer = self
            .client
            .call(
                Operation::KeyPair,
                None,
                minicbor::to_vec(SeedOp { seed: seed.into() })?,
            )
            .await?;
        Ok(minicbor::decode(&buffer)?)
    }
}

/// Authenticates a replication session against a remote node and, on
/// success, returns the raw transport ready for splicing into a local
/// drive's replication stream.
///
/// Returns `Ok(None)` when the remote denies the credentials. Uses a
/// dedicated connection; operations and replication never share one.
pub async fn replicate(
    addr: impl ToSocketAddrs,
    id: &[u8],
    key: &[u8; KEY_SIZE],
) -> ProtocolResult<Option<(TcpStream, BytesMut)>> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, FrameCodec::new());
    handshake(&mut framed).await?;

    let mut session = ClientSession::new(framed);
    session.connect().await?;
    if !session.authenticate(id, key).await? {
        return Ok(None);
    }
    Ok(Some(session.pull().await?))
}
