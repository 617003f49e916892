//! End-to-end node tests over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use cfs_core::Drive;
use cfs_drive_memory::MemoryDrive;
use cfs_fs::{Cfs, CfsOptions, CfsRegistry, DriveFactory, create_cfs};
use cfs_node::{CfsClient, CfsServer, replicate};
use cfs_protocol::{ProtocolError, error_code};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn memory_factory() -> DriveFactory {
    Arc::new(|_, keys| {
        Box::pin(async move { Ok(Arc::new(MemoryDrive::new(keys)) as Arc<dyn Drive>) })
    })
}

async fn served_node(id: &[u8]) -> (Arc<Cfs>, SocketAddr) {
    let cfs = create_cfs(CfsOptions::with_id(id.to_vec()), memory_factory())
        .await
        .unwrap();
    let registry = Arc::new(CfsRegistry::new());
    registry.insert(cfs.clone());

    let server = CfsServer::new(registry);
    let (addr, _task) = server.listen("127.0.0.1:0").await.unwrap();
    (cfs, addr)
}

#[tokio::test]
async fn file_operations_over_tcp() {
    let (cfs, addr) = served_node(b"alice").await;
    let client = CfsClient::connect(addr, b"alice".to_vec(), cfs.key())
        .await
        .unwrap();

    client.noop().await.unwrap();

    client.write_file("/etc/hosts", "localhost").await.unwrap();
    assert_eq!(client.read_file("/etc/hosts").await.unwrap(), b"localhost");

    let stat = client.stat_file("/etc/hosts").await.unwrap();
    assert_eq!(stat.size, 9);
    assert!(!stat.is_directory);

    // Home-relative paths resolve server side.
    assert_eq!(client.resolve("~/notes").await.unwrap(), "/home/notes");

    client.make_directory_path("/var/cache/a/b").await.unwrap();
    let listing = client.list_directory("/var/cache/a").await.unwrap();
    assert_eq!(listing, vec!["b".to_string()]);
    client.remove_directory("/var/cache/a/b").await.unwrap();

    client.touch_file("/tmp/scratch").await.unwrap();
    client.access_file("/tmp/scratch", 0).await.unwrap();
    client.unlink_file("/tmp/scratch").await.unwrap();
    let err = client.stat_file("/tmp/scratch").await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Remote {
            code: error_code::NOT_FOUND,
            ..
        }
    ));
}

#[tokio::test]
async fn descriptor_lifecycle_over_tcp() {
    let (cfs, addr) = served_node(b"alice").await;
    let client = CfsClient::connect(addr, b"alice".to_vec(), cfs.key())
        .await
        .unwrap();

    client.write_file("/home/data", "0123456789").await.unwrap();
    let fd = client.open("~/data", "r").await.unwrap();
    assert!(fd > 0);

    assert_eq!(client.read(fd, None, None).await.unwrap(), b"0123456789");
    assert_eq!(client.read(fd, Some(2), Some(4)).await.unwrap(), b"2345");

    client.close(fd).await.unwrap();
    let err = client.read(fd, None, None).await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Remote {
            code: error_code::NOT_OPENED,
            ..
        }
    ));
}

#[tokio::test]
async fn requests_without_registered_drive_fail() {
    let (cfs, addr) = served_node(b"alice").await;
    let client = CfsClient::connect(addr, b"mallory".to_vec(), cfs.key())
        .await
        .unwrap();

    let err = client.stat_file("/etc").await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Remote {
            code: error_code::NOT_FOUND,
            ..
        }
    ));

    // KeyPair needs no registered filesystem and stays available.
    let pair = client.key_pair(b"seed".to_vec()).await.unwrap();
    assert_eq!(pair.public.len(), 32);
    assert_eq!(pair.seed, b"seed");
}

#[tokio::test]
async fn replication_session_over_tcp() {
    let (cfs, addr) = served_node(b"alice").await;

    // Accepted credentials end in a raw splice; the in-memory drive's
    // replication peer is a loopback echo.
    let (mut io, leftover) = replicate(addr, b"alice", &cfs.key())
        .await
        .unwrap()
        .expect("credentials accepted");
    assert!(leftover.is_empty());
    io.write_all(b"replica bytes").await.unwrap();
    let mut echo = [0u8; 13];
    io.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"replica bytes");

    // Unknown credentials are denied, not errored.
    let denied = replicate(addr, b"mallory", &[0u8; 32]).await.unwrap();
    assert!(denied.is_none());
}
