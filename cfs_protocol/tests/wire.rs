//! Client/server protocol tests over an in-memory duplex transport.

use std::sync::Arc;

use cfs_core::Drive;
use cfs_drive_memory::MemoryDrive;
use cfs_fs::{Cfs, CfsOptions, CfsRegistry, DriveFactory, create_cfs};
use cfs_protocol::{
    ClientSession, DriveRef, Frame, FrameCodec, Handshake, ListResult, NumberResult, OpenOp,
    Operation, PathOp, ProtocolClient, ProtocolError, ReadOp, Request, StatResult, StringResult,
    error_code, handle_request, handshake, message, serve_connection,
};
use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

fn memory_factory() -> DriveFactory {
    Arc::new(|_, keys| {
        Box::pin(async move { Ok(Arc::new(MemoryDrive::new(keys)) as Arc<dyn Drive>) })
    })
}

async fn registered_cfs(id: &[u8]) -> (Arc<Cfs>, Arc<CfsRegistry>) {
    let cfs = create_cfs(CfsOptions::with_id(id.to_vec()), memory_factory())
        .await
        .unwrap();
    let registry = Arc::new(CfsRegistry::new());
    registry.insert(cfs.clone());
    (cfs, registry)
}

async fn connected_client(
    registry: Arc<CfsRegistry>,
) -> (ProtocolClient, JoinHandle<Result<(), ProtocolError>>) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(serve_connection(server_io, registry));
    let mut framed = Framed::new(client_io, FrameCodec::new());
    handshake(&mut framed).await.unwrap();
    (ProtocolClient::spawn(framed), server)
}

fn drive_ref(cfs: &Cfs) -> DriveRef {
    DriveRef {
        id: cfs.identifier().map(|id| id.to_vec()).unwrap_or_default(),
        key: cfs.key().to_vec(),
        secret_key: Vec::new(),
    }
}

#[tokio::test]
async fn handshake_rejects_forged_key() {
    let (_, registry) = registered_cfs(b"alice").await;
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_connection(server_io, registry));

    let mut framed = Framed::new(client_io, FrameCodec::new());
    framed
        .send(Frame::Handshake(Handshake {
            nonce: message::nonce(),
            key: vec![0u8; 32],
            ack: false,
        }))
        .await
        .unwrap();

    let result = server.await.unwrap();
    assert!(matches!(result, Err(ProtocolError::BadHandshake { .. })));
}

#[tokio::test]
async fn concurrent_requests_correlate_by_nonce() {
    let (cfs, registry) = registered_cfs(b"alice").await;
    cfs.write_file("/etc/hosts", "localhost").await.unwrap();
    let (client, _server) = connected_client(registry).await;
    let drive = drive_ref(&cfs);

    let stat = client.call(
        Operation::StatFile,
        Some(drive.clone()),
        minicbor::to_vec(PathOp {
            path: "/etc/hosts".into(),
        })
        .unwrap(),
    );
    let contents = client.call(
        Operation::ReadFile,
        Some(drive.clone()),
        minicbor::to_vec(PathOp {
            path: "/etc/hosts".into(),
        })
        .unwrap(),
    );
    let resolved = client.call(
        Operation::Resolve,
        Some(drive.clone()),
        minicbor::to_vec(PathOp { path: "~".into() }).unwrap(),
    );
    let noop = client.call(Operation::NoOperation, None, Vec::new());

    let (stat, contents, resolved, noop) = tokio::join!(stat, contents, resolved, noop);

    let stat: StatResult = minicbor::decode(&stat.unwrap()).unwrap();
    assert_eq!(stat.size, "localhost".len() as u64);
    assert!(!stat.is_directory);

    assert_eq!(contents.unwrap(), b"localhost");

    let resolved: StringResult = minicbor::decode(&resolved.unwrap()).unwrap();
    assert_eq!(resolved.value, "/home");

    assert!(noop.unwrap().is_empty());
}

#[tokio::test]
async fn open_read_close_over_the_wire() {
    let (cfs, registry) = registered_cfs(b"alice").await;
    cfs.write_file("/home/data", "payload").await.unwrap();
    let (client, _server) = connected_client(registry).await;
    let drive = drive_ref(&cfs);

    let fd = client
        .call(
            Operation::Open,
            Some(drive.clone()),
            minicbor::to_vec(OpenOp {
                path: "~/data".into(),
                flags: "r".into(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let fd: NumberResult = minicbor::decode(&fd).unwrap();
    assert!(fd.value > 0);

    let data = client
        .call(
            Operation::Read,
            Some(drive.clone()),
            minicbor::to_vec(ReadOp {
                fd: fd.value as u32,
                offset: None,
                length: None,
            })
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(data, b"payload");

    client
        .call(
            Operation::Close,
            Some(drive.clone()),
            minicbor::to_vec(cfs_protocol::message::CloseOp {
                fd: fd.value as u32,
            })
            .unwrap(),
        )
        .await
        .unwrap();

    // Closing again is a typed not-opened error, not a dead session.
    let err = client
        .call(
            Operation::Close,
            Some(drive),
            minicbor::to_vec(cfs_protocol::message::CloseOp {
                fd: fd.value as u32,
            })
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Remote {
            code: error_code::NOT_OPENED,
            ..
        }
    ));
}

#[tokio::test]
async fn read_with_invalid_descriptor_is_bad_request() {
    let (cfs, registry) = registered_cfs(b"alice").await;
    let (client, _server) = connected_client(registry).await;

    let err = client
        .call(
            Operation::Read,
            Some(drive_ref(&cfs)),
            minicbor::to_vec(ReadOp {
                fd: 0,
                offset: None,
                length: None,
            })
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Remote {
            code: error_code::BAD_REQUEST,
            ..
        }
    ));
}

#[tokio::test]
async fn bad_open_flags_are_rejected() {
    let (cfs, registry) = registered_cfs(b"alice").await;
    let (client, _server) = connected_client(registry).await;

    for flags in ["", "z", "rw"] {
        let err = client
            .call(
                Operation::Open,
                Some(drive_ref(&cfs)),
                minicbor::to_vec(OpenOp {
                    path: "/etc/f".into(),
                    flags: flags.into(),
                })
                .unwrap(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ProtocolError::Remote {
                    code: error_code::BAD_REQUEST,
                    ..
                }
            ),
            "flags {flags:?}"
        );
    }
}

#[tokio::test]
async fn unimplemented_table_entries() {
    let (cfs, registry) = registered_cfs(b"alice").await;
    let (client, _server) = connected_client(registry).await;

    for op in [Operation::Write, Operation::DownloadDirectory] {
        let err = client
            .call(
                op,
                Some(drive_ref(&cfs)),
                minicbor::to_vec(PathOp { path: "/etc".into() }).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Remote {
                code: error_code::NOT_IMPLEMENTED,
                ..
            }
        ));
    }
}

#[tokio::test]
async fn list_directory_over_the_wire() {
    let (cfs, registry) = registered_cfs(b"alice").await;
    cfs.write_file("/etc/a", "1").await.unwrap();
    cfs.write_file("/etc/b", "2").await.unwrap();
    let (client, _server) = connected_client(registry).await;

    let listing = client
        .call(
            Operation::ListDirectory,
            Some(drive_ref(&cfs)),
            minicbor::to_vec(PathOp {
                path: "/etc".into(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let listing: ListResult = minicbor::decode(&listing).unwrap();
    assert!(listing.values.contains(&"a".to_string()));
    assert!(listing.values.contains(&"b".to_string()));
}

#[tokio::test]
async fn request_validation_rejections() {
    let (cfs, registry) = registered_cfs(b"alice").await;

    // Empty nonce.
    let response = handle_request(
        Request {
            nonce: Vec::new(),
            operation: Operation::StatFile.code(),
            drive: None,
            buffer: Vec::new(),
        },
        &registry,
    )
    .await;
    assert_eq!(response.error_code, error_code::BAD_REQUEST);

    // Unknown operation code.
    let response = handle_request(
        Request {
            nonce: message::nonce(),
            operation: 999,
            drive: None,
            buffer: Vec::new(),
        },
        &registry,
    )
    .await;
    assert_eq!(response.error_code, error_code::BAD_REQUEST);

    // Wrong drive key length.
    let response = handle_request(
        Request {
            nonce: message::nonce(),
            operation: Operation::StatFile.code(),
            drive: Some(DriveRef {
                id: b"alice".to_vec(),
                key: vec![1; 16],
                secret_key: Vec::new(),
            }),
            buffer: Vec::new(),
        },
        &registry,
    )
    .await;
    assert_eq!(response.error_code, error_code::BAD_REQUEST);

    // Well-formed request: secrets and buffers are scrubbed from the echo.
    let request_nonce = message::nonce();
    let response = handle_request(
        Request {
            nonce: request_nonce.clone(),
            operation: Operation::StatFile.code(),
            drive: Some(DriveRef {
                id: b"alice".to_vec(),
                key: cfs.key().to_vec(),
                secret_key: vec![7; 32],
            }),
            buffer: minicbor::to_vec(PathOp { path: "/etc".into() }).unwrap(),
        },
        &registry,
    )
    .await;
    assert_eq!(response.error_code, error_code::NO_ERROR);
    assert_eq!(response.nonce, message::response_nonce(&request_nonce));
    assert!(response.request.buffer.is_empty());
    assert!(response.drive.as_ref().unwrap().secret_key.is_empty());
}

async fn session_client(registry: Arc<CfsRegistry>) -> (ClientSession<DuplexStream>, JoinHandle<Result<(), ProtocolError>>) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(serve_connection(server_io, registry));
    let mut framed = Framed::new(client_io, FrameCodec::new());
    handshake(&mut framed).await.unwrap();
    (ClientSession::new(framed), server)
}

#[tokio::test]
async fn session_authenticates_registered_drive() {
    let (cfs, registry) = registered_cfs(b"alice").await;
    let (mut session, server) = session_client(registry).await;

    session.connect().await.unwrap();
    let ok = session
        .authenticate(b"alice", &cfs.key())
        .await
        .unwrap();
    assert!(ok);

    // Stream phase ends in a raw splice; the in-memory drive's
    // replication peer is a loopback.
    let (mut io, leftover) = session.pull().await.unwrap();
    assert!(leftover.is_empty());
    io.write_all(b"replica bytes").await.unwrap();
    let mut echo = [0u8; 13];
    io.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"replica bytes");

    drop(io);
    let _ = server.await.unwrap();
}

#[tokio::test]
async fn session_denies_unknown_credentials() {
    let (_cfs, registry) = registered_cfs(b"alice").await;
    let (mut session, server) = session_client(registry).await;

    session.connect().await.unwrap();
    let ok = session.authenticate(b"mallory", &[0u8; 32]).await.unwrap();
    assert!(!ok);

    server.await.unwrap().unwrap();
}
