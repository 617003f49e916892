//! End-to-end tests of the virtual filesystem over memory drives.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cfs_core::{Drive, FsError, OpenFlags, ReadOptions, keys::verify};
use cfs_drive_memory::MemoryDrive;
use cfs_fs::{
    AccessMode, CFS_DIRECTORIES, CFS_EPOCH_FILE, CFS_FILES, CFS_ID_FILE, CFS_SIGNATURE_FILE,
    Cfs, CfsOptions, DriveFactory, EVENT_LOG_PATH, EventRecord, PartitionName, create_cfs,
};
use dashmap::DashMap;

/// Factory whose drives survive across `create_cfs` calls, behaving
/// like persistent storage.
fn shared_factory() -> (DriveFactory, Arc<DashMap<PartitionName, Arc<dyn Drive>>>) {
    let store: Arc<DashMap<PartitionName, Arc<dyn Drive>>> = Arc::new(DashMap::new());
    let handle = store.clone();
    let factory: DriveFactory = Arc::new(move |name, keys| {
        let store = store.clone();
        Box::pin(async move {
            let drive = store
                .entry(name)
                .or_insert_with(|| Arc::new(MemoryDrive::new(keys)) as Arc<dyn Drive>)
                .clone();
            Ok(drive)
        })
    });
    (factory, handle)
}

async fn owner_cfs(id: &[u8]) -> Arc<Cfs> {
    let (factory, _) = shared_factory();
    create_cfs(CfsOptions::with_id(Bytes::copy_from_slice(id)), factory)
        .await
        .unwrap()
}

#[tokio::test]
async fn provisioning_creates_reserved_tree() {
    let cfs = owner_cfs(b"alice").await;

    for dir in CFS_DIRECTORIES {
        let stat = cfs.stat(dir).await.unwrap();
        assert!(stat.is_directory, "{dir} should be a directory");
    }
    for file in CFS_FILES {
        assert!(!cfs.stat(file).await.unwrap().is_directory, "{file}");
    }

    assert_eq!(&cfs.read_file(CFS_ID_FILE).await.unwrap()[..], b"alice");

    let epoch = String::from_utf8(cfs.read_file(CFS_EPOCH_FILE).await.unwrap().to_vec()).unwrap();
    assert!(epoch.parse::<u64>().unwrap() > 0);

    // The signature file holds the raw signature bytes binding the
    // owner id to the root public key.
    let signature = cfs.read_file(CFS_SIGNATURE_FILE).await.unwrap();
    assert_eq!(signature.len(), cfs_core::SIGNATURE_SIZE);
    let mut message = b"alice".to_vec();
    message.extend_from_slice(&cfs.key());
    assert!(verify(
        &cfs.key(),
        cfs_core::Hash::new(&message).as_bytes(),
        &signature
    ));
}

#[tokio::test]
async fn provisioning_is_idempotent() {
    let (factory, _) = shared_factory();
    let opts = || CfsOptions::with_id(Bytes::from_static(b"alice"));

    let first = create_cfs(opts(), factory.clone()).await.unwrap();
    first.write_file("/etc/custom", "kept").await.unwrap();
    let epoch = first.read_file(CFS_EPOCH_FILE).await.unwrap();

    let second = create_cfs(opts(), factory).await.unwrap();
    assert_eq!(second.read_file(CFS_EPOCH_FILE).await.unwrap(), epoch);
    assert_eq!(&second.read_file("/etc/custom").await.unwrap()[..], b"kept");
    assert_eq!(first.key_path(), second.key_path());
}

#[tokio::test]
async fn descriptors_are_unique_across_partitions() {
    let cfs = owner_cfs(b"alice").await;
    cfs.write_file("/etc/one", "first").await.unwrap();
    cfs.write_file("/var/two", "second").await.unwrap();

    let fd_etc = cfs.open("/etc/one", OpenFlags::read()).await.unwrap();
    let fd_var = cfs.open("/var/two", OpenFlags::read()).await.unwrap();
    assert_ne!(fd_etc, fd_var);

    let one = cfs.read(fd_etc, ReadOptions::default()).await.unwrap();
    let two = cfs.read(fd_var, ReadOptions::default()).await.unwrap();
    assert_eq!(&one[..], b"first");
    assert_eq!(&two[..], b"second");

    cfs.close(fd_etc).await.unwrap();
    cfs.close(fd_var).await.unwrap();
}

#[tokio::test]
async fn open_read_close_lifecycle() {
    let cfs = owner_cfs(b"alice").await;

    let fd = cfs
        .open("/home/notes.txt", OpenFlags::parse("w+").unwrap())
        .await
        .unwrap();
    assert!(fd > 0);
    cfs.close(fd).await.unwrap();
    assert!(matches!(cfs.close(fd).await, Err(FsError::NotOpened(_))));

    cfs.write_file("/home/notes.txt", "remember").await.unwrap();
    let fd = cfs.open("~/notes.txt", OpenFlags::read()).await.unwrap();
    let data = cfs
        .read(
            fd,
            ReadOptions {
                offset: Some(2),
                length: Some(6),
            },
        )
        .await
        .unwrap();
    assert_eq!(&data[..], b"member");
    cfs.close(fd).await.unwrap();

    // Exclusive create refuses existing files.
    assert!(matches!(
        cfs.open("/home/notes.txt", OpenFlags::parse("wx").unwrap()).await,
        Err(FsError::AccessDenied(_))
    ));
    // Plain read of a missing file is not found.
    assert!(matches!(
        cfs.open("/home/missing", OpenFlags::read()).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn paths_normalize_against_home() {
    let cfs = owner_cfs(b"alice").await;
    assert_eq!(cfs.home(), Some("/home"));
    assert_eq!(cfs.resolve("~").unwrap(), "/home");
    assert_eq!(cfs.resolve("~/a/./b/../c").unwrap(), "/home/a/c");
    assert_eq!(cfs.resolve("etc//hosts").unwrap(), "/etc/hosts");

    cfs.write_file("~/f", "x").await.unwrap();
    assert_eq!(&cfs.read_file("/home/f").await.unwrap()[..], b"x");
}

#[tokio::test]
async fn streaming_reads_and_writes() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let cfs = owner_cfs(b"alice").await;

    let mut writer = cfs.create_write_stream("/var/cache/archive").await.unwrap();
    writer.write_all(b"streamed ").await.unwrap();
    writer.write_all(b"payload").await.unwrap();
    writer.shutdown().await.unwrap();
    drop(writer);

    // The write commits when the stream ends; wait for it to land.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match cfs.read_file("/var/cache/archive").await {
            Ok(data) if !data.is_empty() => {
                assert_eq!(&data[..], b"streamed payload");
                break;
            }
            _ => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "streamed write never committed"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    // Home-relative paths stream through the identity partition.
    cfs.write_file("~/tape", "rewound").await.unwrap();
    let mut reader = cfs.create_read_stream("~/tape").await.unwrap();
    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).await.unwrap();
    assert_eq!(contents, b"rewound");

    assert!(matches!(
        cfs.create_read_stream("/var/cache/missing").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn access_modes() {
    let cfs = owner_cfs(b"alice").await;
    cfs.access("/etc", AccessMode::Exists).await.unwrap();
    cfs.access("/etc", AccessMode::Read).await.unwrap();
    cfs.access("/etc", AccessMode::Write).await.unwrap();
    assert!(matches!(
        cfs.access("/etc", AccessMode::Execute).await,
        Err(FsError::NotSupported(_))
    ));
    assert!(matches!(
        cfs.access("/etc/nope", AccessMode::Exists).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn reader_instance_cannot_write() {
    let owner = owner_cfs(b"alice").await;

    let (factory, _) = shared_factory();
    let reader = create_cfs(
        CfsOptions {
            key: Some(owner.key()),
            ..CfsOptions::default()
        },
        factory,
    )
    .await
    .unwrap();

    assert!(!reader.writable());
    assert!(matches!(
        reader.access("/etc", AccessMode::Write).await,
        Err(FsError::AccessDenied(_))
    ));
    assert!(matches!(
        reader.write_file("/etc/x", "y").await,
        Err(FsError::AccessDenied(_))
    ));
    assert!(matches!(
        reader.open("/etc/x", OpenFlags::parse("w").unwrap()).await,
        Err(FsError::AccessDenied(_))
    ));
    assert!(matches!(
        reader.create_write_stream("/etc/x").await,
        Err(FsError::AccessDenied(_))
    ));
}

#[tokio::test]
async fn directory_tree_operations() {
    let cfs = owner_cfs(b"alice").await;

    cfs.mkdirp("/var/cache/app/data").await.unwrap();
    cfs.write_file("/var/cache/app/data/blob", "b").await.unwrap();

    let entries = cfs.readdir("/var/cache/app").await.unwrap();
    assert_eq!(entries, vec!["data"]);

    assert!(matches!(
        cfs.rmdir("/var/cache/app").await,
        Err(FsError::BadRequest(_))
    ));
    cfs.rimraf("/var/cache/app").await.unwrap();
    assert!(matches!(
        cfs.stat("/var/cache/app").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn event_log_collects_and_flushes() {
    let cfs = owner_cfs(b"alice").await;

    cfs.write_file("/etc/hosts", "localhost").await.unwrap();
    cfs.write_file("~/journal", "day one").await.unwrap();
    cfs.unlink("~/journal").await.unwrap();

    // Let the history events reach the collector before flushing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cfs.flush_events().await;

    let log = cfs.read_file(EVENT_LOG_PATH).await.unwrap();
    let records: Vec<EventRecord> = String::from_utf8(log.to_vec())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(records.iter().any(|r| {
        r.kind == "put" && r.path.as_deref() == Some("/etc/hosts")
    }));
    assert!(records.iter().any(|r| {
        r.kind == "del" && r.path.as_deref() == Some("/home/journal")
    }));
    // Every flush terminates with a flush record.
    assert_eq!(records.last().unwrap().kind, "flush");
    // The log never records writes to itself.
    assert!(!records.iter().any(|r| r.path.as_deref() == Some(EVENT_LOG_PATH)));
}

#[tokio::test]
async fn close_all_shuts_down_partitions() {
    let (factory, drives) = shared_factory();
    let cfs = create_cfs(CfsOptions::with_id(Bytes::from_static(b"alice")), factory)
        .await
        .unwrap();

    cfs.write_file("/etc/f", "x").await.unwrap();
    let fd = cfs.open("/etc/f", OpenFlags::read()).await.unwrap();
    cfs.close_all().await;

    assert!(!cfs.is_opened(fd));
    let etc = drives.get(&PartitionName::Etc).unwrap().clone();
    assert!(etc.ready().await.is_err());
}

#[tokio::test]
async fn mount_points_stat_as_directories() {
    let cfs = owner_cfs(b"alice").await;
    for name in PartitionName::MOUNTED {
        let stat = cfs.stat(name.mount_path()).await.unwrap();
        assert!(stat.is_directory, "{name}");
    }
}
