#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::sync::Arc;

use bytes::Bytes;
use remote_fs::config::FsConfig;
use remote_fs::fs::RemoteFileSystem;
use remote_fs::transport::local::LocalTransport;

struct Harness {
    remote: tempfile::TempDir,
    _cache: tempfile::TempDir,
    fs: RemoteFileSystem<LocalTransport>,
}

fn harness() -> Harness {
    let remote = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    std::fs::create_dir(remote.path().join("docs")).unwrap();
    std::fs::write(remote.path().join("docs/readme.md"), "hello").unwrap();
    std::os::unix::fs::symlink("docs", remote.path().join("latest")).unwrap();
    let fs = RemoteFileSystem::new(
        LocalTransport::new(remote.path()),
        FsConfig::with_cache_dir(cache.path()),
    );
    Harness {
        remote,
        _cache: cache,
        fs,
    }
}

#[tokio::test]
async fn reads_and_lists_a_real_directory() {
    let h = harness();
    let docs = h.fs.find("/docs").await.unwrap().unwrap();
    assert!(docs.is_directory());

    let listed = h.fs.children(&docs).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path(), "/docs/readme.md");
    assert_eq!(h.fs.read(&listed[0]).await.unwrap().as_ref(), b"hello");
    assert_eq!(h.fs.metadata(&listed[0]).await.unwrap().size(), 5);

    let through = h.fs.find("/latest/readme.md").await.unwrap().unwrap();
    assert_eq!(through.path(), "/latest/readme.md");
    assert_eq!(h.fs.read(&through).await.unwrap().as_ref(), b"hello");
}

#[tokio::test]
async fn mutations_land_on_disk() {
    let h = harness();
    let docs = h.fs.find("/docs").await.unwrap().unwrap();

    let notes = h.fs.create_directory(&docs, "notes").await.unwrap();
    assert!(h.remote.path().join("docs/notes").is_dir());
    let todo = h.fs.create_file(&notes, "todo.txt").await.unwrap();
    h.fs.write(&todo, Bytes::from_static(b"ship it")).await.unwrap();
    assert_eq!(
        std::fs::read(h.remote.path().join("docs/notes/todo.txt")).unwrap(),
        b"ship it"
    );
    let leftovers: Vec<_> = std::fs::read_dir(h.remote.path().join("docs/notes"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "{leftovers:?}");

    let readme = h.fs.find("/docs/readme.md").await.unwrap().unwrap();
    let renamed = h.fs.rename(&readme, "index.md").await.unwrap();
    assert!(Arc::ptr_eq(&renamed, &readme));
    assert!(h.remote.path().join("docs/index.md").is_file());
    assert!(h.fs.find("/docs/readme.md").await.unwrap().is_none());

    h.fs.delete(&notes).await.unwrap();
    assert!(!h.remote.path().join("docs/notes").exists());
    assert!(!todo.is_valid());
    assert_eq!(h.fs.children(&docs).await.unwrap().len(), 1);
}
