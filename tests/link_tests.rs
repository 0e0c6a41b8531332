#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockTransport, Recorder, filesystem};
use remote_fs::event::EventKind;
use remote_fs::fs::FsError;
use remote_fs::link::LinkResolution;

#[tokio::test]
async fn two_links_pointing_at_each_other_are_cyclic() {
    let mock = MockTransport::new();
    mock.add_link("/a", "/b");
    mock.add_link("/b", "/a");
    let (fs, _cache) = filesystem(&mock);

    let a = fs.find("/a").await.unwrap().unwrap();
    assert!(a.is_link());
    assert!(fs.is_cyclic_link(&a).await.unwrap());
    let err = fs.read(&a).await.unwrap_err();
    assert!(matches!(err, FsError::CyclicLink { .. }), "{err}");
    assert_eq!(i32::from(&err), libc::ELOOP);
    assert_eq!(fs.read_symbolic_link_path(&a).unwrap(), "/b");
}

#[tokio::test]
async fn link_into_itself_is_cyclic() {
    let mock = MockTransport::new();
    mock.add_dir("/d");
    mock.add_link("/d/loop", ".");
    let (fs, _cache) = filesystem(&mock);

    let link = fs.find("/d/loop").await.unwrap().unwrap();
    // "." resolves to the link's own parent, which is not below the link.
    assert!(!fs.is_cyclic_link(&link).await.unwrap());

    mock.add_link("/d/inner", "/d/inner/x");
    fs.refresh(&fs.find("/d").await.unwrap().unwrap()).await.unwrap();
    let inner = fs.find("/d/inner").await.unwrap().unwrap();
    assert!(matches!(
        fs.canonical_delegate(&inner).await.unwrap(),
        LinkResolution::SelfReference
    ));
}

#[tokio::test]
async fn dangling_link_counts_as_cyclic_but_reads_as_not_found() {
    let mock = MockTransport::new();
    mock.add_link("/dangling", "/nowhere");
    let (fs, _cache) = filesystem(&mock);

    let link = fs.find("/dangling").await.unwrap().unwrap();
    assert!(matches!(
        fs.canonical_delegate(&link).await.unwrap(),
        LinkResolution::Dangling { .. }
    ));
    assert!(fs.is_cyclic_link(&link).await.unwrap());
    let err = fs.read(&link).await.unwrap_err();
    assert!(matches!(err, FsError::NotFound { operation: "read", .. }), "{err}");
    assert_eq!(i32::from(&err), libc::ENOENT);
}

#[tokio::test]
async fn lookups_through_a_directory_link_keep_their_path() {
    let mock = MockTransport::new();
    mock.add_dir("/real");
    mock.add_file("/real/f.txt", "hello");
    mock.add_link("/ln", "real");
    let (fs, _cache) = filesystem(&mock);

    let through = fs.find("/ln/f.txt").await.unwrap().unwrap();
    assert_eq!(through.path(), "/ln/f.txt");
    let real = fs.find("/real/f.txt").await.unwrap().unwrap();
    assert!(Arc::ptr_eq(through.link_child_delegate().unwrap(), &real));
    assert_eq!(fs.read(&through).await.unwrap().as_ref(), b"hello");
    assert_eq!(fs.metadata(&through).await.unwrap().name(), "f.txt");

    let ln = fs.find("/ln").await.unwrap().unwrap();
    let listed = fs.children(&ln).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(Arc::ptr_eq(&listed[0], &through));
    assert!(Arc::ptr_eq(
        &fs.read_symbolic_link(&ln).await.unwrap(),
        &fs.find("/real").await.unwrap().unwrap()
    ));
}

#[tokio::test]
async fn chained_links_resolve_to_the_final_target() {
    let mock = MockTransport::new();
    mock.add_dir("/opt");
    mock.add_dir("/opt/v2");
    mock.add_file("/opt/v2/bin", "binary");
    mock.add_link("/opt/current", "v2");
    mock.add_link("/usr", "/opt/current");
    let (fs, _cache) = filesystem(&mock);

    let usr = fs.find("/usr").await.unwrap().unwrap();
    let resolved = fs.canonical_delegate(&usr).await.unwrap().into_delegate().unwrap();
    assert_eq!(resolved.path(), "/opt/v2");
    let bin = fs.find("/usr/bin").await.unwrap().unwrap();
    assert_eq!(fs.read(&bin).await.unwrap().as_ref(), b"binary");
}

#[tokio::test]
async fn link_listeners_see_delegate_changes() {
    let mock = MockTransport::new();
    mock.add_dir("/real");
    mock.add_link("/ln", "/real");
    let (fs, _cache) = filesystem(&mock);

    let real = fs.find("/real").await.unwrap().unwrap();
    fs.children(&real).await.unwrap();
    let ln = fs.find("/ln").await.unwrap().unwrap();
    let events = Recorder::new();
    fs.add_listener("/ln", events.clone()).await.unwrap();
    assert_eq!(ln.as_link().unwrap().forwarded_from().as_deref(), Some("/real"));

    mock.add_file("/real/new", "n");
    fs.refresh(&real).await.unwrap();
    let seen = events.events();
    assert_eq!(seen.len(), 1, "{seen:?}");
    assert_eq!(seen[0].kind, EventKind::Created);
    assert_eq!(seen[0].source.path, "/ln");
    assert_eq!(seen[0].file.path, "/ln/new");

    let listener: Arc<dyn remote_fs::event::FileChangeListener> = events.clone();
    assert!(fs.remove_listener("/ln", &listener));
    assert!(ln.as_link().unwrap().forwarded_from().is_none());
}

#[tokio::test]
async fn retargeted_link_forwards_from_the_new_target() {
    let mock = MockTransport::new();
    mock.add_dir("/one");
    mock.add_dir("/two");
    mock.add_link("/ln", "/one");
    let (fs, _cache) = filesystem(&mock);

    let ln = fs.find("/ln").await.unwrap().unwrap();
    fs.add_listener("/ln", Recorder::new()).await.unwrap();
    assert_eq!(ln.as_link().unwrap().forwarded_from().as_deref(), Some("/one"));

    mock.remove("/ln");
    mock.add_link("/ln", "/two");
    fs.refresh(&fs.root()).await.unwrap();
    assert!(Arc::ptr_eq(&fs.find("/ln").await.unwrap().unwrap(), &ln));
    assert_eq!(fs.read_symbolic_link_path(&ln).unwrap(), "/two");
    assert_eq!(ln.as_link().unwrap().forwarded_from().as_deref(), Some("/two"));
}

#[tokio::test]
async fn retargeting_a_watched_link_at_an_unknown_sibling_completes() {
    let mock = MockTransport::new();
    mock.add_dir("/d");
    mock.add_file("/d/a", "a");
    mock.add_link("/d/l", "a");
    let (fs, _cache) = filesystem(&mock);

    let d = fs.find("/d").await.unwrap().unwrap();
    let link = fs.find("/d/l").await.unwrap().unwrap();
    fs.add_listener("/d/l", Recorder::new()).await.unwrap();
    assert_eq!(link.as_link().unwrap().forwarded_from().as_deref(), Some("/d/a"));

    mock.remove("/d/l");
    mock.add_link("/d/l", "missing");
    tokio::time::timeout(Duration::from_secs(5), fs.refresh(&d))
        .await
        .expect("refresh finished")
        .unwrap();
    assert_eq!(fs.read_symbolic_link_path(&link).unwrap(), "missing");
    assert!(link.as_link().unwrap().forwarded_from().is_none());
}
