//! Torrent commands and the polls they trigger.

use std::io::Write;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use tremote_core::RpcEvent;
use tremote_core::engine::AddTorrentOptions;
use tremote_core::model::TorrentStatus;

use crate::daemon::HttpDaemon;
use crate::{connect, next_matching};

#[tokio::test]
async fn test_added_link_appears_in_next_poll() {
    let daemon = HttpDaemon::start().await;
    let (handle, mut events, _) = connect(daemon.config()).await;

    handle
        .add_torrent_link("magnet:?xt=urn:btih:abcdef", AddTorrentOptions::default())
        .await
        .unwrap();
    let id = next_matching(&mut events, |event| match event {
        RpcEvent::TorrentAdded { id } => Some(*id),
        _ => None,
    })
    .await;
    handle.wait_idle().await.unwrap();

    let torrent = handle.torrent(id).await.unwrap();
    assert!(torrent.is_some());
    let add = &daemon.arguments_of("torrent-add")[0];
    assert_eq!(add["filename"], json!("magnet:?xt=urn:btih:abcdef"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_added_file_is_uploaded_as_base64() {
    let daemon = HttpDaemon::start().await;
    let (handle, mut events, _) = connect(daemon.config()).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"d4:infod4:name4:testee").unwrap();
    let options = AddTorrentOptions {
        download_directory: Some("/media".to_string()),
        start: false,
        ..Default::default()
    };

    handle.add_torrent_file(file.path(), options).await.unwrap();
    next_matching(&mut events, |event| match event {
        RpcEvent::TorrentAdded { id } => Some(*id),
        _ => None,
    })
    .await;

    let add = &daemon.arguments_of("torrent-add")[0];
    assert_eq!(add["metainfo"], json!(STANDARD.encode(b"d4:infod4:name4:testee")));
    assert_eq!(add["download-dir"], json!("/media"));
    assert_eq!(add["paused"], json!(true));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_then_remove() {
    let daemon = HttpDaemon::start().await;
    let first = daemon.add_torrent("first", 0.5);
    let second = daemon.add_torrent("second", 0.5);
    let (handle, _events, _) = connect(daemon.config()).await;

    handle.stop_torrents(vec![first]).await.unwrap();
    handle.wait_idle().await.unwrap();
    let stopped = handle.torrent(first).await.unwrap().unwrap();
    assert_eq!(stopped.data().status, TorrentStatus::Paused);

    handle.remove_torrents(vec![first], true).await.unwrap();
    handle.wait_idle().await.unwrap();

    let remaining: Vec<i64> = handle
        .torrents()
        .await
        .unwrap()
        .iter()
        .map(|torrent| torrent.id())
        .collect();
    assert_eq!(remaining, vec![second]);
    let remove = &daemon.arguments_of("torrent-remove")[0];
    assert_eq!(remove["delete-local-data"], json!(true));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_finished_download_is_reported() {
    let daemon = HttpDaemon::start().await;
    let id = daemon.add_torrent("almost", 0.9);
    let (handle, mut events, _) = connect(daemon.config()).await;

    daemon.set_percent_done(id, 1.0);

    let finished = next_matching(&mut events, |event| match event {
        RpcEvent::TorrentFinished { id } => Some(*id),
        _ => None,
    })
    .await;
    assert_eq!(finished, id);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_free_space_queries() {
    let daemon = HttpDaemon::start().await;
    let (handle, mut events, _) = connect(daemon.config()).await;

    handle.get_download_dir_free_space().await.unwrap();
    let bytes = next_matching(&mut events, |event| match event {
        RpcEvent::DownloadDirFreeSpace(bytes) => Some(*bytes),
        _ => None,
    })
    .await;
    assert_eq!(bytes, 5_000_000_000);

    handle.get_free_space_for_path("/media").await.unwrap();
    let (path, success, bytes) = next_matching(&mut events, |event| match event {
        RpcEvent::FreeSpaceForPath {
            path,
            success,
            bytes,
        } => Some((path.clone(), *success, *bytes)),
        _ => None,
    })
    .await;
    assert_eq!(path, "/media");
    assert!(success);
    assert_eq!(bytes, 1_000_000);

    handle.shutdown().await.unwrap();
}
