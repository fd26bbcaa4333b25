//! Connection handshake, authentication and failure reporting.

use tokio::net::TcpListener;
use tremote_core::RpcErrorKind;
use tremote_core::config::TremoteConfig;
use tremote_core::engine::ConnectionState;

use crate::connect;
use crate::daemon::HttpDaemon;

#[tokio::test]
async fn test_connects_after_session_token_handshake() {
    let daemon = HttpDaemon::start().await;
    let id = daemon.add_torrent("ubuntu.iso", 0.25);

    let (handle, _events, status) = connect(daemon.config()).await;

    assert_eq!(status.connection_state, ConnectionState::Connected);
    assert!(daemon.conflicts() >= 1);
    let torrents = handle.torrents().await.unwrap();
    assert_eq!(torrents.len(), 1);
    assert_eq!(torrents[0].id(), id);
    assert_eq!(torrents[0].data().name, "ubuntu.iso");

    let settings = handle.server_settings().await.unwrap();
    assert_eq!(settings.rpc_version, 17);
    assert_eq!(settings.download_directory, "/downloads");
    let stats = handle.server_stats().await.unwrap();
    assert_eq!(stats.download_speed, 4096);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rotated_session_token_is_picked_up() {
    let daemon = HttpDaemon::start().await;
    let (handle, _events, _) = connect(daemon.config()).await;
    handle.set_update_disabled(true).await.unwrap();
    handle.wait_idle().await.unwrap();
    let conflicts = daemon.conflicts();

    daemon.rotate_session("second-token");
    handle.update_data().await.unwrap();
    handle.wait_idle().await.unwrap();

    assert!(daemon.conflicts() > conflicts);
    assert!(handle.status().await.unwrap().is_connected());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_basic_auth_is_sent() {
    let daemon = HttpDaemon::start_with_credentials(Some(("admin", "secret"))).await;

    let (handle, _events, status) =
        connect(daemon.config_with_credentials("admin", "secret")).await;

    assert!(status.is_connected());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_credentials_fail_with_authentication_error() {
    let daemon = HttpDaemon::start_with_credentials(Some(("admin", "secret"))).await;

    let (handle, _events, status) =
        connect(daemon.config_with_credentials("admin", "guess")).await;

    assert_eq!(status.connection_state, ConnectionState::Disconnected);
    assert_eq!(status.error, Some(RpcErrorKind::AuthenticationError));
    assert!(daemon.methods().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_daemon_fails_with_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (handle, _events, status) = connect(TremoteConfig::for_testing("127.0.0.1", port)).await;

    assert_eq!(status.error, Some(RpcErrorKind::ConnectionError));
    assert!(!status.detailed_message.is_empty());
    handle.shutdown().await.unwrap();
}
