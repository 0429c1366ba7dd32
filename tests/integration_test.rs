//! Black-box tests against the real control server and wire protocol,
//! mirroring the client/server framing without spawning actual containers.

use phiocker::core::protocol::{read_envelope, write_envelope, Request, Response};
use phiocker::core::server::Daemon;
use tempfile::TempDir;
use tokio::io::BufReader;
use tokio::net::UnixStream;

async fn start_daemon() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("phiocker.sock");
    let base_path = dir.path().join("base");
    std::fs::create_dir_all(&base_path).unwrap();

    let daemon = Daemon::new(socket_path.clone(), base_path);
    tokio::spawn(async move {
        let _ = daemon.run().await;
    });

    // Give the listener a moment to bind.
    for _ in 0..50 {
        if UnixStream::connect(&socket_path).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    (dir, socket_path)
}

async fn roundtrip(socket_path: &std::path::Path, kind: &str, args: Vec<String>) -> Response {
    let stream = UnixStream::connect(socket_path).await.unwrap();
    let mut reader = BufReader::new(stream);
    write_envelope(reader.get_mut(), &Request::new(kind, args))
        .await
        .unwrap();
    read_envelope(&mut reader).await.unwrap().unwrap()
}

#[tokio::test]
async fn ps_on_empty_registry_reports_header_only() {
    let (_dir, socket_path) = start_daemon().await;
    let resp = roundtrip(&socket_path, "ps", vec![]).await;
    assert!(!resp.is_error());
    assert!(resp.output.contains("NAME"));
}

#[tokio::test]
async fn list_with_no_containers_directory_is_friendly() {
    let (_dir, socket_path) = start_daemon().await;
    let resp = roundtrip(&socket_path, "list", vec![]).await;
    assert!(!resp.is_error());
    assert!(resp.output.contains("no containers directory found"));
}

#[tokio::test]
async fn stop_on_unknown_container_is_an_error() {
    let (_dir, socket_path) = start_daemon().await;
    let resp = roundtrip(&socket_path, "stop", vec!["ghost".to_string()]).await;
    assert!(resp.is_error());
}

#[tokio::test]
async fn delete_on_missing_container_is_not_an_error() {
    let (_dir, socket_path) = start_daemon().await;
    let resp = roundtrip(&socket_path, "delete", vec!["ghost".to_string()]).await;
    assert!(!resp.is_error());
    assert!(resp.output.contains("does not exist"));
}

#[tokio::test]
async fn run_on_unknown_container_reports_missing_spec() {
    let (_dir, socket_path) = start_daemon().await;
    let resp = roundtrip(&socket_path, "run", vec!["ghost".to_string()]).await;
    assert!(resp.is_error());
}

#[tokio::test]
async fn unknown_request_type_is_rejected() {
    let (_dir, socket_path) = start_daemon().await;
    let resp = roundtrip(&socket_path, "frobnicate", vec![]).await;
    assert!(resp.is_error());
}
