// Full client over the reqwest session against a local mockito server

use dbxkit_client::{
    init_test_logging, route, BaseHosts, ClientConfig, OAuthTokenRefresher, TransportClient, API_RESULT_HEADER,
};
use dbxkit_core::{
    AccessToken, CallError, LongLivedAccessTokenProvider, Route, ShortLivedAccessTokenProvider,
};
use mockito::Matcher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

#[derive(Debug, Serialize)]
struct PathArg {
    path: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Metadata {
    name: String,
    size: u64,
}

const GET_METADATA: Route<PathArg, Metadata, Value> =
    route!("files" / "get_metadata", auth: [User], host: Api, style: Rpc);
const UPLOAD: Route<PathArg, Metadata, Value> =
    route!("files" / "upload", auth: [User], host: Content, style: Upload);
const DOWNLOAD: Route<PathArg, Metadata, Value> =
    route!("files" / "download", auth: [User], host: Content, style: Download);

fn arg(path: &str) -> PathArg {
    PathArg { path: path.to_string() }
}

fn config(server: &mockito::ServerGuard, download_dir: &std::path::Path) -> ClientConfig {
    ClientConfig::default()
        .with_hosts(BaseHosts::all(server.url()))
        .with_timeout(Some(Duration::from_secs(5)))
        .with_download_dir(download_dir)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out")
        .expect("handler dropped")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_round_trip() {
    init_test_logging();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let mock = server
        .mock("POST", "/2/files/get_metadata")
        .match_header("authorization", "Bearer long-lived")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({"path": "/notes.txt"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name":"notes.txt","size":12}"#)
        .create_async()
        .await;

    let client = TransportClient::with_http_session(
        config(&server, dir.path()),
        Arc::new(LongLivedAccessTokenProvider::new("long-lived")),
        Handle::current(),
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .request(&GET_METADATA, &arg("/notes.txt"))
        .response(move |result| tx.send(result).unwrap());

    let result = next(&mut rx).await;
    assert_eq!(
        result,
        Ok(Metadata {
            name: "notes.txt".to_string(),
            size: 12
        })
    );
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_sends_bytes_and_escaped_argument() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let mock = server
        .mock("POST", "/2/files/upload")
        .match_header("content-type", "application/octet-stream")
        .match_header("dropbox-api-arg", r#"{"path":"/na\u00efve.txt"}"#)
        .match_body("file contents")
        .with_status(200)
        .with_body(r#"{"name":"naïve.txt","size":13}"#)
        .create_async()
        .await;

    let client = TransportClient::with_http_session(
        config(&server, dir.path()),
        Arc::new(LongLivedAccessTokenProvider::new("t")),
        Handle::current(),
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    client
        .upload(&UPLOAD, &arg("/na\u{ef}ve.txt"), b"file contents".to_vec())
        .progress(move |p| {
            let _ = progress_tx.send(p);
        })
        .response(move |result| tx.send(result).unwrap());

    let metadata = next(&mut rx).await.unwrap();
    assert_eq!(metadata.size, 13);
    let progress = next(&mut progress_rx).await;
    assert_eq!(progress.completed, 13);
    assert_eq!(progress.fraction_completed(), Some(1.0));
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_file_lands_at_destination() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let mock = server
        .mock("POST", "/2/files/download")
        .match_header("dropbox-api-arg", r#"{"path":"/photo.jpg"}"#)
        .with_status(200)
        .with_header(API_RESULT_HEADER, r#"{"name":"photo.jpg","size":6}"#)
        .with_body("JPEG..")
        .create_async()
        .await;

    let client = TransportClient::with_http_session(
        config(&server, dir.path()),
        Arc::new(LongLivedAccessTokenProvider::new("t")),
        Handle::current(),
    )
    .unwrap();

    let destination = dir.path().join("photo.jpg");
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .download_file(&DOWNLOAD, &arg("/photo.jpg"), &destination, false)
        .response(move |result| tx.send(result).unwrap());

    let (metadata, location) = next(&mut rx).await.unwrap();
    assert_eq!(metadata.name, "photo.jpg");
    assert_eq!(location, destination);
    assert_eq!(std::fs::read(&destination).unwrap(), b"JPEG..");
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_token_is_refreshed_before_the_call() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-me".into()),
            Matcher::UrlEncoded("client_id".into(), "app-key".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"token_type":"bearer","access_token":"fresh","expires_in":14400}"#)
        .expect(1)
        .create_async()
        .await;
    let call = server
        .mock("POST", "/2/files/get_metadata")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_body(r#"{"name":"a","size":1}"#)
        .expect(2)
        .create_async()
        .await;

    let refresher = Arc::new(OAuthTokenRefresher::new(&server.url(), "app-key").unwrap());
    let expired = AccessToken::short_lived("stale", "refresh-me", chrono::Utc::now() - chrono::Duration::minutes(5));
    let client = TransportClient::with_http_session(
        config(&server, dir.path()),
        Arc::new(ShortLivedAccessTokenProvider::new(expired, refresher)),
        Handle::current(),
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for _ in 0..2 {
        let tx = tx.clone();
        client
            .request(&GET_METADATA, &arg("/a"))
            .response(move |result| tx.send(result).unwrap());
    }
    assert!(next(&mut rx).await.is_ok());
    assert!(next(&mut rx).await.is_ok());
    refresh.assert_async().await;
    call.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_errors_map_to_call_errors() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    server
        .mock("POST", "/2/files/get_metadata")
        .with_status(401)
        .with_header("x-dropbox-request-id", "abc123")
        .with_body(r#"{"error":{".tag":"expired_access_token"},"error_summary":"expired_access_token/"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/2/files/download")
        .with_status(409)
        .with_body(r#"{"error":{".tag":"path","path":{".tag":"not_found"}},"error_summary":"path/not_found/"}"#)
        .create_async()
        .await;

    let client = TransportClient::with_http_session(
        config(&server, dir.path()),
        Arc::new(LongLivedAccessTokenProvider::new("t")),
        Handle::current(),
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .request(&GET_METADATA, &arg("/a"))
        .response(move |result| tx.send(result).unwrap());
    match next(&mut rx).await {
        Err(CallError::AuthError(details)) => {
            assert_eq!(details.error[".tag"], "expired_access_token");
            assert_eq!(details.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("unexpected {:?}", other),
    }

    // The error body of a failed file download is read back from disk.
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .download_file(&DOWNLOAD, &arg("/missing"), dir.path().join("missing"), false)
        .response(move |result| tx.send(result).unwrap());
    match next(&mut rx).await {
        Err(CallError::RouteError(details)) => {
            assert_eq!(details.error["path"][".tag"], "not_found");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!dir.path().join("missing").exists());
}
