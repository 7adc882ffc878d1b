//! Serving over real sockets: startup, graceful shutdown and persistence.

use std::time::Duration;

use axum::Router;
use axum::http::{Method, Request, StatusCode, header};
use axum::routing::get;
use blob_storage::Digest;
use bytes::Bytes;
use camino::Utf8PathBuf;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use registry::{Server, ServerConfig, ServerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

const MANIFEST: &[u8] = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{},"layers":[]}"#;

async fn request(port: u16, method: Method, path: &str, body: Bytes) -> (StatusCode, Bytes) {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, "localhost")
        .body(Full::new(body))
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn slow_router(delay: Duration) -> Router {
    Router::new().route(
        "/slow",
        get(move || async move {
            tokio::time::sleep(delay).await;
            "done"
        }),
    )
}

#[tokio::test]
async fn in_flight_request_finishes_during_shutdown() {
    let server = Server::bind(&ServerConfig::default(), slow_router(Duration::from_millis(200)))
        .await
        .unwrap();
    let port = server.local_addr().port();

    let (cancel, cancelled) = oneshot::channel::<()>();
    let run = tokio::spawn(server.start().run(async move {
        let _ = cancelled.await;
    }));

    let in_flight = tokio::spawn(request(port, Method::GET, "/slow", Bytes::new()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.send(()).unwrap();

    let (status, body) = in_flight.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"done");

    run.await.unwrap().unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn stuck_request_exceeds_grace() {
    let grace = Duration::from_millis(100);
    let config = ServerConfig::default().with_shutdown_grace(grace);
    let server = Server::bind(&config, slow_router(Duration::from_secs(30)))
        .await
        .unwrap();
    let port = server.local_addr().port();

    let (cancel, cancelled) = oneshot::channel::<()>();
    let run = tokio::spawn(server.start().run(async move {
        let _ = cancelled.await;
    }));

    let _stuck = tokio::spawn(request(port, Method::GET, "/slow", Bytes::new()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.send(()).unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, ServerError::ShutdownTimeout { .. }));
}

#[tokio::test]
async fn memory_registry_serves_until_cancelled() {
    let running = registry::start(&ServerConfig::default()).await.unwrap();
    let port = running.port();
    assert_ne!(port, 0);

    let (status, _) = request(port, Method::GET, "/v2/", Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);

    let data = Bytes::from_static(b"layer contents");
    let digest = Digest::sha256(&data);
    let (status, _) = request(
        port,
        Method::POST,
        &format!("/v2/app/blobs/uploads/?digest={digest}"),
        data.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = request(port, Method::GET, &format!("/v2/app/blobs/{digest}"), Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);

    running.run(async {}).await.unwrap();
}

#[tokio::test]
async fn disk_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().join("images")).unwrap();
    let config = ServerConfig::default().with_storage_path(Some(root.clone()));

    let data = Bytes::from_static(b"persistent layer");
    let digest = Digest::sha256(&data);

    let running = registry::start(&config).await.unwrap();
    assert!(root.is_dir(), "storage directory is created at startup");

    let port = running.port();
    let (status, _) = request(
        port,
        Method::POST,
        &format!("/v2/app/blobs/uploads/?digest={digest}"),
        data.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = request(
        port,
        Method::PUT,
        "/v2/app/manifests/latest",
        Bytes::from_static(MANIFEST),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    running.run(async {}).await.unwrap();

    let running = registry::start(&config).await.unwrap();
    let port = running.port();

    let (status, body) = request(port, Method::GET, &format!("/v2/app/blobs/{digest}"), Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);

    let (status, body) = request(port, Method::GET, "/v2/app/manifests/latest", Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], MANIFEST);

    running.run(async {}).await.unwrap();
}

#[tokio::test]
async fn unusable_storage_fails_before_binding() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).unwrap();
    let config = ServerConfig::default().with_storage_path(Some(root));

    let err = registry::start(&config).await.unwrap_err();
    assert!(err.is_startup());
}

#[tokio::test]
async fn serve_returns_after_cancellation() {
    registry::serve(ServerConfig::default(), async {})
        .await
        .unwrap();
}

#[tokio::test]
async fn stalled_headers_are_disconnected() {
    let config = ServerConfig::default().with_header_read_timeout(Duration::from_millis(100));
    let server = Server::bind(&config, slow_router(Duration::ZERO)).await.unwrap();
    let port = server.local_addr().port();
    let running = server.start();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n")
        .await
        .unwrap();

    // The server gives up on the request and closes the connection.
    let mut received = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await;
    assert!(closed.is_ok(), "connection left open with incomplete headers");

    // Well-behaved clients are unaffected.
    let (status, body) = request(port, Method::GET, "/slow", Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"done");

    running.run(async {}).await.unwrap();
}

#[tokio::test]
async fn port_is_reported_before_serving() {
    let server = Server::bind(&ServerConfig::default(), slow_router(Duration::ZERO))
        .await
        .unwrap();
    let reported = server.local_addr().port();
    assert_ne!(reported, 0);

    // Connections are queued on the bound listener before the accept loop runs.
    let early = TcpStream::connect(("127.0.0.1", reported)).await;
    assert!(early.is_ok());
    drop(early);

    let running = server.start();
    assert_eq!(running.port(), reported);

    let (status, body) = request(reported, Method::GET, "/slow", Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"done");

    running.run(async {}).await.unwrap();
}
