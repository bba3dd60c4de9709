use std::net::SocketAddr;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use trawl_core::{ErrorKind, RepoUnavailableReason};
use trawl_endpoint::Endpoint;
use trawl_proto::{encode_frame, DoneEvent, FileMatch, PatternInfo, SearchRequest};
use trawl_search::{HttpTransport, Transport};

/// Serves one connection with a canned HTTP response and returns the raw request.
async fn serve_once(
    status: &'static str,
    body: Vec<u8>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        // Read until the JSON body has arrived.
        loop {
            let n = socket.read(&mut buf).await.expect("read request");
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.ends_with(b"}") {
                break;
            }
        }
        let head = format!(
            "HTTP/1.1 {status}\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.expect("write head");
        socket.write_all(&body).await.expect("write body");
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&request).into_owned()
    });
    Ok((addr, handle))
}

fn request() -> SearchRequest {
    SearchRequest {
        repo: "github.com/foo/bar".to_owned(),
        repo_id: 1,
        commit_oid: "sha1".to_owned(),
        pattern_info: PatternInfo::literal("foo"),
        ..SearchRequest::default()
    }
}

#[tokio::test]
async fn streams_matches_until_done() -> Result<()> {
    let mut body = Vec::new();
    body.extend(encode_frame("matches", &vec![FileMatch::path_only("a.go")])?);
    body.extend(encode_frame("progress", &serde_json::json!({"done": 1}))?);
    body.extend(encode_frame("matches", &vec![FileMatch::path_only("b.go")])?);
    body.extend(encode_frame(
        "done",
        &DoneEvent {
            limit_hit: true,
            ..DoneEvent::default()
        },
    )?);
    body.extend_from_slice(b"trailing garbage");

    let (addr, server) = serve_once("200 OK", body).await?;
    let endpoint = Endpoint::new(format!("http://{addr}/search"));
    let received = Mutex::new(Vec::new());
    let on_matches = |matches: Vec<FileMatch>| {
        received.lock().extend(matches.into_iter().map(|m| m.path));
    };

    let done = HttpTransport::new()
        .search(&endpoint, &request(), &on_matches)
        .await?;

    assert!(done.limit_hit);
    assert_eq!(*received.lock(), vec!["a.go", "b.go"]);
    let raw = server.await?;
    assert!(raw.starts_with("POST /search"), "{raw}");
    assert!(raw.contains(r#""commit_oid":"sha1""#), "{raw}");
    Ok(())
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() -> Result<()> {
    let cases = [
        ("503 Service Unavailable", ErrorKind::Transient),
        ("400 Bad Request", ErrorKind::Permanent),
        (
            "404 Not Found",
            ErrorKind::RepoUnavailable(RepoUnavailableReason::Missing),
        ),
    ];
    for (status, kind) in cases {
        let (addr, server) = serve_once(status, b"nope".to_vec()).await?;
        let endpoint = Endpoint::new(format!("http://{addr}"));
        let err = HttpTransport::new()
            .search(&endpoint, &request(), &|_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kind, "{status}");
        assert!(err.message().contains("nope"), "{err}");
        server.await?;
    }
    Ok(())
}

#[tokio::test]
async fn stream_ending_before_done_is_transient() -> Result<()> {
    let body = encode_frame("matches", &vec![FileMatch::path_only("a.go")])?;
    let (addr, server) = serve_once("200 OK", body).await?;
    let endpoint = Endpoint::new(format!("http://{addr}"));

    let err = HttpTransport::new()
        .search(&endpoint, &request(), &|_| {})
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    server.await?;
    Ok(())
}

#[tokio::test]
async fn connection_refused_is_transient() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let err = HttpTransport::new()
        .search(&Endpoint::new(format!("http://{addr}")), &request(), &|_| {})
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    Ok(())
}
