use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use turbfetch_runtime::client::{
    HttpClientConfig, HttpQueryClient, QueryClient, QueryError, QueryRequest,
};

/// What the server saw: request line, lowercased header lines, body.
struct Captured {
    request_line: String,
    headers: Vec<String>,
    body: Vec<u8>,
}

/// Accepts one connection, records the request, answers with `status_line` and `body`.
async fn serve_once(
    status_line: &'static str,
    body: &'static str,
) -> Result<(SocketAddr, oneshot::Receiver<Captured>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let Ok(read) = sock.read(&mut chunk).await else {
                return;
            };
            if read == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..read]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let headers: Vec<String> = lines
            .filter(|l| !l.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        let content_length = headers
            .iter()
            .find_map(|h| h.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let Ok(read) = sock.read(&mut chunk).await else {
                return;
            };
            if read == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..read]);
        }

        let response = format!(
            "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = sock.write_all(response.as_bytes()).await;
        let _ = sock.shutdown().await;
        let _ = tx.send(Captured {
            request_line,
            headers,
            body: buf[header_end..].to_vec(),
        });
    });

    Ok((addr, rx))
}

fn client(addr: SocketAddr, auth_token: Option<&str>) -> Result<HttpQueryClient> {
    Ok(HttpQueryClient::new(&HttpClientConfig {
        endpoint: format!("http://{addr}/"),
        auth_token: auth_token.map(str::to_string),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
    })?)
}

fn request() -> QueryRequest {
    QueryRequest {
        dataset_title: "channel".to_string(),
        variable: "velocity".to_string(),
        time: 0.5,
        temporal_method: "none".to_string(),
        spatial_method: "lag4".to_string(),
        spatial_operator: "field".to_string(),
        points: vec![[0.0, 0.0, 0.0], [0.25, 0.0, 0.5]],
    }
}

#[tokio::test]
async fn posts_json_with_bearer_token_and_decodes_rows() -> Result<()> {
    let (addr, captured) = serve_once(
        "HTTP/1.1 200 OK",
        r#"{"columns":["ux","uy"],"values":[1.0,2.0,3.0,4.0]}"#,
    )
    .await?;

    let response = client(addr, Some("secret-token"))?.query(request()).await?;
    assert_eq!(response.columns, vec!["ux", "uy"]);
    assert_eq!(response.values, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(response.rows(), 2);
    response.check_shape(2)?;

    let seen = captured.await?;
    assert!(seen.request_line.starts_with("POST /query "), "{}", seen.request_line);
    assert!(seen
        .headers
        .iter()
        .any(|h| h == "authorization: bearer secret-token"));
    assert!(seen
        .headers
        .iter()
        .any(|h| h.starts_with("content-type: application/json")));

    let body: serde_json::Value = serde_json::from_slice(&seen.body)?;
    assert_eq!(body["dataset_title"], "channel");
    assert_eq!(body["variable"], "velocity");
    assert_eq!(body["time"], 0.5);
    assert_eq!(body["spatial_method"], "lag4");
    assert_eq!(body["points"][1], serde_json::json!([0.25, 0.0, 0.5]));
    Ok(())
}

#[tokio::test]
async fn no_token_sends_no_authorization_header() -> Result<()> {
    let (addr, captured) = serve_once(
        "HTTP/1.1 200 OK",
        r#"{"columns":["p"],"values":[0.0,0.0]}"#,
    )
    .await?;

    client(addr, None)?.query(request()).await?;
    let seen = captured.await?;
    assert!(!seen.headers.iter().any(|h| h.starts_with("authorization:")));
    Ok(())
}

#[tokio::test]
async fn error_status_keeps_code_and_body() -> Result<()> {
    let (addr, _captured) =
        serve_once("HTTP/1.1 503 Service Unavailable", "rate limit exceeded").await?;

    let err = client(addr, None)?
        .query(request())
        .await
        .expect_err("503 must fail");
    match err {
        QueryError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "rate limit exceeded");
        }
        other => panic!("expected status error, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn undecodable_body_is_malformed() -> Result<()> {
    let (addr, _captured) = serve_once("HTTP/1.1 200 OK", "<html>not json</html>").await?;

    let err = client(addr, None)?
        .query(request())
        .await
        .expect_err("html must fail");
    assert!(matches!(err, QueryError::Malformed(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn refused_connection_is_transport_error() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let err = client(addr, None)?
        .query(request())
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, QueryError::Transport(_)), "{err}");
    Ok(())
}
