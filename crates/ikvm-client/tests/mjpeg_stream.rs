//! Integration tests for `MjpgClient` against a hand-rolled HTTP server that
//! speaks just enough of mjpg-streamer's `?action=stream` response.

use std::time::Duration;

use ikvm_client::error::ErrorCategory;
use ikvm_client::infrastructure::mjpeg::{MjpegError, MjpgClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const STREAM_HEADER: &str = "HTTP/1.0 200 OK\r\n\
Connection: close\r\n\
Content-Type: multipart/x-mixed-replace;boundary=boundarydonotcross\r\n\
\r\n";

fn jpeg(seed: u8, fill: usize) -> Vec<u8> {
    let mut body = vec![0xFF, 0xD8];
    body.extend(std::iter::repeat(seed).take(fill));
    body.extend_from_slice(&[0xFF, 0xD9]);
    body
}

fn part(body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "--boundarydonotcross\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: 0.0\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}

/// Consumes the HTTP request head so closing the socket does not reset it.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Serves one connection: `head` followed by `body`, then closes.
async fn serve_once(head: &'static str, body: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/?action=stream", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.shutdown().await.ok();
        request
    });
    (url, handle)
}

#[tokio::test]
async fn test_frames_are_read_from_http_stream() {
    // Arrange
    let first = jpeg(1, 500);
    let second = jpeg(2, 20_000);
    let mut body = part(&first);
    body.extend(part(&second));
    let (url, server) = serve_once(STREAM_HEADER, body).await;
    let mut client = MjpgClient::new();

    // Act
    client.open(&url, Duration::from_secs(2)).await.expect("open");
    let got_first = client.next_frame().await;
    let got_second = client.next_frame().await;
    let after = client.next_frame().await;
    let request = server.await.unwrap();

    // Assert
    assert!(request.starts_with("GET /?action=stream"), "got {request:?}");
    assert_eq!(got_first.unwrap(), first);
    assert_eq!(got_second.unwrap(), second);
    let err = after.unwrap_err();
    assert!(matches!(err, MjpegError::FrameLost), "got {err:?}");
    assert_eq!(err.category(), ErrorCategory::Lost);
}

#[tokio::test]
async fn test_http_error_status_is_open_error() {
    let (url, _server) = serve_once("HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n", Vec::new()).await;
    let mut client = MjpgClient::new();

    let err = client.open(&url, Duration::from_secs(2)).await.unwrap_err();

    assert!(matches!(err, MjpegError::Open { .. }), "got {err:?}");
    assert_eq!(err.category(), ErrorCategory::Transport);
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_unreachable_server_is_open_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/?action=stream", listener.local_addr().unwrap());
    drop(listener);
    let mut client = MjpgClient::new();

    let err = client.open(&url, Duration::from_secs(2)).await.unwrap_err();

    assert!(matches!(err, MjpegError::Open { .. }), "got {err:?}");
    assert!(matches!(client.next_frame().await, Err(MjpegError::NotOpened)));
}

#[tokio::test]
async fn test_reopen_replaces_previous_stream() {
    // Arrange
    let old = jpeg(1, 10);
    let new = jpeg(9, 10);
    let (first_url, first_server) = serve_once(STREAM_HEADER, part(&old)).await;
    let (second_url, second_server) = serve_once(STREAM_HEADER, part(&new)).await;
    let mut client = MjpgClient::new();

    // Act
    client.open(&first_url, Duration::from_secs(2)).await.unwrap();
    client.open(&second_url, Duration::from_secs(2)).await.unwrap();
    let frame = client.next_frame().await;
    first_server.await.unwrap();
    second_server.await.unwrap();

    // Assert
    assert_eq!(frame.unwrap(), new);
}

#[tokio::test]
async fn test_close_releases_stream() {
    let (url, _server) = serve_once(STREAM_HEADER, part(&jpeg(3, 10))).await;
    let mut client = MjpgClient::new();
    client.open(&url, Duration::from_secs(2)).await.unwrap();
    assert!(client.is_open());

    client.close();

    assert!(!client.is_open());
    assert!(matches!(client.next_frame().await, Err(MjpegError::NotOpened)));
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    // Arrange: headers, then nothing.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/?action=stream", listener.local_addr().unwrap());
    let _server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream.write_all(STREAM_HEADER.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        stream
    });
    let mut client = MjpgClient::with_read_timeout(Duration::from_millis(100));
    client.open(&url, Duration::from_secs(2)).await.unwrap();

    // Act
    let err = client.next_frame().await.unwrap_err();

    // Assert
    assert!(matches!(err, MjpegError::ReadTimeout(_)), "got {err:?}");
    assert_eq!(err.category(), ErrorCategory::Timing);
}
