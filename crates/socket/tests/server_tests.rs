//! Tests for the inspector server over real loopback TCP connections

use inspector_socket::{
    frame::CLOSE_FRAME,
    http::{accept_upgrade_response, HANDSHAKE_FAILED_RESPONSE},
    InspectorServer, SessionEvent,
};
use inspector_utils::ensure_test_logging;
use serde_json::Value;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

const TARGET_ID: &str = "0f2c6e7a-3b1d-4c5e-9a8b-7d6e5f4a3b2c";
const WS_KEY: &str = "x3JJHMbDL1EzLkh9GBhXDw==";
const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> InspectorServer {
    ensure_test_logging(None);
    InspectorServer::builder()
        .port(0)
        .target_id(TARGET_ID)
        .target_title("demo[42]")
        .target_url("file:///tmp/demo.js")
        .start()
        .await
        .expect("failed to start inspector server")
}

async fn connect(server: &InspectorServer) -> TcpStream {
    TcpStream::connect(server.handle().local_addr()).await.expect("failed to connect")
}

/// Read one response with a `Content-Length` body, returning head and body.
async fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8(data[..end + 4].to_vec()).unwrap();
            let length: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("Content-Length: "))
                .map(|len| len.trim().parse().unwrap())
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                let body = String::from_utf8(data[end + 4..end + 4 + length].to_vec()).unwrap();
                return (head, body);
            }
        }
        let n = timeout(TIMEOUT, stream.read(&mut chunk)).await.expect("timed out").unwrap();
        assert!(n > 0, "connection closed before the response completed");
        data.extend_from_slice(&chunk[..n]);
    }
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(TIMEOUT, stream.read_exact(&mut buf)).await.expect("timed out").unwrap();
    buf
}

async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(TIMEOUT, stream.read_to_end(&mut buf)).await.expect("timed out").unwrap();
    buf
}

async fn next_event(server: &mut InspectorServer) -> SessionEvent {
    timeout(TIMEOUT, server.next_event()).await.expect("timed out").expect("server gone")
}

fn upgrade_request(path: &str, host: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: keep-alive, Upgrade\r\n\
         Upgrade: websocket\r\nSec-WebSocket-Key: {WS_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    )
}

fn client_frame(op_code: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 125);
    let key = [0x12, 0x34, 0x56, 0x78];
    let mut frame = vec![0x80 | op_code, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

/// Attach a session and return its socket and id
async fn attach(server: &mut InspectorServer) -> (TcpStream, u64) {
    let mut stream = connect(server).await;
    stream.write_all(upgrade_request(&format!("/{TARGET_ID}"), "localhost").as_bytes()).await.unwrap();
    let expected = accept_upgrade_response(WS_KEY);
    assert_eq!(read_exact(&mut stream, expected.len()).await, expected);

    let SessionEvent::Started { session_id } = next_event(server).await else {
        panic!("expected a session start");
    };
    (stream, session_id)
}

#[tokio::test]
async fn test_json_list_describes_target() {
    let server = start_server().await;
    let port = server.handle().local_addr().port();
    let mut stream = connect(&server).await;

    let host = format!("localhost:{port}");
    stream.write_all(format!("GET /json/list HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(head.contains("Content-Type: application/json; charset=UTF-8\r\n"));

    let targets: Value = serde_json::from_str(&body).unwrap();
    let target = &targets.as_array().unwrap()[0];
    assert_eq!(target["id"], TARGET_ID);
    assert_eq!(target["type"], "node");
    assert_eq!(target["title"], "demo[42]");
    assert_eq!(target["url"], "file:///tmp/demo.js");
    assert_eq!(target["webSocketDebuggerUrl"], format!("ws://{host}/{TARGET_ID}"));
    assert!(target["devtoolsFrontendUrl"].as_str().unwrap().ends_with(&format!("ws={host}/{TARGET_ID}")));

    // `/json` is an alias, and the connection stays usable
    stream.write_all(format!("GET /json HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes()).await.unwrap();
    let (_, alias_body) = read_response(&mut stream).await;
    assert_eq!(alias_body, body);
}

#[tokio::test]
async fn test_json_list_without_host_uses_local_address() {
    let server = start_server().await;
    let port = server.handle().local_addr().port();
    let mut stream = connect(&server).await;

    stream.write_all(b"GET /json/list HTTP/1.0\r\n\r\n").await.unwrap();
    let (_, body) = read_response(&mut stream).await;
    let targets: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(targets[0]["webSocketDebuggerUrl"], format!("ws://127.0.0.1:{port}/{TARGET_ID}"));
}

#[tokio::test]
async fn test_json_version() {
    let server = start_server().await;
    let mut stream = connect(&server).await;

    stream.write_all(b"GET /json/version HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").await.unwrap();
    let (_, body) = read_response(&mut stream).await;
    let version: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(version["Protocol-Version"], "1.1");
    assert!(version["Browser"].as_str().unwrap().starts_with("inspector-socket/"));
}

#[tokio::test]
async fn test_unknown_path_is_rejected() {
    let server = start_server().await;
    let mut stream = connect(&server).await;

    stream.write_all(b"GET /favicon.ico HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, HANDSHAKE_FAILED_RESPONSE);
}

#[tokio::test]
async fn test_rebinding_host_is_rejected() {
    let server = start_server().await;
    let mut stream = connect(&server).await;

    let request = upgrade_request(&format!("/{TARGET_ID}"), "attacker.example.com:9229");
    stream.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, HANDSHAKE_FAILED_RESPONSE);
    assert_eq!(server.handle().session_count(), 0);
}

#[tokio::test]
async fn test_upgrade_to_unknown_target_is_rejected() {
    let server = start_server().await;
    let mut stream = connect(&server).await;

    stream.write_all(upgrade_request("/not-the-target", "localhost").as_bytes()).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, HANDSHAKE_FAILED_RESPONSE);
}

#[tokio::test]
async fn test_session_round_trip() {
    let mut server = start_server().await;
    let handle = server.handle();
    let (mut stream, session_id) = attach(&mut server).await;
    assert_eq!(handle.session_count(), 1);

    let request = br#"{"id":1,"method":"Debugger.enable"}"#;
    stream.write_all(&client_frame(0x1, request)).await.unwrap();
    assert_eq!(
        next_event(&mut server).await,
        SessionEvent::Message { session_id, text: String::from_utf8(request.to_vec()).unwrap() }
    );

    assert!(handle.send(session_id, r#"{"id":1,"result":{}}"#));
    let reply = read_exact(&mut stream, 2 + 20).await;
    assert_eq!(reply[0], 0x81);
    assert_eq!(&reply[2..], br#"{"id":1,"result":{}}"#);
    assert!(!handle.send(session_id + 100, "nobody"));

    // Front-end closes; the close frame is echoed and the session ends
    stream.write_all(&client_frame(0x8, &[])).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, CLOSE_FRAME);
    assert_eq!(next_event(&mut server).await, SessionEvent::Ended { session_id });
    assert_eq!(handle.session_count(), 0);
}

#[tokio::test]
async fn test_terminate_closes_sessions() {
    let mut server = start_server().await;
    let handle = server.handle();
    let (mut stream, session_id) = attach(&mut server).await;

    handle.terminate();
    assert_eq!(read_exact(&mut stream, 2).await, CLOSE_FRAME);
    stream.write_all(&client_frame(0x8, &[])).await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());
    assert_eq!(next_event(&mut server).await, SessionEvent::Ended { session_id });

    // The listener is gone once the accept loop observes the stop signal
    tokio::time::sleep(Duration::from_millis(50)).await;
    let refused = TcpStream::connect(handle.local_addr()).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn test_stop_keeps_attached_sessions() {
    let mut server = start_server().await;
    let handle = server.handle();
    let (mut stream, session_id) = attach(&mut server).await;

    handle.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(handle.local_addr()).await.is_err());

    stream.write_all(&client_frame(0x1, b"ping")).await.unwrap();
    assert_eq!(
        next_event(&mut server).await,
        SessionEvent::Message { session_id, text: "ping".to_string() }
    );
    assert!(handle.send(session_id, "pong"));
    assert_eq!(read_exact(&mut stream, 6).await, b"\x81\x04pong");
    assert_eq!(handle.session_count(), 1);
}

#[tokio::test]
async fn test_dropping_server_releases_port_and_sessions() {
    let mut server = start_server().await;
    let addr = server.handle().local_addr();
    let (mut stream, _) = attach(&mut server).await;

    drop(server);
    assert_eq!(read_exact(&mut stream, 2).await, CLOSE_FRAME);
    stream.write_all(&client_frame(0x8, &[])).await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_unpublished_http_answers_not_found() {
    ensure_test_logging(None);
    let mut server = InspectorServer::builder()
        .port(0)
        .target_id(TARGET_ID)
        .publish_http(false)
        .publish_console(false)
        .start()
        .await
        .unwrap();
    let mut stream = connect(&server).await;

    for path in ["/json/list", "/json/version"] {
        stream.write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes()).await.unwrap();
        let (head, body) = read_response(&mut stream).await;
        assert!(head.starts_with("HTTP/1.0 404 Not Found\r\n"), "{head}");
        assert!(body.is_empty());
    }

    // The WebSocket endpoint stays reachable
    let (_, session_id) = attach(&mut server).await;
    assert_eq!(server.handle().session_count(), 1);
    assert!(server.handle().send(session_id, "{}"));
}

#[tokio::test]
async fn test_listens_on_every_resolved_address() {
    ensure_test_logging(None);
    let resolved: Vec<_> = tokio::net::lookup_host(("localhost", 0)).await.unwrap().collect();
    let server =
        InspectorServer::builder().host("localhost").port(0).publish_console(false).start().await.unwrap();
    let handle = server.handle();

    let addrs = handle.local_addrs();
    assert!(!addrs.is_empty());
    assert!(addrs.len() <= resolved.len());
    for addr in addrs {
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), handle.local_addr().port());
        assert!(resolved.iter().any(|r| r.ip() == addr.ip()));
        TcpStream::connect(addr).await.expect("every listener accepts");
    }
    assert_eq!(handle.ws_url(), format!("ws://localhost:{}/{}", handle.local_addr().port(), handle.target_id()));
}

#[tokio::test]
async fn test_start_fails_when_nothing_binds() {
    ensure_test_logging(None);
    let first = start_server().await;
    let taken = first.handle().local_addr();

    let result = InspectorServer::builder()
        .host(taken.ip().to_string())
        .port(taken.port())
        .publish_console(false)
        .start()
        .await;
    assert!(result.is_err());
}
