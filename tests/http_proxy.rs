//! End-to-end tests for the HTTP proxy front end over real sockets.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;

use common::{read_to_close, read_until, spawn_proxy, start_echo_server, start_recording_server, TIMEOUT};

const OK_EMPTY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

#[tokio::test]
async fn connect_tunnel_is_transparent() {
    let (echo, echo_closed) = start_echo_server().await;
    let proxy = spawn_proxy(|_| {}).await;

    let mut client = TcpStream::connect(proxy.http).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", echo).as_bytes())
        .await
        .unwrap();

    let head = read_until(&mut client, b"\r\n\r\n").await;
    assert!(head.starts_with(b"HTTP/1.1 200"), "{:?}", String::from_utf8_lossy(&head));
    assert!(head.ends_with(b"\r\n\r\n"), "tunnel bytes arrived before any were sent");

    let payload = b"\x00\x01binary\r\n\r\nGET / HTTP/1.1\r\n\xff";
    client.write_all(payload).await.unwrap();
    let echoed = read_until(&mut client, b"\xff").await;
    assert_eq!(echoed, payload);

    drop(client);
    tokio::time::timeout(TIMEOUT, echo_closed)
        .await
        .expect("echo connection left open")
        .unwrap();
}

#[tokio::test]
async fn absolute_form_request_is_rewritten() {
    let (upstream, seen) = start_recording_server(OK_EMPTY).await;
    let proxy = spawn_proxy(|_| {}).await;

    let mut client = TcpStream::connect(proxy.http).await.unwrap();
    let request = format!(
        "GET http://{}/ HTTP/1.1\r\n\
         Proxy-Connection: keep-alive\r\n\
         Proxy-Authenticate: x\r\n\
         Proxy-Authorization: y\r\n\r\n",
        upstream
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_until(&mut client, b"\r\n\r\n").await;
    assert_eq!(response, OK_EMPTY);

    client.shutdown().await.unwrap();
    let seen = tokio::time::timeout(TIMEOUT, seen).await.unwrap().unwrap();
    assert_eq!(
        String::from_utf8(seen).unwrap(),
        "GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"
    );
}

#[tokio::test]
async fn pipelined_requests_share_one_upstream() {
    let (upstream, seen) = start_recording_server(OK_EMPTY).await;
    let proxy = spawn_proxy(|_| {}).await;

    let mut client = TcpStream::connect(proxy.http).await.unwrap();
    let request = format!(
        "POST http://{0}/submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello\
         GET http://{0}/status HTTP/1.1\r\nHost: {0}\r\n\r\n",
        upstream
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut responses = read_until(&mut client, b"\r\n\r\n").await;
    while responses.len() < 2 * OK_EMPTY.len() {
        responses.extend(read_until(&mut client, b"\r\n\r\n").await);
    }
    assert_eq!(responses, [OK_EMPTY, OK_EMPTY].concat());

    client.shutdown().await.unwrap();
    let seen = tokio::time::timeout(TIMEOUT, seen).await.unwrap().unwrap();
    assert_eq!(
        String::from_utf8(seen).unwrap(),
        format!(
            "POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello\
             GET /status HTTP/1.1\r\nHost: {}\r\n\r\n",
            upstream
        )
    );
}

#[tokio::test]
async fn pipelined_request_for_another_endpoint_is_rejected() {
    let (first, seen) = start_recording_server(OK_EMPTY).await;
    let (second, _) = start_recording_server(OK_EMPTY).await;
    let proxy = spawn_proxy(|config| config.http.check_endpoint_match = true).await;

    let mut client = TcpStream::connect(proxy.http).await.unwrap();
    let request = format!(
        "GET http://{}/a HTTP/1.1\r\n\r\nGET http://{}/b HTTP/1.1\r\n\r\n",
        first, second
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let received = String::from_utf8(read_to_close(&mut client).await).unwrap();
    assert!(received.contains("HTTP/1.1 400"), "{:?}", received);

    // Depending on timing the first request may or may not have gone out,
    // but the second must never reach the first upstream.
    if let Ok(Ok(seen)) = tokio::time::timeout(TIMEOUT, seen).await {
        assert!(!String::from_utf8_lossy(&seen).contains("/b"));
    }
}

#[tokio::test]
async fn refused_connect_gets_bad_request() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let proxy = spawn_proxy(|_| {}).await;
    let mut client = TcpStream::connect(proxy.http).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
        .await
        .unwrap();

    let received = String::from_utf8(read_to_close(&mut client).await).unwrap();
    assert!(received.starts_with("HTTP/1.1 400"), "{:?}", received);
}

#[tokio::test]
async fn garbage_request_gets_bad_request() {
    let proxy = spawn_proxy(|_| {}).await;
    let mut client = TcpStream::connect(proxy.http).await.unwrap();
    client.write_all(b"\x16\x03\x01 not http\r\n\r\n").await.unwrap();

    let received = String::from_utf8_lossy(&read_to_close(&mut client).await).into_owned();
    assert!(received.starts_with("HTTP/1.1 400"), "{:?}", received);
}
