use std::net::SocketAddr;

use n0_error::Result;
use n0_tracing_test::traced_test;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::agent::{Agent, AgentOpts, decode_request};
use crate::parse::{first_line, host_label, read_request, response_status_code};
use crate::relay::RELAY_TIMEOUT;
use crate::routes::RoutingTable;
use crate::{TIMEOUT_BODY, UNREACHABLE_BODY, client_topic};

// -- Test helpers --

/// Spawns a raw TCP origin that reads one request head, answers with the
/// fixed response bytes, and closes. Returns the address and a channel
/// carrying the bytes the origin received.
async fn spawn_origin(response: &'static [u8]) -> Result<(SocketAddr, oneshot::Receiver<Vec<u8>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut received = vec![0u8; 4096];
        let mut len = 0;
        loop {
            match stream.read(&mut received[len..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    len += n;
                    if received[..len].windows(4).any(|w| w == b"\r\n\r\n") || len == received.len()
                    {
                        break;
                    }
                }
            }
        }
        received.truncate(len);
        stream.write_all(response).await.ok();
        stream.shutdown().await.ok();
        tx.send(received).ok();
    });
    Ok((addr, rx))
}

fn agent_exposing(expose: impl Into<String>) -> Agent {
    Agent::new(AgentOpts {
        expose: expose.into(),
        tunnel: "localhost".to_string(),
        name: Some("cake".to_string()),
    })
}

// -- Request reading --

#[tokio::test]
async fn read_request_without_body() -> Result {
    let raw: &[u8] = b"GET /p HTTP/1.1\r\nHost: cake.t.example\r\n\r\n";
    let mut reader = std::io::Cursor::new(raw);
    let (bytes, head) = read_request(&mut reader).await?;
    assert_eq!(&bytes[..], raw);
    assert_eq!(head.host(), Some("cake.t.example"));
    assert_eq!(head.method, http::Method::GET);
    assert_eq!(head.target, "/p");
    assert_eq!(head.content_length(), 0);
    Ok(())
}

#[tokio::test]
async fn read_request_with_body() -> Result {
    let raw: &[u8] = b"POST /submit HTTP/1.1\r\nHost: box.t.example\r\nContent-Length: 5\r\n\r\nhello";
    let mut reader = std::io::Cursor::new(raw);
    let (bytes, head) = read_request(&mut reader).await?;
    assert_eq!(&bytes[..], raw);
    assert_eq!(head.content_length(), 5);
    Ok(())
}

#[tokio::test]
async fn read_request_stops_at_declared_body_length() -> Result {
    // A pipelined second request must not leak into the first message.
    let raw: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\nhiGET / HTTP/1.1\r\n\r\n";
    let mut reader = std::io::Cursor::new(raw);
    let (bytes, _head) = read_request(&mut reader).await?;
    let expected: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\nhi";
    assert_eq!(&bytes[..], expected);
    Ok(())
}

#[tokio::test]
async fn read_request_rejects_oversized_header_section() {
    let mut raw = b"GET / HTTP/1.1\r\nHost: a\r\nX-Filler: ".to_vec();
    raw.extend(std::iter::repeat_n(b'x', 9000));
    let mut reader = std::io::Cursor::new(raw);
    assert!(read_request(&mut reader).await.is_err());
}

#[tokio::test]
async fn read_request_rejects_truncated_body() {
    let raw: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nhi";
    let mut reader = std::io::Cursor::new(raw);
    assert!(read_request(&mut reader).await.is_err());
}

#[tokio::test]
async fn read_request_rejects_garbage() {
    let raw: &[u8] = b"NOT VALID HTTP\r\n\r\n";
    let mut reader = std::io::Cursor::new(raw);
    assert!(read_request(&mut reader).await.is_err());
}

// -- Label and status-line handling --

#[test]
fn label_is_first_hostname_component() {
    assert_eq!(host_label("cake.t.example"), "cake");
    assert_eq!(host_label("cake.t.example:8080"), "cake");
}

#[test]
fn label_without_dot_is_whole_host() {
    assert_eq!(host_label("localhost"), "localhost");
    assert_eq!(host_label(""), "");
}

#[test]
fn topic_is_label_under_clients() {
    assert_eq!(client_topic("cake"), "clients/cake");
}

#[test]
fn status_code_is_token_after_version() {
    assert_eq!(response_status_code(b"HTTP/1.0 503 OK\nbody"), Some(503));
    assert_eq!(
        response_status_code(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"),
        Some(200)
    );
    assert_eq!(response_status_code(b"HTTP/1.1 404\r\n\r\n"), Some(404));
    assert_eq!(response_status_code(b"garbage response"), None);
    assert_eq!(response_status_code(b""), None);
}

#[test]
fn first_line_drops_terminator() {
    assert_eq!(
        first_line("GET /p HTTP/1.1\r\nHost: a\r\n\r\n"),
        "GET /p HTTP/1.1"
    );
    assert_eq!(first_line(""), "");
}

// -- Fallback bodies --

#[test]
fn fallback_bodies_are_byte_exact() {
    assert_eq!(
        UNREACHABLE_BODY,
        concat!(
            "HTTP/1.0 503 OK\n",
            "Content-type: text/html; charset=UTF-8\n",
            "Connection: close\n",
            "\n",
            "<!DOCTYPE html>\n",
            "<html>\n",
            "<body>\n",
            "<p>The remote server was unreachable.</p>\n",
            "</body>\n",
            "</html>\n",
        )
        .as_bytes()
    );
    assert_eq!(
        TIMEOUT_BODY,
        concat!(
            "HTTP/1.0 503 OK\n",
            "Content-type: text/html; charset=UTF-8\n",
            "Connection: close\n",
            "\n",
            "<!DOCTYPE html>\n",
            "<html>\n",
            "<body>\n",
            "<p>We didn't receive a reply from the remote host, despite waiting 10 seconds.</p>\n",
            "</body>\n",
            "</html>\n",
        )
        .as_bytes()
    );
}

// -- Agent payload classification --

#[test]
fn agent_ignores_its_own_response_echo() {
    assert!(decode_request(b"X-HTTP/1.0 200 OK\r\n\r\nhi").is_none());
}

#[test]
fn agent_drops_malformed_envelopes() {
    assert!(decode_request(b"neither marker nor json").is_none());
}

#[test]
fn agent_accepts_request_envelopes() {
    let envelope =
        decode_request(br#"{"Request":"GET / HTTP/1.1\r\n\r\n","Source":"10.0.0.5","Response":""}"#)
            .expect("valid envelope");
    assert_eq!(envelope.request, "GET / HTTP/1.1\r\n\r\n");
    assert_eq!(envelope.source, "10.0.0.5");
}

// -- Agent fetch --

#[tokio::test]
#[traced_test]
async fn fetch_relays_request_and_response_verbatim() -> Result {
    let response = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nhi";
    let (addr, received) = spawn_origin(response).await?;

    let agent = agent_exposing(addr.to_string());
    let request = b"GET /p HTTP/1.1\r\nHost: cake.t.example\r\n\r\n";
    let fetched = agent.fetch(request).await;

    assert_eq!(fetched, response);
    assert_eq!(received.await.unwrap(), request);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn fetch_answers_with_fallback_when_service_is_down() -> Result {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let agent = agent_exposing(addr.to_string());
    let fetched = agent.fetch(b"GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(fetched, UNREACHABLE_BODY);
    Ok(())
}

// -- Relay wait --

#[tokio::test(start_paused = true)]
async fn relay_wait_gives_up_after_the_timeout() {
    let routes = RoutingTable::default();
    let mut pending = routes.register("ghost");

    let start = tokio::time::Instant::now();
    let waited = tokio::time::timeout(RELAY_TIMEOUT, pending.response()).await;
    assert!(waited.is_err());
    assert_eq!(start.elapsed(), RELAY_TIMEOUT);
}
