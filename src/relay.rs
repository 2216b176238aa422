//! Request relay between public HTTP callers and agents on the broker.
//!
//! Each accepted connection is read as one complete HTTP/1.x message,
//! wrapped in a JSON envelope, and published on the topic of the agent named
//! by the caller's hostname label. The handler then waits on its routing
//! entry for the agent's raw response and writes it to the caller's socket
//! verbatim; re-emitting through any response-building machinery would
//! corrupt the agent's headers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use n0_error::{Result, anyerr};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::BrokerClient;
use crate::parse::{self, RequestHead};
use crate::routes::RoutingTable;
use crate::{Envelope, TIMEOUT_BODY, client_topic, codec};

/// How long the gateway waits for an agent's response before giving up.
pub(crate) const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Front-end socket timeouts; generous compared to the relay wait so slow
/// callers can still transmit headers and body.
const FRONTEND_IO_TIMEOUT: Duration = Duration::from_secs(300);

/// Relays inbound HTTP requests through the broker to agents.
#[derive(Debug)]
pub(crate) struct Relay {
    broker: BrokerClient,
    routes: Arc<RoutingTable>,
}

impl Relay {
    pub fn new(broker: BrokerClient) -> Self {
        Self {
            broker,
            routes: Arc::new(RoutingTable::default()),
        }
    }

    /// Serves one public caller: reads the request, relays it, writes the
    /// response bytes back, and closes the socket.
    pub async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (mut recv, mut send) = stream.split();

        let (request, head) = match timeout(FRONTEND_IO_TIMEOUT, parse::read_request(&mut recv)).await
        {
            Ok(read) => read?,
            Err(_) => return Err(anyerr!("timed out reading request")),
        };

        let label = parse::host_label(head.host().unwrap_or_default()).to_string();
        let source = source_ip(&head, peer);
        debug!(%label, %source, method = %head.method, target = %head.target, "relaying request");

        let envelope = Envelope::new(&request, source).encode()?;
        let response = self.relay(&label, envelope).await;

        match timeout(FRONTEND_IO_TIMEOUT, send.write_all(&response)).await {
            Ok(written) => written?,
            Err(_) => return Err(anyerr!("timed out writing response")),
        }
        send.shutdown().await.ok();
        Ok(())
    }

    /// Publishes the envelope for `label` and waits for the matching response.
    ///
    /// Failures past this point never surface to the caller as errors; they
    /// resolve to the 503 timeout body so the socket always receives a
    /// complete HTTP response.
    async fn relay(&self, label: &str, envelope: Vec<u8>) -> Bytes {
        let topic = client_topic(label);
        let mut pending = self.routes.register(label);

        let routes = self.routes.clone();
        let route_label = label.to_string();
        if let Err(err) = self
            .broker
            .subscribe(&topic, move |payload| {
                if codec::is_response(&payload) {
                    routes.complete(&route_label, codec::strip_response_marker(payload));
                }
            })
            .await
        {
            warn!("failed to subscribe for the response: {err}");
        }

        if let Err(err) = self.broker.publish(&topic, envelope).await {
            warn!("failed to publish the request: {err}");
        }

        let response = match timeout(RELAY_TIMEOUT, pending.response()).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!(%label, "displaced by a newer request for the same label");
                Bytes::from_static(TIMEOUT_BODY)
            }
            Err(_) => {
                debug!(%label, "no reply within {RELAY_TIMEOUT:?}");
                Bytes::from_static(TIMEOUT_BODY)
            }
        };

        if let Err(err) = self.broker.unsubscribe(&topic).await {
            warn!("failed to unsubscribe from {topic}: {err}");
        }
        self.routes.release(&pending);
        response
    }
}

/// The caller's IP: the first `X-Forwarded-For` entry when present, else the
/// peer address without port.
pub(crate) fn source_ip(head: &RequestHead, peer: SocketAddr) -> String {
    match head.forwarded_for().and_then(|v| v.split(',').next()) {
        Some(first) => strip_port(first.trim()),
        None => peer.ip().to_string(),
    }
}

/// Removes a `:port` suffix from a forwarded address without mangling bare
/// IPv6 literals.
fn strip_port(entry: &str) -> String {
    if entry.parse::<IpAddr>().is_ok() {
        return entry.to_string();
    }
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    // hostname:port, but not a bare v6 address with its many colons
    if let Some((host, port)) = entry.rsplit_once(':')
        && !host.contains(':')
        && !port.is_empty()
        && port.bytes().all(|b| b.is_ascii_digit())
    {
        return host.to_string();
    }
    entry.to_string()
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;
    use crate::parse::RequestHead;

    fn head_with_xff(value: Option<&str>) -> RequestHead {
        let mut headers = http::HeaderMap::new();
        if let Some(value) = value {
            headers.insert("x-forwarded-for", HeaderValue::from_str(value).unwrap());
        }
        RequestHead {
            method: http::Method::GET,
            target: "/".to_string(),
            headers,
        }
    }

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn source_prefers_first_forwarded_entry() {
        let head = head_with_xff(Some("10.0.0.5, 1.2.3.4"));
        assert_eq!(source_ip(&head, peer("9.9.9.9:1234")), "10.0.0.5");
    }

    #[test]
    fn source_falls_back_to_peer_without_port() {
        let head = head_with_xff(None);
        assert_eq!(source_ip(&head, peer("9.9.9.9:1234")), "9.9.9.9");
    }

    #[test]
    fn source_ignores_empty_forwarded_header() {
        let head = head_with_xff(Some(" "));
        assert_eq!(source_ip(&head, peer("9.9.9.9:1234")), "9.9.9.9");
    }

    #[test]
    fn source_strips_forwarded_port() {
        let head = head_with_xff(Some("10.0.0.5:9999, 1.2.3.4"));
        assert_eq!(source_ip(&head, peer("9.9.9.9:1234")), "10.0.0.5");
    }

    #[test]
    fn source_keeps_bare_ipv6_intact() {
        let head = head_with_xff(Some("2001:db8::1"));
        assert_eq!(source_ip(&head, peer("9.9.9.9:1234")), "2001:db8::1");
    }

    #[test]
    fn source_unwraps_bracketed_ipv6_with_port() {
        let head = head_with_xff(Some("[2001:db8::1]:443"));
        assert_eq!(source_ip(&head, peer("9.9.9.9:1234")), "2001:db8::1");
    }

    #[test]
    fn source_strips_port_from_hostnames() {
        let head = head_with_xff(Some("proxy.internal:8080"));
        assert_eq!(source_ip(&head, peer("9.9.9.9:1234")), "proxy.internal");
    }

    #[test]
    fn source_from_ipv6_peer() {
        let head = head_with_xff(None);
        assert_eq!(source_ip(&head, peer("[2001:db8::2]:9999")), "2001:db8::2");
    }
}
