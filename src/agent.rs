//! The private-network side of the tunnel.
//!
//! An agent subscribes to its own topic, replays each request envelope
//! against the local service it exposes, and publishes the complete raw
//! response back on the same topic behind the response marker.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::{Envelope, TunnelError, UNREACHABLE_BODY, client_topic, codec, parse};

/// How many recent requests the stats ring keeps for display.
const RECENT_REQUESTS: usize = 5;

/// Configuration for one agent process.
#[derive(Debug, Clone)]
pub struct AgentOpts {
    /// The local `host:port` to expose to the internet.
    pub expose: String,
    /// The address of the publicly visible tunnel host (the broker).
    pub tunnel: String,
    /// The name for this connection; random when unset.
    pub name: Option<String>,
}

/// A connected agent exposing one local service.
#[derive(Debug)]
pub struct Agent {
    expose: String,
    tunnel: String,
    name: String,
    stats: AgentStats,
}

impl Agent {
    pub fn new(opts: AgentOpts) -> Self {
        let name = opts
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            expose: opts.expose,
            tunnel: opts.tunnel,
            name,
            stats: AgentStats::default(),
        }
    }

    /// The label callers use as their hostname's first component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read-only request statistics, for a front-end display.
    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    /// Serves requests arriving on this agent's topic.
    ///
    /// The broker delivers one message at a time, so requests are handled
    /// strictly in series; a slow local service delays later deliveries.
    /// The caller owns `broker` and tears it down on shutdown.
    pub async fn run(&self, broker: &BrokerClient) -> Result<(), TunnelError> {
        let topic = client_topic(&self.name);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        broker
            .subscribe(&topic, move |payload| {
                tx.send(payload).ok();
            })
            .await?;

        println!(
            "Visit http://{}.{} to see the local content from {}",
            self.name, self.tunnel, self.expose
        );

        while let Some(payload) = rx.recv().await {
            self.handle_payload(broker, &topic, payload).await;
        }
        Ok(())
    }

    /// Serves one payload from the shared topic.
    async fn handle_payload(&self, broker: &BrokerClient, topic: &str, payload: Bytes) {
        let Some(envelope) = decode_request(&payload) else {
            return;
        };
        debug!(source = %envelope.source, line = %parse::first_line(&envelope.request), "incoming request");

        let response = self.fetch(envelope.request.as_bytes()).await;

        let mut message = Vec::with_capacity(crate::RESPONSE_MARKER.len() + response.len());
        message.extend_from_slice(crate::RESPONSE_MARKER);
        message.extend_from_slice(&response);
        if let Err(err) = broker.publish(topic, message).await {
            warn!("failed to publish the response: {err}");
        }

        match parse::response_status_code(&response) {
            Some(status) => self
                .stats
                .record(parse::first_line(&envelope.request), status),
            None => debug!("response without a parsable status line"),
        }
    }

    /// Replays the raw request against the exposed service and buffers the
    /// complete response until the service closes the connection.
    ///
    /// Any local failure resolves to the fixed 503 body so the caller always
    /// receives a complete response.
    pub(crate) async fn fetch(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = match TcpStream::connect(&self.expose).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(expose = %self.expose, "failed to connect to the local service: {err}");
                return UNREACHABLE_BODY.to_vec();
            }
        };
        if let Err(err) = stream.write_all(request).await {
            warn!(expose = %self.expose, "failed to forward the request: {err}");
            return UNREACHABLE_BODY.to_vec();
        }
        let mut response = Vec::new();
        if let Err(err) = stream.read_to_end(&mut response).await {
            warn!(expose = %self.expose, "failed to read the response: {err}");
            return UNREACHABLE_BODY.to_vec();
        }
        response
    }
}

/// Classifies a payload from the shared topic.
///
/// Returns `None` for the agent's own response echoes (marker prefix) and for
/// payloads that fail to decode; neither produces a reply.
pub(crate) fn decode_request(payload: &[u8]) -> Option<Envelope> {
    if codec::is_response(payload) {
        return None;
    }
    match Envelope::decode(payload) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!("dropping malformed envelope: {err}");
            None
        }
    }
}

/// Per-status-code counters and the most recent requests.
///
/// Written only from the agent's serial delivery loop; read from a display
/// refresh tick via [`AgentStats::snapshot`].
#[derive(Debug, Default)]
pub struct AgentStats {
    inner: Mutex<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    codes: BTreeMap<u16, u64>,
    recent: VecDeque<RecentRequest>,
}

/// One entry of the recent-requests ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentRequest {
    /// First line of the relayed request.
    pub line: String,
    /// Status code the local service answered with.
    pub status: u16,
}

/// Point-in-time copy of the agent's statistics.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub codes: BTreeMap<u16, u64>,
    /// Most recent request last.
    pub recent: Vec<RecentRequest>,
}

impl AgentStats {
    fn record(&self, line: impl Into<String>, status: u16) {
        let mut inner = self.lock();
        *inner.codes.entry(status).or_default() += 1;
        if inner.recent.len() == RECENT_REQUESTS {
            inner.recent.pop_front();
        }
        inner.recent.push_back(RecentRequest {
            line: line.into(),
            status,
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            codes: inner.codes.clone(),
            recent: inner.recent.iter().cloned().collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
