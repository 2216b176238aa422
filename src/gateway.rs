//! Public HTTP front end.
//!
//! Binds a plain TCP listener and hands every accepted connection to the
//! relay, whatever the method or path. Owning the socket directly is what
//! lets the relay write the agent's response bytes back unmodified.

use std::sync::Arc;

use n0_error::e;
use tokio::net::TcpListener;
use tracing::{Instrument, debug, warn, warn_span};

use crate::TunnelError;
use crate::broker::BrokerClient;
use crate::relay::Relay;

/// Configuration for the gateway front end.
#[derive(Debug, Clone)]
pub struct GatewayOpts {
    /// The IP to listen upon.
    pub bind_host: String,
    /// The port to bind upon.
    pub bind_port: u16,
}

impl Default for GatewayOpts {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8080,
        }
    }
}

/// Binds the front end and serves through `broker` until failure.
///
/// The caller owns the broker connection and tears it down on shutdown.
pub async fn serve(broker: BrokerClient, opts: GatewayOpts) -> Result<(), TunnelError> {
    let relay = Arc::new(Relay::new(broker));

    let bind = format!("{}:{}", opts.bind_host, opts.bind_port);
    let listener = TcpListener::bind(&bind).await.map_err(|source| {
        e!(TunnelError::Bind {
            addr: bind.clone(),
            source
        })
    })?;
    println!("Launching the server on http://{bind}");
    accept_loop(relay, listener).await
}

/// Runs an accept loop on `listener` and relays every connection.
async fn accept_loop(relay: Arc<Relay>, listener: TcpListener) -> Result<(), TunnelError> {
    let mut conn_id = 0u64;
    loop {
        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|source| e!(TunnelError::Accept { source }))?;
        conn_id += 1;
        let relay = relay.clone();
        tokio::spawn(
            async move {
                debug!("New connection from {}", peer_addr);
                if let Err(err) = relay.handle_connection(stream, peer_addr).await {
                    warn!("Connection closed with error: {:#}", err);
                } else {
                    debug!("Connection closed");
                }
            }
            .instrument(warn_span!("conn", id = %conn_id)),
        );
    }
}
