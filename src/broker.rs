//! Thin client for the shared MQTT broker.
//!
//! One connection per process. A single dispatch task owns the event loop and
//! invokes the registered callback for each publish it receives, so delivery
//! is serialised per client; callbacks must stay cheap and hand real work to
//! a channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use n0_error::e;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::TunnelError;

/// Default MQTT port expected on the tunnel host.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Buffered HTTP messages ride in single publishes, so the packet cap is well
/// above rumqttc's default.
const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// Connection options for the shared broker.
#[derive(Debug, Clone)]
pub struct BrokerOpts {
    /// Broker hostname.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Client identifier; must be unique per broker-connected process.
    pub client_id: String,
}

impl BrokerOpts {
    pub fn new(host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_BROKER_PORT,
            client_id: client_id.into(),
        }
    }
}

type Callback = Arc<dyn Fn(Bytes) + Send + Sync>;
type Subscriptions = Arc<Mutex<HashMap<String, Callback>>>;

/// Handle to the process-wide broker connection.
#[derive(Clone, derive_more::Debug)]
pub struct BrokerClient {
    #[debug(skip)]
    client: AsyncClient,
    #[debug("Subscriptions")]
    subs: Subscriptions,
    shutdown: CancellationToken,
}

impl BrokerClient {
    /// Dials the broker and blocks until the MQTT handshake completes.
    ///
    /// On success a dispatch task is spawned that keeps polling the
    /// connection for the life of the process.
    pub async fn connect(opts: BrokerOpts) -> Result<Self, TunnelError> {
        let mut mqtt_opts = MqttOptions::new(opts.client_id.clone(), opts.host.clone(), opts.port);
        mqtt_opts.set_keep_alive(KEEP_ALIVE);
        mqtt_opts.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 64);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(e!(TunnelError::BrokerRejected { code: ack.code }));
                }
                Ok(_) => continue,
                Err(source) => {
                    return Err(e!(TunnelError::BrokerUnreachable {
                        host: opts.host.clone(),
                        port: opts.port,
                        source
                    }));
                }
            }
        }
        debug!(host = %opts.host, port = opts.port, client_id = %opts.client_id, "connected to broker");

        let subs = Subscriptions::default();
        let shutdown = CancellationToken::new();
        tokio::spawn(
            dispatch(eventloop, client.clone(), subs.clone(), shutdown.clone())
                .instrument(error_span!("broker-dispatch")),
        );
        Ok(Self {
            client,
            subs,
            shutdown,
        })
    }

    /// Registers `callback` for `topic` and subscribes on the broker.
    ///
    /// A topic carries a single callback; subscribing again replaces it.
    /// Callbacks run on the dispatch task, one message at a time.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(Bytes) + Send + Sync + 'static,
    ) -> Result<(), TunnelError> {
        self.lock_subs()
            .insert(topic.to_string(), Arc::new(callback));
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|source| {
                e!(TunnelError::SubscribeFailed {
                    topic: topic.to_string(),
                    source
                })
            })
    }

    /// Publishes `payload` on `topic` with QoS 0.
    ///
    /// Resolves once the message is buffered on the connection; no broker
    /// acknowledgement is awaited.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|source| {
                e!(TunnelError::PublishFailed {
                    topic: topic.to_string(),
                    source
                })
            })
    }

    /// Drops the callback for `topic` and unsubscribes on the broker.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TunnelError> {
        self.lock_subs().remove(topic);
        self.client.unsubscribe(topic).await.map_err(|source| {
            e!(TunnelError::SubscribeFailed {
                topic: topic.to_string(),
                source
            })
        })
    }

    /// Tears the connection down; used on clean shutdown.
    pub async fn disconnect(&self) {
        self.shutdown.cancel();
        self.client.disconnect().await.ok();
    }

    fn lock_subs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Callback>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Polls the event loop forever, routing publishes to their callbacks.
///
/// rumqttc re-dials on the next poll after a connection error; subscriptions
/// are replayed on every fresh ConnAck so they survive reconnects.
async fn dispatch(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subs: Subscriptions,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let callback = subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&publish.topic)
                    .cloned();
                match callback {
                    Some(callback) => callback(publish.payload),
                    None => trace!(topic = %publish.topic, "publish without subscriber"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let topics: Vec<String> = subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect();
                for topic in topics {
                    if let Err(err) = client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
                        warn!(%topic, "failed to replay subscription: {err}");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("broker connection error: {err}");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("broker dispatch stopped");
}
