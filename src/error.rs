use std::io;

use n0_error::stack_error;
use rumqttc::{ClientError, ConnectReturnCode, ConnectionError};

/// Errors that can occur while running the gateway or an agent.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum TunnelError {
    /// The broker handshake never completed
    #[error("failed to reach broker at {host}:{port}")]
    BrokerUnreachable {
        /// Broker hostname we dialled
        host: String,
        /// Broker port we dialled
        port: u16,
        #[error(source, std_err)]
        source: ConnectionError,
    },

    /// The broker answered the handshake with a refusal
    #[error("broker refused the connection: {code:?}")]
    BrokerRejected { code: ConnectReturnCode },

    /// Failed to register a topic subscription with the broker
    #[error("failed to subscribe to {topic}")]
    SubscribeFailed {
        topic: String,
        #[error(source, std_err)]
        source: ClientError,
    },

    /// Failed to hand a publish to the broker connection
    #[error("failed to publish to {topic}")]
    PublishFailed {
        topic: String,
        #[error(source, std_err)]
        source: ClientError,
    },

    /// A request envelope failed to encode or decode
    #[error("malformed request envelope")]
    MalformedEnvelope {
        #[error(source, std_err)]
        source: serde_json::Error,
    },

    /// Failed to bind the front-end TCP listener
    #[error("failed to bind tcp socket to {addr}")]
    Bind {
        /// The address we tried to bind to
        addr: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Failed to accept an incoming TCP connection
    #[error("failed to accept tcp connection")]
    Accept {
        #[error(source, std_err)]
        source: io::Error,
    },
}
