//! Framing for the shared request/response topic.
//!
//! Requests travel gateway-to-agent as JSON envelopes; responses travel back
//! as raw HTTP prefixed with [`RESPONSE_MARKER`](crate::RESPONSE_MARKER). The
//! marker is load-bearing: the agent both subscribes to and publishes on its
//! own topic, so it must be applied before any decode attempt.

use bytes::Bytes;
use n0_error::e;
use serde::{Deserialize, Serialize};

use crate::{RESPONSE_MARKER, TunnelError};

/// One HTTP request travelling from the gateway to an agent.
///
/// Wire field names are fixed; they are part of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The literal HTTP request received by the gateway, to be replayed
    /// against the agent's local service.
    #[serde(rename = "Request")]
    pub request: String,

    /// The IP address of the caller that made the request.
    #[serde(rename = "Source")]
    pub source: String,

    /// Reserved; never populated by the gateway.
    #[serde(rename = "Response", default)]
    pub response: String,
}

impl Envelope {
    /// Builds an envelope around a serialised HTTP request.
    ///
    /// Bytes outside UTF-8 are replaced; the relay buffers whole messages, so
    /// the request is expected to be a complete HTTP/1.x message already.
    pub fn new(request: &[u8], source: impl Into<String>) -> Self {
        Self {
            request: String::from_utf8_lossy(request).into_owned(),
            source: source.into(),
            response: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TunnelError> {
        serde_json::to_vec(self).map_err(|source| e!(TunnelError::MalformedEnvelope { source }))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TunnelError> {
        serde_json::from_slice(payload)
            .map_err(|source| e!(TunnelError::MalformedEnvelope { source }))
    }
}

/// True iff the payload is a response rather than a request envelope.
pub fn is_response(payload: &[u8]) -> bool {
    payload.starts_with(RESPONSE_MARKER)
}

/// Removes the leading response marker.
///
/// The caller must have checked [`is_response`] first.
pub fn strip_response_marker(payload: Bytes) -> Bytes {
    payload.slice(RESPONSE_MARKER.len()..)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_wire_field_names() {
        let envelope = Envelope::new(b"GET /p HTTP/1.1\r\nHost: cake.t.example\r\n\r\n", "10.0.0.5");
        let encoded = envelope.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(
            value["Request"],
            "GET /p HTTP/1.1\r\nHost: cake.t.example\r\n\r\n"
        );
        assert_eq!(value["Source"], "10.0.0.5");
        assert_eq!(value["Response"], "");
    }

    #[test]
    fn decode_round_trips() {
        let envelope = Envelope::new(b"GET / HTTP/1.0\r\n\r\n", "1.2.3.4");
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.request, envelope.request);
        assert_eq!(decoded.source, envelope.source);
        assert_eq!(decoded.response, "");
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(Envelope::decode(b"not json at all").is_err());
    }

    #[test]
    fn decode_rejects_missing_fields() {
        assert!(Envelope::decode(br#"{"Request":"GET / HTTP/1.0\r\n\r\n"}"#).is_err());
    }

    #[test]
    fn decode_tolerates_absent_response_field() {
        let decoded =
            Envelope::decode(br#"{"Request":"GET / HTTP/1.0\r\n\r\n","Source":"::1"}"#).unwrap();
        assert_eq!(decoded.response, "");
    }

    #[test]
    fn marker_detection() {
        assert!(is_response(b"X-HTTP/1.0 200 OK\r\n\r\n"));
        assert!(is_response(b"X-"));
        assert!(!is_response(b"{\"Request\":\"\"}"));
        assert!(!is_response(b"X"));
        assert!(!is_response(b""));
    }

    #[test]
    fn marker_strip() {
        let payload = Bytes::from_static(b"X-HTTP/1.0 200 OK\r\n\r\nhi");
        assert_eq!(
            strip_response_marker(payload),
            Bytes::from_static(b"HTTP/1.0 200 OK\r\n\r\nhi")
        );
    }

    #[test]
    fn envelope_body_bytes_are_escaped() {
        let envelope = Envelope::new(b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\n\x01\x02", "::1");
        let encoded = envelope.encode().unwrap();
        assert!(std::str::from_utf8(&encoded).is_ok());
        let decoded = Envelope::decode(&encoded).unwrap();
        assert!(decoded.request.ends_with("\x01\x02"));
    }
}
