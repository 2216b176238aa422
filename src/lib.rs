//! Expose private HTTP services to the public internet over an MQTT broker.
//!
//! A public [`gateway`] accepts HTTP requests on wildcard hostnames and relays
//! each one, as a JSON envelope on the topic `clients/<label>`, to the
//! [`agent`] named by the first hostname label. The agent performs the request
//! against its local service and publishes the complete raw response back on
//! the same topic, prefixed with [`RESPONSE_MARKER`]; the gateway then writes
//! those bytes verbatim to the caller's socket.

pub mod agent;
pub mod broker;
mod codec;
pub mod error;
pub mod gateway;
mod parse;
mod relay;
mod routes;

pub use codec::{Envelope, is_response, strip_response_marker};
pub use error::TunnelError;

/// How much data to read for a request header section before it's considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Topic namespace shared by all agents; the label is the final path segment.
pub const TOPIC_PREFIX: &str = "clients/";

/// Prefix distinguishing responses from request envelopes on the shared topic.
///
/// Requests and responses traverse the same topic, so every subscriber filters
/// by role before decoding anything: payloads starting with this marker are
/// responses, everything else is attempted as a JSON envelope.
pub const RESPONSE_MARKER: &[u8] = b"X-";

/// Returns the broker topic carrying requests and responses for `label`.
pub fn client_topic(label: &str) -> String {
    format!("{TOPIC_PREFIX}{label}")
}

/// Complete HTTP response published by an agent whose local service is down.
pub const UNREACHABLE_BODY: &[u8] = br"HTTP/1.0 503 OK
Content-type: text/html; charset=UTF-8
Connection: close

<!DOCTYPE html>
<html>
<body>
<p>The remote server was unreachable.</p>
</body>
</html>
";

/// Complete HTTP response written by the gateway when no reply arrives in time.
pub const TIMEOUT_BODY: &[u8] = br"HTTP/1.0 503 OK
Content-type: text/html; charset=UTF-8
Connection: close

<!DOCTYPE html>
<html>
<body>
<p>We didn't receive a reply from the remote host, despite waiting 10 seconds.</p>
</body>
</html>
";

#[cfg(test)]
mod tests;
