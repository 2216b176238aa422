use bytes::{Bytes, BytesMut};
use http::{HeaderValue, Method};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio::io::{self, AsyncRead, AsyncReadExt};

use crate::HEADER_SECTION_MAX_LENGTH;

/// Parsed request line and header section of an inbound HTTP request.
///
/// The raw bytes are kept separately; this head exists only for routing
/// decisions (host label, source address, body length). The relay never
/// re-emits from parsed fields.
#[derive(Debug)]
pub(crate) struct RequestHead {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target as received.
    pub target: String,
    /// Raw header map as received.
    pub headers: http::HeaderMap<HeaderValue>,
}

impl RequestHead {
    pub fn host(&self) -> Option<&str> {
        self.headers.get(http::header::HOST).and_then(|v| v.to_str().ok())
    }

    pub fn forwarded_for(&self) -> Option<&str> {
        self.headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Declared body length; absent or unparsable headers count as zero.
    pub fn content_length(&self) -> usize {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Reads one complete HTTP/1.x request message from `reader`.
///
/// Returns the verbatim message bytes (request line, headers, CRLF, body) and
/// the parsed head. The header section is capped at
/// [`HEADER_SECTION_MAX_LENGTH`]; the body is read to the declared
/// `Content-Length`.
pub(crate) async fn read_request(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(Bytes, RequestHead)> {
    let mut buf = BytesMut::with_capacity(4 * 1024);

    let (header_len, head) = loop {
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if buf.len() >= HEADER_SECTION_MAX_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "Buffer size limit reached before end of request header section",
            )
            .into());
        }
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed before end of request header section",
            )
            .into());
        }
    };

    let total = header_len + head.content_length();
    while buf.len() < total {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed before end of request body",
            )
            .into());
        }
    }
    buf.truncate(total);
    Ok((buf.freeze(), head))
}

/// Parses a request head from a buffer and returns `None` when incomplete.
///
/// Returns the length of the header section and the head.
fn parse_head(buf: &[u8]) -> Result<Option<(usize, RequestHead)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf).std_context("Invalid HTTP request")? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(header_len) => {
            let method_str = req.method.context("Missing HTTP method")?;
            let method = method_str.parse().std_context("Invalid HTTP method")?;
            let target = req.path.context("Missing request target")?.to_string();
            let headers = http::HeaderMap::from_iter(req.headers.iter_mut().flat_map(|h| {
                let value = HeaderValue::from_bytes(h.value).ok()?;
                let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                Some((name, value))
            }));
            Ok(Some((
                header_len,
                RequestHead {
                    method,
                    target,
                    headers,
                },
            )))
        }
    }
}

/// Derives the agent label from a `Host` value: the first `.`-separated
/// component, or the whole host when it contains no dot.
pub(crate) fn host_label(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

/// First line of a serialised HTTP message, without the line terminator.
pub(crate) fn first_line(message: &str) -> &str {
    message.lines().next().map(str::trim_end).unwrap_or("")
}

/// Status code of a raw HTTP response: the first space-separated token after
/// the status line's HTTP version.
pub(crate) fn response_status_code(response: &[u8]) -> Option<u16> {
    let line_end = response
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(response.len());
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut tokens = line.split_whitespace();
    let _version = tokens.next()?;
    tokens.next()?.parse().ok()
}
