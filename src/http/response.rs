//! Response construction and HTTP/1.x encoding.
//!
//! # Responsibilities
//! - Build simple text responses (the synthesized 404 among them)
//! - Stamp the `Connection` header with the keep-alive decision
//! - Serialize status line, headers and body onto the wire
//!
//! # Design Decisions
//! - Bodies are fully buffered, so framing is always `Content-Length`
//! - No body is written for HEAD requests or 1xx / 204 / 304 responses

use std::io;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderValue, Response, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A plain-text response with the given status.
pub fn simple_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Bytes> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// The response sent when no pipeline stage produced one.
pub fn not_found() -> Response<Bytes> {
    simple_response(StatusCode::NOT_FOUND, "Not Found")
}

/// Tell the client whether the connection survives this response.
pub fn set_keep_alive(response: &mut Response<Bytes>, keep_alive: bool) {
    let value = if keep_alive { "keep-alive" } else { "close" };
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static(value));
}

/// Whether a response with this status may carry a body.
fn body_allowed(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Encode the status line and header block.
pub fn encode_head(response: &Response<Bytes>) -> Vec<u8> {
    let status = response.status();
    let mut out = Vec::with_capacity(256);

    if response.version() == Version::HTTP_10 {
        out.extend_from_slice(b"HTTP/1.0 ");
    } else {
        out.extend_from_slice(b"HTTP/1.1 ");
    }
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in response.headers() {
        // the body is complete, chunked framing would be wrong
        if *name == TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if body_allowed(status) && !response.headers().contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(b"content-length: ");
        out.extend_from_slice(response.body().len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Write `response` to `writer`. The caller flushes.
pub async fn write_response<W>(
    writer: &mut W,
    response: &Response<Bytes>,
    head_request: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_head(response)).await?;
    if !head_request && body_allowed(response.status()) {
        writer.write_all(response.body()).await?;
    }
    Ok(())
}
