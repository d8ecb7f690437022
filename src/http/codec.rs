//! HTTP/1.x request decoding.
//!
//! # Responsibilities
//! - Hold the per-connection read buffer (allocated fallibly)
//! - Parse request line and headers with `httparse`
//! - Read bodies framed by `Content-Length` or chunked encoding
//! - Tell a peer that went away apart from a peer that sent garbage
//!
//! Bytes that follow a request stay in the buffer for the next read, so
//! pipelined requests on one connection are served in order.

use std::collections::TryReserveError;
use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Request, Version};
use httparse::Status;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::ConnectionConfig;

/// Most headers accepted on a single request.
const MAX_HEADERS: usize = 64;

/// Error type for request decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The peer closed the connection between requests.
    #[error("connection closed by peer")]
    Closed,
    /// The peer closed the connection part way through a request.
    #[error("connection closed mid-request")]
    UnexpectedEof,
    #[error("malformed request: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("invalid request head: {0}")]
    InvalidHead(#[from] http::Error),
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid chunked body")]
    InvalidChunk,
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the error only means the peer stopped talking.
    pub fn is_closed(&self) -> bool {
        match self {
            CodecError::Closed | CodecError::UnexpectedEof => true,
            CodecError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Size limits applied while decoding.
#[derive(Debug, Clone, Copy)]
pub struct CodecLimits {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl From<&ConnectionConfig> for CodecLimits {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_head_bytes: config.max_head_bytes,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

impl Default for CodecLimits {
    fn default() -> Self {
        (&ConnectionConfig::default()).into()
    }
}

/// Read buffer for one connection.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    /// Allocate a buffer of `capacity` bytes, reporting failure instead of
    /// aborting.
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)?;
        Ok(Self { buf })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    /// Read whatever the peer has sent; `Ok(0)` means end of stream.
    async fn fill<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        reader.read_buf(&mut self.buf).await
    }

    /// Read at least one more byte, treating end of stream as truncation.
    async fn fill_more<R>(&mut self, reader: &mut R) -> Result<(), CodecError>
    where
        R: AsyncRead + Unpin,
    {
        match self.fill(reader).await? {
            0 => Err(CodecError::UnexpectedEof),
            _ => Ok(()),
        }
    }

    /// Read until the buffer holds at least `len` bytes.
    async fn fill_to<R>(&mut self, reader: &mut R, len: usize) -> Result<(), CodecError>
    where
        R: AsyncRead + Unpin,
    {
        if len > self.buf.len() {
            self.buf.reserve(len - self.buf.len());
        }
        while self.buf.len() < len {
            self.fill_more(reader).await?;
        }
        Ok(())
    }
}

/// Read the next complete request from `reader`.
pub async fn read_request<R>(
    reader: &mut R,
    buf: &mut ReadBuffer,
    limits: &CodecLimits,
) -> Result<Request<Bytes>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let (head, head_len) = loop {
        if !buf.is_empty() {
            if let Some(parsed) = parse_head(buf.as_slice())? {
                break parsed;
            }
        }
        if buf.len() >= limits.max_head_bytes {
            return Err(CodecError::HeadTooLarge(limits.max_head_bytes));
        }
        if buf.fill(reader).await? == 0 {
            return Err(if buf.is_empty() {
                CodecError::Closed
            } else {
                CodecError::UnexpectedEof
            });
        }
    };
    buf.consume(head_len);

    let body = match body_framing(&head.headers)? {
        Framing::Empty => Bytes::new(),
        Framing::Length(len) => read_sized(reader, buf, len, limits).await?,
        Framing::Chunked => read_chunked(reader, buf, limits).await?,
    };

    Ok(Request::from_parts(head, body))
}

fn parse_head(bytes: &[u8]) -> Result<Option<(http::request::Parts, usize)>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(bytes)? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(req.method.unwrap_or_default())
        .uri(req.path.unwrap_or_default())
        .version(version);
    for header in req.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    let (parts, ()) = builder.body(())?.into_parts();
    Ok(Some((parts, len)))
}

enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

fn body_framing(headers: &HeaderMap) -> Result<Framing, CodecError> {
    if let Some(value) = headers.get(TRANSFER_ENCODING) {
        let value = value
            .to_str()
            .map_err(|_| CodecError::UnsupportedTransferEncoding)?;
        // chunked must be the final coding
        let last = value.rsplit(',').next().unwrap_or_default().trim();
        return if last.eq_ignore_ascii_case("chunked") {
            Ok(Framing::Chunked)
        } else {
            Err(CodecError::UnsupportedTransferEncoding)
        };
    }

    match headers.get(CONTENT_LENGTH) {
        None => Ok(Framing::Empty),
        Some(value) => {
            let len: usize = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or(CodecError::InvalidContentLength)?;
            Ok(if len == 0 {
                Framing::Empty
            } else {
                Framing::Length(len)
            })
        }
    }
}

async fn read_sized<R>(
    reader: &mut R,
    buf: &mut ReadBuffer,
    len: usize,
    limits: &CodecLimits,
) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin,
{
    if len > limits.max_body_bytes {
        return Err(CodecError::BodyTooLarge(limits.max_body_bytes));
    }
    buf.fill_to(reader, len).await?;
    let body = Bytes::copy_from_slice(&buf.as_slice()[..len]);
    buf.consume(len);
    Ok(body)
}

async fn read_chunked<R>(
    reader: &mut R,
    buf: &mut ReadBuffer,
    limits: &CodecLimits,
) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let (used, size) = loop {
            match httparse::parse_chunk_size(&buf.as_slice()[pos..]) {
                Ok(Status::Complete(parsed)) => break parsed,
                Ok(Status::Partial) if buf.len() - pos > limits.max_head_bytes => {
                    return Err(CodecError::InvalidChunk)
                }
                Ok(Status::Partial) => buf.fill_more(reader).await?,
                Err(_) => return Err(CodecError::InvalidChunk),
            }
        };
        pos += used;
        if size == 0 {
            break;
        }

        let size = usize::try_from(size)
            .ok()
            .filter(|size| body.len().saturating_add(*size) <= limits.max_body_bytes)
            .ok_or(CodecError::BodyTooLarge(limits.max_body_bytes))?;
        buf.fill_to(reader, pos + size + 2).await?;

        let chunk = &buf.as_slice()[pos..pos + size + 2];
        if &chunk[size..] != b"\r\n" {
            return Err(CodecError::InvalidChunk);
        }
        body.extend_from_slice(&chunk[..size]);
        pos += size + 2;
    }

    // Trailers are discarded; the block ends at an empty line.
    loop {
        match find_crlf(&buf.as_slice()[pos..]) {
            Some(0) => {
                pos += 2;
                break;
            }
            Some(line) => pos += line + 2,
            None if buf.len() - pos > limits.max_head_bytes => {
                return Err(CodecError::HeadTooLarge(limits.max_head_bytes))
            }
            None => buf.fill_more(reader).await?,
        }
    }

    buf.consume(pos);
    Ok(body.freeze())
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\r\n")
}
