//! Buffered HTTP/1.1 framing for inbound requests and upstream responses.
//!
//! Bodies are always read completely: a record needs the whole response, and
//! the fingerprint needs the whole request body.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const READ_BUFFER: usize = 8192;

/// Size and time limits applied while reading one message.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub idle_timeout: Duration,
    pub read_timeout: Duration,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    /// Headers in arrival order, framing headers removed.
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub keep_alive: bool,
}

impl InboundRequest {
    /// Wire form of the request with a normalized body framing.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(request_target(&self.uri).as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// `path?query` of a URI, `/` when empty.
pub fn request_target(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
    UntilClose,
}

struct Head {
    start_line: String,
    headers: HeaderMap,
    content_length: Option<usize>,
    chunked: bool,
    connection_tokens: HashSet<String>,
}

pub async fn read_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    limits: &Limits,
) -> Result<Option<InboundRequest>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(limits.idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + limits.read_timeout;
    let Some(head) = read_head(reader, peer, deadline, limits.max_header_bytes).await? else {
        return Ok(None);
    };

    let mut parts = head.start_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;

    let keep_alive = if head.connection_tokens.contains("close") {
        false
    } else if version == Version::HTTP_10 {
        head.connection_tokens.contains("keep-alive")
    } else {
        true
    };

    let plan = if head.chunked {
        BodyPlan::Chunked
    } else {
        match head.content_length {
            Some(0) | None => BodyPlan::Empty,
            Some(length) => BodyPlan::Fixed(length),
        }
    };
    let body = read_body(reader, plan, limits, peer, "request").await?;

    Ok(Some(InboundRequest {
        method,
        uri,
        version,
        headers: strip_framing(head.headers, &head.connection_tokens),
        body,
        keep_alive,
    }))
}

pub async fn read_response<S>(
    reader: &mut BufReader<S>,
    request_method: &Method,
    peer: SocketAddr,
    limits: &Limits,
) -> Result<UpstreamResponse>
where
    S: AsyncRead + Unpin,
{
    loop {
        let deadline = Instant::now() + limits.read_timeout;
        let head = read_head(reader, peer, deadline, limits.max_header_bytes)
            .await?
            .ok_or_else(|| anyhow!("upstream closed connection before sending status line"))?;
        let (_, status) = parse_status_line(&head.start_line)?;
        if status.is_informational() {
            continue;
        }

        let plan = if *request_method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            BodyPlan::Empty
        } else if head.chunked {
            BodyPlan::Chunked
        } else if let Some(length) = head.content_length {
            if length == 0 {
                BodyPlan::Empty
            } else {
                BodyPlan::Fixed(length)
            }
        } else {
            BodyPlan::UntilClose
        };
        let body = read_body(reader, plan, limits, peer, "upstream response").await?;
        return Ok(UpstreamResponse {
            status,
            headers: head.headers,
            body,
        });
    }
}

pub fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };
    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;
    Ok((version, status))
}

async fn read_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_header_bytes: usize,
) -> Result<Option<Head>>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_header_bytes > 0, "header limit must be greater than zero");
    let mut line = String::new();
    let mut used = read_line_with_deadline(reader, &mut line, deadline, peer, max_header_bytes).await?;
    if used == 0 {
        return Ok(None);
    }
    let start_line = line.trim_end_matches(['\r', '\n']).to_string();
    if start_line.is_empty() {
        bail!("empty start line from {peer}");
    }

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding = false;
    let mut connection_tokens = HashSet::new();
    loop {
        let remaining = max_header_bytes
            .checked_sub(used)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("headers from {peer} exceed configured limit"))?;
        let read = read_line_with_deadline(reader, &mut line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed during headers from {peer}");
        }
        used += read;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}'"))?;

        if header_name == http::header::CONTENT_LENGTH {
            if content_length.is_some() {
                bail!("multiple Content-Length headers are not supported");
            }
            let parsed: usize = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        } else if header_name == http::header::TRANSFER_ENCODING {
            transfer_encoding = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        } else if header_name == http::header::CONNECTION {
            for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                connection_tokens.insert(token.to_ascii_lowercase());
            }
        }
        headers.append(header_name, header_value);
    }

    if transfer_encoding && content_length.is_some() {
        bail!("message must not include both Transfer-Encoding and Content-Length");
    }
    if transfer_encoding && !chunked {
        bail!("unsupported Transfer-Encoding");
    }

    Ok(Some(Head {
        start_line,
        headers,
        content_length,
        chunked,
        connection_tokens,
    }))
}

async fn read_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    limits: &Limits,
    peer: SocketAddr,
    what: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(Vec::new()),
        BodyPlan::Fixed(length) => {
            ensure!(
                length <= limits.max_body_bytes,
                "{what} body of {length} bytes exceeds configured limit"
            );
            let mut body = vec![0u8; length];
            timeout_with_context(
                limits.read_timeout,
                reader.read_exact(&mut body),
                format!("reading {what} body from {peer}"),
            )
            .await?;
            Ok(body)
        }
        BodyPlan::Chunked => read_chunked_body(reader, limits, peer, what).await,
        BodyPlan::UntilClose => {
            let mut body = Vec::new();
            let mut buffer = [0u8; READ_BUFFER];
            loop {
                let read = timeout_with_context(
                    limits.read_timeout,
                    reader.read(&mut buffer),
                    format!("reading {what} body from {peer}"),
                )
                .await?;
                if read == 0 {
                    break;
                }
                ensure!(
                    body.len() + read <= limits.max_body_bytes,
                    "{what} body exceeds configured limit"
                );
                body.extend_from_slice(&buffer[..read]);
            }
            Ok(body)
        }
    }
}

async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    limits: &Limits,
    peer: SocketAddr,
    what: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        let size_bytes = read_line_with_timeout(
            reader,
            &mut line,
            limits.read_timeout,
            peer,
            MAX_CHUNK_LINE_LENGTH,
        )
        .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            // Trailers are read and dropped.
            loop {
                let trailer_bytes = read_line_with_timeout(
                    reader,
                    &mut line,
                    limits.read_timeout,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if trailer_bytes == 0 || line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        ensure!(
            body.len() + chunk_size <= limits.max_body_bytes,
            "{what} body exceeds configured limit"
        );
        let start = body.len();
        body.resize(start + chunk_size, 0);
        timeout_with_context(
            limits.read_timeout,
            reader.read_exact(&mut body[start..]),
            format!("reading chunk data from {peer}"),
        )
        .await?;

        let mut crlf = [0u8; 2];
        timeout_with_context(
            limits.read_timeout,
            reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {peer}"),
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {peer}");
        }
    }
}

async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("timed out reading headers from {peer}"))?;
    read_line_with_timeout(reader, buf, remaining, peer, max_len).await
}

pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = timeout_with_context(
            timeout_dur,
            reader.fill_buf(),
            format!("reading line from {peer}"),
        )
        .await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

fn is_hop_by_hop(name: &str, connection_tokens: &HashSet<String>) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "upgrade"
            | "transfer-encoding"
            | "content-length"
    ) || connection_tokens.contains(name)
}

fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn strip_framing(headers: HeaderMap, tokens: &HashSet<String>) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    let mut current: Option<HeaderName> = None;
    for (name, value) in headers {
        if let Some(name) = name {
            current = Some(name);
        }
        match current.as_ref() {
            Some(name) if !is_hop_by_hop(name.as_str(), tokens) => {
                out.append(name.clone(), value);
            }
            _ => {}
        }
    }
    out
}

/// Serializes a response head. The body length is always stated with
/// `Content-Length`, hop-by-hop and framing headers are dropped.
pub fn encode_response(
    status: StatusCode,
    headers: &HeaderMap,
    plan: BodyPlan,
    keep_alive: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    let tokens = connection_tokens(headers);
    let mut origin_length = None;
    for (name, value) in headers {
        if name == http::header::CONTENT_LENGTH {
            origin_length.get_or_insert_with(|| value.as_bytes().to_vec());
        }
        if is_hop_by_hop(name.as_str(), &tokens) {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match plan {
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        _ => {
            // HEAD, 204 and 304 keep the origin's declared length.
            if let Some(value) = origin_length {
                buffer.extend_from_slice(b"Content-Length: ");
                buffer.extend_from_slice(&value);
                buffer.extend_from_slice(b"\r\n");
            } else if status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED {
                buffer.extend_from_slice(b"Content-Length: 0\r\n");
            }
        }
    }

    if !keep_alive {
        buffer.extend_from_slice(b"Connection: close\r\n");
    }
    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Body framing for a reply to `method` with `status`.
pub fn reply_plan(method: &Method, status: StatusCode, body_len: usize) -> BodyPlan {
    if *method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        BodyPlan::Empty
    } else {
        BodyPlan::Fixed(body_len)
    }
}

/// Builds the upstream request: origin-form target, `Host` set to the
/// upstream authority and `Connection: close`.
pub fn encode_upstream_request(request: &InboundRequest, target: &str, host: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256 + request.body.len());
    buffer.extend_from_slice(request.method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(target.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");
    buffer.extend_from_slice(b"Host: ");
    buffer.extend_from_slice(host.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    let no_tokens = HashSet::new();
    for (name, value) in &request.headers {
        if name == http::header::HOST || is_hop_by_hop(name.as_str(), &no_tokens) {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    if !request.body.is_empty() || matches!(request.method, Method::POST | Method::PUT | Method::PATCH)
    {
        buffer.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer.extend_from_slice(&request.body);
    buffer
}

/// Plain-text reply used for fast failures.
pub fn text_response(status: StatusCode, message: &str) -> (HeaderMap, Vec<u8>) {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    let mut body = message.as_bytes().to_vec();
    body.push(b'\n');
    (headers, body)
}
