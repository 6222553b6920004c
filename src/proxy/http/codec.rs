use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    proxy::{
        forward_limits::HeaderBudget,
        headers::{HeaderAction, RequestHeaderSanitizer, is_hop_by_hop_response_header},
    },
    util::{remaining_until, timeout_with_context},
};

#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Collects inbound request headers, keeping only those that travel upstream.
pub struct HeaderAccumulator {
    sanitizer: RequestHeaderSanitizer,
    headers: Vec<HeaderLine>,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            sanitizer: RequestHeaderSanitizer::new(max_bytes),
            headers: Vec::new(),
        }
    }

    /// Returns `false` once the blank line ending the header section is seen.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        let line_len = line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            self.sanitizer.reserve(line_len)?;
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        if let HeaderAction::Forward = self.sanitizer.record(name, value, line_len)? {
            self.headers.push(HeaderLine::new(name, value));
        }
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.sanitizer.host()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.sanitizer.content_length()
    }

    pub fn is_chunked(&self) -> bool {
        self.sanitizer.is_chunked()
    }

    pub fn expect_continue(&self) -> bool {
        self.sanitizer.expect_continue()
    }

    pub fn forward_headers(&self) -> impl Iterator<Item = &HeaderLine> {
        self.headers
            .iter()
            .filter(move |header| !self.has_connection_token(header.lower_name()))
    }

    pub fn has_header(&self, lower_name: &str) -> bool {
        self.headers
            .iter()
            .any(|header| header.lower_name() == lower_name)
    }

    pub fn total_bytes(&self) -> usize {
        self.sanitizer.total_bytes()
    }

    pub fn has_connection_token(&self, token: &str) -> bool {
        self.sanitizer.connection_tokens().contains(token)
    }
}

pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderAccumulator,
    pub request_line_bytes: usize,
}

impl RequestHead {
    /// HTTP/1.0 clients are always closed after one response.
    pub fn wants_close(&self) -> bool {
        self.version == Version::HTTP_10 || self.headers.has_connection_token("close")
    }

    pub fn head_bytes(&self) -> u64 {
        (self.request_line_bytes + self.headers.total_bytes()) as u64
    }
}

pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let Some((request_line, request_line_bytes)) =
        read_request_line(reader, peer, deadline, max_header_bytes).await?
    else {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    };
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = match parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?
    {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    ensure!(
        parts.next().is_none(),
        "malformed request line: unexpected trailing data"
    );

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    let mut headers = HeaderAccumulator::new(remaining);
    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_deadline(reader, &mut header_line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed while reading request headers from {peer}");
        }
        if !headers
            .push_line(&header_line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        version,
        headers,
        request_line_bytes,
    }))
}

pub async fn read_request_line<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_len: usize,
) -> Result<Option<(String, usize)>>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let total = read_line_with_deadline(reader, &mut line, deadline, peer, max_len)
        .await
        .map_err(|err| {
            if err.to_string().contains("exceeds configured limit") {
                anyhow!("request line exceeds configured limit of {max_len} bytes for {peer}")
            } else {
                err
            }
        })?;
    if total == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        bail!("request line for {peer} missing newline terminator");
    }
    line.pop();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(Some((line, total)))
}

/// Reads one `\n`-terminated line without buffering more than `max_len` bytes.
/// Returns 0 on a clean EOF before any byte of the line.
pub async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let remaining = remaining_until(deadline, &context)?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
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

/// How the relayed body is delimited toward the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFraming {
    /// No body follows the head.
    Empty,
    /// The upstream Content-Length is passed through.
    Fixed,
    /// Re-chunked for HTTP/1.1 clients when the upstream length is unknown.
    Chunked,
    /// Delimited by closing the connection (HTTP/1.0 clients).
    UntilClose,
}

pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Vec<HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

impl ResponseHead {
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location").filter(|value| !value.is_empty())
    }

    fn connection_tokens(&self) -> HashSet<String> {
        self.headers
            .iter()
            .filter(|header| header.lower_name() == "connection")
            .flat_map(|header| header.value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect()
    }

    /// Serializes the head for the client: status verbatim, hop-by-hop headers removed, framing
    /// headers added for the chosen [`ClientFraming`].
    pub fn encode_for_client(&self, framing: ClientFraming, close: bool) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(512);
        let reason = if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("Unknown")
        } else {
            self.reason.as_str()
        };
        buffer.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).as_bytes(),
        );

        let connection_tokens = self.connection_tokens();
        for header in &self.headers {
            if is_hop_by_hop_response_header(header.lower_name(), &connection_tokens) {
                continue;
            }
            if framing != ClientFraming::Fixed
                && framing != ClientFraming::Empty
                && header.lower_name() == "content-length"
            {
                continue;
            }
            buffer.extend_from_slice(header.name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(header.value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        if framing == ClientFraming::Chunked {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        if close {
            buffer.extend_from_slice(b"Connection: close\r\n");
        }
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut budget = HeaderBudget::new(
        max_header_bytes,
        "upstream response headers exceed configured limit",
    )?;

    let mut status_line = String::new();
    let bytes =
        read_line_with_deadline(reader, &mut status_line, deadline, peer, max_header_bytes)
            .await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    budget.record(bytes)?;
    let (version, status, reason) =
        parse_status_line(status_line.trim_end_matches(['\r', '\n']))?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut connection_close = version == Version::HTTP_10;

    let mut header_line = String::new();
    loop {
        let limit = budget.remaining().max(1);
        let read =
            read_line_with_deadline(reader, &mut header_line, deadline, peer, limit).await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        budget.record(read)?;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    connection_close = false;
                }
            }
        }
        headers.push(HeaderLine::new(name, value));
    }

    if transfer_encoding_present && content_length.is_some() {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

pub(crate) fn parse_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[test]
    fn forward_headers_skip_connection_tokens() {
        let mut accumulator = HeaderAccumulator::new(256);
        assert!(matches!(
            accumulator.push_line("Connection: Foo\r\n"),
            Ok(true)
        ));
        assert!(matches!(accumulator.push_line("Foo: bar\r\n"), Ok(true)));
        assert!(matches!(accumulator.push_line("Bar: baz\r\n"), Ok(true)));
        assert!(matches!(accumulator.push_line("\r\n"), Ok(false)));
        let names: Vec<_> = accumulator
            .forward_headers()
            .map(|header| header.name.as_str())
            .collect();
        assert_eq!(names, vec!["Bar"]);
    }

    #[tokio::test]
    async fn reads_origin_form_request() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer
            .write_all(
                b"GET /github.com/o/r/releases/x HTTP/1.1\r\nHost: proxy.local\r\nAccept: */*\r\n\r\n",
            )
            .await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        let head = read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
            .await?
            .expect("request head");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/github.com/o/r/releases/x");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.host(), Some("proxy.local"));
        assert!(!head.wants_close());
        assert!(head.headers.has_header("accept"));
        Ok(())
    }

    #[tokio::test]
    async fn http10_requests_close() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
        drop(writer);
        let mut reader = BufReader::new(client);
        let head = read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
            .await?
            .expect("request head");
        assert!(head.wants_close());
        Ok(())
    }

    #[tokio::test]
    async fn clean_eof_yields_none() -> Result<()> {
        let (client, writer) = duplex(64);
        drop(writer);
        let mut reader = BufReader::new(client);
        assert!(
            read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejects_long_request_line() -> Result<()> {
        let (client, mut writer) = duplex(4096);
        let request = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(2048));
        writer.write_all(request.as_bytes()).await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        let err = match read_request_head(&mut reader, peer(), Duration::from_secs(1), 512).await
        {
            Ok(_) => panic!("request line should exceed limit"),
            Err(err) => err,
        };
        assert!(
            err.to_string().contains("request line exceeds"),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejects_bad_version() -> Result<()> {
        let (client, mut writer) = duplex(256);
        writer.write_all(b"GET / HTTP/2.0\r\n\r\n").await?;
        drop(writer);
        let mut reader = BufReader::new(client);
        assert!(
            read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn parses_response_head() -> Result<()> {
        let (upstream, mut writer) = duplex(1024);
        writer
            .write_all(
                b"HTTP/1.1 302 Found\r\nLocation: https://objects.example/x\r\nContent-Length: 0\r\n\r\n",
            )
            .await?;
        let mut reader = BufReader::new(upstream);
        let head = read_response_head(
            &mut reader,
            Instant::now() + Duration::from_secs(1),
            peer(),
            1024,
        )
        .await?;
        assert_eq!(head.status, StatusCode::FOUND);
        assert_eq!(head.reason, "Found");
        assert_eq!(head.location(), Some("https://objects.example/x"));
        assert_eq!(head.content_length, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_length_with_transfer_encoding() -> Result<()> {
        let (upstream, mut writer) = duplex(1024);
        writer
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
            )
            .await?;
        let mut reader = BufReader::new(upstream);
        let err = read_response_head(
            &mut reader,
            Instant::now() + Duration::from_secs(1),
            peer(),
            1024,
        )
        .await
        .err()
        .expect("conflicting framing should fail");
        assert!(err.to_string().contains("must not include both"));
        Ok(())
    }

    #[tokio::test]
    async fn response_headers_respect_budget() -> Result<()> {
        let (upstream, mut writer) = duplex(4096);
        let response = format!("HTTP/1.1 200 OK\r\nX-Big: {}\r\n\r\n", "a".repeat(200));
        writer.write_all(response.as_bytes()).await?;
        let mut reader = BufReader::new(upstream);
        assert!(
            read_response_head(
                &mut reader,
                Instant::now() + Duration::from_secs(1),
                peer(),
                64
            )
            .await
            .is_err()
        );
        Ok(())
    }

    fn sample_head() -> ResponseHead {
        ResponseHead {
            version: Version::HTTP_11,
            status: StatusCode::OK,
            reason: "OK".to_string(),
            headers: vec![
                HeaderLine::new("Connection", "keep-alive, X-Hop"),
                HeaderLine::new("X-Hop", "1"),
                HeaderLine::new("Keep-Alive", "timeout=5"),
                HeaderLine::new("Transfer-Encoding", "chunked"),
                HeaderLine::new("Content-Type", "application/zip"),
                HeaderLine::new("ETag", "\"abc\""),
            ],
            content_length: None,
            chunked: true,
            connection_close: false,
        }
    }

    #[test]
    fn encode_strips_hop_by_hop_and_rechunks() {
        let text =
            String::from_utf8(sample_head().encode_for_client(ClientFraming::Chunked, false))
                .unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!text.contains("Connection:"));
        assert!(!text.contains("X-Hop"));
        assert!(!text.contains("Keep-Alive"));
        assert!(text.contains("Content-Type: application/zip\r\n"));
        assert!(text.contains("ETag: \"abc\"\r\n"));
        assert_eq!(text.matches("Transfer-Encoding: chunked").count(), 1);
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_passes_content_length_for_fixed_bodies() {
        let head = ResponseHead {
            version: Version::HTTP_11,
            status: StatusCode::NOT_FOUND,
            reason: String::new(),
            headers: vec![HeaderLine::new("Content-Length", "9")],
            content_length: Some(9),
            chunked: false,
            connection_close: false,
        };
        let text = String::from_utf8(head.encode_for_client(ClientFraming::Fixed, true)).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
    }

    #[test]
    fn status_line_keeps_multiword_reason() -> Result<()> {
        let (version, status, reason) = parse_status_line("HTTP/1.0 404 Not Found")?;
        assert_eq!(version, Version::HTTP_10);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reason, "Not Found");
        assert!(parse_status_line("HTTP/2 200").is_err());
        Ok(())
    }
}
