use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::{
    io_util::write_all_with_timeout,
    metrics,
    proxy::{forward_error::RequestConstruction, upstream::ResolveOverride},
    util::deadline_with_context,
};

use super::body::{BodyReader, RelayEnd, ResponseBodyPlan, determine_response_body_plan, relay_body};
use super::codec::{ClientFraming, HeaderAccumulator, ResponseHead, read_response_head};
use super::upstream::{UpstreamConnection, UpstreamTarget};

/// Upstream requests made for one forward. If the last one still answers with a redirect,
/// that response is relayed as-is.
pub const MAX_UPSTREAM_REQUESTS: u8 = 10;

/// Dropped from the replayed request once a redirect leaves the original host.
const CREDENTIAL_HEADERS: [&str; 4] = ["authorization", "cookie", "cookie2", "www-authenticate"];

const USER_AGENT: &str = concat!("ghproxy/", env!("CARGO_PKG_VERSION"));

pub struct ForwardContext<'a> {
    pub tls: &'a Arc<ClientConfig>,
    pub resolve: &'a [ResolveOverride],
    /// Bounds the whole upstream exchange, every hop and every body read included.
    pub timeout: Duration,
    pub chunk_size: usize,
    pub size_limit: u64,
    pub max_response_header_size: usize,
    pub client_timeout: Duration,
}

/// The client's request as it should be replayed upstream.
pub struct OutboundRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderAccumulator,
    pub body: Bytes,
    pub client_version: Version,
    pub client_close: bool,
}

#[derive(Debug)]
pub struct StreamStats {
    pub status: StatusCode,
    /// Head plus body bytes written to the client.
    pub bytes_out: u64,
    pub body_bytes: u64,
    pub redirects: u8,
    pub final_url: String,
    pub client_close: bool,
    pub completed: bool,
}

#[derive(Debug)]
pub enum ForwardOutcome {
    /// Declared length exceeds the size limit; the client should fetch `location` itself.
    Oversize { location: String, declared: u64 },
    Streamed(StreamStats),
}

/// Fetches `url` and streams the response to `client`.
///
/// Errors are only returned before any response byte has been written; once the head is sent,
/// failures are reported through [`StreamStats::completed`].
pub async fn forward<C>(
    client: &mut C,
    url: &str,
    request: OutboundRequest<'_>,
    ctx: &ForwardContext<'_>,
    peer: SocketAddr,
) -> Result<ForwardOutcome>
where
    C: AsyncWrite + Unpin,
{
    let deadline = Instant::now() + ctx.timeout;
    let origin = Url::parse(url).map_err(|err| RequestConstruction::new(err.to_string()))?;
    let mut current = origin.clone();
    let mut method = request.method.clone();
    let mut body = request.body;
    let mut redirects = 0u8;
    let mut strip_credentials = false;

    let (mut reader, head, upstream_peer) = loop {
        let target = UpstreamTarget::from_url(&current)?;
        let connection =
            UpstreamConnection::connect(&target, ctx.tls, ctx.resolve, deadline).await?;
        let upstream_peer = connection.peer;
        let mut stream = connection.stream;

        let request_bytes = build_upstream_request(
            &method,
            &target,
            request.headers,
            &body,
            strip_credentials,
        );
        deadline_with_context(
            deadline,
            stream.write_all(&request_bytes),
            "sending request to upstream",
        )
        .await?;
        if !body.is_empty() {
            deadline_with_context(
                deadline,
                stream.write_all(&body),
                "sending request body to upstream",
            )
            .await?;
        }
        deadline_with_context(deadline, stream.flush(), "flushing request to upstream").await?;

        let mut reader = BufReader::new(stream);
        let head = read_final_response_head(
            &mut reader,
            deadline,
            upstream_peer,
            ctx.max_response_header_size,
        )
        .await?;

        if !is_followed_redirect(head.status) {
            break (reader, head, upstream_peer);
        }
        let Some(location) = head.location() else {
            break (reader, head, upstream_peer);
        };
        if redirects + 1 >= MAX_UPSTREAM_REQUESTS {
            warn!(
                peer = %peer,
                url = %current,
                redirects,
                "upstream redirect limit reached; relaying last response"
            );
            break (reader, head, upstream_peer);
        }

        let next = current
            .join(location)
            .map_err(|err| anyhow!("invalid upstream Location '{location}': {err}"))?;
        debug!(
            peer = %peer,
            status = head.status.as_u16(),
            from = %current,
            to = %next,
            "following upstream redirect"
        );
        metrics::record_upstream_redirect();
        if !strip_credentials && !same_authority(&origin, &next) {
            debug!(
                peer = %peer,
                to = %next,
                "redirect left the original host; dropping credentials"
            );
            strip_credentials = true;
        }
        if matches!(
            head.status,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
        ) && method != Method::HEAD
        {
            method = Method::GET;
            body = Bytes::new();
        }
        redirects += 1;
        current = next;
    };

    if let Some(declared) = head.content_length
        && declared > ctx.size_limit
    {
        warn!(
            peer = %peer,
            url = %current,
            size = declared,
            limit = ctx.size_limit,
            "upstream response exceeds size limit; redirecting client"
        );
        return Ok(ForwardOutcome::Oversize {
            location: url.to_string(),
            declared,
        });
    }

    let body_plan = determine_response_body_plan(&method, &head);
    let framing = client_framing(body_plan, request.client_version);
    let client_close = request.client_close || framing == ClientFraming::UntilClose;
    let head_bytes = head.encode_for_client(framing, client_close);

    let mut stats = StreamStats {
        status: head.status,
        bytes_out: 0,
        body_bytes: 0,
        redirects,
        final_url: current.to_string(),
        client_close,
        completed: false,
    };

    if let Err(err) = write_all_with_timeout(
        client,
        &head_bytes,
        ctx.client_timeout,
        "writing response head to client",
    )
    .await
    {
        warn!(peer = %peer, error = %err, "failed to write response head to client");
        stats.client_close = true;
        return Ok(ForwardOutcome::Streamed(stats));
    }
    stats.bytes_out = head_bytes.len() as u64;

    let started = Instant::now();
    let mut decoder = BodyReader::new(&mut reader, body_plan, upstream_peer);
    let relay = relay_body(
        &mut decoder,
        client,
        framing == ClientFraming::Chunked,
        ctx.chunk_size,
        deadline,
        ctx.client_timeout,
    )
    .await;
    metrics::record_streamed_bytes(relay.bytes);
    stats.body_bytes = relay.bytes;
    stats.bytes_out += relay.bytes;

    match relay.end {
        RelayEnd::Complete => {
            let secs = started.elapsed().as_secs_f64();
            let rate = if secs > 0.0 {
                relay.bytes as f64 / secs
            } else {
                relay.bytes as f64
            };
            debug!(
                peer = %peer,
                url = %stats.final_url,
                bytes = relay.bytes,
                bytes_per_sec = rate as u64,
                "finished streaming upstream response"
            );
            stats.completed = true;
        }
        RelayEnd::UpstreamFailed(err) => {
            warn!(
                peer = %peer,
                url = %stats.final_url,
                bytes = relay.bytes,
                error = %err,
                "upstream body read failed mid-stream"
            );
            metrics::record_upstream_error("body_read");
            stats.client_close = true;
        }
        RelayEnd::ClientFailed(err) => {
            warn!(
                peer = %peer,
                url = %stats.final_url,
                bytes = relay.bytes,
                error = %err,
                "client write failed mid-stream; aborting upstream read"
            );
            stats.client_close = true;
        }
    }
    Ok(ForwardOutcome::Streamed(stats))
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn same_authority(a: &Url, b: &Url) -> bool {
    let host_matches = match (a.host_str(), b.host_str()) {
        (Some(left), Some(right)) => left.eq_ignore_ascii_case(right),
        _ => false,
    };
    host_matches && a.port_or_known_default() == b.port_or_known_default()
}

fn client_framing(plan: ResponseBodyPlan, client_version: Version) -> ClientFraming {
    match plan {
        ResponseBodyPlan::Empty => ClientFraming::Empty,
        ResponseBodyPlan::Fixed(_) => ClientFraming::Fixed,
        ResponseBodyPlan::Chunked | ResponseBodyPlan::UntilClose => {
            if client_version == Version::HTTP_11 {
                ClientFraming::Chunked
            } else {
                ClientFraming::UntilClose
            }
        }
    }
}

/// Skips interim 1xx responses.
async fn read_final_response_head<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let head = read_response_head(reader, deadline, peer, max_header_bytes).await?;
        if !head.status.is_informational() {
            return Ok(head);
        }
        debug!(peer = %peer, status = head.status.as_u16(), "skipping interim upstream response");
    }
}

pub(crate) fn build_upstream_request(
    method: &Method,
    target: &UpstreamTarget,
    headers: &HeaderAccumulator,
    body: &[u8],
    strip_credentials: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(target.request_path.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");

    buffer.extend_from_slice(b"Host: ");
    buffer.extend_from_slice(target.authority.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for header in headers.forward_headers() {
        if strip_credentials && CREDENTIAL_HEADERS.contains(&header.lower_name()) {
            continue;
        }
        buffer.extend_from_slice(header.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(header.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    if !headers.has_header("user-agent") {
        buffer.extend_from_slice(b"User-Agent: ");
        buffer.extend_from_slice(USER_AGENT.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Connection: close\r\n");
    if !body.is_empty() || *method == Method::POST || *method == Method::PUT {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(body.len().to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"\r\n");
    buffer
}
