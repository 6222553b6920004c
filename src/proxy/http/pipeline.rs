use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use http::{HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::{
    io_util::{flush_with_timeout, write_all_with_timeout},
    logging::{AccessLogBuilder, Route},
    metrics::{self, InflightGuard},
    proxy::{
        AppContext,
        forward_error::{classify_forward_error, log_forward_error},
        plan::{Plan, Refusal, plan_request},
        request::{InboundRoute, InboundTarget, parse_inbound_target, route},
    },
    util::timeout_with_context,
    web,
};

use super::body::{BodyPlan, BodyTooLarge, read_request_body};
use super::codec::HeaderAccumulator;
use super::forward::{ForwardContext, ForwardOutcome, OutboundRequest, forward};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub enum ClientDisposition {
    Continue,
    Close,
}

pub struct RequestContext {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderAccumulator,
    pub head_bytes: u64,
    pub client_close: bool,
    pub start: Instant,
}

impl RequestContext {
    fn log_builder(&self, peer: SocketAddr) -> AccessLogBuilder {
        AccessLogBuilder::new(peer)
            .method(self.method.as_str())
            .path(self.target.clone())
    }

    fn has_body(&self) -> bool {
        self.headers.is_chunked() || self.headers.content_length().unwrap_or(0) > 0
    }

    fn body_plan(&self) -> BodyPlan {
        if self.headers.is_chunked() {
            BodyPlan::Chunked
        } else {
            match self.headers.content_length() {
                Some(0) | None => BodyPlan::Empty,
                Some(length) => BodyPlan::Fixed(length),
            }
        }
    }
}

/// A response generated by the proxy itself rather than relayed from upstream.
pub struct LocalResponse<'a> {
    pub status: StatusCode,
    pub content_type: &'a str,
    pub location: Option<&'a str>,
    pub body: &'a [u8],
}

impl<'a> LocalResponse<'a> {
    pub fn text(status: StatusCode, body: &'a str) -> Self {
        Self {
            status,
            content_type: TEXT_PLAIN,
            location: None,
            body: body.as_bytes(),
        }
    }

    pub fn redirect(location: &'a str) -> Self {
        Self {
            status: StatusCode::FOUND,
            content_type: TEXT_PLAIN,
            location: Some(location),
            body: b"",
        }
    }

    fn asset(asset: web::Asset) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: asset.content_type,
            location: None,
            body: asset.body,
        }
    }

    fn encode_head(&self, close: bool) -> String {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Unknown"),
            self.content_type,
            self.body.len()
        );
        if let Some(location) = self.location {
            head.push_str("Location: ");
            head.push_str(location);
            head.push_str("\r\n");
        }
        if close {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");
        head
    }
}

pub async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    ctx: RequestContext,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_timeout = app.settings.client_timeout();
    let log = ctx.log_builder(peer);

    let target = match parse_inbound_target(&ctx.target) {
        Ok(target) => target,
        Err(err) => {
            warn!(peer = %peer, error = %err, "rejecting malformed request target");
            return respond_with_access_log(
                reader.get_mut(),
                LocalResponse::text(StatusCode::BAD_REQUEST, "Bad Request"),
                true,
                client_timeout,
                ctx.head_bytes,
                ctx.start.elapsed(),
                log.decision("ERROR").error_reason("bad_request_target"),
            )
            .await;
        }
    };

    // Local routes never read a request body, so a client that sent one cannot be reused.
    let local_close = ctx.client_close || ctx.has_body();
    match route(&target) {
        InboundRoute::Index => {
            respond_with_access_log(
                reader.get_mut(),
                LocalResponse::asset(web::index_page()),
                local_close,
                client_timeout,
                ctx.head_bytes,
                ctx.start.elapsed(),
                log.route(Route::Index).decision("INDEX"),
            )
            .await
        }
        InboundRoute::QueryRedirect(q) => {
            let location = format!("/{q}");
            respond_redirect(
                reader.get_mut(),
                &location,
                client_timeout,
                &ctx,
                log.route(Route::QueryRedirect).decision("REDIRECT"),
            )
            .await
        }
        InboundRoute::Static(name) => {
            let log = log.route(Route::Static);
            match web::static_asset(name) {
                Some(asset) => {
                    respond_with_access_log(
                        reader.get_mut(),
                        LocalResponse::asset(asset),
                        local_close,
                        client_timeout,
                        ctx.head_bytes,
                        ctx.start.elapsed(),
                        log.decision("STATIC"),
                    )
                    .await
                }
                None => {
                    respond_with_access_log(
                        reader.get_mut(),
                        LocalResponse::text(StatusCode::NOT_FOUND, "Not Found"),
                        true,
                        client_timeout,
                        ctx.head_bytes,
                        ctx.start.elapsed(),
                        log.decision("NOT_FOUND"),
                    )
                    .await
                }
            }
        }
        InboundRoute::Proxy => handle_proxy(reader, peer, app, &target, ctx, log).await,
    }
}

async fn handle_proxy<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    target: &InboundTarget,
    ctx: RequestContext,
    log: AccessLogBuilder,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = &app.settings;
    let client_timeout = settings.client_timeout();
    let planned = plan_request(
        target.proxied_url(),
        target.query.as_deref(),
        &app.policy,
        settings.jsdelivr,
    );
    let mut log = log.route(Route::Proxy).decision(planned.plan.decision());
    if let Some(classification) = &planned.classification {
        log = log.resource(classification.kind.as_str());
    }

    let url = match planned.plan {
        Plan::Refuse(refusal) => {
            if let Refusal::Policy(rejection) = refusal {
                log = log.rule_list(rejection.list_name());
            }
            debug!(peer = %peer, path = %target.path, reason = refusal.message(), "refusing request");
            return respond_with_access_log(
                reader.get_mut(),
                LocalResponse::text(StatusCode::FORBIDDEN, refusal.message()),
                true,
                client_timeout,
                ctx.head_bytes,
                ctx.start.elapsed(),
                log,
            )
            .await;
        }
        Plan::Mirror { location } => {
            let log = log.upstream(location.clone());
            return respond_redirect(reader.get_mut(), &location, client_timeout, &ctx, log).await;
        }
        Plan::Pass { location } => {
            let log = log.rule_list("pass").upstream(location.clone());
            return respond_redirect(reader.get_mut(), &location, client_timeout, &ctx, log).await;
        }
        Plan::Forward { target } => target,
    };
    let log = log.upstream(url.clone());

    let body_plan = ctx.body_plan();
    if ctx.headers.expect_continue() && body_plan != BodyPlan::Empty {
        send_continue(reader.get_mut(), client_timeout).await?;
    }
    let body = match read_request_body(
        reader,
        body_plan,
        client_timeout,
        peer,
        settings.max_request_body_size,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => {
            let (response, reason) = match err.downcast_ref::<BodyTooLarge>() {
                Some(too_large) => {
                    warn!(
                        peer = %peer,
                        bytes_read = too_large.bytes_read,
                        max = settings.max_request_body_size,
                        "request body exceeds limit"
                    );
                    (
                        LocalResponse::text(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large."),
                        "body_too_large",
                    )
                }
                None => {
                    warn!(peer = %peer, error = %err, "failed to read request body");
                    (
                        LocalResponse::text(StatusCode::BAD_REQUEST, "Bad Request"),
                        "body_read",
                    )
                }
            };
            return respond_with_access_log(
                reader.get_mut(),
                response,
                true,
                client_timeout,
                ctx.head_bytes,
                ctx.start.elapsed(),
                log.decision("ERROR")
                    .error_reason(reason)
                    .error_detail(err.to_string()),
            )
            .await;
        }
    };
    let bytes_in = ctx.head_bytes + body.len() as u64;

    let _inflight = InflightGuard::enter();
    let forward_ctx = ForwardContext {
        tls: &app.tls,
        resolve: &settings.resolve,
        timeout: settings.timeout(),
        chunk_size: settings.chunk_size,
        size_limit: settings.size_limit,
        max_response_header_size: settings.max_response_header_size,
        client_timeout,
    };
    let request = OutboundRequest {
        method: &ctx.method,
        headers: &ctx.headers,
        body,
        client_version: ctx.version,
        client_close: ctx.client_close,
    };

    match forward(reader.get_mut(), &url, request, &forward_ctx, peer).await {
        Ok(ForwardOutcome::Oversize { location, .. }) => {
            metrics::record_oversize_redirect();
            let log = log.decision("OVERSIZE");
            respond_redirect(reader.get_mut(), &location, client_timeout, &ctx, log).await
        }
        Ok(ForwardOutcome::Streamed(stats)) => {
            let mut log = log
                .status(stats.status)
                .bytes(bytes_in, stats.bytes_out)
                .elapsed(ctx.start.elapsed())
                .redirects(stats.redirects)
                .upstream(stats.final_url);
            if !stats.completed {
                log = log.error_reason("stream_aborted");
            }
            log.log();
            if stats.client_close {
                shutdown_stream(reader.get_mut()).await;
                Ok(ClientDisposition::Close)
            } else {
                Ok(ClientDisposition::Continue)
            }
        }
        Err(err) => {
            let kind = classify_forward_error(&err);
            log_forward_error(&kind, peer, &url, &err);
            metrics::record_upstream_error(kind.label());
            let message = kind.client_message(&err);
            respond_with_access_log(
                reader.get_mut(),
                LocalResponse::text(kind.status(), &message),
                true,
                client_timeout,
                bytes_in,
                ctx.start.elapsed(),
                log.decision("ERROR")
                    .error_reason(kind.label())
                    .error_detail(err.to_string()),
            )
            .await
        }
    }
}

/// Sends a 302 to `location`, or 400 when the location cannot be carried in a header.
async fn respond_redirect<S>(
    stream: &mut S,
    location: &str,
    timeout_dur: Duration,
    ctx: &RequestContext,
    log: AccessLogBuilder,
) -> Result<ClientDisposition>
where
    S: AsyncWrite + Unpin,
{
    let response = if HeaderValue::from_str(location).is_ok() {
        LocalResponse::redirect(location)
    } else {
        warn!(location, "redirect target is not a valid header value");
        LocalResponse::text(StatusCode::BAD_REQUEST, "Invalid redirect target")
    };
    respond_with_access_log(
        stream,
        response,
        true,
        timeout_dur,
        ctx.head_bytes,
        ctx.start.elapsed(),
        log,
    )
    .await
}

async fn send_continue<S>(client: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_all_with_timeout(
        client,
        b"HTTP/1.1 100 Continue\r\n\r\n",
        timeout_dur,
        "sending 100 Continue to client",
    )
    .await?;
    flush_with_timeout(client, timeout_dur, "flushing 100 Continue to client").await
}

/// Writes a local response, logs it and tells the caller whether the connection may be reused.
pub async fn respond_with_access_log<S>(
    stream: &mut S,
    response: LocalResponse<'_>,
    close: bool,
    timeout_dur: Duration,
    bytes_in: u64,
    elapsed: Duration,
    log_builder: AccessLogBuilder,
) -> Result<ClientDisposition>
where
    S: AsyncWrite + Unpin,
{
    let status = response.status;
    let written = write_local_response(stream, &response, close, timeout_dur).await;
    let bytes_out = *written.as_ref().unwrap_or(&0) as u64;
    log_builder
        .status(status)
        .bytes(bytes_in, bytes_out)
        .elapsed(elapsed)
        .log();
    written?;
    if close {
        shutdown_stream(stream).await;
        Ok(ClientDisposition::Close)
    } else {
        Ok(ClientDisposition::Continue)
    }
}

/// Plain response that always closes the connection.
pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let response = LocalResponse {
        status,
        content_type,
        location: None,
        body,
    };
    write_local_response(stream, &response, true, timeout_dur).await
}

async fn write_local_response<S>(
    stream: &mut S,
    response: &LocalResponse<'_>,
    close: bool,
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let head = response.encode_head(close);
    write_all_with_timeout(stream, head.as_bytes(), timeout_dur, "writing response header")
        .await?;
    let mut written = head.len();
    if !response.body.is_empty() {
        write_all_with_timeout(stream, response.body, timeout_dur, "writing response body")
            .await?;
        written += response.body.len();
    }
    flush_with_timeout(stream, timeout_dur, "flushing response").await?;
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    if let Err(err) = timeout_with_context(
        SHUTDOWN_TIMEOUT,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
    {
        debug!(error = %err, "failed to shut down client stream");
    }
}
