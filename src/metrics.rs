use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::TcpListener,
};

use crate::proxy::http::{codec::read_request_head, pipeline::send_response, shutdown_stream};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total requests by decision");
    let vec = IntCounterVec::new(opts, &["decision"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_method_total", "Requests by method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_method_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency by decision")
        .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["decision"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static INFLIGHT_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("inflight_requests", "Current inflight requests").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register inflight_requests");
    gauge
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("upstream_errors_total", "Upstream errors by kind"),
        &["kind"],
    )
    .expect("create upstream_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_errors_total");
    vec
});

static UPSTREAM_REDIRECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "upstream_redirects_total",
        "Upstream redirects followed internally",
    )
    .expect("create upstream_redirects_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register upstream_redirects_total");
    counter
});

static OVERSIZE_REDIRECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "oversize_redirects_total",
        "Responses redirected to the source because of their declared size",
    )
    .expect("create oversize_redirects_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register oversize_redirects_total");
    counter
});

static STREAMED_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "streamed_bytes_total",
        "Response body bytes relayed to clients",
    )
    .expect("create streamed_bytes_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register streamed_bytes_total");
    counter
});

fn latency_buckets() -> Vec<f64> {
    // Downloads can stream for minutes; keep a long tail.
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

fn normalize_label(value: &str, empty: &'static str) -> String {
    if value.is_empty() {
        empty.to_string()
    } else {
        value.to_string()
    }
}

/// Decrements the inflight gauge when dropped.
#[must_use]
pub struct InflightGuard(());

impl InflightGuard {
    pub fn enter() -> Self {
        INFLIGHT_REQUESTS.inc();
        Self(())
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        INFLIGHT_REQUESTS.dec();
    }
}

pub fn record_request(decision: &str, method: &str, status: StatusCode, elapsed: Duration) {
    let decision = normalize_label(decision, "unknown");
    let method = normalize_label(method, "unknown");
    let status_class = status_class(status.as_u16());

    REQUESTS_TOTAL.with_label_values(&[decision.as_str()]).inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class])
        .inc();
    REQUEST_METHOD_TOTAL
        .with_label_values(&[method.as_str()])
        .inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[decision.as_str()])
        .observe(elapsed.as_secs_f64());
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_upstream_redirect() {
    UPSTREAM_REDIRECTS_TOTAL.inc();
}

pub fn record_oversize_redirect() {
    OVERSIZE_REDIRECTS_TOTAL.inc();
}

pub fn record_streamed_bytes(bytes: u64) {
    if bytes > 0 {
        STREAMED_BYTES_TOTAL.inc_by(bytes);
    }
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the text exposition on `GET /metrics`; every other request gets 404.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(listen = %addr, "metrics endpoint started");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(
                stream,
                peer,
                "/metrics",
                METRICS_READ_TIMEOUT,
                METRICS_MAX_REQUEST_BYTES,
            )
            .await
            {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(
    stream: S,
    peer: SocketAddr,
    path: &str,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Some(head) = read_request_head(&mut reader, peer, read_timeout, max_bytes).await? else {
        return Ok(());
    };

    let stream = reader.get_mut();
    if head.method == Method::GET && head.target == path {
        let body = gather();
        send_response(
            stream,
            StatusCode::OK,
            TextEncoder::new().format_type(),
            &body,
            read_timeout,
        )
        .await?;
    } else {
        send_response(
            stream,
            StatusCode::NOT_FOUND,
            "text/plain; charset=utf-8",
            b"not found",
            read_timeout,
        )
        .await?;
    }
    shutdown_stream(stream).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn record_basic_metrics() {
        record_request("FORWARD", "GET", StatusCode::OK, Duration::from_millis(10));
        record_upstream_redirect();
        record_streamed_bytes(42);
        let text = String::from_utf8(gather()).expect("utf8");
        assert!(
            text.contains("requests_total"),
            "expected requests_total in metrics output"
        );
        assert!(
            text.contains("upstream_redirects_total"),
            "expected upstream_redirects_total in metrics output"
        );
        assert!(text.contains("streamed_bytes_total"));
    }

    #[test]
    fn inflight_guard_is_exported() {
        let guard = InflightGuard::enter();
        let text = String::from_utf8(gather()).expect("utf8");
        drop(guard);
        assert!(text.contains("inflight_requests"));
    }

    #[tokio::test]
    async fn serves_metrics_on_configured_path() {
        record_oversize_redirect();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        handle_stream(server, peer(), "/metrics", Duration::from_secs(1), 8192)
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("oversize_redirects_total"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET /other HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        handle_stream(server, peer(), "/metrics", Duration::from_secs(1), 8192)
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    }

    #[tokio::test]
    async fn rejects_oversized_request_line() {
        let (mut client, server) = tokio::io::duplex(1024);
        let oversized = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(64));
        client.write_all(oversized.as_bytes()).await.unwrap();
        drop(client);

        let err = handle_stream(server, peer(), "/metrics", Duration::from_secs(1), 32)
            .await
            .expect_err("oversized request should be rejected");
        assert!(
            err.to_string().contains("exceeds"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn times_out_on_slow_request() {
        let (_client, server) = tokio::io::duplex(1024);
        let err = handle_stream(server, peer(), "/metrics", Duration::from_millis(50), 1024)
            .await
            .expect_err("slow request should time out");
        assert!(
            err.to_string().contains("timed out"),
            "unexpected error: {err}"
        );
    }
}
