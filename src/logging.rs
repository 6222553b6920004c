use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "debug";

/// Installs the global subscriber. `RUST_LOG` wins over the `debug` setting when present.
pub fn init_logger(format: LogFormat, debug: bool) -> Result<()> {
    let fallback = if debug { DEBUG_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// Which inbound surface served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Index,
    QueryRedirect,
    Static,
    Proxy,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Index => "index",
            Route::QueryRedirect => "query_redirect",
            Route::Static => "static",
            Route::Proxy => "proxy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub method: String,
    pub path: String,
    pub route: Option<Route>,
    pub resource: Option<String>,
    pub status: u16,
    pub decision: String,
    pub rule_list: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub upstream: Option<String>,
    pub redirects: Option<u8>,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.ip(),
                client_port: peer.port(),
                method: String::new(),
                path: String::new(),
                route: None,
                resource: None,
                status: 0,
                decision: String::from("UNKNOWN"),
                rule_list: None,
                bytes_in: 0,
                bytes_out: 0,
                elapsed_ms: 0,
                upstream: None,
                redirects: None,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.event.route = Some(route);
        self
    }

    pub fn resource(mut self, kind: impl Into<String>) -> Self {
        self.event.resource = Some(kind.into());
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.event.decision = decision.into();
        self
    }

    pub fn rule_list(mut self, list: impl Into<String>) -> Self {
        self.event.rule_list = Some(list.into());
        self
    }

    pub fn bytes(mut self, in_bytes: u64, out_bytes: u64) -> Self {
        self.event.bytes_in = in_bytes;
        self.event.bytes_out = out_bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn upstream(mut self, url: impl Into<String>) -> Self {
        self.event.upstream = Some(url.into());
        self
    }

    pub fn redirects(mut self, hops: u8) -> Self {
        self.event.redirects = Some(hops);
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.event.error_reason = Some(reason.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        path,
        route,
        resource,
        status,
        decision,
        rule_list,
        bytes_in,
        bytes_out,
        elapsed_ms,
        upstream,
        redirects,
        error_reason,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let route_field = route.map(Route::as_str);
    let resource_field = resource.as_deref();
    let rule_list_field = rule_list.as_deref();
    let upstream_field = upstream.as_deref();
    let error_reason_field = error_reason.as_deref();
    let error_detail_field = error_detail.as_deref();

    tracing::info!(
        target = "access_log",
        ts,
        client_ip = %client_ip,
        method,
        path,
        route = route_field,
        resource = resource_field,
        status,
        decision,
        rule_list = rule_list_field,
        bytes_in,
        bytes_out,
        elapsed_ms,
        client_port,
        upstream = upstream_field,
        redirects,
        error_reason = error_reason_field,
        error_detail = error_detail_field
    );

    crate::metrics::record_request(
        &decision,
        &method,
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Duration::from_millis(elapsed_ms as u64),
    );
}
