use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Error, Result, anyhow, bail, ensure};
use serde::Deserialize;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use crate::util::timeout_with_context;

/// Pins one upstream `host:port` to a fixed socket address, written as `host:port=address`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ResolveOverride {
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
}

impl ResolveOverride {
    pub fn new(host: impl Into<String>, port: u16, addr: SocketAddr) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            addr,
        }
    }

    fn applies_to(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}

impl FromStr for ResolveOverride {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let (authority, addr) = value
            .split_once('=')
            .with_context(|| format!("resolve entry '{value}' is missing '='"))?;
        let (host, port) = authority
            .trim()
            .rsplit_once(':')
            .with_context(|| format!("resolve entry '{value}' is missing a port"))?;
        if host.is_empty() {
            bail!("resolve entry '{value}' has an empty host");
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in resolve entry '{value}'"))?;
        let addr = addr
            .trim()
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid address in resolve entry '{value}'"))?;
        Ok(Self::new(host, port, addr))
    }
}

impl TryFrom<String> for ResolveOverride {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for ResolveOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.host, self.port, self.addr)
    }
}

/// Uses a matching override when one is configured, otherwise asks the system resolver.
pub async fn resolve_or_override(
    host: &str,
    port: u16,
    overrides: &[ResolveOverride],
    resolve_timeout: Duration,
) -> Result<Vec<SocketAddr>> {
    if let Some(pinned) = overrides.iter().find(|entry| entry.applies_to(host, port)) {
        debug!(host, port, addr = %pinned.addr, "using pinned upstream address");
        return Ok(vec![pinned.addr]);
    }
    resolve(host, port, resolve_timeout).await
}

/// Resolves `host:port` to every address the system resolver returns.
pub async fn resolve(host: &str, port: u16, resolve_timeout: Duration) -> Result<Vec<SocketAddr>> {
    let context = format!("resolving upstream host {host}");
    let addrs: Vec<SocketAddr> =
        timeout_with_context(resolve_timeout, lookup_host((host, port)), context.as_str())
            .await?
            .collect();
    ensure!(!addrs.is_empty(), "no addresses found for upstream host {host}");
    debug!(host, port, count = addrs.len(), "resolved upstream host");
    Ok(addrs)
}

/// Tries each address in turn and returns the first stream that connects.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow!(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}
