use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result, anyhow};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use url::{Host, Position, Url};

use crate::{
    proxy::{
        forward_error::RequestConstruction,
        upstream::{self, ResolveOverride},
    },
    util::{deadline_with_context, remaining_until},
};

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Where one upstream hop goes, derived from an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub tls: bool,
    /// Host without IPv6 brackets, used for DNS and SNI.
    pub host: String,
    pub port: u16,
    /// Value of the `Host` header.
    pub authority: String,
    /// Origin-form path and query sent on the request line.
    pub request_path: String,
}

impl UpstreamTarget {
    pub fn from_url(url: &Url) -> Result<Self, RequestConstruction> {
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(RequestConstruction::new(format!(
                    "unsupported scheme '{other}'"
                )));
            }
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(RequestConstruction::new("URL has no host")),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RequestConstruction::new("URL has no port"))?;
        let authority = url[Position::BeforeHost..Position::BeforePath].to_string();
        let mut request_path = url[Position::BeforePath..Position::AfterQuery].to_string();
        if request_path.is_empty() {
            request_path.push('/');
        }
        Ok(Self {
            tls,
            host,
            port,
            authority,
            request_path,
        })
    }
}

pub(crate) struct UpstreamConnection {
    pub(crate) stream: UpstreamIo,
    pub(crate) peer: SocketAddr,
}

impl UpstreamConnection {
    /// Resolves, connects and, for https, completes the TLS handshake before `deadline`.
    pub(crate) async fn connect(
        target: &UpstreamTarget,
        tls: &Arc<ClientConfig>,
        overrides: &[ResolveOverride],
        deadline: Instant,
    ) -> Result<Self> {
        let addresses = upstream::resolve_or_override(
            &target.host,
            target.port,
            overrides,
            remaining_until(deadline, "resolving upstream host")?,
        )
        .await?;
        let (tcp, peer) = upstream::connect_to_addrs(
            &addresses,
            remaining_until(deadline, "connecting to upstream")?,
        )
        .await?;
        let stream = if target.tls {
            let server_name = ServerName::try_from(target.host.as_str())
                .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", target.host))?
                .to_owned();
            let connector = TlsConnector::from(tls.clone());
            let stream = deadline_with_context(
                deadline,
                connector.connect(server_name, tcp),
                "TLS handshake with upstream",
            )
            .await
            .with_context(|| {
                format!(
                    "failed to establish TLS with upstream {}:{}",
                    target.host, target.port
                )
            })?;
            UpstreamIo::Tls(Box::new(stream))
        } else {
            UpstreamIo::Plain(tcp)
        };
        Ok(Self { stream, peer })
    }
}
