#![allow(dead_code)]

pub mod http_utils;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use ghproxy::{
    proxy::{AppContext, listener, upstream::ResolveOverride},
    settings::Settings,
};
use rustls::{RootCertStore, client::ClientConfig, crypto::ring};

pub use http_utils::*;
pub use upstream::TestUpstream;

pub fn default_test_settings() -> Settings {
    Settings {
        host: "127.0.0.1".to_string(),
        port: 0,
        timeout: 5,
        client_timeout: 5,
        max_request_body_size: 1024 * 1024,
        ..Settings::default()
    }
}

/// Pins `host` on plain-HTTP port 80 to a local stub upstream.
pub fn pin_http_host(settings: &mut Settings, host: &str, addr: SocketAddr) {
    settings.resolve.push(ResolveOverride::new(host, 80, addr));
}

/// Upstream TLS is never exercised by these tests, so an empty trust store suffices.
pub fn build_client_tls() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;
    let builder = builder.with_root_certificates(Arc::new(RootCertStore::empty()));
    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    /// Sends `request` on a fresh connection and reads until the proxy closes it.
    pub async fn request(&self, request: &str) -> Result<String> {
        let mut stream = self.connect().await?;
        send_raw(&mut stream, request.as_bytes()).await?;
        read_http_response(&mut stream).await
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[derive(Default)]
pub struct ProxyHarnessBuilder {
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let mut settings = default_test_settings();
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        let settings = Arc::new(settings);
        let policy = Arc::new(settings.access_policy());
        let app = AppContext::new(settings.clone(), policy, build_client_tls()?);

        let tcp = listener::start_listener(&settings).await?;
        let addr = tcp.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(err) = listener::serve(tcp, app).await {
                tracing::error!(error = ?err, "proxy serve failed");
            }
        });

        Ok(ProxyHarness {
            addr,
            settings,
            handle,
        })
    }
}

pub async fn spawn_default() -> Result<ProxyHarness> {
    ProxyHarnessBuilder::new().spawn().await
}
