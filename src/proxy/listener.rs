use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::settings::Settings;

use super::{AppContext, http};

pub async fn start_listener(settings: &Settings) -> Result<TcpListener> {
    let (host, port) = settings.bind_target();
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind listener on {host}:{port}"))?;
    let local_addr = listener
        .local_addr()
        .with_context(|| format!("failed to read bound address for {host}:{port}"))?;
    info!(
        address = %local_addr,
        jsdelivr = settings.jsdelivr,
        debug = settings.debug,
        "proxy listener started"
    );
    Ok(listener)
}

/// Accepts connections forever, one task per connection.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on downstream stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    http::handle_http(stream, peer, app).await
}
