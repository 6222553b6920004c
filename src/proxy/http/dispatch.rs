use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;

use super::codec::read_request_head;
use super::pipeline::{
    ClientDisposition, LocalResponse, RequestContext, handle_request, respond_with_access_log,
};

pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    serve_http_loop(stream, peer, &app).await
}

/// Serves requests on one client connection until either side asks to close.
pub(super) async fn serve_http_loop<S>(stream: S, peer: SocketAddr, app: &AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_request_header_size;
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_request_head(&mut reader, peer, client_timeout, max_header_size).await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                if err.to_string().starts_with("timed out") {
                    debug!(peer = %peer, "client connection idle; closing");
                    break;
                }
                debug!(peer = %peer, error = %err, "malformed request");
                respond_with_access_log(
                    reader.get_mut(),
                    LocalResponse::text(StatusCode::BAD_REQUEST, "Bad Request"),
                    true,
                    client_timeout,
                    0,
                    start.elapsed(),
                    AccessLogBuilder::new(peer)
                        .decision("ERROR")
                        .error_reason("malformed_request")
                        .error_detail(format!("{err:#}")),
                )
                .await?;
                break;
            }
        };

        let ctx = RequestContext {
            client_close: head.wants_close(),
            head_bytes: head.head_bytes(),
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            start,
        };

        match handle_request(&mut reader, peer, app, ctx).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }
    Ok(())
}
