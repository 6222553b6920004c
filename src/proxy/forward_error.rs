use std::net::SocketAddr;

use anyhow::Error;
use http::StatusCode;
use thiserror::Error;
use tracing::warn;

use crate::proxy::http::BodyTooLarge;

/// The outbound request could not be built from the target URL.
#[derive(Debug, Error)]
#[error("cannot build upstream request: {reason}")]
pub struct RequestConstruction {
    pub reason: String,
}

impl RequestConstruction {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failures that happen before any response bytes reach the client.
pub enum ForwardErrorKind<'a> {
    BodyTooLarge(&'a BodyTooLarge),
    Construction(&'a RequestConstruction),
    Transport,
}

impl ForwardErrorKind<'_> {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ForwardErrorKind::Construction(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForwardErrorKind::Transport => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => "body_too_large",
            ForwardErrorKind::Construction(_) => "request_construction",
            ForwardErrorKind::Transport => "transport",
        }
    }

    /// Plain-text body sent to the client.
    pub fn client_message(&self, err: &Error) -> String {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => "Request body too large.".to_string(),
            ForwardErrorKind::Construction(_) => "Error creating request".to_string(),
            ForwardErrorKind::Transport => format!("Request failed: {err}"),
        }
    }
}

pub fn classify_forward_error(err: &Error) -> ForwardErrorKind<'_> {
    if let Some(body) = err.downcast_ref::<BodyTooLarge>() {
        ForwardErrorKind::BodyTooLarge(body)
    } else if let Some(construction) = err.downcast_ref::<RequestConstruction>() {
        ForwardErrorKind::Construction(construction)
    } else {
        ForwardErrorKind::Transport
    }
}

pub fn log_forward_error(kind: &ForwardErrorKind<'_>, peer: SocketAddr, url: &str, err: &Error) {
    match kind {
        ForwardErrorKind::BodyTooLarge(body) => warn!(
            peer = %peer,
            bytes_read = body.bytes_read,
            "request body exceeded configured limit"
        ),
        ForwardErrorKind::Construction(construction) => warn!(
            peer = %peer,
            url,
            reason = %construction.reason,
            "failed to build upstream request"
        ),
        ForwardErrorKind::Transport => warn!(
            peer = %peer,
            url,
            error = %err,
            "upstream request failed"
        ),
    }
}
