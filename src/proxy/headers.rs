use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail, ensure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDisposition {
    Connection,
    Host,
    ContentLength,
    TransferEncoding,
    Expect,
    Skip,
    Forward,
}

/// Client-address headers describe this hop, not the upstream exchange.
pub fn is_forwarding_header(name: &str) -> bool {
    name.starts_with("x-forwarded-")
        || name.ends_with("-client-ip")
        || matches!(
            name,
            "forwarded" | "x-real-ip" | "cf-connecting-ip" | "cdn-loop" | "via"
        )
}

/// Classifies a lowercase inbound header name.
pub fn classify_request_header(name: &str) -> HeaderDisposition {
    match name {
        "connection" => HeaderDisposition::Connection,
        "host" => HeaderDisposition::Host,
        "content-length" => HeaderDisposition::ContentLength,
        "transfer-encoding" => HeaderDisposition::TransferEncoding,
        "expect" => HeaderDisposition::Expect,
        "keep-alive" | "upgrade" | "te" | "trailer" => HeaderDisposition::Skip,
        _ if name.starts_with("proxy-") || is_forwarding_header(name) => HeaderDisposition::Skip,
        _ => HeaderDisposition::Forward,
    }
}

/// Upstream response headers that must not be relayed to the client.
pub fn is_hop_by_hop_response_header(name: &str, connection_tokens: &HashSet<String>) -> bool {
    matches!(
        name,
        "connection" | "transfer-encoding" | "keep-alive" | "proxy-connection" | "upgrade"
    ) || connection_tokens.contains(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    Forward,
    Skip,
}

/// Validates inbound request headers, capturing framing and connection metadata while
/// deciding which headers continue upstream.
#[derive(Debug, Clone)]
pub struct RequestHeaderSanitizer {
    max_bytes: usize,
    consumed: usize,
    host: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
    expect_continue: bool,
    connection_tokens: HashSet<String>,
}

impl RequestHeaderSanitizer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            host: None,
            content_length: None,
            chunked: false,
            expect_continue: false,
            connection_tokens: HashSet::new(),
        }
    }

    pub fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit"
        );
        Ok(())
    }

    pub fn record(&mut self, name: &str, value: &str, byte_len: usize) -> Result<HeaderAction> {
        self.reserve(byte_len)?;

        let name_lower = name.to_ascii_lowercase();
        match classify_request_header(&name_lower) {
            HeaderDisposition::Connection => {
                for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    self.connection_tokens.insert(token.to_ascii_lowercase());
                }
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Host => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                self.host = Some(value.to_ascii_lowercase());
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::ContentLength => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                if self.content_length.is_some() {
                    bail!("multiple Content-Length headers are not supported");
                }
                let length: usize = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.content_length = Some(length);
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::TransferEncoding => {
                if self.chunked {
                    bail!("duplicate Transfer-Encoding header");
                }
                if !value.trim().eq_ignore_ascii_case("chunked") {
                    bail!("unsupported Transfer-Encoding '{value}'");
                }
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                self.chunked = true;
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Expect => {
                if !value.trim().eq_ignore_ascii_case("100-continue") {
                    bail!("unsupported Expect header value '{value}'");
                }
                self.expect_continue = true;
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Skip => Ok(HeaderAction::Skip),
            HeaderDisposition::Forward => Ok(HeaderAction::Forward),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn connection_tokens(&self) -> &HashSet<String> {
        &self.connection_tokens
    }
}
