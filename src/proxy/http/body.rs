use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::time::Instant;

use crate::{
    io_util::{flush_with_timeout, write_all_with_timeout},
    proxy::{forward_limits::BodySizeTracker, http::codec::read_line_with_deadline},
    util::deadline_with_context,
};

use super::codec::ResponseHead;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit")]
pub struct BodyTooLarge {
    pub bytes_read: u64,
}

/// Framing of an inbound request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
}

/// Framing of an upstream response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub fn determine_response_body_plan(method: &Method, head: &ResponseHead) -> ResponseBodyPlan {
    if *method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        ResponseBodyPlan::Empty
    } else if head.chunked {
        ResponseBodyPlan::Chunked
    } else if let Some(length) = head.content_length {
        if length == 0 {
            ResponseBodyPlan::Empty
        } else {
            ResponseBodyPlan::Fixed(length)
        }
    } else {
        ResponseBodyPlan::UntilClose
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Fixed { remaining: u64 },
    Chunked { remaining: u64, needs_crlf: bool },
    UntilClose,
    Done,
}

/// Pull-based decoder yielding payload bytes from a framed HTTP/1.1 body.
pub struct BodyReader<'a, R> {
    reader: &'a mut BufReader<R>,
    state: DecodeState,
    peer: SocketAddr,
}

impl<'a, R> BodyReader<'a, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: &'a mut BufReader<R>, plan: ResponseBodyPlan, peer: SocketAddr) -> Self {
        let state = match plan {
            ResponseBodyPlan::Empty | ResponseBodyPlan::Fixed(0) => DecodeState::Done,
            ResponseBodyPlan::Fixed(length) => DecodeState::Fixed { remaining: length },
            ResponseBodyPlan::Chunked => DecodeState::Chunked {
                remaining: 0,
                needs_crlf: false,
            },
            ResponseBodyPlan::UntilClose => DecodeState::UntilClose,
        };
        Self {
            reader,
            state,
            peer,
        }
    }

    pub fn for_request(reader: &'a mut BufReader<R>, plan: BodyPlan, peer: SocketAddr) -> Self {
        let plan = match plan {
            BodyPlan::Empty => ResponseBodyPlan::Empty,
            BodyPlan::Fixed(length) => ResponseBodyPlan::Fixed(length as u64),
            BodyPlan::Chunked => ResponseBodyPlan::Chunked,
        };
        Self::new(reader, plan, peer)
    }

    /// Fills at most `buf.len()` payload bytes. Returns 0 once the body is complete.
    pub async fn read_chunk(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                DecodeState::Done => return Ok(0),
                DecodeState::Fixed { remaining } => {
                    let to_read = remaining.min(buf.len() as u64) as usize;
                    let read = self.read_payload(&mut buf[..to_read], deadline).await?;
                    if read == 0 {
                        bail!("connection closed early while reading body from {}", self.peer);
                    }
                    let remaining = remaining - read as u64;
                    self.state = if remaining == 0 {
                        DecodeState::Done
                    } else {
                        DecodeState::Fixed { remaining }
                    };
                    return Ok(read);
                }
                DecodeState::UntilClose => {
                    let read = self.read_payload(buf, deadline).await?;
                    if read == 0 {
                        self.state = DecodeState::Done;
                    }
                    return Ok(read);
                }
                DecodeState::Chunked {
                    remaining,
                    needs_crlf,
                } => {
                    if remaining == 0 {
                        if needs_crlf {
                            self.read_chunk_terminator(deadline).await?;
                        }
                        let size = self.read_chunk_size(deadline).await?;
                        if size == 0 {
                            self.skip_trailers(deadline).await?;
                            self.state = DecodeState::Done;
                            return Ok(0);
                        }
                        self.state = DecodeState::Chunked {
                            remaining: size,
                            needs_crlf: true,
                        };
                        continue;
                    }
                    let to_read = remaining.min(buf.len() as u64) as usize;
                    let read = self.read_payload(&mut buf[..to_read], deadline).await?;
                    if read == 0 {
                        bail!("unexpected EOF while reading chunk data from {}", self.peer);
                    }
                    self.state = DecodeState::Chunked {
                        remaining: remaining - read as u64,
                        needs_crlf: true,
                    };
                    return Ok(read);
                }
            }
        }
    }

    async fn read_payload(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        deadline_with_context(
            deadline,
            self.reader.read(buf),
            format!("reading body from {}", self.peer),
        )
        .await
    }

    async fn read_chunk_size(&mut self, deadline: Instant) -> Result<u64> {
        let mut line = String::new();
        let read =
            read_line_with_deadline(self.reader, &mut line, deadline, self.peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if read == 0 {
            bail!("unexpected EOF while reading chunk size from {}", self.peer);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        u64::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
    }

    async fn read_chunk_terminator(&mut self, deadline: Instant) -> Result<()> {
        let mut crlf = [0u8; 2];
        deadline_with_context(
            deadline,
            self.reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {}", self.peer),
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {}", self.peer);
        }
        Ok(())
    }

    async fn skip_trailers(&mut self, deadline: Instant) -> Result<()> {
        let mut line = String::new();
        loop {
            let read = read_line_with_deadline(
                self.reader,
                &mut line,
                deadline,
                self.peer,
                MAX_CHUNK_LINE_LENGTH,
            )
            .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk trailer from {}", self.peer);
            }
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                return Ok(());
            }
        }
    }
}

/// Buffers a complete inbound request body so it can be replayed across upstream redirects.
pub async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    timeout: Duration,
    peer: SocketAddr,
    max_body_size: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    if let BodyPlan::Fixed(length) = plan
        && length > max_body_size
    {
        return Err(BodyTooLarge {
            bytes_read: length as u64,
        }
        .into());
    }

    let deadline = Instant::now() + timeout;
    let mut tracker = BodySizeTracker::new(max_body_size);
    let mut body = BytesMut::new();
    let mut buffer = [0u8; 8192];
    let mut decoder = BodyReader::for_request(reader, plan, peer);
    loop {
        let read = decoder.read_chunk(&mut buffer, deadline).await?;
        if read == 0 {
            break;
        }
        tracker.record(read)?;
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(body.freeze())
}

/// Writes one piece of the response body using the client framing, then flushes.
pub async fn write_client_chunk<C>(
    client: &mut C,
    chunked: bool,
    data: &[u8],
    timeout: Duration,
) -> Result<()>
where
    C: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    if chunked {
        let size_line = format!("{:x}\r\n", data.len());
        write_all_with_timeout(client, size_line.as_bytes(), timeout, "writing chunk size").await?;
        write_all_with_timeout(client, data, timeout, "writing response body to client").await?;
        write_all_with_timeout(client, b"\r\n", timeout, "writing chunk terminator").await?;
    } else {
        write_all_with_timeout(client, data, timeout, "writing response body to client").await?;
    }
    flush_with_timeout(client, timeout, "flushing response body to client").await
}

pub async fn finish_client_body<C>(client: &mut C, chunked: bool, timeout: Duration) -> Result<()>
where
    C: AsyncWrite + Unpin,
{
    if chunked {
        write_all_with_timeout(client, b"0\r\n\r\n", timeout, "writing final chunk").await?;
    }
    flush_with_timeout(client, timeout, "flushing response body to client").await
}

/// How a relay loop ended.
#[derive(Debug)]
pub enum RelayEnd {
    Complete,
    /// Upstream failed mid-body; the client connection must be closed to signal truncation.
    UpstreamFailed(anyhow::Error),
    /// The client stopped accepting bytes.
    ClientFailed(anyhow::Error),
}

pub struct RelayStats {
    pub bytes: u64,
    pub end: RelayEnd,
}

/// Streams the decoded body to the client `chunk_size` bytes at a time, flushing each piece.
pub async fn relay_body<R, C>(
    body: &mut BodyReader<'_, R>,
    client: &mut C,
    chunked: bool,
    chunk_size: usize,
    deadline: Instant,
    client_timeout: Duration,
) -> RelayStats
where
    R: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut bytes = 0u64;
    loop {
        let read = match body.read_chunk(&mut buffer, deadline).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                return RelayStats {
                    bytes,
                    end: RelayEnd::UpstreamFailed(err),
                };
            }
        };
        if let Err(err) = write_client_chunk(client, chunked, &buffer[..read], client_timeout).await
        {
            return RelayStats {
                bytes,
                end: RelayEnd::ClientFailed(err),
            };
        }
        bytes = bytes.saturating_add(read as u64);
    }

    let end = match finish_client_body(client, chunked, client_timeout).await {
        Ok(()) => RelayEnd::Complete,
        Err(err) => RelayEnd::ClientFailed(err),
    };
    RelayStats { bytes, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Version;
    use tokio::io::{AsyncWriteExt, duplex};

    fn peer() -> SocketAddr {
        "127.0.0.1:443".parse().unwrap()
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    fn head(status: StatusCode, length: Option<u64>, chunked: bool) -> ResponseHead {
        ResponseHead {
            version: Version::HTTP_11,
            status,
            reason: String::new(),
            headers: Vec::new(),
            content_length: length,
            chunked,
            connection_close: false,
        }
    }

    #[test]
    fn body_plan_for_bodyless_responses() {
        let get = Method::GET;
        assert_eq!(
            determine_response_body_plan(&Method::HEAD, &head(StatusCode::OK, Some(10), false)),
            ResponseBodyPlan::Empty
        );
        assert_eq!(
            determine_response_body_plan(&get, &head(StatusCode::NO_CONTENT, None, false)),
            ResponseBodyPlan::Empty
        );
        assert_eq!(
            determine_response_body_plan(&get, &head(StatusCode::NOT_MODIFIED, Some(5), false)),
            ResponseBodyPlan::Empty
        );
        assert_eq!(
            determine_response_body_plan(&get, &head(StatusCode::OK, Some(5), false)),
            ResponseBodyPlan::Fixed(5)
        );
        assert_eq!(
            determine_response_body_plan(&get, &head(StatusCode::OK, None, true)),
            ResponseBodyPlan::Chunked
        );
        assert_eq!(
            determine_response_body_plan(&get, &head(StatusCode::OK, None, false)),
            ResponseBodyPlan::UntilClose
        );
    }

    #[tokio::test]
    async fn decodes_chunked_body_in_small_reads() -> Result<()> {
        let (upstream, mut writer) = duplex(1024);
        writer
            .write_all(b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n")
            .await?;
        drop(writer);

        let mut reader = BufReader::new(upstream);
        let mut decoder = BodyReader::new(&mut reader, ResponseBodyPlan::Chunked, peer());
        let mut collected = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let read = decoder.read_chunk(&mut buf, deadline()).await?;
            if read == 0 {
                break;
            }
            assert!(read <= 3);
            collected.extend_from_slice(&buf[..read]);
        }
        assert_eq!(collected, b"hello world");
        Ok(())
    }

    #[tokio::test]
    async fn fixed_body_detects_truncation() -> Result<()> {
        let (upstream, mut writer) = duplex(1024);
        writer.write_all(b"abc").await?;
        drop(writer);

        let mut reader = BufReader::new(upstream);
        let mut decoder = BodyReader::new(&mut reader, ResponseBodyPlan::Fixed(10), peer());
        let mut buf = [0u8; 16];
        assert_eq!(decoder.read_chunk(&mut buf, deadline()).await?, 3);
        assert!(decoder.read_chunk(&mut buf, deadline()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn request_body_over_limit_is_rejected() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer.write_all(b"5\r\nhello\r\n0\r\n\r\n").await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        let err = read_request_body(
            &mut reader,
            BodyPlan::Chunked,
            Duration::from_secs(1),
            peer(),
            2,
        )
        .await
        .expect_err("expected body size limit error");
        assert!(err.downcast::<BodyTooLarge>().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn declared_length_over_limit_fails_before_reading() {
        let (client, _writer) = duplex(64);
        let mut reader = BufReader::new(client);
        let err = read_request_body(
            &mut reader,
            BodyPlan::Fixed(100),
            Duration::from_secs(1),
            peer(),
            10,
        )
        .await
        .expect_err("declared length too large");
        assert_eq!(err.downcast_ref::<BodyTooLarge>().unwrap().bytes_read, 100);
    }

    #[tokio::test]
    async fn request_body_is_buffered() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer.write_all(b"0032have 0123\n").await?;
        drop(writer);
        let mut reader = BufReader::new(client);
        let body = read_request_body(
            &mut reader,
            BodyPlan::Fixed(14),
            Duration::from_secs(1),
            peer(),
            1024,
        )
        .await?;
        assert_eq!(&body[..], b"0032have 0123\n");
        Ok(())
    }

    #[tokio::test]
    async fn relay_rechunks_for_client() -> Result<()> {
        let (upstream, mut upstream_writer) = duplex(1024);
        upstream_writer.write_all(b"abcdefgh").await?;
        drop(upstream_writer);

        let (mut client, mut client_reader) = duplex(1024);
        let mut reader = BufReader::new(upstream);
        let mut decoder = BodyReader::new(&mut reader, ResponseBodyPlan::UntilClose, peer());
        let stats = relay_body(
            &mut decoder,
            &mut client,
            true,
            5,
            deadline(),
            Duration::from_secs(1),
        )
        .await;
        drop(client);

        assert_eq!(stats.bytes, 8);
        assert!(matches!(stats.end, RelayEnd::Complete));
        let mut out = Vec::new();
        client_reader.read_to_end(&mut out).await?;
        assert_eq!(out, b"5\r\nabcde\r\n3\r\nfgh\r\n0\r\n\r\n");
        Ok(())
    }

    #[tokio::test]
    async fn relay_reports_upstream_failure() -> Result<()> {
        let (upstream, mut upstream_writer) = duplex(1024);
        upstream_writer.write_all(b"abc").await?;
        drop(upstream_writer);

        let (mut client, _client_reader) = duplex(1024);
        let mut reader = BufReader::new(upstream);
        let mut decoder = BodyReader::new(&mut reader, ResponseBodyPlan::Fixed(6), peer());
        let stats = relay_body(
            &mut decoder,
            &mut client,
            false,
            1024,
            deadline(),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(stats.bytes, 3);
        assert!(matches!(stats.end, RelayEnd::UpstreamFailed(_)));
        Ok(())
    }
}
