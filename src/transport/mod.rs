//! The HTTP boundary of the pipeline.

#[cfg(feature = "hyper-client")]
mod hyper_client;
#[cfg(feature = "ureq-client")]
mod ureq_client;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;

#[cfg(feature = "hyper-client")]
pub use hyper_client::HyperTransport;
#[cfg(feature = "ureq-client")]
pub use ureq_client::UreqTransport;

use crate::error::{BoxError, TransportErrorKind};
use crate::message::{ByteStream, HttpRequest, HttpResponse, ReaderBody, StreamingHttpResponse};

pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
#[error("{kind} transport failure: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn body_too_large(limit_bytes: usize, actual_bytes: usize) -> Self {
        Self::new(
            TransportErrorKind::BodyTooLarge,
            BodyLimitExceeded {
                limit_bytes,
                actual_bytes,
            },
        )
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn body_limit(&self) -> Option<&BodyLimitExceeded> {
        self.source.downcast_ref()
    }

    pub fn into_source(self) -> BoxError {
        self.source
    }
}

/// Source of a [`TransportErrorKind::BodyTooLarge`] failure; `actual_bytes` is
/// the size read when the limit tripped, not necessarily the full body size.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("response body exceeds {limit_bytes} bytes (read {actual_bytes})")]
pub struct BodyLimitExceeded {
    pub limit_bytes: usize,
    pub actual_bytes: usize,
}

/// Sends one request and buffers the response. Redirects are returned as-is.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Returns once the response head has arrived, leaving the body unread.
    /// The default buffers through [`send`](Self::send).
    async fn send_streaming(
        &self,
        request: HttpRequest,
    ) -> Result<StreamingHttpResponse<ByteStream>, TransportError> {
        self.send(request).await.map(StreamingHttpResponse::<ByteStream>::from_buffered)
    }
}

/// Blocking counterpart of [`HttpTransport`]; the transport applies `timeout`
/// to the whole exchange.
pub trait BlockingHttpTransport: Send + Sync {
    fn send(&self, request: HttpRequest, timeout: Option<Duration>) -> Result<HttpResponse, TransportError>;

    fn send_streaming(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<StreamingHttpResponse<ReaderBody>, TransportError> {
        self.send(request, timeout)
            .map(StreamingHttpResponse::<ReaderBody>::from_buffered)
    }
}

#[async_trait]
impl<T> HttpTransport for Arc<T>
where
    T: HttpTransport + ?Sized,
{
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }

    async fn send_streaming(
        &self,
        request: HttpRequest,
    ) -> Result<StreamingHttpResponse<ByteStream>, TransportError> {
        (**self).send_streaming(request).await
    }
}

#[async_trait]
impl<T> HttpTransport for &T
where
    T: HttpTransport + ?Sized,
{
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }

    async fn send_streaming(
        &self,
        request: HttpRequest,
    ) -> Result<StreamingHttpResponse<ByteStream>, TransportError> {
        (**self).send_streaming(request).await
    }
}

impl<T> BlockingHttpTransport for Arc<T>
where
    T: BlockingHttpTransport + ?Sized,
{
    fn send(&self, request: HttpRequest, timeout: Option<Duration>) -> Result<HttpResponse, TransportError> {
        (**self).send(request, timeout)
    }

    fn send_streaming(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<StreamingHttpResponse<ReaderBody>, TransportError> {
        (**self).send_streaming(request, timeout)
    }
}

impl<T> BlockingHttpTransport for &T
where
    T: BlockingHttpTransport + ?Sized,
{
    fn send(&self, request: HttpRequest, timeout: Option<Duration>) -> Result<HttpResponse, TransportError> {
        (**self).send(request, timeout)
    }

    fn send_streaming(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<StreamingHttpResponse<ReaderBody>, TransportError> {
        (**self).send_streaming(request, timeout)
    }
}

/// Buffers a streamed body, failing once it grows past `max_bytes`.
pub(crate) async fn collect_stream(mut body: ByteStream, max_bytes: usize) -> Result<Bytes, TransportError> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|source| TransportError::new(TransportErrorKind::Read, source))?;
        let total = collected.len().saturating_add(chunk.len());
        if total > max_bytes {
            return Err(TransportError::body_too_large(max_bytes, total));
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

pub(crate) fn collect_reader(mut body: ReaderBody, max_bytes: usize) -> Result<Bytes, TransportError> {
    let mut collected = Vec::new();
    let mut chunk = [0_u8; 8192];
    loop {
        let read = body
            .read(&mut chunk)
            .map_err(|source| TransportError::new(classify_io_error(&source), source))?;
        if read == 0 {
            return Ok(Bytes::from(collected));
        }
        let total = collected.len().saturating_add(read);
        if total > max_bytes {
            return Err(TransportError::body_too_large(max_bytes, total));
        }
        collected.extend_from_slice(&chunk[..read]);
    }
}

pub(crate) fn classify_io_error(error: &std::io::Error) -> TransportErrorKind {
    match error.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
        std::io::ErrorKind::NotFound => TransportErrorKind::Dns,
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::AddrNotAvailable => TransportErrorKind::Connect,
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
            TransportErrorKind::Reset
        }
        std::io::ErrorKind::UnexpectedEof => TransportErrorKind::Read,
        _ => TransportErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::stream;

    use super::{BodyLimitExceeded, classify_io_error, collect_reader, collect_stream};
    use crate::error::{BoxError, TransportErrorKind};
    use crate::message::{ByteStream, ReaderBody};

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        ByteStream::new(stream::iter(
            parts
                .iter()
                .map(|part| Ok::<_, BoxError>(Bytes::from_static(part)))
                .collect::<Vec<_>>(),
        ))
    }

    #[tokio::test]
    async fn collected_streams_stop_at_the_limit() {
        let body = collect_stream(chunks(&[b"abc", b"def"]), 6).await.expect("fits");
        assert_eq!(body, Bytes::from_static(b"abcdef"));

        let error = collect_stream(chunks(&[b"abc", b"def", b"ghi"]), 4)
            .await
            .expect_err("over the limit");
        assert_eq!(error.kind(), TransportErrorKind::BodyTooLarge);
        assert_eq!(
            error.body_limit(),
            Some(&BodyLimitExceeded {
                limit_bytes: 4,
                actual_bytes: 6,
            })
        );
    }

    #[tokio::test]
    async fn stream_failures_are_read_errors() {
        let failing = ByteStream::new(stream::iter(vec![
            Ok::<_, BoxError>(Bytes::from_static(b"abc")),
            Err::<Bytes, BoxError>("connection dropped".into()),
        ]));
        let error = collect_stream(failing, 1024).await.expect_err("stream fails");
        assert_eq!(error.kind(), TransportErrorKind::Read);
        assert!(error.body_limit().is_none());
    }

    #[test]
    fn collected_readers_stop_at_the_limit() {
        let body = collect_reader(ReaderBody::from_bytes(Bytes::from_static(b"hello")), 5).expect("fits");
        assert_eq!(body, Bytes::from_static(b"hello"));

        let error = collect_reader(ReaderBody::from_bytes(Bytes::from(vec![7_u8; 20_000])), 10_000)
            .expect_err("over the limit");
        assert_eq!(error.kind(), TransportErrorKind::BodyTooLarge);
        assert_eq!(error.body_limit().map(|limit| limit.limit_bytes), Some(10_000));
    }

    #[test]
    fn io_error_kinds_map_to_transport_kinds() {
        let kind_of = |kind| classify_io_error(&std::io::Error::from(kind));
        assert_eq!(kind_of(std::io::ErrorKind::ConnectionRefused), TransportErrorKind::Connect);
        assert_eq!(kind_of(std::io::ErrorKind::ConnectionReset), TransportErrorKind::Reset);
        assert_eq!(kind_of(std::io::ErrorKind::TimedOut), TransportErrorKind::Timeout);
        assert_eq!(kind_of(std::io::ErrorKind::UnexpectedEof), TransportErrorKind::Read);
        assert_eq!(kind_of(std::io::ErrorKind::InvalidData), TransportErrorKind::Other);
    }
}
