use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::TokioExecutor;

use super::{DEFAULT_MAX_RESPONSE_BODY_BYTES, HttpTransport, TransportError};
use crate::error::{BoxError, TransportErrorKind};
use crate::message::{ByteStream, HttpRequest, HttpResponse, SdkBody, StreamingHttpResponse};

type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// [`HttpTransport`] over the hyper legacy client. TLS is provided by the
/// connector passed to [`HyperTransport::with_connector`].
pub struct HyperTransport<C = HttpConnector> {
    client: Client<C, RequestBody>,
    max_response_body_bytes: usize,
}

impl HyperTransport<HttpConnector> {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        Self::with_connector(connector)
    }
}

impl Default for HyperTransport<HttpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> HyperTransport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn with_connector(connector: C) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        Self {
            client,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }
}

impl<C> std::fmt::Debug for HyperTransport<C> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .finish_non_exhaustive()
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

fn into_hyper_request(request: HttpRequest) -> Result<http::Request<RequestBody>, TransportError> {
    let (method, uri, headers, body) = request.into_parts();
    let body = match body {
        SdkBody::Bytes(bytes) => Full::new(bytes)
            .map_err(map_infallible_to_box_error)
            .boxed_unsync(),
        SdkBody::Stream(stream) => {
            StreamBody::new(stream.map(|chunk| chunk.map(Frame::data))).boxed_unsync()
        }
        SdkBody::Reader(_) => {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "blocking reader bodies need a blocking transport",
            ));
        }
        SdkBody::Taken => {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "request body was already consumed",
            ));
        }
    };

    let mut request = http::Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
    *request.headers_mut() = headers;
    Ok(request)
}

fn classify_client_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let text = error.to_string().to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let source_text = std::error::Error::source(error)
        .map(|source| source.to_string().to_ascii_lowercase())
        .unwrap_or_default();
    if text.contains("connection reset")
        || source_text.contains("connection reset")
        || source_text.contains("broken pipe")
        || source_text.contains("connection closed")
    {
        return TransportErrorKind::Reset;
    }
    if text.contains("read") || source_text.contains("unexpected eof") {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}

async fn read_body_limited(mut body: Incoming, max_bytes: usize) -> Result<Bytes, TransportError> {
    let mut collected = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|source| {
            let kind = if source.is_timeout() {
                TransportErrorKind::Timeout
            } else {
                TransportErrorKind::Read
            };
            TransportError::new(kind, source)
        })?;
        if let Some(data) = frame.data_ref() {
            let total = collected.len().saturating_add(data.len());
            if total > max_bytes {
                return Err(TransportError::body_too_large(max_bytes, total));
            }
            collected.extend_from_slice(data);
        }
    }
    Ok(Bytes::from(collected))
}

#[async_trait]
impl<C> HttpTransport for HyperTransport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let request = into_hyper_request(request)?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| TransportError::new(classify_client_error(&source), source))?;
        let (parts, body) = response.into_parts();
        let body = read_body_limited(body, self.max_response_body_bytes).await?;
        Ok(HttpResponse::new(parts.status, parts.headers, body))
    }

    async fn send_streaming(
        &self,
        request: HttpRequest,
    ) -> Result<StreamingHttpResponse<ByteStream>, TransportError> {
        let request = into_hyper_request(request)?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| TransportError::new(classify_client_error(&source), source))?;
        let (parts, body) = response.into_parts();
        let content_length = hyper::body::Body::size_hint(&body).exact();
        let data = TryStreamExt::map_err(body.into_data_stream(), |source| Box::new(source) as BoxError);
        let mut stream = ByteStream::new(data);
        if let Some(length) = content_length {
            stream = stream.with_content_length(length);
        }
        Ok(StreamingHttpResponse::new(parts.status, parts.headers, stream))
    }
}

#[cfg(test)]
mod tests {
    use http::header::HeaderValue;

    use super::into_hyper_request;
    use crate::error::TransportErrorKind;
    use crate::message::{HttpRequest, ReaderBody};

    #[test]
    fn reader_bodies_are_rejected() {
        let request = HttpRequest::put("http://localhost/upload".parse().expect("uri"))
            .with_body(ReaderBody::new(std::io::empty()));
        let error = into_hyper_request(request).expect_err("reader body is not async");
        assert_eq!(error.kind(), TransportErrorKind::Other);
    }

    #[test]
    fn headers_are_carried_over() {
        let request = HttpRequest::get("http://localhost/items".parse().expect("uri"))
            .with_header(http::header::ACCEPT, HeaderValue::from_static("application/json"));
        let request = into_hyper_request(request).expect("buffered body converts");
        assert_eq!(
            request.headers().get(http::header::ACCEPT),
            Some(&HeaderValue::from_static("application/json"))
        );
    }
}
