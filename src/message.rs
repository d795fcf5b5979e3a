use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::BoxError;

type DynByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Async body that can be read once: a streaming request payload or a
/// response body still on the wire.
pub struct ByteStream {
    inner: DynByteStream,
    content_length: Option<u64>,
}

impl ByteStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
            content_length: None,
        }
    }

    /// A single-chunk stream over already buffered bytes.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let length = bytes.len() as u64;
        Self::new(futures_util::stream::iter([Ok::<_, BoxError>(bytes)])).with_content_length(length)
    }

    pub fn with_content_length(mut self, content_length: u64) -> Self {
        self.content_length = Some(content_length);
        self
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Blocking counterpart of [`ByteStream`].
pub struct ReaderBody {
    inner: Box<dyn Read + Send>,
    content_length: Option<u64>,
}

impl ReaderBody {
    pub fn new<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            inner: Box::new(reader),
            content_length: None,
        }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let length = bytes.len() as u64;
        Self::new(std::io::Cursor::new(bytes)).with_content_length(length)
    }

    pub fn with_content_length(mut self, content_length: u64) -> Self {
        self.content_length = Some(content_length);
        self
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

impl Read for ReaderBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::fmt::Debug for ReaderBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ReaderBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum SdkBody {
    Bytes(Bytes),
    Stream(ByteStream),
    Reader(ReaderBody),
    /// Placeholder left behind once a streaming body has been handed to a transport.
    Taken,
}

impl SdkBody {
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Stream(_) | Self::Reader(_))
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::Stream(stream) => stream.content_length(),
            Self::Reader(reader) => reader.content_length(),
            Self::Taken => None,
        }
    }

    pub(crate) fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Bytes(bytes) => Some(Self::Bytes(bytes.clone())),
            _ => None,
        }
    }
}

impl Default for SdkBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for SdkBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for SdkBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for SdkBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for SdkBody {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<ByteStream> for SdkBody {
    fn from(stream: ByteStream) -> Self {
        Self::Stream(stream)
    }
}

impl From<ReaderBody> for SdkBody {
    fn from(reader: ReaderBody) -> Self {
        Self::Reader(reader)
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: SdkBody,
}

impl HttpRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: SdkBody::empty(),
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: Uri) -> Self {
        Self::new(Method::POST, uri)
    }

    pub fn put(uri: Uri) -> Self {
        Self::new(Method::PUT, uri)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<SdkBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &SdkBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut SdkBody {
        &mut self.body
    }

    pub fn take_body(&mut self) -> SdkBody {
        std::mem::replace(&mut self.body, SdkBody::Taken)
    }

    pub fn into_parts(self) -> (Method, Uri, HeaderMap, SdkBody) {
        (self.method, self.uri, self.headers, self.body)
    }

    /// Copies the request when its body can be sent again.
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
        })
    }

    pub(crate) fn ensure_content_length(&mut self) {
        if self.headers.contains_key(CONTENT_LENGTH) {
            return;
        }
        if let Some(length) = self.body.content_length()
            && (length > 0 || self.method != Method::GET)
        {
            self.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
    }
}

/// A fully buffered response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A response whose head has arrived and whose body `B` is still being received.
#[derive(Debug)]
pub struct StreamingHttpResponse<B> {
    status: StatusCode,
    headers: HeaderMap,
    body: B,
}

impl<B> StreamingHttpResponse<B> {
    pub fn new(status: StatusCode, headers: HeaderMap, body: B) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, B) {
        (self.status, self.headers, self.body)
    }
}

impl StreamingHttpResponse<ByteStream> {
    pub fn from_buffered(response: HttpResponse) -> Self {
        Self::new(response.status, response.headers, ByteStream::from_bytes(response.body))
    }
}

impl StreamingHttpResponse<ReaderBody> {
    pub fn from_buffered(response: HttpResponse) -> Self {
        Self::new(response.status, response.headers, ReaderBody::from_bytes(response.body))
    }
}

/// Result of a streaming call: the output unmarshalled from the response head
/// and the body, which is checksum-validated as it is read when the operation
/// asks for response validation.
#[derive(Debug)]
pub struct StreamingOutput<T, B> {
    output: T,
    status: StatusCode,
    headers: HeaderMap,
    body: B,
}

impl<T, B> StreamingOutput<T, B> {
    pub(crate) fn new(output: T, status: StatusCode, headers: HeaderMap, body: B) -> Self {
        Self {
            output,
            status,
            headers,
            body,
        }
    }

    pub fn output(&self) -> &T {
        &self.output
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_mut(&mut self) -> &mut B {
        &mut self.body
    }

    pub fn into_parts(self) -> (T, B) {
        (self.output, self.body)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::stream;
    use http::header::CONTENT_LENGTH;

    use super::{ByteStream, HttpRequest, ReaderBody, SdkBody};

    #[test]
    fn buffered_requests_clone_and_streams_do_not() {
        let uri = "https://example.com/items".parse().expect("valid uri");
        let buffered = HttpRequest::put(uri).with_body("payload");
        let copy = buffered.try_clone().expect("buffered body is replayable");
        assert_eq!(copy.body().bytes(), Some(&Bytes::from_static(b"payload")));

        let uri = "https://example.com/items".parse().expect("valid uri");
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"a"))]);
        let streaming = HttpRequest::put(uri).with_body(ByteStream::new(chunks));
        assert!(streaming.try_clone().is_none());
        assert!(streaming.body().is_streaming());
    }

    #[test]
    fn taking_a_body_leaves_a_placeholder() {
        let uri = "https://example.com/upload".parse().expect("valid uri");
        let mut request = HttpRequest::put(uri)
            .with_body(ReaderBody::new(std::io::empty()).with_content_length(0));
        let body = request.take_body();
        assert!(matches!(body, SdkBody::Reader(_)));
        assert!(matches!(request.body(), SdkBody::Taken));
    }

    #[test]
    fn content_length_is_filled_from_known_body_length() {
        let uri = "https://example.com/upload".parse().expect("valid uri");
        let mut request = HttpRequest::post(uri).with_body("12345");
        request.ensure_content_length();
        assert_eq!(
            request.headers().get(CONTENT_LENGTH).map(|v| v.to_str().ok()),
            Some(Some("5"))
        );
    }
}
