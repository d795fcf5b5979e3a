use std::io::Read;
use std::time::Duration;

use bytes::Bytes;

use super::{BlockingHttpTransport, DEFAULT_MAX_RESPONSE_BODY_BYTES, TransportError, classify_io_error};
use crate::error::TransportErrorKind;
use crate::message::{HttpRequest, HttpResponse, ReaderBody, SdkBody, StreamingHttpResponse};

/// [`BlockingHttpTransport`] over a `ureq` agent. Status codes are never
/// turned into errors and redirects are not followed.
pub struct UreqTransport {
    agent: ureq::Agent,
    max_response_body_bytes: usize,
}

impl UreqTransport {
    pub fn new() -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .user_agent("sdkx")
            .build();
        Self::from_agent(config.new_agent())
    }

    /// Wraps a caller-configured agent; it must not treat statuses as errors.
    pub fn from_agent(agent: ureq::Agent) -> Self {
        Self {
            agent,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    fn run<S: ureq::AsSendBody>(
        &self,
        request: ureq::http::Request<S>,
        timeout: Option<Duration>,
    ) -> Result<ureq::http::Response<ureq::Body>, TransportError> {
        let configured_request = self
            .agent
            .configure_request(request)
            .timeout_global(timeout)
            .build();
        self.agent
            .run(configured_request)
            .map_err(|source| TransportError::new(classify_ureq_error(&source), source))
    }

    fn read_body(&self, response: &mut ureq::http::Response<ureq::Body>) -> Result<Bytes, TransportError> {
        let mut reader = response.body_mut().as_reader();
        let mut collected = Vec::new();
        let mut chunk = [0_u8; 8192];
        loop {
            let read = reader.read(&mut chunk).map_err(|source| {
                let kind = wrapped_ureq_error(&source)
                    .map(classify_ureq_error)
                    .unwrap_or_else(|| classify_io_error(&source));
                TransportError::new(kind, source)
            })?;
            if read == 0 {
                break;
            }
            let total = collected.len().saturating_add(read);
            if total > self.max_response_body_bytes {
                return Err(TransportError::body_too_large(self.max_response_body_bytes, total));
            }
            collected.extend_from_slice(&chunk[..read]);
        }
        Ok(Bytes::from(collected))
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UreqTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("UreqTransport")
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .finish_non_exhaustive()
    }
}

fn classify_ureq_error(error: &ureq::Error) -> TransportErrorKind {
    match error {
        ureq::Error::Timeout(_) => TransportErrorKind::Timeout,
        ureq::Error::HostNotFound => TransportErrorKind::Dns,
        ureq::Error::Tls(_) => TransportErrorKind::Tls,
        ureq::Error::ConnectProxyFailed(_) | ureq::Error::ConnectionFailed => {
            TransportErrorKind::Connect
        }
        ureq::Error::Io(source) => classify_io_error(source),
        _ => TransportErrorKind::Other,
    }
}

fn wrapped_ureq_error(io_error: &std::io::Error) -> Option<&ureq::Error> {
    io_error
        .get_ref()
        .and_then(|source| source.downcast_ref::<ureq::Error>())
}

impl UreqTransport {
    fn exchange(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<ureq::http::Response<ureq::Body>, TransportError> {
        let (method, uri, headers, body) = request.into_parts();
        let mut builder = ureq::http::Request::builder().method(method).uri(uri);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let build_error = |source: ureq::http::Error| TransportError::new(TransportErrorKind::Other, source);

        let response = match body {
            SdkBody::Bytes(bytes) => {
                let request = builder.body(bytes.to_vec()).map_err(build_error)?;
                self.run(request, timeout)?
            }
            SdkBody::Reader(reader) => {
                let request = builder
                    .body(ureq::SendBody::from_owned_reader(reader))
                    .map_err(build_error)?;
                self.run(request, timeout)?
            }
            SdkBody::Stream(_) => {
                return Err(TransportError::new(
                    TransportErrorKind::Other,
                    "async stream bodies need an async transport",
                ));
            }
            SdkBody::Taken => {
                return Err(TransportError::new(
                    TransportErrorKind::Other,
                    "request body was already consumed",
                ));
            }
        };

        Ok(response)
    }
}

impl BlockingHttpTransport for UreqTransport {
    fn send(&self, request: HttpRequest, timeout: Option<Duration>) -> Result<HttpResponse, TransportError> {
        let mut response = self.exchange(request, timeout)?;
        let body = self.read_body(&mut response)?;
        let (parts, _) = response.into_parts();
        Ok(HttpResponse::new(parts.status, parts.headers, body))
    }

    /// The global `timeout` keeps running while the caller reads the body.
    fn send_streaming(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<StreamingHttpResponse<ReaderBody>, TransportError> {
        let response = self.exchange(request, timeout)?;
        let (parts, body) = response.into_parts();
        let content_length = body.content_length();
        let mut reader = ReaderBody::new(body.into_reader());
        if let Some(length) = content_length {
            reader = reader.with_content_length(length);
        }
        Ok(StreamingHttpResponse::new(parts.status, parts.headers, reader))
    }
}

#[cfg(test)]
mod tests {
    use super::classify_ureq_error;
    use crate::error::TransportErrorKind;

    #[test]
    fn ureq_errors_map_to_transport_kinds() {
        assert_eq!(classify_ureq_error(&ureq::Error::HostNotFound), TransportErrorKind::Dns);
        assert_eq!(
            classify_ureq_error(&ureq::Error::ConnectionFailed),
            TransportErrorKind::Connect
        );
        assert_eq!(
            classify_ureq_error(&ureq::Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset
            ))),
            TransportErrorKind::Reset
        );
    }
}
