#![allow(dead_code)]

use std::collections::VecDeque;
use std::future;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use sdkx::checksum::ChecksumSpec;
use sdkx::context::ExecutionContext;
use sdkx::error::{BoxError, TransportErrorKind};
use sdkx::interceptor::Interceptor;
use sdkx::message::{ByteStream, HttpRequest, HttpResponse, SdkBody};
use sdkx::operation::Operation;
use sdkx::transport::{BlockingHttpTransport, HttpTransport, TransportError};

/// 2026-01-01T00:00:00Z
pub const FIXED_EPOCH_SECS: u64 = 1_767_225_600;

pub fn fixed_time() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(FIXED_EPOCH_SECS)
}

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub enum Step {
    Respond(HttpResponse),
    Fail(TransportErrorKind),
    /// Responds after sleeping; the async transport sleeps on the tokio timer.
    Delay(Duration, HttpResponse),
    /// Never answers.
    Hang,
}

pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).expect("header name"),
            HeaderValue::from_str(value).expect("header value"),
        );
    }
    HttpResponse::new(
        StatusCode::from_u16(status).expect("status"),
        map,
        Bytes::copy_from_slice(body.as_bytes()),
    )
}

pub fn ok(body: &str) -> Step {
    Step::Respond(response(200, &[], body))
}

pub fn json_error(status: u16, code: &str) -> Step {
    json_error_with(status, code, &[])
}

pub fn json_error_with(status: u16, code: &str, headers: &[(&str, &str)]) -> Step {
    Step::Respond(response(
        status,
        headers,
        &format!(r#"{{"__type":"{code}","message":"scripted {code}"}}"#),
    ))
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Transport that replays a fixed script and records what it was sent.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    steps: Arc<Mutex<VecDeque<Step>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    fn record(&self, request: &HttpRequest, body: Option<Bytes>) -> Option<Step> {
        lock_unpoisoned(&self.requests).push(RecordedRequest {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            body,
        });
        lock_unpoisoned(&self.steps).pop_front()
    }
}

fn script_exhausted() -> TransportError {
    TransportError::new(TransportErrorKind::Other, "script exhausted")
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let body = match request.take_body() {
            SdkBody::Bytes(bytes) => Some(bytes),
            SdkBody::Stream(mut stream) => {
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
                    collected.extend_from_slice(&chunk);
                }
                Some(Bytes::from(collected))
            }
            SdkBody::Reader(_) | SdkBody::Taken => None,
        };
        match self.record(&request, body) {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(kind)) => Err(TransportError::new(kind, "scripted failure")),
            Some(Step::Delay(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(Step::Hang) => future::pending().await,
            None => Err(script_exhausted()),
        }
    }
}

impl BlockingHttpTransport for ScriptedTransport {
    fn send(&self, mut request: HttpRequest, timeout: Option<Duration>) -> Result<HttpResponse, TransportError> {
        let body = request.take_body().bytes().cloned();
        match self.record(&request, body) {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(kind)) => Err(TransportError::new(kind, "scripted failure")),
            Some(Step::Delay(delay, response)) => match timeout {
                Some(timeout) if timeout < delay => {
                    thread::sleep(timeout);
                    Err(TransportError::new(TransportErrorKind::Timeout, "scripted timeout"))
                }
                _ => {
                    thread::sleep(delay);
                    Ok(response)
                }
            },
            Some(Step::Hang) => {
                thread::sleep(timeout.unwrap_or(Duration::from_secs(30)));
                Err(TransportError::new(TransportErrorKind::Timeout, "scripted hang"))
            }
            None => Err(script_exhausted()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Document {
    pub key: String,
    pub body: Bytes,
}

impl Document {
    pub fn new(key: &str, body: &str) -> Self {
        Self {
            key: key.to_owned(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }
}

/// `PUT /{key}` with a buffered body; the output is the response body text.
#[derive(Clone, Debug, Default)]
pub struct PutDocument {
    pub checksum: Option<ChecksumSpec>,
}

impl PutDocument {
    pub fn with_checksum(checksum: ChecksumSpec) -> Self {
        Self {
            checksum: Some(checksum),
        }
    }
}

pub fn document_uri(endpoint: &Uri, key: &str) -> Result<Uri, BoxError> {
    let base = endpoint.to_string();
    Ok(format!("{}/{}", base.trim_end_matches('/'), key).parse::<Uri>()?)
}

impl Operation for PutDocument {
    type Input = Document;
    type Output = String;

    fn name(&self) -> &'static str {
        "PutDocument"
    }

    fn marshal(&self, input: &Document, endpoint: &Uri) -> Result<HttpRequest, BoxError> {
        Ok(HttpRequest::put(document_uri(endpoint, &input.key)?).with_body(input.body.clone()))
    }

    fn unmarshal(&self, response: &HttpResponse) -> Result<String, BoxError> {
        Ok(response.text_lossy())
    }

    fn checksum_spec(&self) -> Option<ChecksumSpec> {
        self.checksum.clone()
    }
}

/// Like [`PutDocument`] but streams its body in chunks, so it cannot be replayed.
#[derive(Clone, Debug, Default)]
pub struct UploadChunks;

impl Operation for UploadChunks {
    type Input = Vec<Bytes>;
    type Output = String;

    fn name(&self) -> &'static str {
        "UploadChunks"
    }

    fn marshal(&self, chunks: &Vec<Bytes>, endpoint: &Uri) -> Result<HttpRequest, BoxError> {
        let length: usize = chunks.iter().map(Bytes::len).sum();
        let stream = ByteStream::new(futures_util::stream::iter(
            chunks.clone().into_iter().map(Ok::<_, BoxError>),
        ))
        .with_content_length(length as u64);
        Ok(HttpRequest::put(document_uri(endpoint, "upload")?).with_body(stream))
    }

    fn unmarshal(&self, response: &HttpResponse) -> Result<String, BoxError> {
        Ok(response.text_lossy())
    }
}

/// Records every hook it sees as `stage@attempt`.
#[derive(Clone, Default)]
pub struct RecordingInterceptor {
    pub events: Arc<Mutex<Vec<String>>>,
    pub label: &'static str,
}

impl RecordingInterceptor {
    pub fn labelled(label: &'static str) -> Self {
        Self {
            events: Arc::default(),
            label,
        }
    }

    pub fn sharing(label: &'static str, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self { events, label }
    }

    pub fn events(&self) -> Vec<String> {
        lock_unpoisoned(&self.events).clone()
    }

    fn push(&self, stage: &str, context: &ExecutionContext) {
        let event = if self.label.is_empty() {
            format!("{stage}@{}", context.attempt())
        } else {
            format!("{}:{stage}@{}", self.label, context.attempt())
        };
        lock_unpoisoned(&self.events).push(event);
    }
}

impl Interceptor for RecordingInterceptor {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn before_execution(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("before_execution", context);
        Ok(())
    }

    fn before_marshalling(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("before_marshalling", context);
        Ok(())
    }

    fn after_marshalling(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("after_marshalling", context);
        Ok(())
    }

    fn before_transmission(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("before_transmission", context);
        Ok(())
    }

    fn after_transmission(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("after_transmission", context);
        Ok(())
    }

    fn before_unmarshalling(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("before_unmarshalling", context);
        Ok(())
    }

    fn after_unmarshalling(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("after_unmarshalling", context);
        Ok(())
    }

    fn after_execution(&self, context: &ExecutionContext) -> Result<(), BoxError> {
        self.push("after_execution", context);
        Ok(())
    }

    fn on_execution_failure(
        &self,
        context: &ExecutionContext,
        _error: &sdkx::Error,
    ) -> Result<(), BoxError> {
        self.push("on_execution_failure", context);
        Ok(())
    }
}
