#![cfg(all(feature = "hyper-client", feature = "ureq-client"))]

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use common::{Document, PutDocument, lock_unpoisoned};
use sdkx::identity::Credentials;
use sdkx::retry::RetryPolicy;
use sdkx::transport::{HyperTransport, UreqTransport};
use sdkx::{BlockingClient, Client};

#[derive(Clone)]
struct ResponseSpec {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseSpec {
    fn new(status: u16, headers: Vec<(&str, &str)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            body: body.into(),
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(raw_headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(raw_headers);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
            && let Ok(parsed) = value.trim().parse::<usize>()
        {
            return parsed;
        }
    }
    0
}

fn read_http_message(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_header_end(&raw) {
            let content_length = parse_content_length(&raw[..header_end]);
            if raw.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    Ok(raw)
}

fn write_http_response(stream: &mut TcpStream, response: &ResponseSpec) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        response.body.len()
    )
    .into_bytes();

    for (name, value) in &response.headers {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&response.body);

    stream.write_all(&raw)?;
    stream.flush()
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Serves `responses` in order, one connection each, and keeps the raw requests.
struct ScriptedServer {
    endpoint: String,
    requests: Arc<Mutex<Vec<String>>>,
    join: Option<JoinHandle<()>>,
}

impl ScriptedServer {
    fn start(responses: Vec<ResponseSpec>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scripted server");
        let endpoint = format!(
            "http://{}",
            listener.local_addr().expect("read local address")
        );
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = Arc::clone(&requests);
        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut pending = responses.into_iter();
            let mut next = pending.next();
            while let Some(response) = next.take() {
                if Instant::now() >= deadline {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        if let Ok(raw) = read_http_message(&mut stream) {
                            lock_unpoisoned(&requests_clone)
                                .push(String::from_utf8_lossy(&raw).into_owned());
                        }
                        let _ = write_http_response(&mut stream, &response);
                        next = pending.next();
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                        next = Some(response);
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            endpoint,
            requests,
            join: Some(join),
        }
    }

    fn requests(&self) -> Vec<String> {
        lock_unpoisoned(&self.requests).clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn header_line<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    raw.split("\r\n").find_map(|line| {
        let (header, value) = line.split_once(':')?;
        header.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn retry_policy() -> RetryPolicy {
    RetryPolicy::standard().base_delay(Duration::ZERO)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hyper_transport_sends_signed_requests_and_retries() {
    let server = ScriptedServer::start(vec![
        ResponseSpec::new(
            503,
            vec![("content-type", "application/json")],
            r#"{"__type":"ServiceUnavailable"}"#,
        ),
        ResponseSpec::new(200, vec![("x-amzn-requestid", "req-1")], "stored"),
    ]);
    let client = Client::builder("docs")
        .region("us-east-1")
        .endpoint(server.endpoint.clone())
        .credentials(Credentials::new("AKIDEXAMPLE", "secret"))
        .retry_policy(retry_policy())
        .transport(HyperTransport::new())
        .build()
        .expect("client");

    let output = client
        .call(&PutDocument::default(), Document::new("doc.txt", "hello"))
        .await
        .expect("retried to success");

    assert_eq!(output, "stored");
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    for raw in &requests {
        assert!(raw.starts_with("PUT /doc.txt HTTP/1.1\r\n"), "{raw}");
        assert!(raw.ends_with("hello"), "{raw}");
        let authorization = header_line(raw, "authorization").expect("authorization header");
        assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(header_line(raw, "x-amz-date").is_some());
        assert_eq!(header_line(raw, "content-length"), Some("5"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_response_bodies_fail_without_retrying() {
    let oversized = ResponseSpec::new(200, vec![], "0123456789");
    let server = ScriptedServer::start(vec![oversized.clone(), oversized.clone(), oversized]);
    let client = Client::builder("docs")
        .region("us-east-1")
        .endpoint(server.endpoint.clone())
        .credentials(Credentials::new("AKIDEXAMPLE", "secret"))
        .retry_policy(retry_policy())
        .transport(HyperTransport::new().max_response_body_bytes(4))
        .build()
        .expect("client");

    let error = client
        .call(&PutDocument::default(), Document::new("doc.txt", "hello"))
        .await
        .expect_err("body too large");

    assert_eq!(error.code(), sdkx::ErrorCode::ResponseBodyTooLarge);
    assert_eq!(error.kind(), sdkx::ErrorKind::ResponseTooLarge);
    assert!(matches!(
        error,
        sdkx::Error::ResponseBodyTooLarge {
            limit_bytes: 4,
            actual_bytes: 10,
            ..
        }
    ));
    assert_eq!(client.retry_token_bucket().available(), 500);
    assert_eq!(server.requests().len(), 1);
}

#[test]
fn ureq_oversized_response_bodies_fail_without_retrying() {
    let oversized = ResponseSpec::new(200, vec![], "0123456789");
    let server = ScriptedServer::start(vec![oversized.clone(), oversized]);
    let client = BlockingClient::builder("docs")
        .region("us-east-1")
        .endpoint(server.endpoint.clone())
        .credentials(Credentials::new("AKIDEXAMPLE", "secret"))
        .retry_policy(retry_policy())
        .transport(UreqTransport::new().max_response_body_bytes(4))
        .build()
        .expect("client");

    let error = client
        .call(&PutDocument::default(), Document::new("doc.txt", "hello"))
        .expect_err("body too large");

    assert_eq!(error.code(), sdkx::ErrorCode::ResponseBodyTooLarge);
    assert!(error.history().is_none());
    assert_eq!(client.retry_token_bucket().available(), 500);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hyper_streams_success_bodies_past_the_buffer_limit() {
    use futures_util::StreamExt;

    let server = ScriptedServer::start(vec![ResponseSpec::new(
        200,
        vec![("x-amz-checksum-crc32", "AAAAAA==")],
        "Hello world",
    )]);
    let client = Client::builder("docs")
        .region("us-east-1")
        .endpoint(server.endpoint.clone())
        .credentials(Credentials::new("AKIDEXAMPLE", "secret"))
        .retry_policy(retry_policy())
        .transport(HyperTransport::new().max_response_body_bytes(4))
        .build()
        .expect("client");
    let operation = PutDocument::with_checksum(
        sdkx::checksum::ChecksumSpec::new().response_validation_enabled(true),
    );

    let streaming = client
        .call_streaming(&operation, Document::new("doc.txt", "hello"))
        .await
        .expect("streamed bodies are not capped");
    let (_, mut body) = streaming.into_parts();
    assert_eq!(body.content_length(), Some(11));

    let mut data = Vec::new();
    let mut failure = None;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => data.extend_from_slice(&chunk),
            Err(error) => {
                failure = Some(error);
                break;
            }
        }
    }
    assert_eq!(data, b"Hello world");
    let failure = failure
        .expect("mismatch at end of stream")
        .downcast::<sdkx::Error>()
        .expect("sdk error");
    assert_eq!(failure.code(), sdkx::ErrorCode::ChecksumMismatch);
    assert_eq!(server.requests().len(), 1);
}

#[test]
fn ureq_streams_success_bodies() {
    let server = ScriptedServer::start(vec![ResponseSpec::new(200, vec![], "0123456789")]);
    let client = BlockingClient::builder("docs")
        .region("us-east-1")
        .endpoint(server.endpoint.clone())
        .credentials(Credentials::new("AKIDEXAMPLE", "secret"))
        .retry_policy(retry_policy())
        .transport(UreqTransport::new().max_response_body_bytes(4))
        .build()
        .expect("client");

    let streaming = client
        .call_streaming(&PutDocument::default(), Document::new("doc.txt", "hello"))
        .expect("streamed bodies are not capped");
    let (_, mut body) = streaming.into_parts();
    let mut data = String::new();
    body.read_to_string(&mut data).expect("body reads");
    assert_eq!(data, "0123456789");
}

#[test]
fn ureq_transport_surfaces_modeled_errors() {
    let server = ScriptedServer::start(vec![ResponseSpec::new(
        400,
        vec![("x-amzn-errortype", "ValidationException:http://internal.example.com/")],
        r#"{"message":"key too long"}"#,
    )]);
    let client = BlockingClient::builder("docs")
        .region("us-east-1")
        .endpoint(server.endpoint.clone())
        .credentials(Credentials::new("AKIDEXAMPLE", "secret"))
        .retry_policy(retry_policy())
        .transport(UreqTransport::new())
        .build()
        .expect("client");

    let error = client
        .call(&PutDocument::default(), Document::new("doc.txt", "hello"))
        .expect_err("validation error");

    let service = error.service_error().expect("service error");
    assert_eq!(service.code, "ValidationException");
    assert_eq!(service.message.as_deref(), Some("key too long"));
    assert_eq!(server.requests().len(), 1);
}
