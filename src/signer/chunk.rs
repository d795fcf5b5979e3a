use std::collections::VecDeque;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;

use super::{EMPTY_SHA256, SigningError, hmac_sha256, sha256_hex};
use crate::checksum::{ChecksumAlgorithm, ChecksumState};
use crate::error::BoxError;
use crate::message::{ByteStream, ReaderBody};

const CHUNK_SIGNATURE_EXTENSION: &str = ";chunk-signature=";
const TRAILER_SIGNATURE_HEADER: &str = "x-amz-trailer-signature:";
const SIGNATURE_HEX_LEN: u64 = 64;

/// Immutable inputs for signing the chunks of one request. The running
/// signature lives in [`ChunkSigningState`] so one signer can serve many
/// bodies.
#[derive(Clone)]
pub struct ChunkSigner {
    signing_key: [u8; 32],
    amz_date: String,
    scope: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSigningState {
    previous_signature: String,
}

impl ChunkSigningState {
    /// Starts the chain from the request's header signature.
    pub fn seed(signature: impl Into<String>) -> Self {
        Self {
            previous_signature: signature.into(),
        }
    }

    pub fn previous_signature(&self) -> &str {
        &self.previous_signature
    }
}

impl ChunkSigner {
    pub fn new(signing_key: [u8; 32], amz_date: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            signing_key,
            amz_date: amz_date.into(),
            scope: scope.into(),
        }
    }

    pub fn sign_chunk(
        &self,
        state: &ChunkSigningState,
        chunk: &[u8],
    ) -> Result<ChunkSigningState, SigningError> {
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256-PAYLOAD\n{}\n{}\n{}\n{EMPTY_SHA256}\n{}",
            self.amz_date,
            self.scope,
            state.previous_signature,
            sha256_hex(chunk)
        );
        self.next(&string_to_sign)
    }

    /// Signs the canonical trailer block (`name:value\n` lines).
    pub fn sign_trailer(
        &self,
        state: &ChunkSigningState,
        trailer: &[u8],
    ) -> Result<ChunkSigningState, SigningError> {
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256-TRAILER\n{}\n{}\n{}\n{}",
            self.amz_date,
            self.scope,
            state.previous_signature,
            sha256_hex(trailer)
        );
        self.next(&string_to_sign)
    }

    fn next(&self, string_to_sign: &str) -> Result<ChunkSigningState, SigningError> {
        let signature = hmac_sha256(&self.signing_key, string_to_sign.as_bytes())?;
        Ok(ChunkSigningState::seed(hex::encode(signature)))
    }
}

impl std::fmt::Debug for ChunkSigner {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ChunkSigner")
            .field("amz_date", &self.amz_date)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Length of the `aws-chunked` encoding of `decoded_length` payload bytes.
pub fn encoded_length(
    decoded_length: u64,
    chunk_size: usize,
    signed: bool,
    trailer: Option<ChecksumAlgorithm>,
) -> u64 {
    let chunk_size = chunk_size.max(1) as u64;
    let extension = if signed {
        CHUNK_SIGNATURE_EXTENSION.len() as u64 + SIGNATURE_HEX_LEN
    } else {
        0
    };
    let frame = |length: u64| hex_digits(length) + extension + 2 + length + 2;

    let full_chunks = decoded_length / chunk_size;
    let remainder = decoded_length % chunk_size;
    let mut total = full_chunks * frame(chunk_size);
    if remainder > 0 {
        total += frame(remainder);
    }
    total += 1 + extension + 2;
    if let Some(algorithm) = trailer {
        total += algorithm.header_name().len() as u64 + 1 + algorithm.base64_len() as u64 + 2;
        if signed {
            total += TRAILER_SIGNATURE_HEADER.len() as u64 + SIGNATURE_HEX_LEN + 2;
        }
    }
    total + 2
}

fn hex_digits(value: u64) -> u64 {
    let mut digits = 1;
    let mut rest = value >> 4;
    while rest > 0 {
        digits += 1;
        rest >>= 4;
    }
    digits
}

/// Rebuffers a payload into fixed-size `aws-chunked` frames, optionally
/// signing each one and appending a checksum trailer.
#[derive(Debug)]
pub struct AwsChunkedEncoder {
    chunk_size: usize,
    signing: Option<(ChunkSigner, ChunkSigningState)>,
    checksum: Option<ChecksumState>,
    buffer: BytesMut,
    finished: bool,
}

impl AwsChunkedEncoder {
    pub fn unsigned(chunk_size: usize, trailer: Option<ChecksumAlgorithm>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            signing: None,
            checksum: trailer.map(ChecksumState::new),
            buffer: BytesMut::new(),
            finished: false,
        }
    }

    pub fn signed(
        signer: ChunkSigner,
        seed: ChunkSigningState,
        chunk_size: usize,
        trailer: Option<ChecksumAlgorithm>,
    ) -> Self {
        Self {
            signing: Some((signer, seed)),
            ..Self::unsigned(chunk_size, trailer)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Buffers `data` and returns every frame that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, SigningError> {
        if let Some(checksum) = &mut self.checksum {
            checksum.update(data);
        }
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            frames.push(self.frame(&chunk)?);
        }
        Ok(frames)
    }

    /// Emits the partial last chunk, the terminating chunk and any trailer.
    pub fn finish(&mut self) -> Result<Bytes, SigningError> {
        self.finished = true;
        let mut out = BytesMut::new();
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            out.extend_from_slice(&self.frame(&chunk)?);
        }
        out.extend_from_slice(self.frame_header(&[])?.as_bytes());

        if let Some(checksum) = self.checksum.take() {
            let algorithm = checksum.algorithm();
            let line = format!("{}:{}", algorithm.header_name(), checksum.finalize().to_base64());
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
            if let Some((signer, state)) = &mut self.signing {
                *state = signer.sign_trailer(state, format!("{line}\n").as_bytes())?;
                out.extend_from_slice(TRAILER_SIGNATURE_HEADER.as_bytes());
                out.extend_from_slice(state.previous_signature.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        Ok(out.freeze())
    }

    fn frame(&mut self, chunk: &[u8]) -> Result<Bytes, SigningError> {
        let header = self.frame_header(chunk)?;
        let mut frame = BytesMut::with_capacity(header.len() + chunk.len() + 2);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(chunk);
        frame.extend_from_slice(b"\r\n");
        Ok(frame.freeze())
    }

    /// `<hex len>[;chunk-signature=<sig>]\r\n`, advancing the signature chain.
    fn frame_header(&mut self, chunk: &[u8]) -> Result<String, SigningError> {
        let mut header = format!("{:x}", chunk.len());
        if let Some((signer, state)) = &mut self.signing {
            *state = signer.sign_chunk(state, chunk)?;
            header.push_str(CHUNK_SIGNATURE_EXTENSION);
            header.push_str(&state.previous_signature);
        }
        header.push_str("\r\n");
        Ok(header)
    }
}

/// Async `aws-chunked` body.
pub struct AwsChunkedStream {
    inner: ByteStream,
    encoder: AwsChunkedEncoder,
    pending: VecDeque<Bytes>,
    done: bool,
}

impl AwsChunkedStream {
    pub fn new(inner: ByteStream, encoder: AwsChunkedEncoder) -> Self {
        Self {
            inner,
            encoder,
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl Stream for AwsChunkedStream {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(data))) => match this.encoder.push(&data) {
                    Ok(frames) => this.pending.extend(frames),
                    Err(error) => {
                        this.done = true;
                        return Poll::Ready(Some(Err(Box::new(error))));
                    }
                },
                Poll::Ready(Some(Err(error))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    match this.encoder.finish() {
                        Ok(tail) => this.pending.push_back(tail),
                        Err(error) => return Poll::Ready(Some(Err(Box::new(error)))),
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for AwsChunkedStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AwsChunkedStream")
            .field("encoder", &self.encoder)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Blocking `aws-chunked` body.
pub struct AwsChunkedReader {
    inner: ReaderBody,
    encoder: AwsChunkedEncoder,
    current: Bytes,
    queued: VecDeque<Bytes>,
    scratch: Vec<u8>,
    done: bool,
}

impl AwsChunkedReader {
    pub fn new(inner: ReaderBody, encoder: AwsChunkedEncoder) -> Self {
        let scratch = vec![0; encoder.chunk_size.min(64 * 1024)];
        Self {
            inner,
            encoder,
            current: Bytes::new(),
            queued: VecDeque::new(),
            scratch,
            done: false,
        }
    }
}

impl Read for AwsChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.current.is_empty() {
                let count = buf.len().min(self.current.len());
                let chunk = self.current.split_to(count);
                buf[..count].copy_from_slice(&chunk);
                return Ok(count);
            }
            if let Some(next) = self.queued.pop_front() {
                self.current = next;
                continue;
            }
            if self.done {
                return Ok(0);
            }
            let read = self.inner.read(&mut self.scratch)?;
            if read == 0 {
                self.done = true;
                self.current = self.encoder.finish().map_err(std::io::Error::other)?;
                continue;
            }
            let frames = self
                .encoder
                .push(&self.scratch[..read])
                .map_err(std::io::Error::other)?;
            self.queued.extend(frames);
        }
    }
}

impl std::fmt::Debug for AwsChunkedReader {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AwsChunkedReader")
            .field("encoder", &self.encoder)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
