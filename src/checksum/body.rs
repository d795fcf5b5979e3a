use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;

use super::{ChecksumAlgorithm, ChecksumOutcome, ChecksumState};
use crate::error::BoxError;

/// Validates an async response stream against an expected checksum; the
/// comparison happens once, at end of stream, and a mismatch is yielded as the
/// final item.
pub struct ValidatingBody<S> {
    inner: S,
    state: Option<ChecksumState>,
    expected: String,
}

impl<S> ValidatingBody<S> {
    pub fn new(inner: S, algorithm: ChecksumAlgorithm, expected: impl Into<String>) -> Self {
        Self {
            inner,
            state: Some(ChecksumState::new(algorithm)),
            expected: expected.into(),
        }
    }
}

impl<S> Stream for ValidatingBody<S>
where
    S: Stream<Item = Result<Bytes, BoxError>> + Unpin,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(state) = this.state.as_mut() {
                    state.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => match this.state.take() {
                Some(state) => match state.validate(&this.expected).into_result() {
                    Ok(_) => Poll::Ready(None),
                    Err(error) => Poll::Ready(Some(Err(Box::new(error)))),
                },
                None => Poll::Ready(None),
            },
            other => other,
        }
    }
}

/// Blocking counterpart of [`ValidatingBody`]; a mismatch surfaces as an
/// `InvalidData` I/O error wrapping the checksum error.
pub struct ValidatingReader<R> {
    inner: R,
    state: Option<ChecksumState>,
    expected: String,
    outcome: Option<ChecksumOutcome>,
}

impl<R> ValidatingReader<R> {
    pub fn new(inner: R, algorithm: ChecksumAlgorithm, expected: impl Into<String>) -> Self {
        Self {
            inner,
            state: Some(ChecksumState::new(algorithm)),
            expected: expected.into(),
            outcome: None,
        }
    }

    /// Result of the comparison, available after end of stream.
    pub fn outcome(&self) -> Option<&ChecksumOutcome> {
        self.outcome.as_ref()
    }
}

impl<R: Read> Read for ValidatingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            if let Some(state) = self.state.as_mut() {
                state.update(&buf[..read]);
            }
            return Ok(read);
        }

        if let Some(state) = self.state.take() {
            let outcome = state.validate(&self.expected);
            self.outcome = Some(outcome.clone());
            if let Err(error) = outcome.into_result() {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, error));
            }
        }
        Ok(0)
    }
}
