//! Timeout enforcement around provider calls: a plain race for unary
//! requests, and an inter-chunk idle timer for streams. The stream timer
//! resets on every chunk and destroys the stream when it fires first.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::GaleError;

/// Race a provider future against the request timeout.
pub(crate) async fn with_timeout<T, F>(future: F, ms: u64) -> Result<T, GaleError>
where
    F: Future<Output = Result<T, GaleError>>,
{
    match tokio::time::timeout(Duration::from_millis(ms), future).await {
        Ok(result) => result,
        Err(_) => Err(GaleError::RequestTimeout(ms)),
    }
}

/// Stream wrapper enforcing a per-chunk deadline. Every delivered chunk
/// rearms the timer; if it fires while the upstream is quiet, the stream
/// yields `PROVIDER_REQUEST_STREAM_TIMEOUT_ERROR` and terminates. Upstream
/// errors and normal end both cancel the timer.
pub(crate) struct TimeoutStream<S> {
    inner: Pin<Box<S>>,
    deadline: Pin<Box<tokio::time::Sleep>>,
    window: Duration,
    ms: u64,
    done: bool,
}

impl<S> TimeoutStream<S>
where
    S: Stream<Item = Result<Bytes, GaleError>> + Send,
{
    pub fn new(inner: S, ms: u64) -> Self {
        let window = Duration::from_millis(ms);
        Self {
            inner: Box::pin(inner),
            deadline: Box::pin(tokio::time::sleep(window)),
            window,
            ms,
            done: false,
        }
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<Bytes, GaleError>> + Send,
{
    type Item = Result<Bytes, GaleError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let next = tokio::time::Instant::now() + self.window;
                self.deadline.as_mut().reset(next);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                if self.deadline.as_mut().poll(cx).is_ready() {
                    self.done = true;
                    return Poll::Ready(Some(Err(GaleError::StreamTimeout(self.ms))));
                }
                Poll::Pending
            }
        }
    }
}
