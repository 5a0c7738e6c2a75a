//! Caller-facing response stream: a channel of SSE frames. Producers
//! (resume replay, the live pipe, fallback retries) enqueue frames through a
//! `StreamSender`; dropping every sender closes the stream, and an explicit
//! failure frame destroys it with an error. Dropping the receiving side is
//! the caller's cancellation signal: the next send fails and the pipeline
//! tears its work down.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::codec;
use crate::error::GaleError;
use crate::event::Event;

#[derive(Debug)]
enum Frame {
    Data(Bytes),
    Fail(GaleError),
}

/// SSE byte stream returned to the caller, tagged with its session id.
#[derive(Debug)]
pub struct ResponseStream {
    session_id: String,
    rx: mpsc::UnboundedReceiver<Frame>,
    done: bool,
}

impl ResponseStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes, GaleError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Data(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Frame::Fail(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Clone)]
pub(crate) struct StreamSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl StreamSender {
    /// Encode and enqueue one event. Returns false once the consumer is gone.
    pub fn send_event(&self, event: &Event) -> bool {
        self.tx.send(Frame::Data(codec::encode(event))).is_ok()
    }

    /// Destroy the stream with an error after any already-queued frames.
    pub fn fail(&self, err: GaleError) {
        let _ = self.tx.send(Frame::Fail(err));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer drops the stream.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

pub(crate) fn channel(session_id: impl Into<String>) -> (StreamSender, ResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamSender { tx }, ResponseStream { session_id: session_id.into(), rx, done: false })
}
