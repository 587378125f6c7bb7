//! Single-consumer event delivery for a live session.
//!
//! The channel holds at most one undelivered event, so a slow reader
//! throttles the producer instead of events being dropped. A `complete` or
//! `error` event closes the sink; so does the reader going away.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{HostwatchError, Result};

/// Kind of a streamed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// One line of process output, or an informational notice.
    Output,
    /// Terminal: the session failed or timed out.
    Error,
    /// Terminal: the session finished.
    Complete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Complete)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event: a kind and a free-text payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecEvent {
    pub kind: EventKind,
    pub payload: String,
}

impl ExecEvent {
    pub fn output(payload: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Output,
            payload: payload.into(),
        }
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            payload: payload.into(),
        }
    }

    pub fn complete(payload: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Complete,
            payload: payload.into(),
        }
    }

    /// Server-sent-events framing: `event: <kind>`, one `data:` line per
    /// payload line, blank line terminator.
    pub fn to_sse(&self) -> String {
        let mut out = format!("event: {}\n", self.kind);
        if self.payload.is_empty() {
            out.push_str("data: \n");
        }
        for line in self.payload.lines() {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Create a connected sink/stream pair.
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(1);
    (
        EventSink { tx, closed: false },
        EventStream {
            inner: ReceiverStream::new(rx),
        },
    )
}

/// Producer end. Owned by the session task.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ExecEvent>,
    closed: bool,
}

impl EventSink {
    /// Deliver one event, waiting until the reader has room.
    ///
    /// Fails with [`HostwatchError::StreamClosed`] after a terminal event
    /// or once the reader has been dropped.
    ///
    /// Cancel safe: if the future is dropped while waiting, nothing was
    /// delivered.
    pub async fn send(&mut self, event: ExecEvent) -> Result<()> {
        if self.closed {
            return Err(HostwatchError::StreamClosed);
        }
        let Ok(permit) = self.tx.reserve().await else {
            self.closed = true;
            return Err(HostwatchError::StreamClosed);
        };
        let terminal = event.kind.is_terminal();
        permit.send(event);
        if terminal {
            self.closed = true;
        }
        Ok(())
    }

    pub async fn output(&mut self, line: impl Into<String>) -> Result<()> {
        self.send(ExecEvent::output(line)).await
    }

    /// No further events will be accepted.
    pub fn is_closed(&self) -> bool {
        self.closed || self.tx.is_closed()
    }

    /// Whether the reader went away.
    pub fn is_disconnected(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer end: a [`Stream`] of [`ExecEvent`]s that ends after the
/// terminal event.
#[derive(Debug)]
pub struct EventStream {
    inner: ReceiverStream<ExecEvent>,
}

impl EventStream {
    /// Stop accepting events without dropping the stream.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Stream for EventStream {
    type Item = ExecEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    #[test]
    fn sse_framing() {
        assert_eq!(
            ExecEvent::output("hello").to_sse(),
            "event: output\ndata: hello\n\n"
        );
        assert_eq!(
            ExecEvent::error("line one\nline two").to_sse(),
            "event: error\ndata: line one\ndata: line two\n\n"
        );
        assert_eq!(ExecEvent::complete("").to_sse(), "event: complete\ndata: \n\n");
    }

    #[test]
    fn terminal_kinds() {
        assert!(!EventKind::Output.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(EventKind::Complete.is_terminal());
    }

    #[tokio::test]
    async fn terminal_event_closes_sink() {
        let (mut sink, stream) = event_channel();
        let reader = tokio::spawn(stream.collect::<Vec<_>>());

        sink.output("a").await.unwrap();
        sink.send(ExecEvent::complete("done")).await.unwrap();
        assert!(sink.is_closed());
        let late = sink.output("late").await;
        assert!(matches!(late, Err(HostwatchError::StreamClosed)));
        drop(sink);

        let events = reader.await.unwrap();
        assert_eq!(
            events,
            vec![ExecEvent::output("a"), ExecEvent::complete("done")]
        );
    }

    #[tokio::test]
    async fn send_waits_for_reader() {
        let (mut sink, mut stream) = event_channel();
        sink.output("1").await.unwrap();

        // Capacity is one: the second send parks until the first is read.
        let blocked = tokio::time::timeout(Duration::from_millis(50), sink.output("2")).await;
        assert!(blocked.is_err());

        assert_eq!(stream.next().await, Some(ExecEvent::output("1")));
        sink.output("3").await.unwrap();
        assert_eq!(stream.next().await, Some(ExecEvent::output("3")));
    }

    #[tokio::test]
    async fn abandoned_send_delivers_nothing() {
        let (mut sink, mut stream) = event_channel();
        sink.output("1").await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(20), sink.output("lost")).await;
        assert!(abandoned.is_err());

        assert_eq!(stream.next().await, Some(ExecEvent::output("1")));
        sink.output("2").await.unwrap();
        assert_eq!(stream.next().await, Some(ExecEvent::output("2")));
    }

    #[tokio::test]
    async fn dropped_reader_is_a_disconnect() {
        let (mut sink, stream) = event_channel();
        drop(stream);
        assert!(sink.is_disconnected());
        assert!(matches!(sink.output("x").await, Err(HostwatchError::StreamClosed)));
        assert!(sink.is_closed());
    }
}
