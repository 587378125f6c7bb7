//! Driving one spawned child: output pumping, exit, deadline and cancel.

use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionState;
use super::stream::{EventSink, ExecEvent};
use crate::signal;

/// Output buffer plus best-effort forwarding to the reader.
///
/// Events wait in a local queue until the reader has room, so callers can
/// race [`flush_one`](Self::flush_one) against other work. Once the reader
/// disconnects, lines are still captured but no longer queued.
pub(crate) struct Forwarder {
    sink: EventSink,
    output: String,
    pending: VecDeque<ExecEvent>,
    streaming: bool,
    entry_id: i64,
}

impl Forwarder {
    pub(crate) fn new(sink: EventSink, entry_id: i64) -> Self {
        Self {
            sink,
            output: String::new(),
            pending: VecDeque::new(),
            streaming: true,
            entry_id,
        }
    }

    /// Capture a line of process output and queue it for the reader.
    pub(crate) fn capture(&mut self, line: String) {
        self.output.push_str(&line);
        self.output.push('\n');
        self.queue(ExecEvent::output(line));
    }

    /// An informational `output` event that is not process output.
    pub(crate) async fn notice(&mut self, message: impl Into<String>) {
        self.queue_notice(message);
        self.flush().await;
    }

    /// [`notice`](Self::notice) without waiting for delivery.
    pub(crate) fn queue_notice(&mut self, message: impl Into<String>) {
        self.queue(ExecEvent::output(message));
    }

    /// Send the terminal event after anything still queued. Nothing is
    /// sent afterwards.
    pub(crate) async fn terminal(&mut self, event: ExecEvent) {
        self.queue(event);
        self.flush().await;
        self.streaming = false;
    }

    pub(crate) fn entry_id(&self) -> i64 {
        self.entry_id
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming && !self.sink.is_disconnected()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Deliver the oldest queued event.
    ///
    /// Cancel safe: a dropped call leaves the event at the head of the
    /// queue.
    pub(crate) async fn flush_one(&mut self) {
        let Some(event) = self.pending.front().cloned() else {
            return;
        };
        match self.sink.send(event).await {
            Ok(()) => {
                self.pending.pop_front();
            }
            Err(_) => {
                debug!(entry_id = self.entry_id, "event reader gone, continuing without streaming");
                self.streaming = false;
                self.pending.clear();
            }
        }
    }

    pub(crate) async fn flush(&mut self) {
        while self.has_pending() {
            self.flush_one().await;
        }
    }

    fn queue(&mut self, event: ExecEvent) {
        if self.streaming {
            self.pending.push_back(event);
        }
    }
}

/// Session state with validated transitions.
pub(crate) struct Tracker {
    state: SessionState,
    entry_id: i64,
}

impl Tracker {
    pub(crate) fn new(entry_id: i64) -> Self {
        Self {
            state: SessionState::Starting,
            entry_id,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: SessionState) {
        if self.state.can_transition_to(next) {
            debug!(entry_id = self.entry_id, from = %self.state, to = %next, "session state");
            self.state = next;
        } else {
            warn!(entry_id = self.entry_id, from = %self.state, to = %next, "ignoring invalid session transition");
        }
    }
}

/// How a driven child ended.
#[derive(Debug)]
pub(crate) enum ChildEnd {
    Exited(ExitStatus),
    WaitFailed(io::Error),
    /// The deadline fired.
    DeadlineExceeded(Duration),
    /// The session was cancelled from outside.
    Cancelled,
}

/// Spawn a task that reads `reader` line by line into `tx`.
///
/// Invalid UTF-8 is replaced rather than ending the stream.
pub(crate) fn pump<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "error reading child output");
                    break;
                }
            }
        }
    });
}

/// Wire the child's stdout and stderr into one ordered line channel.
pub(crate) fn merged_output(child: &mut Child) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    if let Some(stdout) = child.stdout.take() {
        pump(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump(stderr, tx);
    }
    rx
}

/// Parameters for [`drive`].
pub(crate) struct DriveOptions<'a> {
    pub deadline: Option<Duration>,
    pub cancel: &'a CancellationToken,
    pub kill_grace: Duration,
    pub drain_grace: Duration,
    /// Process group to signal on cancellation; the child's own pid
    /// otherwise.
    pub pgid: Option<u32>,
}

/// Forward output until the child exits or the session is cancelled.
///
/// On cancellation (including deadline expiry) the process group gets
/// SIGTERM, then SIGKILL after `kill_grace`. Output still buffered after
/// exit is drained for at most `drain_grace`.
pub(crate) async fn drive(
    mut child: Child,
    mut lines: mpsc::Receiver<String>,
    fwd: &mut Forwarder,
    opts: DriveOptions<'_>,
) -> ChildEnd {
    let pid = child.id();
    let wait = child.wait();
    tokio::pin!(wait);

    let deadline = async {
        match opts.deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    // Sends to the reader get their own branch so a stalled reader never
    // holds off the deadline or a cancel.
    let mut lines_open = true;
    let end = loop {
        tokio::select! {
            line = lines.recv(), if lines_open => match line {
                Some(line) => fwd.capture(line),
                None => lines_open = false,
            },
            _ = fwd.flush_one(), if fwd.has_pending() => {}
            status = &mut wait => {
                break match status {
                    Ok(status) => ChildEnd::Exited(status),
                    Err(e) => ChildEnd::WaitFailed(e),
                };
            }
            _ = &mut deadline => {
                opts.cancel.cancel();
                break ChildEnd::DeadlineExceeded(opts.deadline.unwrap_or_default());
            }
            _ = opts.cancel.cancelled() => break ChildEnd::Cancelled,
        }
    };

    if matches!(end, ChildEnd::DeadlineExceeded(_) | ChildEnd::Cancelled) {
        if let Some(pid) = pid {
            let target = opts.pgid.unwrap_or(pid);
            kill_tree(target, opts.pgid.is_some(), libc::SIGTERM);
            if tokio::time::timeout(opts.kill_grace, &mut wait).await.is_err() {
                debug!(pid, "child survived SIGTERM grace, sending SIGKILL");
                kill_tree(target, opts.pgid.is_some(), libc::SIGKILL);
                if tokio::time::timeout(opts.kill_grace, &mut wait).await.is_err() {
                    warn!(pid, "child not reaped after SIGKILL");
                }
            }
        }
    }

    let drained = tokio::time::timeout(opts.drain_grace, async {
        while let Some(line) = lines.recv().await {
            fwd.capture(line);
        }
        fwd.flush().await;
    })
    .await;
    if drained.is_err() {
        warn!(pid = ?pid, "output drain did not finish within grace");
    }

    end
}

fn kill_tree(target: u32, group: bool, sig: libc::c_int) {
    let result = if group {
        signal::signal_group(target, sig)
    } else {
        signal::send_signal(target, sig)
    };
    if let Err(e) = result {
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid = target, group, signal = sig, error = %e, "failed to signal child");
        }
    }
}
