//! Launch commands: `run`, `script`, `docker`, `stop` (by id or pid). Session events are
//! rendered to the terminal as they arrive.

use std::io::Write;

use anyhow::{Result, bail};
use futures::StreamExt;

use hostwatch_core::HostwatchService;
use hostwatch_core::exec::{EventKind, ExecEvent, ExecutionSession, LaunchRequest, SessionState};
use hostwatch_core::signal::StopOutcome;

/// How events are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Render {
    /// Output lines on stdout, errors on stderr.
    Plain,
    /// Server-sent-events frames on stdout.
    Sse,
}

/// Text to print for one event, or `None` when it adds nothing.
///
/// In plain mode a `complete` payload repeats lines already printed, so
/// it is skipped.
pub fn render_event(event: &ExecEvent, render: Render) -> Option<String> {
    match render {
        Render::Sse => Some(event.to_sse()),
        Render::Plain => match event.kind {
            EventKind::Output => Some(format!("{}\n", event.payload)),
            EventKind::Error => Some(format!("error: {}\n", event.payload)),
            EventKind::Complete => None,
        },
    }
}

pub async fn run_launch(
    service: &HostwatchService,
    id: i64,
    request: LaunchRequest,
    render: Render,
) -> Result<()> {
    let session = service.launch(id, request).await?;
    if let Some(pid) = session.spawned_pid() {
        tracing::info!(entry_id = id, pid, "launched");
    }
    follow(session, render).await
}

/// Print events until the session ends. Ctrl-C cancels the session and
/// keeps printing until the terminal event.
async fn follow(mut session: ExecutionSession, render: Render) -> Result<()> {
    let cancel = session.cancel_handle();
    let Some(mut events) = session.events() else {
        bail!("session events already taken");
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if let Some(text) = render_event(&event, render) {
                    let mut stdout = std::io::stdout().lock();
                    if event.kind == EventKind::Error && render == Render::Plain {
                        eprint!("{text}");
                    } else {
                        stdout.write_all(text.as_bytes())?;
                        stdout.flush()?;
                    }
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("interrupted, stopping session...");
                cancel.cancel();
            }
        }
    }

    let outcome = session.finish().await;
    match outcome.state {
        SessionState::Completed => {
            if render == Render::Plain {
                match outcome.pid {
                    Some(pid) => println!("[{}] {} (pid {pid})", outcome.state, outcome.message),
                    None => println!("[{}] {}", outcome.state, outcome.message),
                }
            }
            Ok(())
        }
        state => bail!("session {state}: {}", outcome.message),
    }
}

pub async fn run_stop(service: &HostwatchService, id: i64) -> Result<()> {
    let outcome = service.stop(id).await?;
    println!("{}", stopped_line(id, outcome));
    Ok(())
}

pub async fn run_stop_pid(service: &HostwatchService, pid: u32) -> Result<()> {
    let (entry, outcome) = service.stop_by_pid(pid).await?;
    println!("{} (pid {pid}, {})", stopped_line(entry.id, outcome), entry.name);
    Ok(())
}

fn stopped_line(id: i64, outcome: StopOutcome) -> String {
    if outcome.forced {
        format!("Entry {id} stopped (killed after grace period).")
    } else {
        format!("Entry {id} stopped.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_messages() {
        assert_eq!(stopped_line(3, StopOutcome { forced: false }), "Entry 3 stopped.");
        assert_eq!(
            stopped_line(3, StopOutcome { forced: true }),
            "Entry 3 stopped (killed after grace period)."
        );
    }

    #[test]
    fn plain_rendering() {
        assert_eq!(
            render_event(&ExecEvent::output("hello"), Render::Plain).as_deref(),
            Some("hello\n")
        );
        assert_eq!(
            render_event(&ExecEvent::error("boom"), Render::Plain).as_deref(),
            Some("error: boom\n")
        );
        assert_eq!(render_event(&ExecEvent::complete("hello\n"), Render::Plain), None);
    }

    #[test]
    fn sse_rendering_passes_frames_through() {
        let event = ExecEvent::complete("done");
        assert_eq!(render_event(&event, Render::Sse), Some(event.to_sse()));
    }
}
