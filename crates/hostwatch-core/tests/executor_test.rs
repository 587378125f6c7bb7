//! Live executor against real child processes.
//!
//! Registry writes go to `MemoryRegistryStore`; processes are plain shell
//! commands so no JVM or container daemon is needed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;

use hostwatch_db::models::{EntryStatus, LaunchWay, NewEntry, RegistryEntry};

use hostwatch_core::container::DockerCli;
use hostwatch_core::error::HostwatchError;
use hostwatch_core::exec::{EventKind, ExecEvent, ExecutorConfig, LaunchRequest, LiveExecutor, SessionState};
use hostwatch_core::inspect::{ProcessInspector, ProcfsInspector};
use hostwatch_core::registry::{EntryLocks, MemoryRegistryStore, RegistryStore};
use hostwatch_core::signal;

// ===========================================================================
// Helpers
// ===========================================================================

struct Fixture {
    store: Arc<MemoryRegistryStore>,
    executor: LiveExecutor,
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        kill_grace: Duration::from_millis(500),
        stop_grace: Duration::from_millis(500),
        drain_grace: Duration::from_secs(1),
        observe_window: Duration::from_secs(1),
        script_settle: Duration::from_millis(10),
        ..ExecutorConfig::default()
    }
}

fn fixture_with(docker_binary: &str) -> Fixture {
    let store = Arc::new(MemoryRegistryStore::new());
    let containers = Arc::new(DockerCli::with_binary(docker_binary));
    let inspector: Arc<dyn ProcessInspector> = Arc::new(ProcfsInspector::new(containers.clone()));
    let executor = LiveExecutor::new(store.clone(), EntryLocks::new(), inspector, containers, fast_config());
    Fixture { store, executor }
}

fn fixture() -> Fixture {
    fixture_with("docker")
}

async fn add_entry(fx: &Fixture, name: &str, run: &str, catalog: &str, way: LaunchWay) -> RegistryEntry {
    fx.store
        .insert(NewEntry {
            name: name.to_owned(),
            ports: "18080".into(),
            pid: 0,
            catalog: catalog.to_owned(),
            run: run.to_owned(),
            worker: "host-1".into(),
            status: EntryStatus::Stopped,
            way,
        })
        .await
        .unwrap()
}

fn row(fx: &Fixture, id: i64) -> RegistryEntry {
    fx.store.snapshot().into_iter().find(|r| r.id == id).unwrap()
}

// ===========================================================================
// Foreground
// ===========================================================================

#[tokio::test]
async fn echo_streams_one_line_then_completes() {
    let fx = fixture();
    let entry = add_entry(&fx, "hello", "echo hello", "", LaunchWay::Native).await;

    let mut session = fx.executor.launch(&entry, LaunchRequest::foreground()).await.unwrap();
    let events: Vec<ExecEvent> = session.events().unwrap().collect().await;
    let outcome = session.finish().await;

    assert_eq!(events.len(), 2, "events: {events:?}");
    assert_eq!(events[0], ExecEvent::output("hello"));
    assert_eq!(events[1].kind, EventKind::Complete);
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.output, "hello\n");

    let after = row(&fx, entry.id);
    assert_eq!(after.status, EntryStatus::Stopped);
    assert_eq!(Some(after.pid as u32), outcome.pid);
}

#[tokio::test]
async fn stderr_and_env_are_captured() {
    let fx = fixture();
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().to_string_lossy().into_owned();
    let entry = add_entry(&fx, "envy", "echo $PROJECT_NAME; pwd; echo oops >&2; exit 3", &catalog, LaunchWay::Native).await;

    let session = fx.executor.launch(&entry, LaunchRequest::foreground()).await.unwrap();
    let outcome = session.finish().await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(outcome.output.contains("envy\n"));
    assert!(outcome.output.contains("oops\n"));
    assert!(outcome.output.contains(dir.path().file_name().unwrap().to_str().unwrap()));
    assert!(outcome.message.contains("exit status: 3"), "{}", outcome.message);
}

#[tokio::test]
async fn deadline_times_out_and_kills() {
    let fx = fixture();
    let entry = add_entry(&fx, "sleepy", "sleep 30", "", LaunchWay::Native).await;

    let started = Instant::now();
    let mut session = fx
        .executor
        .launch(&entry, LaunchRequest::foreground().with_deadline(Duration::from_millis(200)))
        .await
        .unwrap();
    let pid = session.spawned_pid().unwrap();
    let events: Vec<ExecEvent> = session.events().unwrap().collect().await;
    let outcome = session.finish().await;

    assert_eq!(outcome.state, SessionState::TimedOut);
    assert_eq!(events.last().unwrap().kind, EventKind::Error);
    assert!(outcome.message.contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!signal::pid_alive(pid));
}

#[tokio::test]
async fn deadline_fires_while_reader_is_stalled() {
    let fx = fixture();
    let entry = add_entry(&fx, "chatty", "echo 1; echo 2; echo 3; sleep 30", "", LaunchWay::Native).await;

    let mut session = fx
        .executor
        .launch(&entry, LaunchRequest::foreground().with_deadline(Duration::from_millis(300)))
        .await
        .unwrap();
    let pid = session.spawned_pid().unwrap();
    // Held but never read: the one-slot channel fills on the first line.
    let events = session.events().unwrap();

    let started = Instant::now();
    while signal::pid_alive(pid) && started.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!signal::pid_alive(pid), "pid {pid} outlived its deadline");

    drop(events);
    let outcome = session.finish().await;
    assert_eq!(outcome.state, SessionState::TimedOut);
    assert_eq!(outcome.output, "1\n2\n3\n");
}

#[tokio::test]
async fn cancel_is_honoured_while_reader_is_stalled() {
    let fx = fixture();
    let entry = add_entry(&fx, "chatty", "while true; do echo tick; sleep 0.05; done", "", LaunchWay::Native).await;

    let mut session = fx.executor.launch(&entry, LaunchRequest::foreground()).await.unwrap();
    let pid = session.spawned_pid().unwrap();
    let mut events = session.events().unwrap();
    assert_eq!(events.next().await, Some(ExecEvent::output("tick")));
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.cancel_handle().cancel();
    let started = Instant::now();
    while signal::pid_alive(pid) && started.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!signal::pid_alive(pid));

    let rest: Vec<ExecEvent> = events.collect().await;
    let outcome = session.finish().await;
    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(rest.last().unwrap().kind, EventKind::Error);
}

#[tokio::test]
async fn cancel_stops_the_session() {
    let fx = fixture();
    let entry = add_entry(&fx, "long", "sleep 30", "", LaunchWay::Native).await;

    let session = fx.executor.launch(&entry, LaunchRequest::foreground()).await.unwrap();
    let pid = session.spawned_pid().unwrap();
    let handle = session.cancel_handle();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    let outcome = session.finish().await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(outcome.message.contains("cancelled"));
    assert!(!signal::pid_alive(pid));
}

#[tokio::test]
async fn dropped_reader_still_reaps() {
    let fx = fixture();
    let entry = add_entry(&fx, "chatty", "for i in 1 2 3 4 5; do echo $i; done", "", LaunchWay::Native).await;

    let mut session = fx.executor.launch(&entry, LaunchRequest::foreground()).await.unwrap();
    drop(session.events());
    let outcome = session.finish().await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.output, "1\n2\n3\n4\n5\n");
}

#[tokio::test]
async fn script_without_matching_process_still_marks_running() {
    let fx = fixture();
    let mut entry = add_entry(&fx, "deployer", "true", "", LaunchWay::Native).await;
    entry.script = "echo deployed".into();

    let mut session = fx.executor.launch(&entry, LaunchRequest::script()).await.unwrap();
    let events: Vec<ExecEvent> = session.events().unwrap().collect().await;
    let outcome = session.finish().await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.pid, None);
    assert!(events.iter().any(|e| e.payload.starts_with("warning: no running process")));
    assert_eq!(row(&fx, entry.id).status, EntryStatus::Running);
}

// ===========================================================================
// Containers
// ===========================================================================

#[tokio::test]
async fn container_start_runs_runtime_command() {
    // `echo` stands in for the docker binary and prints its arguments.
    let fx = fixture_with("echo");
    let entry = add_entry(&fx, "orders", "", "", LaunchWay::Docker).await;

    let outcome = fx
        .executor
        .launch(&entry, LaunchRequest::container(false))
        .await
        .unwrap()
        .finish()
        .await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.output, "start orders\n");
    assert_eq!(row(&fx, entry.id).status, EntryStatus::Running);
}

#[tokio::test]
async fn failed_container_start_leaves_row_alone() {
    let fx = fixture_with("false");
    let entry = add_entry(&fx, "orders", "", "", LaunchWay::Docker).await;

    let outcome = fx
        .executor
        .launch(&entry, LaunchRequest::container(true))
        .await
        .unwrap()
        .finish()
        .await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(row(&fx, entry.id).status, EntryStatus::Stopped);
}

#[tokio::test]
async fn container_stop_marks_stopped() {
    let fx = fixture_with("true");
    let entry = add_entry(&fx, "orders", "", "", LaunchWay::Docker).await;
    fx.store.set_status(entry.id, EntryStatus::Running).await.unwrap();

    let outcome = fx.executor.stop(&row(&fx, entry.id)).await.unwrap();

    assert!(!outcome.forced);
    assert_eq!(row(&fx, entry.id).status, EntryStatus::Stopped);
}

// ===========================================================================
// Stop
// ===========================================================================

#[tokio::test]
async fn stop_terminates_native_pid() {
    let fx = fixture();
    let entry = add_entry(&fx, "victim", "", "", LaunchWay::Native).await;
    let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id().unwrap();
    fx.store
        .set_pid_status(entry.id, pid as i32, EntryStatus::Running)
        .await
        .unwrap();

    let reaper = tokio::spawn(async move { child.wait().await });
    let outcome = fx.executor.stop(&row(&fx, entry.id)).await.unwrap();
    reaper.await.unwrap().unwrap();

    assert!(!outcome.forced);
    assert_eq!(row(&fx, entry.id).status, EntryStatus::Stopped);
}

#[tokio::test]
async fn launch_errors_are_immediate() {
    let fx = fixture();
    let native = add_entry(&fx, "native", "true", "", LaunchWay::Native).await;
    let missing_dir = add_entry(&fx, "lost", "true", "/nonexistent/catalog", LaunchWay::Native).await;

    let conflict = fx.executor.launch(&native, LaunchRequest::container(false)).await.unwrap_err();
    assert!(matches!(conflict, HostwatchError::Conflict { .. }));

    let spawn = fx.executor.launch(&missing_dir, LaunchRequest::foreground()).await.unwrap_err();
    assert!(matches!(spawn, HostwatchError::Execution { source: Some(_), .. }));
}

// ===========================================================================
// Background
// ===========================================================================

#[tokio::test]
async fn background_run_tracks_the_real_pid() {
    let fx = fixture();
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().to_string_lossy().into_owned();
    let entry = add_entry(&fx, "daemon", "sh -c 'echo booting; exec sleep 30'", &catalog, LaunchWay::Native).await;

    let mut session = fx.executor.launch(&entry, LaunchRequest::background()).await.unwrap();
    let wrapper = session.spawned_pid().unwrap();
    let events: Vec<ExecEvent> = session.events().unwrap().collect().await;
    let outcome = session.finish().await;

    let pid = outcome.pid.unwrap();
    let alive = signal::pid_alive(pid);
    signal::terminate_pid(pid, Duration::from_millis(500)).await.unwrap();

    assert_eq!(outcome.state, SessionState::Completed, "{}", outcome.message);
    assert!(alive);
    assert_ne!(pid, wrapper);
    assert!(events.contains(&ExecEvent::output("booting")));
    let stored = row(&fx, entry.id);
    assert_eq!(stored.pid as u32, pid);
    assert_eq!(stored.status, EntryStatus::Running);
    assert!(dir.path().join(".hostwatch/launch.pid").exists());
}

#[tokio::test]
async fn background_process_that_exits_fails() {
    let fx = fixture();
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().to_string_lossy().into_owned();
    let entry = add_entry(&fx, "flaky", "echo bye", &catalog, LaunchWay::Native).await;

    let outcome = fx
        .executor
        .launch(&entry, LaunchRequest::background())
        .await
        .unwrap()
        .finish()
        .await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(outcome.message.contains("exited during startup"), "{}", outcome.message);
    assert_eq!(row(&fx, entry.id).status, EntryStatus::Stopped);
}

#[tokio::test]
async fn unresolved_background_pid_tracks_the_launcher_group() {
    let fx = fixture();
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().to_string_lossy().into_owned();
    // Mentions java but is not a JVM, so neither the pid file nor the
    // command search yields a usable pid.
    std::fs::write(dir.path().join("java-stub.sh"), "sleep 30\n").unwrap();
    let entry = add_entry(&fx, "stub", "sh java-stub.sh", &catalog, LaunchWay::Native).await;

    let mut session = fx.executor.launch(&entry, LaunchRequest::background()).await.unwrap();
    let wrapper = session.spawned_pid().unwrap();
    let events: Vec<ExecEvent> = session.events().unwrap().collect().await;
    let outcome = session.finish().await;

    let group_alive = signal::group_alive(wrapper);
    signal::terminate_group(wrapper, Duration::from_millis(500)).await.unwrap();

    assert_eq!(outcome.state, SessionState::Completed, "{}", outcome.message);
    assert_eq!(outcome.pid, Some(wrapper));
    assert!(group_alive);
    assert!(
        events
            .iter()
            .any(|e| e.kind == EventKind::Output && e.payload.contains("tracking launcher pid")),
        "events: {events:?}"
    );
    let stored = row(&fx, entry.id);
    assert_eq!(stored.pid as u32, wrapper);
    assert_eq!(stored.status, EntryStatus::Running);
}

#[tokio::test]
async fn cancelled_background_run_is_terminated() {
    let fx = fixture();
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().to_string_lossy().into_owned();
    let entry = add_entry(&fx, "daemon", "sleep 30", &catalog, LaunchWay::Native).await;

    let request = LaunchRequest::background().with_deadline(Duration::from_secs(30));
    let mut session = fx.executor.launch(&entry, request).await.unwrap();
    let events = session.events().unwrap();
    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        cancel.cancel();
    });

    let events: Vec<ExecEvent> = events.collect().await;
    let outcome = session.finish().await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(outcome.message, "cancelled");
    assert_eq!(events.last().unwrap().kind, EventKind::Error);
    let pid = outcome.pid.unwrap();
    assert!(!signal::pid_alive(pid));
    let stored = row(&fx, entry.id);
    assert_eq!(stored.pid as u32, pid);
    assert_eq!(stored.status, EntryStatus::Stopped);
}
