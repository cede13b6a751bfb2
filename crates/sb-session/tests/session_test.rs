mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, DeadSink, ScriptedBackend};
use sb_core::config::ShellConfig;
use sb_core::types::SessionState;
use sb_session::{Session, SessionError, SessionSpec};

fn spec() -> SessionSpec {
    SessionSpec {
        shell: ShellConfig {
            program: Some("/bin/sh".into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

// ===========================================================================
// Teardown
// ===========================================================================

#[test]
fn concurrent_close_tears_down_exactly_once() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).expect("spawn"));
    let pty = allocated.try_recv().expect("pty allocated");

    let winners = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..16)
        .map(|_| {
            let session = Arc::clone(&session);
            let winners = Arc::clone(&winners);
            std::thread::spawn(move || {
                if session.close() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(pty.counters.kills(), 1);
    assert_eq!(pty.counters.waits(), 1);
    assert_eq!(pty.counters.control_drops(), 1);
    assert_eq!(pty.counters.writer_drops(), 1);
    assert!(session.is_closed());

    // Later calls stay no-ops.
    assert!(!session.close());
    assert_eq!(pty.counters.kills(), 1);
}

#[test]
fn close_without_process_handle_skips_kill() {
    let (backend, allocated) = ScriptedBackend::without_process();
    let session = Session::spawn("s1", backend.as_ref(), &spec()).expect("spawn");
    let pty = allocated.try_recv().unwrap();
    assert_eq!(session.pid(), None);

    assert!(session.close());
    assert_eq!(pty.counters.kills(), 0);
    assert_eq!(pty.counters.control_drops(), 1);
}

#[tokio::test]
async fn dropping_open_session_kills_without_waiting() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Session::spawn("s1", backend.as_ref(), &spec()).unwrap();
    let pty = allocated.try_recv().unwrap();

    drop(session);
    assert_eq!(pty.counters.kills(), 1);
    assert_eq!(pty.counters.waits(), 0);
    assert_eq!(pty.counters.control_drops(), 1);
}

#[test]
fn dropping_closed_session_does_not_tear_down_again() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Session::spawn("s1", backend.as_ref(), &spec()).unwrap();
    let pty = allocated.try_recv().unwrap();

    session.close();
    drop(session);
    assert_eq!(pty.counters.kills(), 1);
    assert_eq!(pty.counters.waits(), 1);
}

#[tokio::test]
async fn closed_signal_resolves_after_close() {
    let (backend, _allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).unwrap());

    let waiter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.closed().await })
    };
    session.close();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("closed() should resolve")
        .unwrap();
    assert_eq!(session.status().state, SessionState::Closed);
}

// ===========================================================================
// Write / resize
// ===========================================================================

#[test]
fn write_reaches_pty_verbatim() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Session::spawn("s1", backend.as_ref(), &spec()).unwrap();
    let pty = allocated.try_recv().unwrap();

    session.write(b"ls -la\r").unwrap();
    session.write_line("echo hi").unwrap();

    assert_eq!(pty.writes.try_recv().unwrap(), b"ls -la\r");
    assert_eq!(pty.writes.try_recv().unwrap(), b"echo hi\n");
}

#[test]
fn write_after_close_fails() {
    let (backend, _allocated) = ScriptedBackend::new();
    let session = Session::spawn("s1", backend.as_ref(), &spec()).unwrap();
    session.close();

    match session.write(b"x") {
        Err(SessionError::WriteFailed(msg)) => assert!(msg.contains("closed")),
        other => panic!("expected WriteFailed, got {other:?}"),
    }
}

#[test]
fn resize_updates_geometry_and_is_ignored_after_close() {
    let (backend, _allocated) = ScriptedBackend::new();
    let session = Session::spawn("s1", backend.as_ref(), &spec()).unwrap();

    session.resize(40, 120).unwrap();
    let size = session.size().unwrap();
    assert_eq!((size.rows, size.cols), (40, 120));

    session.close();
    session.resize(10, 10).expect("resize after close is a no-op");
    assert!(matches!(session.size(), Err(SessionError::Closed(_))));

    // The final status keeps the last geometry.
    let status = session.status();
    assert_eq!(status.state, SessionState::Closed);
    assert_eq!((status.rows, status.cols), (40, 120));
}

#[test]
fn spawn_failure_reports_shell_name() {
    let backend = ScriptedBackend::failing("No such file or directory");
    let err = Session::spawn("s1", backend.as_ref(), &spec()).expect_err("spawn should fail");
    match err {
        SessionError::SpawnFailed { shell, detail } => {
            assert_eq!(shell, "sh");
            assert!(detail.contains("No such file"));
        }
        other => panic!("expected SpawnFailed, got {other:?}"),
    }
}

// ===========================================================================
// Read loop
// ===========================================================================

#[tokio::test]
async fn output_is_forwarded_in_read_order() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).unwrap());
    let pty = allocated.try_recv().unwrap();

    let (sink_tx, sink_rx) = flume::unbounded::<Vec<u8>>();
    session.start_read_loop(Arc::new(sink_tx)).unwrap();

    let mut expected = Vec::new();
    for i in 0..200u32 {
        let chunk = format!("line-{i}\n").into_bytes();
        expected.extend_from_slice(&chunk);
        pty.output.send(chunk).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < expected.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv_async())
            .await
            .expect("timed out waiting for output")
            .unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, expected);
    let total = expected.len() as u64;
    assert!(eventually(Duration::from_secs(1), || session.status().bytes_forwarded == total).await);
    session.close();
}

#[tokio::test]
async fn only_one_read_loop_per_session() {
    let (backend, _allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).unwrap());
    let (sink_tx, _sink_rx) = flume::unbounded::<Vec<u8>>();
    let sink = Arc::new(sink_tx);

    session.start_read_loop(sink.clone()).unwrap();
    assert!(session.is_attached());
    assert!(matches!(
        session.start_read_loop(sink),
        Err(SessionError::ReadLoopActive(_))
    ));
    session.close();
}

#[tokio::test]
async fn end_of_stream_closes_session() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).unwrap());
    let pty = allocated.try_recv().unwrap();
    let (sink_tx, _sink_rx) = flume::unbounded::<Vec<u8>>();
    let task = session.start_read_loop(Arc::new(sink_tx)).unwrap();

    // Dropping the output side is EOF for the reader.
    drop(pty.output);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("read loop should exit")
        .unwrap();
    assert!(session.is_closed());
    assert_eq!(pty.counters.kills(), 1);
}

#[tokio::test]
async fn failed_send_tears_session_down() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).unwrap());
    let pty = allocated.try_recv().unwrap();
    session.start_read_loop(Arc::new(DeadSink)).unwrap();

    pty.output.send(b"$ ".to_vec()).unwrap();
    assert!(eventually(Duration::from_secs(2), || session.is_closed()).await);
    assert!(eventually(Duration::from_secs(1), || pty.counters.kills() == 1).await);
}

// ===========================================================================
// Prompt watcher
// ===========================================================================

#[tokio::test]
async fn watcher_answers_confirmation_prompt() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).unwrap());
    let pty = allocated.try_recv().unwrap();
    let (sink_tx, sink_rx) = flume::unbounded::<Vec<u8>>();
    session.start_read_loop(Arc::new(sink_tx)).unwrap();
    session.set_prompt_watcher(true);

    pty.output.send(b"Continue? [y/n] ".to_vec()).unwrap();

    let write = tokio::time::timeout(Duration::from_secs(2), pty.writes.recv_async())
        .await
        .expect("watcher should write")
        .unwrap();
    assert_eq!(write, b"y\n");

    // The prompt itself is still forwarded.
    let forwarded = sink_rx.recv_async().await.unwrap();
    assert_eq!(forwarded, b"Continue? [y/n] ");
    session.close();
}

#[tokio::test]
async fn disabled_watcher_does_not_answer() {
    let (backend, allocated) = ScriptedBackend::new();
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec()).unwrap());
    let pty = allocated.try_recv().unwrap();
    let (sink_tx, sink_rx) = flume::unbounded::<Vec<u8>>();
    session.start_read_loop(Arc::new(sink_tx)).unwrap();
    assert!(!session.prompt_watcher_enabled());

    pty.output.send(b"Continue? [y/n] ".to_vec()).unwrap();

    let forwarded = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, b"Continue? [y/n] ");
    // Scanning happens before forwarding, so any answer would already be queued.
    assert!(pty.writes.try_recv().is_err());
    session.close();
}

#[tokio::test]
async fn watcher_initial_state_comes_from_session_spec() {
    let (backend, allocated) = ScriptedBackend::new();
    let mut spec = spec();
    spec.prompt_watcher = true;
    let session = Arc::new(Session::spawn("s1", backend.as_ref(), &spec).unwrap());
    let pty = allocated.try_recv().unwrap();
    let (sink_tx, _sink_rx) = flume::unbounded::<Vec<u8>>();
    session.start_read_loop(Arc::new(sink_tx)).unwrap();

    pty.output.send(b"Are you sure? ".to_vec()).unwrap();
    let write = tokio::time::timeout(Duration::from_secs(2), pty.writes.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(write, b"y\n");
    session.close();
}

#[test]
fn spawn_passes_environment_and_term() {
    let (backend, allocated) = ScriptedBackend::new();
    let mut spec = spec();
    spec.environment.insert("PROJECT".into(), "demo".into());
    spec.working_directory = Some("/tmp".into());
    let _session = Session::spawn("s1", backend.as_ref(), &spec).unwrap();
    let pty = allocated.try_recv().unwrap();

    assert!(pty
        .command
        .env
        .contains(&("TERM".to_string(), "xterm-256color".to_string())));
    assert!(pty
        .command
        .env
        .contains(&("PROJECT".to_string(), "demo".to_string())));
    assert_eq!(pty.command.cwd.as_deref(), Some(std::path::Path::new("/tmp")));
}
