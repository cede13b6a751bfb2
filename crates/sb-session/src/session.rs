use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sb_core::config::{Config, ShellConfig};
use sb_core::types::{SessionState, SessionStatus, TerminalSize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::prompt_watcher::{PromptWatcher, AFFIRMATIVE};
use crate::pty::{ProcessHandle, PtyBackend, PtyControl};
use crate::shell;
use crate::sink::OutputSink;

/// Line terminator appended by [`Session::write_line`].
pub const LINE_TERMINATOR: &str = "\n";

/// Depth of the channel between the blocking PTY reader thread and the
/// forwarding task.
const READ_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// SessionSpec
// ---------------------------------------------------------------------------

/// Everything needed to launch a session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub shell: ShellConfig,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub size: TerminalSize,
    pub prompt_watcher: bool,
    pub term: String,
    pub read_chunk_size: usize,
}

impl SessionSpec {
    /// Defaults taken from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            shell: config.shell.clone(),
            environment: BTreeMap::new(),
            working_directory: None,
            size: TerminalSize::new(config.session.rows, config.session.cols),
            prompt_watcher: config.session.prompt_watcher,
            term: config.session.term.clone(),
            read_chunk_size: config.session.read_chunk_size,
        }
    }
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One pseudo-terminal plus the shell process attached to it.
///
/// The PTY handles are owned exclusively by the session. `close()` is the
/// single teardown path and may be called any number of times from any
/// thread; only the first call does work.
pub struct Session {
    id: String,
    shell: String,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    read_chunk_size: usize,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    control: Mutex<Option<Box<dyn PtyControl>>>,
    last_size: Mutex<TerminalSize>,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
    watcher: PromptWatcher,
    closed: AtomicBool,
    done: watch::Sender<bool>,
    attached: AtomicBool,
    bytes_forwarded: AtomicU64,
}

impl Session {
    /// Resolve the shell, allocate a PTY and launch the process.
    pub fn spawn(
        id: impl Into<String>,
        backend: &dyn PtyBackend,
        spec: &SessionSpec,
    ) -> Result<Self> {
        let id = id.into();
        let command = shell::build_command(
            &spec.shell,
            &spec.term,
            &spec.environment,
            spec.working_directory.as_deref(),
        );

        let channels = backend.allocate(&command, spec.size).map_err(|e| {
            warn!(session_id = %id, shell = %command.name, error = %e, "shell spawn failed");
            SessionError::SpawnFailed {
                shell: command.name.clone(),
                detail: e.to_string(),
            }
        })?;

        let pid = channels.process.as_ref().and_then(|p| p.pid());
        info!(
            session_id = %id,
            shell = %command.name,
            backend = backend.name(),
            ?pid,
            size = %spec.size,
            "session spawned"
        );

        let (done, _) = watch::channel(false);
        Ok(Self {
            id,
            shell: command.name,
            pid,
            created_at: Utc::now(),
            read_chunk_size: spec.read_chunk_size.max(1),
            reader: Mutex::new(Some(channels.reader)),
            writer: Mutex::new(Some(channels.writer)),
            control: Mutex::new(Some(channels.control)),
            last_size: Mutex::new(spec.size),
            process: Mutex::new(channels.process),
            watcher: PromptWatcher::new(spec.prompt_watcher),
            closed: AtomicBool::new(false),
            done,
            attached: AtomicBool::new(false),
            bytes_forwarded: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a read loop has been bound to a connection.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Forward raw bytes (keystrokes) to the PTY input side.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::WriteFailed(format!("session {} is closed", self.id)));
        }
        let mut writer = lock(&self.writer);
        let writer = writer
            .as_mut()
            .ok_or_else(|| SessionError::WriteFailed(format!("session {} is closed", self.id)))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Write `text` followed by a line terminator.
    pub fn write_line(&self, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + LINE_TERMINATOR.len());
        line.push_str(text);
        line.push_str(LINE_TERMINATOR);
        self.write(line.as_bytes())
    }

    /// Propagate a geometry change. A closed session ignores it.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        if self.is_closed() {
            debug!(session_id = %self.id, "resize after close ignored");
            return Ok(());
        }
        let control = lock(&self.control);
        match control.as_ref() {
            Some(control) => {
                let size = TerminalSize::new(rows, cols);
                control
                    .resize(size)
                    .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
                *lock(&self.last_size) = size;
                debug!(session_id = %self.id, rows, cols, "PTY resized");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Current PTY geometry.
    pub fn size(&self) -> Result<TerminalSize> {
        let control = lock(&self.control);
        let control = control
            .as_ref()
            .ok_or_else(|| SessionError::Closed(self.id.clone()))?;
        control
            .size()
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    pub fn set_prompt_watcher(&self, enabled: bool) {
        self.watcher.set_enabled(enabled);
        info!(session_id = %self.id, enabled, "prompt watcher toggled");
    }

    pub fn prompt_watcher_enabled(&self) -> bool {
        self.watcher.is_enabled()
    }

    pub fn status(&self) -> SessionStatus {
        // A closed session reports the geometry it had last.
        let size = self.size().unwrap_or_else(|_| *lock(&self.last_size));
        SessionStatus {
            session_id: self.id.clone(),
            state: if self.is_closed() {
                SessionState::Closed
            } else {
                SessionState::Running
            },
            shell: self.shell.clone(),
            pid: self.pid,
            rows: size.rows,
            cols: size.cols,
            prompt_watcher: self.prompt_watcher_enabled(),
            attached: self.is_attached(),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.subscribe_closed();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Receiver for the termination signal; its value flips to `true` once.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Tear the session down. Returns `true` for the call that actually
    /// performed the teardown, `false` for every later (or concurrent) one.
    ///
    /// Order: termination signal, PTY handles, then kill and reap the
    /// process. Blocks while waiting for the process to exit.
    pub fn close(&self) -> bool {
        self.teardown(true)
    }

    fn teardown(&self, reap: bool) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.done.send_replace(true);

        drop(lock(&self.writer).take());
        drop(lock(&self.control).take());

        let process = lock(&self.process).take();
        if let Some(mut process) = process {
            match process.try_wait() {
                Ok(Some(code)) => debug!(session_id = %self.id, code, "process already exited"),
                _ => {
                    if let Err(e) = process.kill() {
                        debug!(session_id = %self.id, error = %e, "kill failed");
                    }
                    if reap {
                        match process.wait() {
                            Ok(code) => debug!(session_id = %self.id, code, "process reaped"),
                            Err(e) => warn!(session_id = %self.id, error = %e, "wait failed"),
                        }
                    }
                }
            }
        }

        info!(session_id = %self.id, "session closed");
        true
    }

    /// Start the read loop, forwarding every PTY chunk to `sink`.
    ///
    /// The blocking PTY read runs on a dedicated thread; scanning and
    /// forwarding run on a tokio task. The loop ends on EOF, read error,
    /// session close, or a failed send, and closes the session on exit.
    /// Only one read loop can ever be started per session.
    pub fn start_read_loop(self: &Arc<Self>, sink: Arc<dyn OutputSink>) -> Result<JoinHandle<()>> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        let reader = lock(&self.reader)
            .take()
            .ok_or_else(|| SessionError::ReadLoopActive(self.id.clone()))?;
        self.attached.store(true, Ordering::Release);

        let (tx, rx) = flume::bounded::<Vec<u8>>(READ_CHANNEL_CAPACITY);
        let chunk_size = self.read_chunk_size;
        let session_id = self.id.clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", self.id))
            .spawn(move || read_pty(reader, tx, chunk_size, session_id))
            .map_err(|e| SessionError::Closed(format!("{}: reader thread: {e}", self.id)))?;

        let session = Arc::clone(self);
        Ok(tokio::spawn(async move {
            session.forward_output(rx, sink).await;
            let closer = Arc::clone(&session);
            if let Err(e) = tokio::task::spawn_blocking(move || closer.close()).await {
                warn!(session_id = %session.id, error = %e, "teardown task failed");
            }
        }))
    }

    async fn forward_output(&self, rx: flume::Receiver<Vec<u8>>, sink: Arc<dyn OutputSink>) {
        let mut done = self.subscribe_closed();
        loop {
            let chunk = tokio::select! {
                chunk = rx.recv_async() => match chunk {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        debug!(session_id = %self.id, "PTY reader finished");
                        break;
                    }
                },
                _ = done.wait_for(|closed| *closed) => break,
            };

            if let Some(pattern) = self.watcher.check(&chunk) {
                info!(session_id = %self.id, pattern, "confirmation prompt detected, answering");
                if let Err(e) = self.write_line(AFFIRMATIVE) {
                    warn!(session_id = %self.id, error = %e, "auto-answer failed");
                }
            }

            let len = chunk.len() as u64;
            if let Err(e) = sink.send_output(chunk).await {
                warn!(session_id = %self.id, error = %e, "output send failed, closing session");
                break;
            }
            self.bytes_forwarded.fetch_add(len, Ordering::Relaxed);
        }
    }
}

/// Dropping an open session kills its process but does not wait for it:
/// the last reference may go away on an async worker thread. Use
/// [`Session::close`] (or the manager) for a full reap.
impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!(session_id = %self.id, "session dropped while open");
            self.teardown(false);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn read_pty(
    mut reader: Box<dyn Read + Send>,
    tx: flume::Sender<Vec<u8>>,
    chunk_size: usize,
    session_id: String,
) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is the usual way a Unix PTY reports that the child exited.
                debug!(%session_id, "pty reader error: {e}");
                break;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("session lock was poisoned, recovering");
        e.into_inner()
    })
}
