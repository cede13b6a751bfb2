//! In-memory PTY backend for deterministic session tests.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sb_core::types::TerminalSize;
use sb_session::pty::{ProcessHandle, PtyBackend, PtyChannels, PtyControl, ShellCommand};
use sb_session::{OutputSink, SinkError};

/// Teardown bookkeeping shared by every piece of one scripted PTY.
#[derive(Debug, Default)]
pub struct Counters {
    pub kills: AtomicUsize,
    pub waits: AtomicUsize,
    pub control_drops: AtomicUsize,
    pub writer_drops: AtomicUsize,
    pub closed: AtomicBool,
}

impl Counters {
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
    pub fn control_drops(&self) -> usize {
        self.control_drops.load(Ordering::SeqCst)
    }
    pub fn writer_drops(&self) -> usize {
        self.writer_drops.load(Ordering::SeqCst)
    }
}

/// Test-side handle to one allocated PTY: push output, observe writes.
pub struct ScriptedPty {
    pub command: ShellCommand,
    pub output: flume::Sender<Vec<u8>>,
    pub writes: flume::Receiver<Vec<u8>>,
    pub counters: Arc<Counters>,
}

pub struct ScriptedBackend {
    allocated: flume::Sender<ScriptedPty>,
    fail_with: Option<String>,
    owns_process: bool,
}

impl ScriptedBackend {
    pub fn new() -> (Arc<Self>, flume::Receiver<ScriptedPty>) {
        let (tx, rx) = flume::unbounded();
        let backend = Self {
            allocated: tx,
            fail_with: None,
            owns_process: true,
        };
        (Arc::new(backend), rx)
    }

    /// A backend where an emulation layer owns the process.
    pub fn without_process() -> (Arc<Self>, flume::Receiver<ScriptedPty>) {
        let (tx, rx) = flume::unbounded();
        let backend = Self {
            allocated: tx,
            fail_with: None,
            owns_process: false,
        };
        (Arc::new(backend), rx)
    }

    pub fn failing(message: &str) -> Arc<Self> {
        let (tx, _rx) = flume::unbounded();
        Arc::new(Self {
            allocated: tx,
            fail_with: Some(message.to_string()),
            owns_process: true,
        })
    }
}

impl PtyBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn allocate(&self, command: &ShellCommand, size: TerminalSize) -> io::Result<PtyChannels> {
        if let Some(message) = &self.fail_with {
            return Err(io::Error::new(io::ErrorKind::NotFound, message.clone()));
        }
        let counters = Arc::new(Counters::default());
        let (output_tx, output_rx) = flume::unbounded();
        let (writes_tx, writes_rx) = flume::unbounded();

        let _ = self.allocated.send(ScriptedPty {
            command: command.clone(),
            output: output_tx,
            writes: writes_rx,
            counters: Arc::clone(&counters),
        });

        let process: Option<Box<dyn ProcessHandle>> = if self.owns_process {
            Some(Box::new(ScriptedProcess {
                counters: Arc::clone(&counters),
            }))
        } else {
            None
        };

        Ok(PtyChannels {
            reader: Box::new(ChannelReader {
                rx: output_rx,
                pending: Vec::new(),
                counters: Arc::clone(&counters),
            }),
            writer: Box::new(ChannelWriter {
                tx: writes_tx,
                counters: Arc::clone(&counters),
            }),
            control: Box::new(ScriptedControl {
                size: Mutex::new(size),
                counters: Arc::clone(&counters),
            }),
            process,
        })
    }
}

struct ChannelReader {
    rx: flume::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    counters: Arc<Counters>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            if self.counters.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => self.pending = chunk,
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct ChannelWriter {
    tx: flume::Sender<Vec<u8>>,
    counters: Arc<Counters>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writes receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.counters.writer_drops.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedControl {
    size: Mutex<TerminalSize>,
    counters: Arc<Counters>,
}

impl PtyControl for ScriptedControl {
    fn resize(&self, size: TerminalSize) -> io::Result<()> {
        *self.size.lock().unwrap() = size;
        Ok(())
    }

    fn size(&self) -> io::Result<TerminalSize> {
        Ok(*self.size.lock().unwrap())
    }
}

impl Drop for ScriptedControl {
    fn drop(&mut self) {
        self.counters.control_drops.fetch_add(1, Ordering::SeqCst);
        self.counters.closed.store(true, Ordering::SeqCst);
    }
}

struct ScriptedProcess {
    counters: Arc<Counters>,
}

impl ProcessHandle for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn try_wait(&mut self) -> io::Result<Option<u32>> {
        Ok(None)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        self.counters.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&mut self) -> io::Result<u32> {
        self.counters.waits.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

/// Sink whose every send fails, as if the connection had died.
pub struct DeadSink;

#[async_trait]
impl OutputSink for DeadSink {
    async fn send_output(&self, _chunk: Vec<u8>) -> Result<(), SinkError> {
        Err(SinkError::TransportSendFailed("connection reset".into()))
    }
}

/// Wait until `f` holds or the timeout elapses.
pub async fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
