use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use sb_core::types::TerminalSize;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// ShellCommand
// ---------------------------------------------------------------------------

/// A fully resolved process launch: executable, arguments, environment and
/// start directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Short human-readable name reported in errors and status.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Geometry control for an allocated PTY. Dropping it closes the PTY
/// master side.
pub trait PtyControl: Send {
    fn resize(&self, size: TerminalSize) -> io::Result<()>;
    fn size(&self) -> io::Result<TerminalSize>;
}

/// The process attached to a PTY.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    /// `Some(exit_code)` once the process has exited.
    fn try_wait(&mut self) -> io::Result<Option<u32>>;
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<u32>;
}

/// Everything a backend hands back for one allocated PTY.
pub struct PtyChannels {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn PtyControl>,
    /// Absent when an emulation layer owns the process instead of us.
    pub process: Option<Box<dyn ProcessHandle>>,
}

/// Platform PTY provider, selected when a session is created.
pub trait PtyBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Allocate a PTY of the given size and launch `command` attached to it.
    fn allocate(&self, command: &ShellCommand, size: TerminalSize) -> io::Result<PtyChannels>;
}

// ---------------------------------------------------------------------------
// NativePtyBackend
// ---------------------------------------------------------------------------

/// `portable-pty` backend: Unix PTYs, ConPTY on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl PtyBackend for NativePtyBackend {
    fn name(&self) -> &'static str {
        if cfg!(windows) {
            "conpty"
        } else {
            "unix-pty"
        }
    }

    fn allocate(&self, command: &ShellCommand, size: TerminalSize) -> io::Result<PtyChannels> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(to_pty_size(size)).map_err(other)?;

        let mut builder = CommandBuilder::new(&command.program);
        for arg in &command.args {
            builder.arg(arg);
        }
        for (k, v) in &command.env {
            builder.env(k, v);
        }
        if let Some(cwd) = &command.cwd {
            builder.cwd(cwd);
        }

        let child = pair.slave.spawn_command(builder).map_err(other)?;
        // Only the child keeps the slave open, so the reader sees EOF on exit.
        drop(pair.slave);

        debug!(program = %command.program, args = ?command.args, pid = ?child.process_id(), "spawned PTY process");

        let reader = pair.master.try_clone_reader().map_err(other)?;
        let writer = pair.master.take_writer().map_err(other)?;

        Ok(PtyChannels {
            reader,
            writer,
            control: Box::new(NativeControl {
                master: Mutex::new(pair.master),
            }),
            process: Some(Box::new(NativeProcess { child })),
        })
    }
}

struct NativeControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
}

impl NativeControl {
    fn master(&self) -> std::sync::MutexGuard<'_, Box<dyn MasterPty + Send>> {
        self.master.lock().unwrap_or_else(|e| {
            warn!("master lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

impl PtyControl for NativeControl {
    fn resize(&self, size: TerminalSize) -> io::Result<()> {
        self.master().resize(to_pty_size(size)).map_err(other)
    }

    fn size(&self) -> io::Result<TerminalSize> {
        let size = self.master().get_size().map_err(other)?;
        Ok(TerminalSize::new(size.rows, size.cols))
    }
}

struct NativeProcess {
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl ProcessHandle for NativeProcess {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn try_wait(&mut self) -> io::Result<Option<u32>> {
        Ok(self.child.try_wait()?.map(|status| status.exit_code()))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<u32> {
        Ok(self.child.wait()?.exit_code())
    }
}

fn to_pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn other(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}
