//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running the configured shell, providing
//! write, resize, exit-wait and kill operations. The raw output reader is
//! handed to the caller at spawn time so the owning session can drive it
//! from its own reader task.

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use termcast_core::{CastError, CastResult};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A managed PTY instance.
pub struct PtyHandle {
    /// Input side of the PTY.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// The master, kept for resize operations (sync Mutex because
    /// MasterPty is not Sync).
    master: Arc<std::sync::Mutex<Box<dyn MasterPty + Send>>>,
    /// Child process handle.
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
}

impl PtyHandle {
    /// Spawn the shell on a fresh PTY at the given geometry.
    ///
    /// The child inherits the broker's environment, with `env` entries
    /// layered on top. Returns the handle plus the raw output reader.
    pub fn spawn(
        shell: &str,
        args: &[String],
        cwd: &Path,
        env: &HashMap<String, String>,
        cols: u16,
        rows: u16,
    ) -> CastResult<(Self, Box<dyn Read + Send>)> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| CastError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.args(args);
        cmd.cwd(cwd);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CastError::Spawn(format!("failed to spawn {shell}: {e}")))?;

        info!(shell, cols, rows, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| CastError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| CastError::Spawn(format!("failed to take PTY writer: {e}")))?;

        Ok((
            Self {
                writer: Arc::new(Mutex::new(writer)),
                master: Arc::new(std::sync::Mutex::new(pair.master)),
                child: Arc::new(Mutex::new(child)),
            },
            reader,
        ))
    }

    /// Write bytes to the PTY input (the blocking write runs off the
    /// async executor).
    pub async fn write(&self, data: Vec<u8>) -> CastResult<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.blocking_lock();
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| CastError::Other(format!("join error: {e}")))?
        .map_err(CastError::Io)?;
        Ok(())
    }

    /// Resize the PTY window.
    pub fn resize(&self, cols: u16, rows: u16) -> CastResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| CastError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| CastError::Other(format!("PTY resize failed: {e}")))?;
        drop(master);
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Wait for the child process to exit. Returns the exit code.
    pub async fn wait(&self) -> CastResult<u32> {
        let child = self.child.clone();
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child.blocking_lock();
            child.wait()
        })
        .await
        .map_err(|e| CastError::Other(format!("join error: {e}")))?
        .map_err(|e| CastError::Other(format!("wait error: {e}")))?;

        Ok(status.exit_code())
    }

    /// Kill the child process.
    pub fn kill(&self) -> CastResult<()> {
        let mut child = self
            .child
            .try_lock()
            .map_err(|_| CastError::Other("child lock contention".into()))?;
        child
            .kill()
            .map_err(|e| CastError::Other(format!("kill failed: {e}")))?;
        Ok(())
    }
}
