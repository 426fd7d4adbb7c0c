//! PTY allocation and I/O for shell sessions.
//!
//! portable-pty's reader/writer handles are blocking, so chunk reads and
//! child waits are pushed onto the blocking pool. The child is killed
//! through a cloned killer handle rather than the child itself: the wait
//! task holds the child for the session's whole life.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize,
};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::task;

/// Upper bound on a single PTY read.
const READ_CHUNK: usize = 32 * 1024;

pub struct PtyHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyHandle {
    /// Open a PTY and spawn `shell` on its slave side with the current
    /// process environment plus `TERM=xterm-256color`.
    pub fn spawn(
        shell: &str,
    ) -> Result<(Self, PtyReader, PtyWriter, Box<dyn Child + Send + Sync>)> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system.openpty(size).context("open PTY pair")?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");
        let child = pair.slave.spawn_command(cmd).context("spawn shell")?;
        let killer = child.clone_killer();

        let reader = pair.master.try_clone_reader().context("clone PTY reader")?;
        let writer = pair.master.take_writer().context("take PTY writer")?;

        let handle = Self {
            master: Mutex::new(Some(pair.master)),
            killer: Mutex::new(killer),
        };
        Ok((handle, PtyReader::new(reader), PtyWriter::new(writer), child))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let guard = self.master.lock();
        let master = guard.as_ref().context("PTY master closed")?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("resize PTY")
    }

    /// Kill the child and drop the master handle. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.killer.lock().kill();
        self.master.lock().take();
    }
}

#[derive(Clone)]
pub struct PtyReader {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
}

impl PtyReader {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    /// Read the next chunk of PTY output into a fresh allocation.
    /// `Ok(None)` means EOF (the child exited and the slave closed).
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let reader = self.reader.clone();
        task::spawn_blocking(move || {
            let mut guard = reader.lock();
            loop {
                let mut buffer = vec![0u8; READ_CHUNK];
                match guard.read(&mut buffer) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        buffer.truncate(n);
                        return Ok(Some(buffer));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
        .context("join PTY read task")?
    }
}

#[derive(Clone)]
pub struct PtyWriter {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PtyWriter {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        guard.write_all(bytes).context("write to PTY")?;
        guard.flush().context("flush PTY writer")?;
        Ok(())
    }
}
