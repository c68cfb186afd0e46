//! PTY plumbing for panes: opens a master/slave pair, spawns the child
//! and hands back blocking-friendly reader/writer handles.

use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, PtyPair, PtySize, native_pty_system};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::task;

use crate::protocol::Winsize;

#[derive(Clone, Debug)]
pub struct PaneCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl PaneCommand {
    pub fn new(argv: &[String], env: HashMap<String, String>) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env,
        })
    }

    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

fn pty_size(size: Winsize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub struct PtyProcess {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
}

impl PtyProcess {
    pub fn spawn(command: &PaneCommand, size: Winsize) -> Result<(Self, PtyReader, PtyWriter)> {
        let mut pair = open_pair(size)?;
        let child = spawn_child(&mut pair, command)?;
        let master = pair.master;
        let reader = master.try_clone_reader().context("clone PTY reader")?;
        let writer = master.take_writer().context("take PTY writer")?;

        let process = Self {
            master: Mutex::new(master),
            child: Mutex::new(Some(child)),
        };
        Ok((process, PtyReader::new(reader), PtyWriter::new(writer)))
    }

    pub fn resize(&self, size: Winsize) -> Result<()> {
        let master = self.master.lock().unwrap();
        master.resize(pty_size(size)).context("resize PTY")
    }

    /// Current kernel-side window size, exposed for tests and `/status`.
    pub fn size(&self) -> Result<Winsize> {
        let master = self.master.lock().unwrap();
        let size = master.get_size().context("query PTY size")?;
        Ok(Winsize {
            rows: size.rows,
            cols: size.cols,
        })
    }

    /// SIGKILLs the child and reaps it. Safe to call more than once.
    pub fn kill(&self) {
        let mut guard = self.child.lock().unwrap();
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Clone)]
pub struct PtyReader {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
}

impl PtyReader {
    const CHUNK: usize = 4096;

    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    /// One blocking read hopped onto the blocking pool; `None` on EOF.
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let reader = self.reader.clone();
        task::spawn_blocking(move || {
            let mut guard = reader.lock().unwrap();
            loop {
                let mut buffer = vec![0u8; Self::CHUNK];
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
        let mut guard = self.writer.lock().unwrap();
        guard.write_all(bytes).context("write to PTY")?;
        guard.flush().context("flush PTY writer")?;
        Ok(())
    }
}

fn open_pair(size: Winsize) -> Result<PtyPair> {
    let pty_system = native_pty_system();
    pty_system.openpty(pty_size(size)).context("open PTY pair")
}

fn spawn_child(pair: &mut PtyPair, command: &PaneCommand) -> Result<Box<dyn Child + Send + Sync>> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    pair.slave.spawn_command(cmd).context("spawn PTY child")
}
