//! A pane is one child process attached to a PTY, its terminal buffer,
//! and the set of data channels its output fans out to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::errors::{AgentError, Result};
use crate::protocol::Winsize;
use crate::pty::{PaneCommand, PtyProcess, PtyReader, PtyWriter};
use crate::registry::PaneRegistry;
use crate::terminal::TerminalBuffer;

/// Per-pane data channel id, tagged onto each bound sink.
pub type DcId = u32;

/// Outbound half of a data channel as a pane sees it. Sends enqueue and
/// never block; ordering within one sink is preserved.
pub trait ChannelSink: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<()>;
    fn close(&self);
    fn label(&self) -> &str;
}

pub struct Pane {
    id: u32,
    command: PaneCommand,
    process: PtyProcess,
    writer: PtyWriter,
    buffer: Mutex<TerminalBuffer>,
    sinks: Mutex<Vec<(DcId, Arc<dyn ChannelSink>)>>,
    next_dc_id: AtomicU32,
    dead: AtomicBool,
}

impl Pane {
    /// Spawns the child on a fresh PTY. The output loop starts separately
    /// via [`Pane::start_reader`], once the pane is registered.
    pub fn spawn(
        id: u32,
        argv: &[String],
        size: Winsize,
        env: HashMap<String, String>,
    ) -> Result<(Arc<Self>, PtyReader)> {
        let command = PaneCommand::new(argv, env)
            .ok_or_else(|| AgentError::Pane("empty pane command".into()))?;
        let (process, reader, writer) = PtyProcess::spawn(&command, size)
            .map_err(|err| AgentError::Pane(format!("spawn {:?}: {err:#}", command.display())))?;
        info!(pane_id = id, command = %command.display(), rows = size.rows, cols = size.cols, "pane spawned");
        let pane = Arc::new(Self {
            id,
            command,
            process,
            writer,
            buffer: Mutex::new(TerminalBuffer::new(size)),
            sinks: Mutex::new(Vec::new()),
            next_dc_id: AtomicU32::new(1),
            dead: AtomicBool::new(false),
        });
        Ok((pane, reader))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn command_line(&self) -> String {
        self.command.display()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Kernel-side PTY size; the debug hook behind `resize_pane` tests
    /// and `/status`.
    pub fn pty_size(&self) -> Result<Winsize> {
        self.process
            .size()
            .map_err(|err| AgentError::Pane(err.to_string()))
    }

    pub fn resize(&self, size: Winsize) -> Result<()> {
        self.process
            .resize(size)
            .map_err(|err| AgentError::Pane(format!("resize pane {}: {err:#}", self.id)))?;
        self.buffer.lock().unwrap().resize(size);
        debug!(pane_id = self.id, rows = size.rows, cols = size.cols, "pane resized");
        Ok(())
    }

    /// Binds a channel: replays the buffer dump to it, then adds it to
    /// the fan-out set. Both happen under the sink lock, so no live chunk
    /// can reach the channel before the dump.
    pub fn bind(&self, sink: Arc<dyn ChannelSink>) -> Result<DcId> {
        if self.is_dead() {
            return Err(AgentError::Pane(format!("pane {} is dead", self.id)));
        }
        let mut sinks = self.sinks.lock().unwrap();
        let dump = self.buffer.lock().unwrap().dump_bytes();
        sink.send(&dump)?;
        let dc_id = self.next_dc_id.fetch_add(1, Ordering::SeqCst);
        debug!(pane_id = self.id, dc_id, label = sink.label(), "channel bound");
        sinks.push((dc_id, sink));
        Ok(dc_id)
    }

    /// Tolerant of ids that were already removed.
    pub fn unbind(&self, dc_id: DcId) {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain(|(id, _)| *id != dc_id);
    }

    /// Keystrokes from a peer, forwarded verbatim to the PTY master.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write(bytes)
            .map_err(|err| AgentError::Pane(format!("write to pane {}: {err:#}", self.id)))
    }

    /// Drives PTY output until EOF, feeding the terminal buffer and
    /// broadcasting each chunk to bound sinks in insertion order. On EOF
    /// or read error the pane removes itself from the registry.
    pub fn start_reader(self: &Arc<Self>, reader: PtyReader, registry: Arc<PaneRegistry>) {
        let pane = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match reader.read_chunk().await {
                    Ok(Some(chunk)) => pane.broadcast(&chunk),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(pane_id = pane.id, error = %format!("{err:#}"), "pane read failed");
                        break;
                    }
                }
            }
            info!(pane_id = pane.id, "pane output ended");
            registry.remove(pane.id);
        });
    }

    fn broadcast(&self, chunk: &[u8]) {
        self.buffer.lock().unwrap().write(chunk);
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain(|(dc_id, sink)| match sink.send(chunk) {
            Ok(()) => true,
            Err(err) => {
                // A dead channel only costs itself; the pane lives on.
                warn!(pane_id = self.id, dc_id, error = %err, "dropping channel after failed write");
                sink.close();
                false
            }
        });
    }

    /// Ordered teardown: close bound channels, then kill and reap the
    /// child. Idempotent; the registry entry is the caller's business.
    pub fn shutdown(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(DcId, Arc<dyn ChannelSink>)> =
            self.sinks.lock().unwrap().drain(..).collect();
        for (dc_id, sink) in drained {
            debug!(pane_id = self.id, dc_id, "closing bound channel");
            sink.close();
        }
        self.process.kill();
    }
}
