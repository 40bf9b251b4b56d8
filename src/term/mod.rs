#![forbid(unsafe_code)]

pub mod buffer;
pub mod origin;

use std::collections::HashMap;
use std::io::{Read as _, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::term::buffer::ScrollbackBuffer;

const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 120;
const READ_CHUNK: usize = 4096;
const BROADCAST_CAPACITY: usize = 256;

// Wire frames for the attach channel: input flows client -> session,
// output session -> client, history session -> client once per buffered
// chunk on attach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermMessage {
    #[serde(rename = "type")]
    pub kind: TermMessageKind,
    pub data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TermMessageKind {
    Input,
    Output,
    History,
}

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub shell: String,
    pub scrollback_lines: usize,
    pub scrollback_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_owned(),
            scrollback_lines: 100,
            scrollback_bytes: 50_000,
        }
    }
}

// One long-lived shell under a PTY. Owned by the multiplexer; clients hold
// the session only through AttachHandle.
pub struct TerminalSession {
    id: String,
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    // Held so the PTY master outlives every attach cycle.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    scrollback: Mutex<ScrollbackBuffer>,
    output_tx: broadcast::Sender<String>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| AppError::Pty(format!("failed to write to pty: {e}")))
    }

    // Append and publish under the scrollback lock, so an attacher that
    // snapshots history and subscribes under the same lock sees every chunk
    // exactly once.
    fn record_output(&self, chunk: String) {
        let mut scrollback = self
            .scrollback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        scrollback.push(chunk.clone());
        let _ = self.output_tx.send(chunk);
    }

    fn kill(&self) {
        let _ = self
            .killer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .kill();
    }
}

// What a client holds while attached: the replayed history, a live output
// receiver, and a write path. Dropping it is a detach; the child shell and
// the scrollback stay.
pub struct AttachHandle {
    pub history: Vec<String>,
    pub output: broadcast::Receiver<String>,
    pub session: Arc<TerminalSession>,
}

#[derive(Debug)]
pub struct TerminalMultiplexer {
    cfg: TerminalConfig,
    sessions: Arc<Mutex<HashMap<String, Arc<TerminalSession>>>>,
}

impl TerminalMultiplexer {
    #[must_use]
    pub fn new(cfg: TerminalConfig) -> Self {
        Self {
            cfg,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // Ids are handed out eagerly; the child shell is created lazily on the
    // first attach.
    #[must_use]
    pub fn open(&self) -> String {
        let id = Uuid::new_v4().to_string();
        info!(session = id, "terminal session id allocated");
        id
    }

    pub fn attach(&self, id: &str) -> Result<AttachHandle> {
        if id.trim().is_empty() {
            return Err(AppError::SessionNotFound(id.to_owned()));
        }

        let session = {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match sessions.get(id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let created = self.spawn_session(id)?;
                    sessions.insert(id.to_owned(), Arc::clone(&created));
                    created
                }
            }
        };

        let (history, output) = {
            let scrollback = session
                .scrollback
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Subscribe while holding the scrollback lock: nothing can be
            // published between the snapshot and the subscription.
            let rx = session.output_tx.subscribe();
            (scrollback.history(), rx)
        };

        info!(session = id, replayed = history.len(), "client attached");
        Ok(AttachHandle {
            history,
            output,
            session,
        })
    }

    #[must_use]
    pub fn session_pid(&self, id: &str) -> Option<u32> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .and_then(|s| s.pid())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn spawn_session(&self, id: &str) -> Result<Arc<TerminalSession>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AppError::Pty(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.cfg.shell);
        cmd.env("TERM", "xterm-256color");
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AppError::Pty(format!("failed to spawn {}: {e}", self.cfg.shell)))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AppError::Pty(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AppError::Pty(format!("failed to take pty writer: {e}")))?;

        let (output_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let session = Arc::new(TerminalSession {
            id: id.to_owned(),
            pid,
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            _master: Mutex::new(pair.master),
            scrollback: Mutex::new(ScrollbackBuffer::new(
                self.cfg.scrollback_lines,
                self.cfg.scrollback_bytes,
            )),
            output_tx,
        });

        info!(session = id, pid, shell = %self.cfg.shell, "terminal child started");

        // Blocking PTY reads get their own OS thread. The session dies only
        // when the child exits; client churn never reaches this loop.
        let io_session = Arc::clone(&session);
        let table = Arc::clone(&self.sessions);
        let session_id = id.to_owned();
        std::thread::Builder::new()
            .name(format!("term-io-{id}"))
            .spawn(move || {
                let mut reader = reader;
                let mut child = child;
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                            io_session.record_output(chunk);
                        }
                    }
                }

                let status = child.wait();
                info!(session = %session_id, ?status, "terminal child exited");
                table
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&session_id);
            })
            .map_err(|e| AppError::Pty(format!("failed to spawn io thread: {e}")))?;

        Ok(session)
    }
}

impl Drop for TerminalMultiplexer {
    fn drop(&mut self) {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for session in sessions.values() {
            session.kill();
        }
        if !sessions.is_empty() {
            warn!(count = sessions.len(), "killed terminal children on shutdown");
        }
    }
}
