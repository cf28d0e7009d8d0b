//! Local terminal resources backed by portable-pty.
//!
//! Each resource id owns one long-lived child process in a pseudo-terminal.
//! `connect` attaches a frame channel to it: data frames are written to the
//! PTY, resize frames resize it, and PTY output comes back as data frames.
//! A resource whose process has exited is dormant until woken.

use super::{TerminalResource, UpstreamConnection, UpstreamEndpoint, UPSTREAM_CHANNEL_CAPACITY};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tabrelay_core::frame::{self, FrameTag, Geometry};
use tabrelay_core::{RelayError, RelayResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// Output frames held while no channel is connected. A fresh upstream channel
/// has room for all of them.
const BACKLOG_CAPACITY: usize = UPSTREAM_CHANNEL_CAPACITY;

/// Routes PTY output, as data frames, to the one connected channel.
///
/// The reader thread blocks while the channel is full, so a connected relay
/// sees every byte in order. Output produced while nothing is connected is
/// kept in a bounded backlog and handed to the next connection first.
#[derive(Default)]
struct OutputRoute {
    inner: Mutex<RouteInner>,
}

#[derive(Default)]
struct RouteInner {
    sink: Option<mpsc::Sender<Vec<u8>>>,
    backlog: VecDeque<Vec<u8>>,
    closed: bool,
}

impl OutputRoute {
    fn lock(&self) -> std::sync::MutexGuard<'_, RouteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one frame. Blocks the calling thread while the connected
    /// channel is full; must not run on the async runtime.
    fn deliver(&self, mut frame: Vec<u8>) {
        loop {
            let sink = {
                let mut inner = self.lock();
                match inner.sink.clone() {
                    Some(sink) => sink,
                    None => {
                        if inner.backlog.len() == BACKLOG_CAPACITY {
                            inner.backlog.pop_front();
                        }
                        inner.backlog.push_back(frame);
                        return;
                    }
                }
            };
            match sink.blocking_send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The relay dropped this channel; detach it unless a newer
                    // connection has already replaced it.
                    let mut inner = self.lock();
                    if inner
                        .sink
                        .as_ref()
                        .is_some_and(|current| current.same_channel(&sink))
                    {
                        inner.sink = None;
                    }
                    frame = returned;
                }
            }
        }
    }

    /// Make `sink` the connected channel, replacing any previous one. The
    /// backlog is flushed into it first. Returns false once the process has
    /// exited.
    fn connect(&self, sink: mpsc::Sender<Vec<u8>>) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        while let Some(frame) = inner.backlog.pop_front() {
            if let Err(e) = sink.try_send(frame) {
                warn!(error = %e, "PTY backlog did not fit the upstream channel");
                break;
            }
        }
        inner.sink = Some(sink);
        true
    }

    /// End of output: the connected channel is dropped so the relay sees the
    /// upstream close.
    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.sink = None;
        inner.backlog.clear();
    }
}

/// One running child process in a PTY.
struct PtyProcess {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Master for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send>>,
    output: Arc<OutputRoute>,
    exited: Arc<AtomicBool>,
}

impl PtyProcess {
    fn spawn(command: Option<&str>, geometry: Geometry) -> RelayResult<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(geometry))
            .map_err(|e| RelayError::Start(format!("failed to open PTY: {e}")))?;

        let mut cmd = if let Some(command) = command {
            let parts: Vec<&str> = command.split_whitespace().collect();
            let Some((program, args)) = parts.split_first() else {
                return Err(RelayError::Config("empty command".into()));
            };
            let mut builder = CommandBuilder::new(program);
            builder.args(args);
            builder
        } else {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            CommandBuilder::new(shell)
        };
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RelayError::Start(format!("failed to spawn command: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RelayError::Start(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RelayError::Start(format!("failed to take PTY writer: {e}")))?;

        let output = Arc::new(OutputRoute::default());
        let exited = Arc::new(AtomicBool::new(false));
        spawn_reader(reader, output.clone(), exited.clone());

        info!(
            columns = geometry.columns,
            rows = geometry.rows,
            "PTY spawned"
        );

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            output,
            exited,
        })
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    fn resize(&self, geometry: Geometry) -> RelayResult<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(pty_size(geometry))
            .map_err(|e| RelayError::Other(format!("PTY resize failed: {e}")))?;
        debug!(columns = geometry.columns, rows = geometry.rows, "PTY resized");
        Ok(())
    }

    async fn write(&self, data: Vec<u8>) -> RelayResult<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| RelayError::Other(format!("join error: {e}")))?
        .map_err(RelayError::Io)
    }

    fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.kill() {
            debug!(error = %e, "PTY child kill failed");
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
    }
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.columns,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Pump PTY output into the route until EOF.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output: Arc<OutputRoute>,
    exited: Arc<AtomicBool>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.deliver(frame::encode_data(&buf[..n])),
                Err(e) => {
                    debug!(error = %e, "PTY read ended");
                    break;
                }
            }
        }
        exited.store(true, Ordering::SeqCst);
        output.close();
        info!("PTY child exited");
    });
}

/// Terminal resources running as local PTY processes.
pub struct PtyResource {
    command: Option<String>,
    geometry: Geometry,
    processes: Mutex<HashMap<String, Arc<PtyProcess>>>,
}

impl PtyResource {
    /// `command` of `None` runs the user's default shell.
    pub fn new(command: Option<String>) -> Self {
        Self {
            command,
            geometry: Geometry {
                columns: 80,
                rows: 24,
            },
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn live_process(&self, resource_id: &str) -> Option<Arc<PtyProcess>> {
        let processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        processes
            .get(resource_id)
            .filter(|p| p.is_alive())
            .cloned()
    }

    /// Spawn the process for `resource_id` unless a live one exists.
    fn ensure_process(&self, resource_id: &str) -> RelayResult<()> {
        let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        if processes.get(resource_id).is_some_and(|p| p.is_alive()) {
            return Ok(());
        }
        let process = PtyProcess::spawn(self.command.as_deref(), self.geometry)?;
        processes.insert(resource_id.to_string(), Arc::new(process));
        Ok(())
    }

    /// Kill and forget the process for `resource_id`.
    pub fn remove(&self, resource_id: &str) {
        let removed = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource_id);
        if let Some(process) = removed {
            process.kill();
        }
    }
}

impl TerminalResource for PtyResource {
    fn start<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move { self.ensure_process(resource_id) })
    }

    fn connect<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<UpstreamConnection>> + Send + 'a>> {
        Box::pin(async move {
            let process = self
                .live_process(resource_id)
                .ok_or_else(|| RelayError::Connect(format!("{resource_id} is not running")))?;

            let (conn, endpoint) = UpstreamConnection::pair(UPSTREAM_CHANNEL_CAPACITY);
            let UpstreamEndpoint {
                mut from_relay,
                to_relay,
            } = endpoint;

            // PTY -> relay runs on the reader thread.
            if !process.output.connect(to_relay) {
                return Err(RelayError::Connect(format!("{resource_id} has exited")));
            }

            // relay -> PTY
            tokio::spawn(async move {
                while let Some(raw) = from_relay.recv().await {
                    let parsed = match frame::parse(&raw) {
                        Ok(f) => f,
                        Err(_) => continue,
                    };
                    let result = match parsed.tag {
                        FrameTag::Data => process.write(parsed.payload.to_vec()).await,
                        FrameTag::Resize => {
                            frame::decode_resize(parsed.payload).and_then(|g| process.resize(g))
                        }
                        FrameTag::Other(tag) => {
                            debug!(tag, "ignoring frame for PTY");
                            Ok(())
                        }
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "PTY input failed");
                        if !process.is_alive() {
                            break;
                        }
                    }
                }
            });

            Ok(conn)
        })
    }

    fn wake<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            info!(resource_id, "respawning dormant PTY");
            self.ensure_process(resource_id)
                .map_err(|e| RelayError::Wake(e.to_string()))
        })
    }

    fn release<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.remove(resource_id);
            debug!(resource_id, "PTY released");
            Ok(())
        })
    }
}
