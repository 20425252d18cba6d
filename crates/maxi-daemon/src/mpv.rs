/// mpv transport over JSON IPC.
///
/// Architecture:
///
/// ```text
///   MpvDriver::ensure_running()        one mpv process, reused across sessions
///   MpvDriver::connect()               one IPC client per playback session
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → session channel
///                                                                   │
///                              run_session() ← translate() ─────────┘
///                                    └── TransportEvent → player core
/// ```
///
/// Property observations are per IPC client in mpv, so dropping the session
/// connection unregisters every observer the session installed.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use maxi_proto::protocol::TransportStatus;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportEvent};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_ICY_TITLE: u64 = 2;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to one IPC connection's writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        self.set_volume(volume).await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, vol: f32) -> anyhow::Result<()> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    /// Register the observations a playback session needs.  mpv pushes the
    /// current value right away, then a property-change on every change.
    pub async fn observe_session_properties(&self) -> anyhow::Result<()> {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_ICY_TITLE, "metadata/by-key/icy-title"),
        ];
        for (id, name) in &props {
            self.send(json!(["observe_property", id, name])).await?;
            debug!("mpv: observe_property id={} name={}", id, name);
        }
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and opens IPC connections to it.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new(initial_volume: f32) -> Self {
        Self {
            socket_name: maxi_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: initial_volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    /// Make sure an mpv instance is listening on our IPC endpoint, spawning
    /// one if neither our child nor a leftover instance answers.
    pub async fn ensure_running(&mut self) -> anyhow::Result<()> {
        if self.process_alive() {
            return Ok(());
        }
        if open_ipc(&self.socket_name).await.is_ok() {
            info!("mpv: reusing instance already listening on {}", self.socket_name);
            return Ok(());
        }

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;

        info!("mpv: spawning new process");
        let mpv_binary = maxi_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(maxi_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if open_ipc(&self.socket_name).await.is_ok() {
                info!("mpv: IPC endpoint is up");
                return Ok(());
            }
        }
        anyhow::bail!("mpv IPC endpoint did not appear")
    }

    /// Open a fresh IPC client.  Unsolicited events for this client are sent
    /// to `event_tx`; the reader task ends when the connection closes.
    pub async fn connect(&self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        let stream = open_ipc(&self.socket_name).await?;
        Ok(start_io_tasks(stream, event_tx))
    }
}

#[cfg(unix)]
async fn open_ipc(name: &str) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(name).await
}

#[cfg(windows)]
async fn open_ipc(
    name: &str,
) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(format!(r"\\.\pipe\{}", name))
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);

    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader / writer tasks ─────────────────────────────────────────────────────

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                    continue;
                };

                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                    continue;
                };
                let result = match val["error"].as_str() {
                    Some("success") => Ok(val),
                    other => Err(anyhow::anyhow!(
                        "mpv error: {}",
                        other.unwrap_or("unknown error")
                    )),
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    // closing our half makes mpv drop the client, which ends the reader
    let _ = writer.shutdown().await;
    debug!("mpv writer: task exiting");
}

// ── status translation ────────────────────────────────────────────────────────

/// Map one mpv event onto the transport vocabulary.  `ready` tells whether
/// `ReadyToPlay` was already reported for this session.
pub fn translate(evt: &MpvEvent, ready: bool) -> Option<TransportEvent> {
    if let Some((id, data)) = evt.as_property_change() {
        return match id {
            OBS_CORE_IDLE if !ready && data.as_bool() == Some(false) => {
                Some(TransportEvent::Status(TransportStatus::ReadyToPlay))
            }
            OBS_ICY_TITLE => data
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| TransportEvent::Metadata(s.to_string())),
            _ => None,
        };
    }

    match evt.event_name()? {
        "end-file" => {
            let reason = evt
                .raw
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            match reason {
                // we asked for it, or mpv is following a playlist entry
                "stop" | "redirect" => None,
                "error" | "network" => {
                    let detail = match evt.raw.get("file_error").and_then(Value::as_str) {
                        Some(err) => format!("{}: {}", reason, err),
                        None => reason.to_string(),
                    };
                    Some(TransportEvent::Status(TransportStatus::Failed(detail)))
                }
                _ => Some(TransportEvent::Status(TransportStatus::Unknown)),
            }
        }
        _ => None,
    }
}

/// Pump one session's mpv events into transport events until the stream
/// fails, the readiness deadline passes, or the connection ends.  A title
/// seen before the stream is ready is held back and sent right after
/// `ReadyToPlay`.
async fn run_session(
    mut mpv_rx: mpsc::Receiver<MpvEvent>,
    events: mpsc::Sender<TransportEvent>,
    connect_timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + connect_timeout;
    let mut ready = false;
    let mut held_title: Option<String> = None;
    loop {
        let next = if ready {
            mpv_rx.recv().await
        } else {
            match tokio::time::timeout_at(deadline, mpv_rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("mpv: no audio after {}s", connect_timeout.as_secs());
                    let _ = events
                        .send(TransportEvent::Status(TransportStatus::Unknown))
                        .await;
                    return;
                }
            }
        };

        let Some(evt) = next else {
            debug!("mpv: session connection closed");
            let _ = events
                .send(TransportEvent::Status(TransportStatus::Failed(
                    "mpv IPC connection closed".to_string(),
                )))
                .await;
            return;
        };

        let Some(out) = translate(&evt, ready) else {
            continue;
        };
        // mpv reports the stream title on open, before audio starts
        if !ready {
            if let TransportEvent::Metadata(title) = out {
                held_title = Some(title);
                continue;
            }
        }
        let terminal = matches!(
            out,
            TransportEvent::Status(TransportStatus::Unknown | TransportStatus::Failed(_))
        );
        let became_ready = out == TransportEvent::Status(TransportStatus::ReadyToPlay);
        if events.send(out).await.is_err() || terminal {
            return;
        }
        if became_ready {
            ready = true;
            if let Some(title) = held_title.take() {
                if events.send(TransportEvent::Metadata(title)).await.is_err() {
                    return;
                }
            }
        }
    }
}

// ── Transport impl ────────────────────────────────────────────────────────────

struct MpvSession {
    handle: MpvHandle,
    translator: JoinHandle<()>,
}

pub struct MpvTransport {
    driver: MpvDriver,
    session: Option<MpvSession>,
    connect_timeout: Duration,
}

impl MpvTransport {
    pub fn new(initial_volume: f32, connect_timeout: Duration) -> Self {
        Self {
            driver: MpvDriver::new(initial_volume),
            session: None,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for MpvTransport {
    async fn open(
        &mut self,
        url: &str,
        volume: f32,
        events: mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<()> {
        if self.session.is_some() {
            self.release().await?;
        }

        self.driver.last_volume = volume;
        self.driver.ensure_running().await?;

        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = self.driver.connect(mpv_tx).await?;
        let translator = tokio::spawn(run_session(mpv_rx, events, self.connect_timeout));
        self.session = Some(MpvSession {
            handle: handle.clone(),
            translator,
        });

        handle.load_stream(url, volume).await?;
        handle.observe_session_properties().await?;
        info!("mpv: loading {}", url);
        Ok(())
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session.translator.abort();
        session.handle.stop().await
    }

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()> {
        self.driver.last_volume = volume;
        if let Some(session) = &self.session {
            session.handle.set_volume(volume).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.release().await {
            debug!("mpv: release on shutdown failed: {}", e);
        }
        self.driver.kill().await;
    }
}
