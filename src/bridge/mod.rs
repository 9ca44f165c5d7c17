//! Emulator bridge: acknowledged command protocol to the embedded script.
//!
//! The client listens on an ephemeral loopback port; the script running
//! inside the emulator dials in (it discovers the port through the
//! supervisor's side-channel file). A newly accepted connection displaces
//! the previous one, which covers the script reconnecting after an emulator
//! crash or relaunch.
//!
//! # Sequential delivery
//!
//! Commands are strictly sequential: a send gate admits one request at a
//! time and holds it until the outcome is known (ack, nack, timeout,
//! disconnect, cancellation), so a second command never reaches the wire
//! while the first is unresolved. The protocol carries no pipelining, and
//! interleaved acks would be ambiguous.
//!
//! # Readiness
//!
//! A live TCP connection does not mean the script can take commands; only
//! its `HELLO` line does. The readiness flag drops on disconnect and when
//! the supervisor observes the emulator process exit.

pub mod protocol;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use protocol::PeerLine;

/// How long a sent command may wait for its ack.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before re-polling the listener after an accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Typed failure of one bridge request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The script rejected the command.
    #[error("peer rejected command: {0}")]
    Nack(String),
    /// No ack arrived within the window.
    #[error("timed out waiting for ack")]
    Timeout,
    /// The connection dropped while the request was pending (or none exists).
    #[error("emulator link disconnected")]
    Disconnected,
    /// The session is shutting down.
    #[error("bridge closed")]
    Closed,
}

/// Unsolicited input from the script, forwarded to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The script (re)initialized and is ready for commands.
    Hello,
    /// A telemetry event line, verbatim.
    Line(String),
}

/// Styled on-screen message shown inside the emulator.
#[derive(Debug, Clone, Default)]
pub struct StyledMessage {
    /// Message text.
    pub text: String,
    /// Screen position keyword (e.g. `topleft`), peer default when empty.
    pub position: Option<String>,
    /// Display duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Foreground color, `#rrggbb`.
    pub foreground: Option<String>,
    /// Background color, `#rrggbb`.
    pub background: Option<String>,
}

impl StyledMessage {
    /// Message with default styling.
    #[must_use]
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn to_args(&self) -> Vec<String> {
        vec![
            self.text.clone(),
            self.position.clone().unwrap_or_default(),
            self.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
            self.foreground.clone().unwrap_or_default(),
            self.background.clone().unwrap_or_default(),
        ]
    }
}

/// The single outstanding command awaiting its ack.
struct PendingRequest {
    id: u64,
    raw_line: String,
    sent_at: Instant,
    attempts: u32,
    reply_tx: oneshot::Sender<Result<(), BridgeError>>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("raw_line", &self.raw_line)
            .field("sent_at", &self.sent_at)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

struct Inner {
    port: u16,
    /// Line sender of the active connection's writer task.
    writer_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Single pending slot -- the bridge is strictly sequential.
    pending: Mutex<Option<PendingRequest>>,
    /// Admits one request at a time; held until the outcome is known.
    send_gate: tokio::sync::Mutex<()>,
    /// True only between a HELLO and the next disconnect/peer exit.
    ready: AtomicBool,
    /// Bumped per accepted connection; guards stale reader cleanup.
    conn_gen: AtomicU64,
    next_id: AtomicU64,
}

/// Handle to the bridge. Cheap to clone via `Arc` at the call sites.
pub struct EmulatorBridge {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmulatorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorBridge")
            .field("port", &self.inner.port)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl EmulatorBridge {
    /// Bind the loopback listener and spawn the accept loop.
    ///
    /// Returns the bridge handle and the stream of unsolicited peer events.
    pub async fn bind(cancel: CancellationToken) -> Result<(Self, mpsc::Receiver<BridgeEvent>)> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("binding bridge listener")?;
        let port = listener.local_addr()?.port();

        let (events_tx, events_rx) = mpsc::channel(32);
        let inner = Arc::new(Inner {
            port,
            writer_tx: Mutex::new(None),
            pending: Mutex::new(None),
            send_gate: tokio::sync::Mutex::new(()),
            ready: AtomicBool::new(false),
            conn_gen: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&inner), events_tx, cancel));

        log::info!("[Bridge] listening on 127.0.0.1:{port}");
        Ok((Self { inner }, events_rx))
    }

    /// The loopback port the script must dial.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// True only after a HELLO with the connection still up.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Supervisor notification: the emulator process is gone, so logical
    /// readiness is gone too even if the socket has not dropped yet.
    pub fn mark_peer_down(&self) {
        if self.inner.ready.swap(false, Ordering::SeqCst) {
            log::info!("[Bridge] peer process exited, readiness cleared");
        }
    }

    /// Pause emulation.
    pub async fn pause(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        self.request("pause", &[], cancel).await
    }

    /// Resume emulation.
    pub async fn resume(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        self.request("resume", &[], cancel).await
    }

    /// Switch to another game/instance. An empty `game` keeps the current
    /// ROM and only swaps the state context.
    pub async fn swap(
        &self,
        game: &str,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        self.request("swap", &[game, instance_id], cancel).await
    }

    /// Save the current state into the archive for `instance_id`.
    pub async fn save(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        self.request("save", &[instance_id], cancel).await
    }

    /// Restart the script's session context (fresh state, nothing loaded).
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        self.request("restart", &[], cancel).await
    }

    /// Show a styled on-screen message.
    pub async fn show_message(
        &self,
        message: &StyledMessage,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let args = message.to_args();
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.request("message", &refs, cancel).await
    }

    /// Tell the script to re-read its plugin settings.
    pub async fn reload_plugins(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        self.request("reload_plugins", &[], cancel).await
    }

    /// Enable or disable the script's periodic autosave.
    pub async fn set_autosave(
        &self,
        enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let flag = if enabled { "on" } else { "off" };
        self.request("autosave", &[flag], cancel).await
    }

    /// Send one command and wait for its outcome.
    async fn request(
        &self,
        verb: &str,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        // One request in flight at a time; held until the outcome is known
        let _gate = self.inner.send_gate.lock().await;

        if cancel.is_cancelled() {
            return Err(BridgeError::Closed);
        }

        let writer = self
            .inner
            .writer_tx
            .lock()
            .expect("writer lock poisoned")
            .clone()
            .ok_or(BridgeError::Disconnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let line = protocol::encode_command(id, verb, args);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            debug_assert!(pending.is_none(), "send gate admitted a second request");
            *pending = Some(PendingRequest {
                id,
                raw_line: line.clone(),
                sent_at: Instant::now(),
                attempts: 1,
                reply_tx,
            });
        }

        if writer.send(format!("{line}\n")).is_err() {
            self.abandon_pending("connection gone before write");
            return Err(BridgeError::Disconnected);
        }
        log::debug!("[Bridge] sent #{id} {verb}");

        tokio::select! {
            reply = reply_rx => reply.unwrap_or(Err(BridgeError::Disconnected)),
            () = tokio::time::sleep(ACK_TIMEOUT) => {
                self.abandon_pending("ack timeout");
                Err(BridgeError::Timeout)
            }
            () = cancel.cancelled() => {
                self.abandon_pending("cancelled");
                Err(BridgeError::Closed)
            }
        }
    }

    fn abandon_pending(&self, why: &str) {
        let taken = self.inner.pending.lock().expect("pending lock poisoned").take();
        if let Some(req) = taken {
            log::debug!(
                "[Bridge] request #{} ({}) abandoned after {:?}, attempt {}: {why}",
                req.id,
                req.raw_line,
                req.sent_at.elapsed(),
                req.attempts,
            );
        }
    }
}

/// Resolve the pending request matching `id`, if any.
fn resolve_pending(inner: &Inner, id: u64, result: Result<(), BridgeError>) {
    let taken = {
        let mut pending = inner.pending.lock().expect("pending lock poisoned");
        match pending.as_ref() {
            Some(req) if req.id == id => pending.take(),
            _ => None,
        }
    };
    match taken {
        Some(req) => {
            log::debug!("[Bridge] request #{id} resolved after {:?}", req.sent_at.elapsed());
            let _ = req.reply_tx.send(result);
        }
        None => log::debug!("[Bridge] stray ack/nack for #{id}"),
    }
}

/// Resolve whatever is pending, regardless of id. Used on disconnect and
/// shutdown so callers are never left blocked.
fn fail_pending(inner: &Inner, error: BridgeError) {
    let taken = inner.pending.lock().expect("pending lock poisoned").take();
    if let Some(req) = taken {
        log::debug!(
            "[Bridge] request #{} failed after {:?}: {error}",
            req.id,
            req.sent_at.elapsed()
        );
        let _ = req.reply_tx.send(Err(error));
    }
}

async fn accept_loop(
    listener: TcpListener,
    inner: Arc<Inner>,
    events_tx: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::info!("[Bridge] script connected from {addr}");
                    install_connection(&inner, stream, events_tx.clone(), cancel.clone());
                }
                Err(e) => {
                    log::warn!("[Bridge] accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    // In-flight requests resolve immediately on shutdown, not via timeout
    *inner.writer_tx.lock().expect("writer lock poisoned") = None;
    inner.ready.store(false, Ordering::SeqCst);
    fail_pending(&inner, BridgeError::Closed);
    log::info!("[Bridge] listener stopped");
}

/// Wire up a freshly accepted connection, displacing the previous one.
fn install_connection(
    inner: &Arc<Inner>,
    stream: tokio::net::TcpStream,
    events_tx: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
) {
    let generation = inner.conn_gen.fetch_add(1, Ordering::SeqCst) + 1;

    // The displaced connection's request can never be answered now
    inner.ready.store(false, Ordering::SeqCst);
    fail_pending(inner, BridgeError::Disconnected);

    let (read_half, write_half) = stream.into_split();
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

    // Replacing the sender drops the old writer task's queue, which closes
    // the displaced socket
    *inner.writer_tx.lock().expect("writer lock poisoned") = Some(line_tx);

    tokio::spawn(writer_task(line_rx, write_half));
    tokio::spawn(reader_task(
        read_half,
        generation,
        Arc::clone(inner),
        events_tx,
        cancel,
    ));
}

async fn writer_task(mut line_rx: mpsc::UnboundedReceiver<String>, mut write_half: OwnedWriteHalf) {
    while let Some(line) = line_rx.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            log::debug!("[Bridge] write failed: {e}");
            break;
        }
    }
}

async fn reader_task(
    read_half: OwnedReadHalf,
    generation: u64,
    inner: Arc<Inner>,
    events_tx: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("[Bridge] read failed: {e}");
                        break;
                    }
                };
                match protocol::parse_line(&line) {
                    Some(PeerLine::Ack { id }) => resolve_pending(&inner, id, Ok(())),
                    Some(PeerLine::Nack { id, reason }) => {
                        resolve_pending(&inner, id, Err(BridgeError::Nack(reason)));
                    }
                    Some(PeerLine::Ping { ts }) => {
                        // Liveness answer goes straight out, not via the
                        // command queue
                        send_raw(&inner, &protocol::encode_pong(&ts));
                    }
                    Some(PeerLine::Hello) => {
                        log::info!("[Bridge] HELLO received, peer ready");
                        inner.ready.store(true, Ordering::SeqCst);
                        if events_tx.send(BridgeEvent::Hello).await.is_err() {
                            break;
                        }
                    }
                    Some(PeerLine::Event { raw }) => {
                        if events_tx.send(BridgeEvent::Line(raw)).await.is_err() {
                            break;
                        }
                    }
                    None => log::debug!("[Bridge] unrecognized line: {line}"),
                }
            }
        }
    }

    // Only the still-current connection may clear shared state; a displaced
    // reader must not clobber its replacement
    if inner.conn_gen.load(Ordering::SeqCst) == generation {
        *inner.writer_tx.lock().expect("writer lock poisoned") = None;
        inner.ready.store(false, Ordering::SeqCst);
        fail_pending(&inner, BridgeError::Disconnected);
        log::info!("[Bridge] script disconnected");
    }
}

fn send_raw(inner: &Inner, line: &str) {
    let writer = inner.writer_tx.lock().expect("writer lock poisoned").clone();
    if let Some(writer) = writer {
        let _ = writer.send(format!("{line}\n"));
    }
}
