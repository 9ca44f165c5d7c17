//! Reconnecting duplex channel to the coordination server.
//!
//! One background task owns the WebSocket for its whole life: dial, drain
//! the outbound queue, decode inbound commands, tear down on any read/write
//! error, sleep a fixed backoff, redial. The queue lives outside the
//! connection, so messages enqueued while offline go out after the next
//! successful dial, in order.
//!
//! Inbound commands are handed to the registered handler's own bounded
//! queue with `try_send`. A slow consumer sheds messages (logged) instead of
//! stalling the protocol read loop; it never reorders them.
//!
//! Delivery is only guaranteed once written to a live connection. Callers
//! that need confirmation use the ack/nack mechanics inside the command
//! payloads, not the transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::ws;

/// Fixed pause between dial attempts and after a dropped connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Outbound queue capacity.
const OUTBOUND_CAPACITY: usize = 64;

/// Why a send did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The transport has been stopped.
    #[error("transport stopped")]
    Closed,
    /// The queue did not accept the message within the deadline.
    #[error("send deadline elapsed before the queue accepted the message")]
    Timeout,
    /// The session was cancelled while waiting.
    #[error("send cancelled")]
    Cancelled,
}

type HandlerSlot = Arc<Mutex<Option<mpsc::Sender<Command>>>>;

/// Handle to the logical server channel.
#[derive(Debug)]
pub struct ServerTransport {
    outbound_tx: mpsc::Sender<Command>,
    handler: HandlerSlot,
    cancel: CancellationToken,
}

impl ServerTransport {
    /// Start the connection loop against `server_url`, identifying as
    /// `player` after each successful dial.
    #[must_use]
    pub fn start(server_url: String, player: String, cancel: CancellationToken) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handler: HandlerSlot = Arc::new(Mutex::new(None));

        tokio::spawn(run_loop(
            server_url,
            player,
            Arc::clone(&handler),
            outbound_rx,
            cancel.clone(),
        ));

        Self {
            outbound_tx,
            handler,
            cancel,
        }
    }

    /// Install the inbound sink. Decoded commands are pushed into it with
    /// `try_send`; when it is full, messages are dropped and logged.
    pub fn register_handler(&self, sink: mpsc::Sender<Command>) {
        *self.handler.lock().expect("handler lock poisoned") = Some(sink);
    }

    /// Clone of the outbound queue sender, for collaborators that reply
    /// over the same channel.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Command> {
        self.outbound_tx.clone()
    }

    /// Enqueue an outbound command. Fails only once the transport stopped.
    pub async fn send(&self, cmd: Command) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound_tx.send(cmd).await.map_err(|_| SendError::Closed)
    }

    /// Enqueue with a deadline, distinguishing a full queue from
    /// cancellation.
    pub async fn send_with_timeout(&self, cmd: Command, deadline: Duration) -> Result<(), SendError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(SendError::Cancelled),
            result = tokio::time::timeout(deadline, self.outbound_tx.send(cmd)) => match result {
                Err(_elapsed) => Err(SendError::Timeout),
                Ok(Err(_closed)) => Err(SendError::Closed),
                Ok(Ok(())) => Ok(()),
            },
        }
    }
}

/// Channel endpoint under the server base URL.
fn build_channel_url(server_url: &str) -> String {
    format!("{}/api/channel", ws::http_to_ws_scheme(server_url.trim_end_matches('/')))
}

/// Why the per-connection loop returned.
enum LoopExit {
    /// Cancellation requested.
    Shutdown,
    /// Connection lost; redial.
    Disconnected,
}

async fn run_loop(
    server_url: String,
    player: String,
    handler: HandlerSlot,
    mut outbound_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    let url = build_channel_url(&server_url);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        log::info!("[Transport] connecting to {url}");
        match ws::connect(&url).await {
            Ok((mut writer, mut reader)) => {
                log::info!("[Transport] connected");

                // Identify this player before anything else goes out
                let hello = Command::hello(&player);
                if let Err(e) = writer.send_text(&hello.encode()).await {
                    log::warn!("[Transport] greeting failed: {e}");
                } else {
                    let exit = run_connected(
                        &mut writer,
                        &mut reader,
                        &mut outbound_rx,
                        &handler,
                        &cancel,
                    )
                    .await;
                    if let LoopExit::Shutdown = exit {
                        break;
                    }
                    log::info!("[Transport] disconnected, redialing in {RECONNECT_DELAY:?}");
                }
            }
            Err(e) => {
                log::warn!("[Transport] connect failed: {e} (retry in {RECONNECT_DELAY:?})");
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }

    log::info!("[Transport] stopped");
}

async fn run_connected(
    writer: &mut ws::WsWriter,
    reader: &mut ws::WsReader,
    outbound_rx: &mut mpsc::Receiver<Command>,
    handler: &HandlerSlot,
    cancel: &CancellationToken,
) -> LoopExit {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = writer.close().await;
                return LoopExit::Shutdown;
            }

            message = reader.recv() => match message {
                Some(Ok(ws::WsMessage::Text(text))) => match Command::decode(&text) {
                    Ok(cmd) => dispatch_inbound(handler, cmd),
                    Err(e) => log::warn!("[Transport] undecodable message: {e}"),
                },
                Some(Ok(ws::WsMessage::Ping(data))) => {
                    if writer.send_pong(data).await.is_err() {
                        return LoopExit::Disconnected;
                    }
                }
                Some(Ok(ws::WsMessage::Close { code, reason })) => {
                    log::info!("[Transport] server closed connection ({code}: {reason})");
                    return LoopExit::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("[Transport] read error: {e}");
                    return LoopExit::Disconnected;
                }
                None => {
                    log::info!("[Transport] stream ended");
                    return LoopExit::Disconnected;
                }
            },

            cmd = outbound_rx.recv() => match cmd {
                Some(cmd) => {
                    if let Err(e) = writer.send_text(&cmd.encode()).await {
                        log::warn!("[Transport] write failed: {e}");
                        return LoopExit::Disconnected;
                    }
                }
                None => return LoopExit::Shutdown,
            },
        }
    }
}

/// Hand an inbound command to the registered handler, shedding on overload.
fn dispatch_inbound(handler: &HandlerSlot, cmd: Command) {
    let guard = handler.lock().expect("handler lock poisoned");
    match guard.as_ref() {
        Some(sink) => {
            if let Err(e) = sink.try_send(cmd) {
                match e {
                    mpsc::error::TrySendError::Full(cmd) => {
                        // Back-pressure resolves by shedding, never by
                        // blocking the read loop
                        log::warn!("[Transport] handler queue full, dropping {:?} ({})", cmd.cmd, cmd.id);
                    }
                    mpsc::error::TrySendError::Closed(cmd) => {
                        log::warn!("[Transport] handler gone, dropping {:?} ({})", cmd.cmd, cmd.id);
                    }
                }
            }
        }
        None => log::debug!("[Transport] no handler registered, dropping {:?}", cmd.cmd),
    }
}
