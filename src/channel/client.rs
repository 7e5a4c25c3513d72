//! Progress channel clients.
//!
//! Two roles share the reconnect policy: [`subscribe`] consumes ordered
//! progress for one session (the UI side and tests), and
//! [`ProgressPublisher`] pushes stage transitions from the worker into the
//! server. Both reconnect only on abnormal closure, with a fixed delay and
//! a bounded attempt count; exhausting the bound surfaces a single
//! connectivity error instead of retrying forever.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{is_system_message, should_reconnect, ChannelTuning, PING_TEXT};
use crate::models::progress::{ProgressMessage, ProgressStatus};
use crate::{AppError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Events surfaced to a subscriber.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A user-facing (non-system) progress update.
    Progress(ProgressMessage),
    /// Terminal success; carries the result payload. Emitted exactly once.
    Completed(ProgressMessage),
    /// Terminal failure. Emitted exactly once.
    Failed(ProgressMessage),
    /// Reconnect budget exhausted. Emitted exactly once, then the stream
    /// ends.
    ConnectivityLost {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Open a subscriber channel for `session_id` and stream its events.
///
/// System messages (keepalive tags, housekeeping phrases) reset the
/// client's liveness window but are never surfaced. The task ends after a
/// terminal event, a normal closure, or connectivity loss.
#[must_use]
pub fn subscribe(
    url: String,
    session_id: String,
    tuning: ChannelTuning,
) -> mpsc::Receiver<ChannelEvent> {
    let (events, rx) = mpsc::channel(32);
    tokio::spawn(subscriber_task(url, session_id, tuning, events));
    rx
}

async fn subscriber_task(
    url: String,
    session_id: String,
    tuning: ChannelTuning,
    events: mpsc::Sender<ChannelEvent>,
) {
    let mut attempts: u32 = 0;

    loop {
        let ws = match connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!(%err, session_id, "channel connect failed");
                if !back_off(&mut attempts, &tuning, &events).await {
                    return;
                }
                continue;
            }
        };

        attempts = 0;
        info!(session_id, "subscriber channel connected");

        match run_subscriber(ws, &session_id, tuning, &events).await {
            ConnectionOutcome::Finished => return,
            ConnectionOutcome::Dropped => {
                if !back_off(&mut attempts, &tuning, &events).await {
                    return;
                }
            }
        }
    }
}

/// Why one connection ended.
enum ConnectionOutcome {
    /// Terminal message delivered or normal closure; do not reconnect.
    Finished,
    /// Abnormal closure; the reconnect policy applies.
    Dropped,
}

async fn run_subscriber(
    ws: WsStream,
    session_id: &str,
    tuning: ChannelTuning,
    events: &mpsc::Sender<ChannelEvent>,
) -> ConnectionOutcome {
    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval(tuning.ping_interval);
    ping.tick().await;
    let mut last_seen = tokio::time::Instant::now();
    // Liveness window: the server's own keepalives arrive well within
    // three ping intervals unless the connection is dead.
    let liveness = tuning.ping_interval * 3;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = tokio::time::Instant::now();
                        let Ok(message) = serde_json::from_str::<ProgressMessage>(&text) else {
                            debug!(session_id, "ignoring unparseable frame");
                            continue;
                        };
                        if is_system_message(&message) {
                            // Housekeeping refreshes liveness, nothing more.
                            continue;
                        }
                        match message.status {
                            ProgressStatus::Completed => {
                                let _ = events.send(ChannelEvent::Completed(message)).await;
                                let _ = sink.close().await;
                                return ConnectionOutcome::Finished;
                            }
                            ProgressStatus::Error => {
                                let _ = events.send(ChannelEvent::Failed(message)).await;
                                let _ = sink.close().await;
                                return ConnectionOutcome::Finished;
                            }
                            _ => {
                                if events.send(ChannelEvent::Progress(message)).await.is_err() {
                                    // Consumer gone; tear down quietly.
                                    let _ = sink.close().await;
                                    return ConnectionOutcome::Finished;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        if should_reconnect(code) {
                            debug!(session_id, ?code, "abnormal close");
                            return ConnectionOutcome::Dropped;
                        }
                        return ConnectionOutcome::Finished;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, session_id, "subscriber socket error");
                        return ConnectionOutcome::Dropped;
                    }
                    None => return ConnectionOutcome::Dropped,
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > liveness {
                    warn!(session_id, "liveness window passed without traffic");
                    return ConnectionOutcome::Dropped;
                }
                let ping_frame = ProgressMessage::keepalive(session_id, PING_TEXT);
                if send_json(&mut sink, &ping_frame).await.is_err() {
                    return ConnectionOutcome::Dropped;
                }
            }
        }
    }
}

/// Apply the reconnect policy. Returns `false` once the budget is spent,
/// after emitting [`ChannelEvent::ConnectivityLost`] exactly once.
async fn back_off(
    attempts: &mut u32,
    tuning: &ChannelTuning,
    events: &mpsc::Sender<ChannelEvent>,
) -> bool {
    if *attempts >= tuning.max_reconnect_attempts {
        warn!(attempts = *attempts, "reconnect budget exhausted");
        let _ = events
            .send(ChannelEvent::ConnectivityLost {
                attempts: *attempts,
            })
            .await;
        return false;
    }
    *attempts += 1;
    tokio::time::sleep(tuning.reconnect_delay).await;
    true
}

/// Worker-side publisher handle.
///
/// Owns a background task holding the socket so keepalive pings keep
/// flowing while a long pipeline stage is silent. Messages are sent in
/// order; a dropped connection is re-established (bounded attempts) and
/// the in-flight message is retried on the new connection.
#[derive(Debug)]
pub struct ProgressPublisher {
    outbound: mpsc::Sender<ProgressMessage>,
    task: JoinHandle<Result<()>>,
}

impl ProgressPublisher {
    /// Connect a publisher channel for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Connectivity` if the initial connection cannot
    /// be established within the reconnect budget.
    pub async fn connect(url: String, session_id: String, tuning: ChannelTuning) -> Result<Self> {
        let ws = connect_with_budget(&url, &tuning).await?;
        let (outbound, queue) = mpsc::channel(32);
        let task = tokio::spawn(publisher_task(ws, url, session_id, tuning, queue));
        Ok(Self { outbound, task })
    }

    /// Queue a progress message for delivery.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the publisher task has already
    /// stopped.
    pub async fn send(&self, message: ProgressMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| AppError::Channel("publisher channel closed".into()))
    }

    /// Drain queued messages, close the socket normally, and report the
    /// task's outcome.
    ///
    /// # Errors
    ///
    /// Propagates any connectivity error the background task hit.
    pub async fn finish(self) -> Result<()> {
        drop(self.outbound);
        self.task
            .await
            .map_err(|err| AppError::Channel(format!("publisher task panicked: {err}")))?
    }
}

async fn connect_with_budget(url: &str, tuning: &ChannelTuning) -> Result<WsStream> {
    let mut attempts: u32 = 0;
    loop {
        match connect_async(url).await {
            Ok((ws, _)) => return Ok(ws),
            Err(err) => {
                if attempts >= tuning.max_reconnect_attempts {
                    return Err(AppError::Connectivity(format!(
                        "could not reach progress channel after {attempts} attempts: {err}"
                    )));
                }
                attempts += 1;
                warn!(%err, attempts, "publisher connect failed; retrying");
                tokio::time::sleep(tuning.reconnect_delay).await;
            }
        }
    }
}

async fn publisher_task(
    ws: WsStream,
    url: String,
    session_id: String,
    tuning: ChannelTuning,
    mut queue: mpsc::Receiver<ProgressMessage>,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval(tuning.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            queued = queue.recv() => {
                let Some(message) = queued else {
                    // Caller finished; close cleanly.
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "done".into(),
                    }))).await;
                    return Ok(());
                };
                let terminal = message.status.is_terminal();
                if let Err(err) = send_json(&mut sink, &message).await {
                    debug!(%err, session_id, "publisher send failed; reconnecting");
                    let ws = connect_with_budget(&url, &tuning).await?;
                    (sink, stream) = ws.split();
                    send_json(&mut sink, &message)
                        .await
                        .map_err(|err| AppError::Connectivity(err.to_string()))?;
                }
                if terminal {
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "terminal".into(),
                    }))).await;
                    return Ok(());
                }
            }
            _ = ping.tick() => {
                let ping_frame = ProgressMessage::keepalive(&session_id, PING_TEXT);
                if let Err(err) = send_json(&mut sink, &ping_frame).await {
                    debug!(%err, session_id, "publisher ping failed; reconnecting");
                    let ws = connect_with_budget(&url, &tuning).await?;
                    (sink, stream) = ws.split();
                }
            }
            inbound = stream.next() => {
                match inbound {
                    // Pong echoes and server keepalives only refresh the
                    // connection; nothing to route.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, session_id, "publisher socket error; reconnecting");
                        let ws = connect_with_budget(&url, &tuning).await?;
                        (sink, stream) = ws.split();
                    }
                    None => {
                        let ws = connect_with_budget(&url, &tuning).await?;
                        (sink, stream) = ws.split();
                    }
                }
            }
        }
    }
}

async fn send_json(
    sink: &mut WsSink,
    message: &ProgressMessage,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(message).map_err(|err| {
        tokio_tungstenite::tungstenite::Error::Io(std::io::Error::other(err))
    })?;
    sink.send(Message::Text(json)).await
}
