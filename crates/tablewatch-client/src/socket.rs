//! The shared socket task.
//!
//! One task per client owns the WebSocket. Channels talk to it through
//! [`SocketCmd`]s on an unbounded command queue; it answers by publishing
//! channel state on `watch` channels and pushing [`ChannelEvent`]s onto each
//! channel's bounded delivery queue.
//!
//! The socket is opened lazily when the first channel subscribes, rejoins
//! every live channel after a reconnect, and stays idle once the last
//! channel leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as Frame;

use tablewatch_proto::{
    ChangeEventRecord, FilterDescriptor, JoinPayload, JoinResponse, Message, MessageKind,
    PostgresChangesPayload, PHOENIX_TOPIC,
};

use crate::channel::ChannelState;
use crate::config::ClientConfig;
use crate::connection::{dial, send_message, ConnectionState, WsStream};
use crate::delivery::ChannelEvent;
use crate::error::Error;

/// Used in place of a heartbeat deadline when heartbeats are disabled.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Commands sent from client and channel handles to the socket task.
pub(crate) enum SocketCmd {
    /// Join a topic and start routing its changes.
    Join {
        join_ref: String,
        topic: String,
        filters: Vec<FilterDescriptor>,
        event_tx: mpsc::Sender<ChannelEvent>,
        state_tx: watch::Sender<ChannelState>,
    },
    /// Leave a previously joined topic.
    Leave {
        join_ref: String,
        done_tx: oneshot::Sender<()>,
    },
    /// Leave everything and stop the task.
    Shutdown { done_tx: oneshot::Sender<()> },
}

struct JoinEntry {
    topic: String,
    filters: Vec<FilterDescriptor>,
    event_tx: mpsc::Sender<ChannelEvent>,
    state_tx: watch::Sender<ChannelState>,
    joined: bool,
}

impl JoinEntry {
    fn set_state(&self, state: ChannelState) {
        tracing::debug!(topic = %self.topic, state = ?state, "channel state changed");
        self.state_tx.send_replace(state);
    }
}

/// Heartbeat schedule for one open socket.
struct Heartbeat {
    every: Duration,
    next: Instant,
    /// Ref of the heartbeat awaiting its reply.
    pending: Option<String>,
}

impl Heartbeat {
    fn new(interval: Duration) -> Self {
        let every = if interval.is_zero() { FAR_FUTURE } else { interval };
        Self {
            every,
            next: Instant::now() + every,
            pending: None,
        }
    }

    fn is_due(&self) -> bool {
        Instant::now() >= self.next
    }
}

enum Outcome {
    Lost(Error),
    Shutdown,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct SocketTask {
    config: ClientConfig,
    cmd_rx: mpsc::UnboundedReceiver<SocketCmd>,
    refs: Arc<AtomicU64>,
    entries: HashMap<String, JoinEntry>,
    conn_state: watch::Sender<ConnectionState>,
}

impl SocketTask {
    pub(crate) fn new(
        config: ClientConfig,
        cmd_rx: mpsc::UnboundedReceiver<SocketCmd>,
        refs: Arc<AtomicU64>,
        conn_state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            config,
            cmd_rx,
            refs,
            entries: HashMap::new(),
            conn_state,
        }
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn set_connection(&self, state: ConnectionState) {
        self.conn_state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Run until shutdown or until every handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.entries.is_empty() {
                self.set_connection(ConnectionState::Disconnected);
                let Some(cmd) = self.cmd_rx.recv().await else {
                    break;
                };
                if let Flow::Stop = self.apply_offline(cmd) {
                    return;
                }
                continue;
            }

            self.set_connection(ConnectionState::Connecting);
            let error = match dial(&self.config).await {
                Ok(stream) => {
                    attempt = 0;
                    self.set_connection(ConnectionState::Connected);
                    tracing::info!(channels = self.entries.len(), "realtime socket connected");
                    match self.drive(stream).await {
                        Outcome::Shutdown => return,
                        Outcome::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.set_connection(ConnectionState::Disconnected);
            for entry in self.entries.values_mut() {
                entry.joined = false;
                entry.set_state(ChannelState::Subscribed);
            }

            let policy = self.config.reconnect.clone();
            if !error.is_retryable() || !policy.allows(attempt) {
                tracing::error!(error = %error, attempts = attempt, "giving up on realtime socket");
                self.fail_all(&error);
                attempt = 0;
                continue;
            }

            let delay = policy.delay_for(attempt);
            attempt += 1;
            tracing::warn!(
                error = %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "realtime socket unavailable, reconnecting"
            );
            if let Flow::Stop = self.backoff(delay).await {
                return;
            }
        }

        self.finish();
    }

    /// Wait out a reconnect delay while still serving commands.
    async fn backoff(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Flow::Stop = self.apply_offline(cmd) {
                            return Flow::Stop;
                        }
                    }
                    None => {
                        self.finish();
                        return Flow::Stop;
                    }
                },
                _ = &mut sleep => return Flow::Continue,
            }
        }
    }

    /// Apply a command while no socket is open.
    fn apply_offline(&mut self, cmd: SocketCmd) -> Flow {
        match cmd {
            SocketCmd::Join {
                join_ref,
                topic,
                filters,
                event_tx,
                state_tx,
            } => {
                tracing::debug!(topic = %topic, join_ref = %join_ref, "join queued");
                self.entries.insert(
                    join_ref,
                    JoinEntry {
                        topic,
                        filters,
                        event_tx,
                        state_tx,
                        joined: false,
                    },
                );
            }
            SocketCmd::Leave { join_ref, done_tx } => {
                if let Some(entry) = self.entries.remove(&join_ref) {
                    tracing::info!(topic = %entry.topic, "channel left");
                    entry.set_state(ChannelState::Closed);
                }
                let _ = done_tx.send(());
            }
            SocketCmd::Shutdown { done_tx } => {
                self.finish();
                let _ = done_tx.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Serve one open socket until it is lost or the client shuts down.
    async fn drive(&mut self, mut ws: WsStream) -> Outcome {
        let pending: Vec<String> = self.entries.keys().cloned().collect();
        for join_ref in pending {
            if let Err(e) = self.send_join(&mut ws, &join_ref).await {
                return Outcome::Lost(e);
            }
        }

        let mut heartbeat = Heartbeat::new(self.config.heartbeat_interval);

        loop {
            // Frames go before the heartbeat timer: a reply may already be
            // buffered behind a full delivery queue.
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SocketCmd::Join { join_ref, topic, filters, event_tx, state_tx }) => {
                        self.entries.insert(
                            join_ref.clone(),
                            JoinEntry { topic, filters, event_tx, state_tx, joined: false },
                        );
                        if let Err(e) = self.send_join(&mut ws, &join_ref).await {
                            return Outcome::Lost(e);
                        }
                    }
                    Some(SocketCmd::Leave { join_ref, done_tx }) => {
                        if let Some(entry) = self.entries.remove(&join_ref) {
                            let leave = Message::leave(&entry.topic, &self.next_ref(), &join_ref);
                            if let Err(e) = send_message(&mut ws, &leave).await {
                                tracing::debug!(topic = %entry.topic, error = %e, "leave not sent");
                            }
                            tracing::info!(topic = %entry.topic, "channel left");
                            entry.set_state(ChannelState::Closed);
                        }
                        let _ = done_tx.send(());
                    }
                    Some(SocketCmd::Shutdown { done_tx }) => {
                        self.close(&mut ws).await;
                        let _ = done_tx.send(());
                        return Outcome::Shutdown;
                    }
                    None => {
                        self.close(&mut ws).await;
                        return Outcome::Shutdown;
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        self.handle_text(&text, &mut heartbeat.pending).await;
                        // A steady stream of frames keeps the timer branch from
                        // running; send due heartbeats from here too.
                        if heartbeat.pending.is_none() && heartbeat.is_due() {
                            if let Err(e) = self.send_heartbeat(&mut ws, &mut heartbeat).await {
                                return Outcome::Lost(e);
                            }
                        }
                    }
                    Some(Ok(Frame::Ping(payload))) => {
                        if let Err(e) = ws.send(Frame::Pong(payload)).await {
                            return Outcome::Lost(Error::Connection(format!("failed to send pong: {}", e)));
                        }
                    }
                    Some(Ok(Frame::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "no close frame".to_string());
                        return Outcome::Lost(Error::Connection(format!("server closed socket: {}", reason)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Outcome::Lost(Error::Connection(format!("socket read failed: {}", e)));
                    }
                    None => {
                        return Outcome::Lost(Error::Connection("socket stream ended".to_string()));
                    }
                },
                _ = tokio::time::sleep_until(heartbeat.next) => {
                    if let Some(stale) = heartbeat.pending.take() {
                        return Outcome::Lost(Error::Connection(format!(
                            "heartbeat {} not acknowledged",
                            stale
                        )));
                    }
                    if let Err(e) = self.send_heartbeat(&mut ws, &mut heartbeat).await {
                        return Outcome::Lost(e);
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self, ws: &mut WsStream, heartbeat: &mut Heartbeat) -> Result<(), Error> {
        let msg_ref = self.next_ref();
        send_message(ws, &Message::heartbeat(&msg_ref)).await?;
        tracing::trace!(msg_ref = %msg_ref, "heartbeat sent");
        heartbeat.pending = Some(msg_ref);
        heartbeat.next = Instant::now() + heartbeat.every;
        Ok(())
    }

    async fn send_join(&self, ws: &mut WsStream, join_ref: &str) -> Result<(), Error> {
        let Some(entry) = self.entries.get(join_ref) else {
            return Ok(());
        };
        let payload = JoinPayload::new(&entry.filters).with_access_token(self.config.join_token());
        let join = Message::join(&entry.topic, join_ref, &payload)?;
        send_message(ws, &join).await?;
        tracing::debug!(topic = %entry.topic, join_ref, filters = entry.filters.len(), "join sent");
        Ok(())
    }

    async fn handle_text(&mut self, text: &str, pending_heartbeat: &mut Option<String>) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match message.kind() {
            MessageKind::Reply => self.handle_reply(message, pending_heartbeat).await,
            MessageKind::PostgresChanges => self.route_change(message).await,
            MessageKind::Close => self.end_topic(&message, ChannelState::Closed),
            MessageKind::Error => self.end_topic(
                &message,
                ChannelState::Errored("channel crashed on server".to_string()),
            ),
            MessageKind::System => {
                let status = message.payload.get("status").and_then(|v| v.as_str());
                let detail = message
                    .payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if status == Some("error") {
                    tracing::warn!(topic = %message.topic, detail, "server reported channel error");
                } else {
                    tracing::debug!(topic = %message.topic, detail, "system message");
                }
            }
            MessageKind::Presence | MessageKind::Other => {
                tracing::trace!(topic = %message.topic, event = %message.event, "ignoring message");
            }
        }
    }

    async fn handle_reply(&mut self, message: Message, pending_heartbeat: &mut Option<String>) {
        if message.topic == PHOENIX_TOPIC {
            if message.msg_ref.is_some() && message.msg_ref == *pending_heartbeat {
                *pending_heartbeat = None;
                tracing::trace!("heartbeat acknowledged");
            }
            return;
        }

        let Some(msg_ref) = message.msg_ref.clone() else {
            return;
        };
        let reply = match message.reply() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "malformed reply");
                return;
            }
        };

        if !reply.is_ok() {
            let reason = reply.reason();
            if let Some(entry) = self.entries.remove(&msg_ref) {
                tracing::warn!(topic = %entry.topic, reason = %reason, "channel join rejected");
                entry.set_state(ChannelState::Errored(format!("join rejected: {}", reason)));
            }
            return;
        }

        let Some(entry) = self.entries.get_mut(&msg_ref) else {
            return;
        };
        if entry.joined {
            return;
        }

        let ids = match JoinResponse::from_value(reply.response) {
            Ok(response) => response.binding_ids(),
            Err(e) => {
                tracing::warn!(topic = %entry.topic, error = %e, "unreadable join response");
                Vec::new()
            }
        };
        entry.joined = true;
        tracing::info!(topic = %entry.topic, bindings = ids.len(), "channel joined");
        entry.set_state(ChannelState::Active);
        if entry.event_tx.send(ChannelEvent::Joined(ids)).await.is_err() {
            tracing::debug!(topic = %entry.topic, "delivery task gone");
        }
    }

    async fn route_change(&mut self, message: Message) {
        let payload = match PostgresChangesPayload::from_value(message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "malformed change payload");
                return;
            }
        };
        let ids = payload.ids;
        let record = ChangeEventRecord::from(payload.data);
        tracing::debug!(
            topic = %message.topic,
            table = %record.table,
            event = %record.event_type,
            "change received"
        );

        let mut routed = 0;
        for (join_ref, entry) in &self.entries {
            if entry.topic != message.topic || !entry.joined {
                continue;
            }
            if message.join_ref.as_ref().is_some_and(|r| r != join_ref) {
                continue;
            }
            let event = ChannelEvent::Change {
                ids: ids.clone(),
                record: record.clone(),
            };
            if entry.event_tx.send(event).await.is_err() {
                tracing::debug!(topic = %entry.topic, "delivery task gone");
            }
            routed += 1;
        }

        if routed == 0 {
            tracing::debug!(topic = %message.topic, "change for a topic with no joined channel");
        }
    }

    /// The server ended a topic; drop its entries.
    fn end_topic(&mut self, message: &Message, state: ChannelState) {
        let ended: Vec<String> = self
            .entries
            .iter()
            .filter(|(join_ref, entry)| {
                entry.topic == message.topic
                    && message.join_ref.as_ref().map_or(true, |r| r == *join_ref)
            })
            .map(|(join_ref, _)| join_ref.clone())
            .collect();

        for join_ref in ended {
            if let Some(entry) = self.entries.remove(&join_ref) {
                tracing::warn!(topic = %entry.topic, event = %message.event, "channel ended by server");
                entry.set_state(state.clone());
            }
        }
    }

    /// Leave every channel and close the socket.
    async fn close(&mut self, ws: &mut WsStream) {
        let joined: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.joined)
            .map(|(join_ref, entry)| (join_ref.clone(), entry.topic.clone()))
            .collect();
        for (join_ref, topic) in joined {
            let leave = Message::leave(topic, &self.next_ref(), &join_ref);
            if send_message(ws, &leave).await.is_err() {
                break;
            }
        }
        let _ = ws.close(None).await;
        self.finish();
    }

    /// Close every channel and mark the client closed.
    fn finish(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.set_state(ChannelState::Closed);
        }
        self.set_connection(ConnectionState::Closed);
        tracing::info!("realtime socket task stopped");
    }

    fn fail_all(&mut self, error: &Error) {
        for (_, entry) in self.entries.drain() {
            entry.set_state(ChannelState::Errored(error.to_string()));
        }
    }
}
