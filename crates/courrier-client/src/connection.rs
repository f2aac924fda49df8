//! Client transport connection.
//!
//! Owns one bidirectional event link to the server and the explicit
//! lifecycle around it: `Disconnected → Connecting → Connected →
//! Reconnecting → Connected | Disconnected`. The state machine runs in a
//! spawned task driven by a command channel; the underlying socket is
//! abstracted behind [`Transport`] so reconnection semantics are testable
//! with an in-memory link.
//!
//! While reconnecting, subscribe/send/read intents are buffered and
//! replayed in order once the link is back. Typing intents are the
//! exception: a stale typing signal must never be replayed, so they are
//! dropped on the floor during any outage.

use std::collections::VecDeque;
use std::future::Future;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use courrier_shared::constants::{COMMAND_QUEUE_CAPACITY, OUTBOUND_QUEUE_CAPACITY};
use courrier_shared::error::ClientError;
use courrier_shared::protocol::{ClientEvent, ServerEvent};
use courrier_shared::types::{ChannelId, CorrelationId, MessageId, UserId};

use crate::backoff::Backoff;

/// One attempt at establishing a live link for `identity`.
///
/// `AuthRejected` is terminal; any other error counts as a transport
/// failure and feeds the backoff schedule.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        identity: UserId,
    ) -> impl Future<Output = Result<TransportLink, ClientError>> + Send;
}

/// The two halves of an established link.
pub struct TransportLink {
    pub outgoing: mpsc::Sender<ClientEvent>,
    pub incoming: mpsc::Receiver<ServerEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

enum Command {
    Send(ClientEvent),
    Close,
}

enum Disposition {
    /// Explicit close or handle dropped.
    Closed,
    /// Transport failure; the reconnect loop takes over.
    Dropped(String),
}

/// Handle to a running connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

/// Establish a connection and spawn its state machine.
///
/// The first attempt is awaited so an `AuthRejected` surfaces directly to
/// the caller; automatic reconnection covers failures after that.
pub async fn connect<T: Transport>(
    transport: T,
    identity: UserId,
) -> Result<(ConnectionHandle, mpsc::Receiver<ServerEvent>), ClientError> {
    connect_with_backoff(transport, identity, Backoff::default()).await
}

pub async fn connect_with_backoff<T: Transport>(
    transport: T,
    identity: UserId,
    backoff: Backoff,
) -> Result<(ConnectionHandle, mpsc::Receiver<ServerEvent>), ClientError> {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

    let link = match transport.connect(identity).await {
        Ok(link) => link,
        Err(e) => {
            let _ = state_tx.send(ConnectionState::Disconnected);
            return Err(e);
        }
    };
    let _ = state_tx.send(ConnectionState::Connected);
    info!(identity = %identity, "Connected");

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    tokio::spawn(run_connection(
        transport, identity, link, backoff, cmd_rx, event_tx, state_tx,
    ));

    Ok((ConnectionHandle { cmd_tx, state_rx }, event_rx))
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the state machine reaches `target`. Returns immediately
    /// if it is already there; returns on task exit either way.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Queue a raw event. Buffered if the link is down; fails only once
    /// the connection is terminally closed.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Send(event))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    pub async fn subscribe_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.send(ClientEvent::SubscribeChannel { channel_id }).await
    }

    pub async fn unsubscribe_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.send(ClientEvent::UnsubscribeChannel { channel_id })
            .await
    }

    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        content: String,
        correlation_id: CorrelationId,
    ) -> Result<(), ClientError> {
        self.send(ClientEvent::SendMessage {
            channel_id,
            content,
            correlation_id,
        })
        .await
    }

    pub async fn typing_start(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.send(ClientEvent::TypingStart { channel_id }).await
    }

    pub async fn typing_stop(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.send(ClientEvent::TypingStop { channel_id }).await
    }

    pub async fn mark_read(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), ClientError> {
        self.send(ClientEvent::MarkRead {
            channel_id,
            message_id,
        })
        .await
    }

    /// Terminal close. Cancels any in-flight reconnect backoff.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

async fn run_connection<T: Transport>(
    transport: T,
    identity: UserId,
    mut link: TransportLink,
    mut backoff: Backoff,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ServerEvent>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut pending: VecDeque<ClientEvent> = VecDeque::new();

    loop {
        // Replay intents buffered during the outage, oldest first. A
        // failure here means the fresh link is already dead.
        let mut replay_failed = false;
        while let Some(event) = pending.pop_front() {
            if link.outgoing.send(event.clone()).await.is_err() {
                pending.push_front(event);
                replay_failed = true;
                break;
            }
        }

        if !replay_failed {
            let _ = state_tx.send(ConnectionState::Connected);
            match drive_link(&mut link, &mut cmd_rx, &event_tx, &mut pending).await {
                Disposition::Closed => {
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    info!(identity = %identity, "Connection closed");
                    return;
                }
                Disposition::Dropped(reason) => {
                    warn!(identity = %identity, reason = %reason, "Transport dropped");
                }
            }
        }

        let _ = state_tx.send(ConnectionState::Reconnecting);
        match reconnect(&transport, identity, &mut backoff, &mut cmd_rx, &mut pending).await {
            Some(new_link) => {
                link = new_link;
                backoff.reset();
                info!(identity = %identity, buffered = pending.len(), "Reconnected");
            }
            None => {
                let _ = state_tx.send(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

/// Pump the live link until it drops or the handle closes.
async fn drive_link(
    link: &mut TransportLink,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<ServerEvent>,
    pending: &mut VecDeque<ClientEvent>,
) -> Disposition {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(event)) => {
                    if link.outgoing.send(event.clone()).await.is_err() {
                        buffer_intent(pending, event);
                        return Disposition::Dropped("outgoing link closed".to_string());
                    }
                }
                Some(Command::Close) | None => return Disposition::Closed,
            },
            incoming = link.incoming.recv() => match incoming {
                Some(event) => {
                    if event_tx.send(event).await.is_err() {
                        // Consumer dropped the event receiver.
                        return Disposition::Closed;
                    }
                }
                None => return Disposition::Dropped("incoming link closed".to_string()),
            },
        }
    }
}

/// Retry the transport under the backoff schedule, buffering intents and
/// honoring close while waiting. `None` means the machine is done: the
/// handle closed, or the server rejected the identity.
async fn reconnect<T: Transport>(
    transport: &T,
    identity: UserId,
    backoff: &mut Backoff,
    cmd_rx: &mut mpsc::Receiver<Command>,
    pending: &mut VecDeque<ClientEvent>,
) -> Option<TransportLink> {
    loop {
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect attempt");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(event)) => buffer_intent(pending, event),
                    Some(Command::Close) | None => {
                        info!("Close during reconnect, giving up");
                        return None;
                    }
                },
            }
        }

        match transport.connect(identity).await {
            Ok(link) => {
                // Commands that queued up while the attempt was in flight
                // were still issued during the outage; apply the buffering
                // rules to them before going live.
                while let Ok(cmd) = cmd_rx.try_recv() {
                    match cmd {
                        Command::Send(event) => buffer_intent(pending, event),
                        Command::Close => {
                            info!("Close during reconnect, giving up");
                            return None;
                        }
                    }
                }
                return Some(link);
            }
            Err(ClientError::AuthRejected) => {
                warn!(identity = %identity, "Identity rejected during reconnect");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "Reconnect attempt failed");
            }
        }
    }
}

fn buffer_intent(pending: &mut VecDeque<ClientEvent>, event: ClientEvent) {
    if is_typing(&event) {
        debug!("Dropping typing intent during outage");
        return;
    }
    pending.push_back(event);
}

fn is_typing(event: &ClientEvent) -> bool {
    matches!(
        event,
        ClientEvent::TypingStart { .. } | ClientEvent::TypingStop { .. }
    )
}
