use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    CreateMessage, HubChannel, HubError, HubEvent, HubInvocation, HubRequest, HubTransport,
    TokenFactory, TransportSignal,
};
use crate::thread::{ThreadLease, ThreadStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting) => true,
            (Connecting | Reconnecting, Connected) => true,
            (Connecting | Connected | Reconnecting, Disconnected) => true,
            (Disconnected, Reconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

/// Applies a transition if the state machine allows it.
fn transition(
    status: &watch::Sender<ConnectionStatus>,
    next: ConnectionState,
    error: Option<String>,
) -> bool {
    status.send_if_modified(|current| {
        if !current.state.can_transition_to(next) {
            debug!(from = %current.state, to = %next, "ignoring transition");
            return false;
        }
        current.state = next;
        if error.is_some() {
            current.last_error = error;
        }
        true
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Replaced,
    Appended,
    MarkedRead,
    /// A new message arrived before the first thread load and was dropped.
    DroppedBeforeLoad,
    /// Presence update that did not include this connection's peer.
    PeerAbsent,
    /// The lease was revoked; nothing was applied.
    Inert,
}

/// Folds hub events into a thread through a lease.
///
/// `NewMessage` before the first `ReceiveMessageThread` is dropped: the server
/// pushes the whole thread on every (re)connect, and that push already
/// contains the message.
pub struct EventRouter {
    lease: ThreadLease,
    thread_loaded: bool,
}

impl EventRouter {
    pub fn new(lease: ThreadLease) -> Self {
        Self {
            lease,
            thread_loaded: false,
        }
    }

    pub fn lease(&self) -> &ThreadLease {
        &self.lease
    }

    pub fn route(&mut self, event: HubEvent) -> Routed {
        match event {
            HubEvent::ReceiveMessageThread(messages) => {
                if !self.lease.replace_all(messages) {
                    return Routed::Inert;
                }
                self.thread_loaded = true;
                Routed::Replaced
            }
            HubEvent::NewMessage(message) => {
                if !self.thread_loaded {
                    debug!(id = message.id, "thread not loaded yet, dropping new message");
                    return Routed::DroppedBeforeLoad;
                }
                if !self.lease.append(message) {
                    return Routed::Inert;
                }
                Routed::Appended
            }
            HubEvent::UpdatedGroup(group) => {
                if !group.contains(self.lease.peer()) {
                    return Routed::PeerAbsent;
                }
                if !self.lease.mark_read_if_recipient_present(&group) {
                    return Routed::Inert;
                }
                Routed::MarkedRead
            }
        }
    }
}

/// One open conversation with a peer.
pub struct LiveConnection {
    id: Uuid,
    peer: Arc<str>,
    channel: Arc<dyn HubChannel>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
    lease: ThreadLease,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl LiveConnection {
    /// Takes over `store` for `peer` and starts the transport. Must be called
    /// from within a tokio runtime.
    pub fn open(
        transport: &dyn HubTransport,
        store: &Arc<ThreadStore>,
        peer: &str,
        token: TokenFactory,
    ) -> Self {
        let id = Uuid::new_v4();
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Idle,
            last_error: None,
        });
        let status = Arc::new(status);
        transition(&status, ConnectionState::Connecting, None);

        let lease = store.lease(peer);
        let session = transport.open(HubRequest {
            peer_username: peer.to_string(),
            token,
        });

        let cancel = CancellationToken::new();
        let driver = tokio::spawn(dispatch(
            id,
            session.signals,
            EventRouter::new(lease.clone()),
            status.clone(),
            cancel.clone(),
        ));

        info!(%id, peer, "live connection opened");
        Self {
            id,
            peer: Arc::from(peer),
            channel: session.channel,
            status,
            cancel,
            lease,
            driver: Mutex::new(Some(driver)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the first successful handshake. Fails with the transport's
    /// reason if the connection drops first, or with `ConnectionClosed`.
    pub async fn wait_connected(&self) -> Result<(), HubError> {
        let mut rx = self.status.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                match status.state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => return Err(HubError::ConnectionClosed),
                    ConnectionState::Disconnected => {
                        let reason = status.last_error.clone().unwrap_or_default();
                        return Err(HubError::Disconnected(reason));
                    }
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(HubError::ConnectionClosed);
            }
        }
    }

    pub async fn send(&self, recipient_username: &str, content: &str) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed);
        }

        let invocation = HubInvocation::SendMessage(CreateMessage {
            recipient_username: recipient_username.to_string(),
            content: content.to_string(),
        });

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(HubError::ConnectionClosed),
            r = self.channel.invoke(invocation) => r,
        };

        result.map_err(|e| {
            warn!(id = %self.id, peer = %self.peer, error = %e, "send failed");
            match e {
                HubError::ConnectionClosed => HubError::ConnectionClosed,
                HubError::SendFailed(cause) | HubError::Disconnected(cause) => {
                    HubError::SendFailed(cause)
                }
            }
        })
    }

    /// Makes the connection inert: no further events reach the thread and
    /// `send` fails. Returns once the dispatch task has finished.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.lease.revoke();
        transition(&self.status, ConnectionState::Closed, None);
        self.channel.stop().await;

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = driver {
            if let Err(e) = handle.await {
                warn!(id = %self.id, error = %e, "dispatch task failed");
            }
        }
        info!(id = %self.id, peer = %self.peer, "live connection closed");
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.lease.revoke();
        }
    }
}

async fn dispatch(
    id: Uuid,
    mut signals: mpsc::Receiver<TransportSignal>,
    mut router: EventRouter,
    status: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            signal = signals.recv() => signal,
        };

        let Some(signal) = signal else {
            transition(
                &status,
                ConnectionState::Disconnected,
                Some("transport ended".to_string()),
            );
            break;
        };

        match signal {
            TransportSignal::Connected => {
                if transition(&status, ConnectionState::Connected, None) {
                    info!(%id, "connected");
                }
            }
            TransportSignal::Disconnected { reason } => {
                warn!(%id, %reason, "disconnected");
                transition(&status, ConnectionState::Disconnected, Some(reason));
            }
            TransportSignal::Reconnecting { attempt } => {
                info!(%id, attempt, "reconnecting");
                transition(&status, ConnectionState::Reconnecting, None);
            }
            TransportSignal::Event(event) => {
                let name = event.name();
                let routed = router.route(event);
                debug!(%id, event = name, ?routed, "routed hub event");
            }
        }
    }
    debug!(%id, "dispatch finished");
}
