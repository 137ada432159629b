//! Live, peer-scoped message channel.
//!
//! A [`HubTransport`] owns the wire: connecting, reconnecting with backoff and
//! decoding frames. It reports everything it observes as [`TransportSignal`]s
//! over one channel, in receive order. [`LiveConnection`] consumes those
//! signals, drives the connection state machine and folds events into the
//! thread.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{GroupMembership, Message};

mod connection;
pub mod protocol;
pub mod signalr;

pub use connection::{ConnectionState, ConnectionStatus, EventRouter, LiveConnection, Routed};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("disconnected: {0}")]
    Disconnected(String),
}

/// Server-pushed events, one variant per hub method the client handles.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    ReceiveMessageThread(Vec<Message>),
    NewMessage(Message),
    UpdatedGroup(GroupMembership),
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::ReceiveMessageThread(_) => "ReceiveMessageThread",
            HubEvent::NewMessage(_) => "NewMessage",
            HubEvent::UpdatedGroup(_) => "UpdatedGroup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    pub recipient_username: String,
    pub content: String,
}

/// Client-to-server hub calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubInvocation {
    SendMessage(CreateMessage),
}

impl HubInvocation {
    pub fn target(&self) -> &'static str {
        match self {
            HubInvocation::SendMessage(_) => "SendMessage",
        }
    }

    pub fn arguments(&self) -> Result<Vec<Value>, serde_json::Error> {
        match self {
            HubInvocation::SendMessage(msg) => Ok(vec![serde_json::to_value(msg)?]),
        }
    }
}

/// What a transport observed, in the order it observed it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    Event(HubEvent),
}

/// Produces a fresh access token. Called once per connection attempt.
pub type TokenFactory = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct HubRequest {
    pub peer_username: String,
    pub token: TokenFactory,
}

impl fmt::Debug for HubRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubRequest")
            .field("peer_username", &self.peer_username)
            .finish_non_exhaustive()
    }
}

/// Outbound half of an opened hub session.
#[async_trait]
pub trait HubChannel: Send + Sync {
    /// Resolves once the server acknowledges the call.
    async fn invoke(&self, invocation: HubInvocation) -> Result<(), HubError>;

    /// Stops the session. No signals are produced afterwards.
    async fn stop(&self);
}

pub struct HubSession {
    pub signals: mpsc::Receiver<TransportSignal>,
    pub channel: Arc<dyn HubChannel>,
}

pub trait HubTransport: Send + Sync {
    /// Starts connecting in the background and returns immediately.
    fn open(&self, request: HubRequest) -> HubSession;
}
