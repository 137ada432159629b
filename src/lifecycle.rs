use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::hub::{ConnectionStatus, HubError, HubTransport, LiveConnection, TokenFactory};
use crate::thread::ThreadStore;

/// Keeps at most one [`LiveConnection`] writing into a [`ThreadStore`].
pub struct ConnectionManager {
    store: Arc<ThreadStore>,
    transport: Arc<dyn HubTransport>,
    token: TokenFactory,
    current: Mutex<Option<Arc<LiveConnection>>>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<ThreadStore>,
        transport: Arc<dyn HubTransport>,
        token: TokenFactory,
    ) -> Self {
        Self {
            store,
            transport,
            token,
            current: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ThreadStore> {
        &self.store
    }

    /// Closes the open conversation, if any, and opens one with `peer`. The
    /// previous connection has fully stopped before the new one starts.
    pub async fn switch_to(&self, peer: &str) -> watch::Receiver<ConnectionStatus> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            info!(from = previous.peer(), to = peer, "switching conversation");
            previous.close().await;
        }

        let conn = Arc::new(LiveConnection::open(
            self.transport.as_ref(),
            &self.store,
            peer,
            self.token.clone(),
        ));
        let status = conn.status();
        *current = Some(conn);
        status
    }

    pub async fn close(&self) {
        let previous = self.current.lock().await.take();
        if let Some(conn) = previous {
            conn.close().await;
        }
    }

    pub async fn current(&self) -> Option<Arc<LiveConnection>> {
        self.current.lock().await.clone()
    }

    pub async fn current_peer(&self) -> Option<String> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|c| c.peer().to_string())
    }

    pub async fn send(&self, recipient_username: &str, content: &str) -> Result<(), HubError> {
        let conn = self.current().await.ok_or(HubError::ConnectionClosed)?;
        conn.send(recipient_username, content).await
    }
}
