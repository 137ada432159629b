use std::sync::Arc;

use tracing::info;

use crate::api::{MembersApi, MessagesApi};
use crate::cache::QueryCache;
use crate::config::Config;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::hub::signalr::SignalRTransport;
use crate::hub::{HubTransport, TokenFactory};
use crate::lifecycle::ConnectionManager;
use crate::thread::ThreadStore;
use crate::types::User;

/// Everything that lives for one login: caches, API clients, the open
/// thread and its connection. Dropped on logout.
pub struct Session {
    user: User,
    pub members: MembersApi,
    pub messages: MessagesApi,
    pub conversations: ConnectionManager,
}

impl Session {
    pub fn new(
        config: &Config,
        user: User,
        http: Arc<dyn HttpClient>,
        transport: Arc<dyn HubTransport>,
    ) -> Self {
        let cache = Arc::new(QueryCache::with_capacity(config.cache_capacity));
        let token = user.token.clone();
        let token: TokenFactory = Arc::new(move || token.clone());

        info!(username = %user.username, "session started");
        Self {
            members: MembersApi::new(http.clone(), cache, &user),
            messages: MessagesApi::new(http),
            conversations: ConnectionManager::new(
                Arc::new(ThreadStore::new()),
                transport,
                token,
            ),
            user,
        }
    }

    /// Wires the reqwest and websocket transports from `config`.
    pub fn connect(config: &Config, user: User) -> Self {
        let http = Arc::new(ReqwestHttpClient::new(
            config.api_url.clone(),
            user.token.clone(),
        ));
        let transport = Arc::new(SignalRTransport::new(config.signalr()));
        Self::new(config, user, http, transport)
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn thread(&self) -> &Arc<ThreadStore> {
        self.conversations.store()
    }

    /// Logout: stops the live connection and forgets cached pages.
    pub async fn end(self) {
        self.conversations.close().await;
        self.members.cache().clear();
        info!(username = %self.user.username, "session ended");
    }
}
