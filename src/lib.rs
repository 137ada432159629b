//! Client-side sync for a chat service: cached paginated queries and a live
//! per-peer message thread fed by a reconnecting hub connection.

pub mod api;
pub mod cache;
pub mod config;
pub mod fetcher;
pub mod http_client;
pub mod hub;
pub mod lifecycle;
pub mod params;
pub mod session;
pub mod thread;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::QueryCache;
pub use config::Config;
pub use fetcher::{FetchError, PaginatedFetcher};
pub use hub::{ConnectionState, HubError, HubEvent, LiveConnection};
pub use lifecycle::ConnectionManager;
pub use session::Session;
pub use thread::{ThreadSnapshot, ThreadStore};
pub use types::{CacheEntry, GroupMembership, Message, PaginationMeta, QueryKey, User};
