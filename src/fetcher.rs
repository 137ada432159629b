use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::http_client::{HttpClient, TransportError};
use crate::params::{derive_key, KeyError, QueryParams};
use crate::types::{CacheEntry, PaginationMeta};

pub const PAGINATION_HEADER: &str = "pagination";

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    FetchFailed(#[from] TransportError),
    #[error("malformed pagination header: {0}")]
    MalformedPaginationHeader(String),
    #[error("unexpected response body: {0}")]
    Decode(serde_json::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Reads the out-of-band pagination descriptor. A missing header is not an
/// error; one that is present but unreadable is.
pub fn parse_pagination(headers: &HeaderMap) -> Result<Option<PaginationMeta>, FetchError> {
    let Some(raw) = headers.get(PAGINATION_HEADER) else {
        return Ok(None);
    };
    let text = raw
        .to_str()
        .map_err(|e| FetchError::MalformedPaginationHeader(e.to_string()))?;
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| FetchError::MalformedPaginationHeader(e.to_string()))
}

/// Issues paginated GETs through a [`QueryCache`].
pub struct PaginatedFetcher<T> {
    http: Arc<dyn HttpClient>,
    cache: Arc<QueryCache<T>>,
}

impl<T> Clone for PaginatedFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<T> PaginatedFetcher<T>
where
    T: DeserializeOwned + Send + Sync,
{
    pub fn new(http: Arc<dyn HttpClient>, cache: Arc<QueryCache<T>>) -> Self {
        Self { http, cache }
    }

    pub fn cache(&self) -> &Arc<QueryCache<T>> {
        &self.cache
    }

    pub async fn fetch(
        &self,
        endpoint: &str,
        params: &dyn QueryParams,
    ) -> Result<Arc<CacheEntry<T>>, FetchError> {
        let key = derive_key(endpoint, params)?;

        if let Some(entry) = self.cache.get(&key) {
            debug!(endpoint, "serving from cache");
            return Ok(entry);
        }

        let query = params.to_query();
        self.cache
            .with_refresh_lock(&key, || async {
                // Another caller may have filled the slot while we waited.
                if let Some(entry) = self.cache.get(&key) {
                    return Ok(entry);
                }

                let entry = self.request(endpoint, &query).await?;
                Ok::<_, FetchError>(self.cache.set(key.clone(), entry))
            })
            .await
    }

    /// Same request as [`fetch`](Self::fetch) but never reads or writes the
    /// cache.
    pub async fn fetch_uncached(
        &self,
        endpoint: &str,
        params: &dyn QueryParams,
    ) -> Result<CacheEntry<T>, FetchError> {
        self.request(endpoint, &params.to_query()).await
    }

    async fn request(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<CacheEntry<T>, FetchError> {
        let resp = self.http.get(endpoint, query).await.map_err(|e| {
            warn!(endpoint, error = %e, "paginated fetch failed");
            FetchError::FetchFailed(e)
        })?;

        let pagination = parse_pagination(&resp.headers)?;
        let result = serde_json::from_value(resp.body).map_err(FetchError::Decode)?;
        Ok(CacheEntry { result, pagination })
    }
}
