use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

/// A response body plus the headers that came with it.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub body: Value,
    pub headers: HeaderMap,
}

/// The request/response half of the server surface.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError>;

    async fn put(&self, path: &str, body: &Value) -> Result<HttpResponse, TransportError>;

    async fn delete(&self, path: &str) -> Result<HttpResponse, TransportError>;
}

/// [`HttpClient`] over reqwest, attaching the session's bearer token to every
/// request.
pub struct ReqwestHttpClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ReqwestHttpClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<HttpResponse, TransportError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(HttpResponse { body, headers })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        debug!(path, "GET");
        self.execute(self.request(Method::GET, path).query(query))
            .await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        debug!(path, "PUT");
        self.execute(self.request(Method::PUT, path).json(body)).await
    }

    async fn delete(&self, path: &str) -> Result<HttpResponse, TransportError> {
        debug!(path, "DELETE");
        self.execute(self.request(Method::DELETE, path)).await
    }
}
