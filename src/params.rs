use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::{QueryKey, User};

#[derive(Debug, thiserror::Error)]
#[error("failed to encode query parameters: {0}")]
pub struct KeyError(#[from] serde_json::Error);

/// Request parameters as an explicitly named, sorted field set.
///
/// The same map drives both the query string sent to the server and the cache
/// key, so two parameter sets with equal fields always share a key.
pub trait QueryParams: Send + Sync {
    fn fields(&self) -> BTreeMap<&'static str, String>;

    fn to_query(&self) -> Vec<(String, String)> {
        self.fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

pub fn derive_key(endpoint: &str, params: &dyn QueryParams) -> Result<QueryKey, KeyError> {
    let canonical = serde_jcs::to_string(&params.fields())?;
    Ok(QueryKey {
        endpoint: Arc::from(endpoint),
        params_canonical: Arc::from(canonical.as_str()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    fn write(&self, fields: &mut BTreeMap<&'static str, String>) {
        fields.insert("pageNumber", self.number.to_string());
        fields.insert("pageSize", self.size.to_string());
    }
}

/// Filters for the member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserParams {
    pub page: Page,
    pub min_age: u32,
    pub max_age: u32,
    pub gender: String,
    pub order_by: String,
}

impl UserParams {
    /// Defaults for `user`: first page of five, ages 18 to 99, the opposite
    /// gender, most recently active first.
    pub fn for_user(user: &User) -> Self {
        let gender = match user.gender.as_deref() {
            Some("female") => "male",
            _ => "female",
        };
        Self {
            page: Page { number: 1, size: 5 },
            min_age: 18,
            max_age: 99,
            gender: gender.to_string(),
            order_by: "lastActive".to_string(),
        }
    }
}

impl QueryParams for UserParams {
    fn fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();
        self.page.write(&mut fields);
        fields.insert("minAge", self.min_age.to_string());
        fields.insert("maxAge", self.max_age.to_string());
        fields.insert("gender", self.gender.clone());
        fields.insert("orderBy", self.order_by.clone());
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Unread,
    Inbox,
    Outbox,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Container::Unread => "Unread",
            Container::Inbox => "Inbox",
            Container::Outbox => "Outbox",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageParams {
    pub page: Page,
    pub container: Container,
}

impl QueryParams for MessageParams {
    fn fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();
        self.page.write(&mut fields);
        fields.insert("Container", self.container.to_string());
        fields
    }
}
