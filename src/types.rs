use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a cached query: the endpoint plus its canonically encoded
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub endpoint: Arc<str>,
    pub params_canonical: Arc<str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub current_page: u32,
    // Older servers spell it "itemPerPage".
    #[serde(alias = "itemPerPage")]
    pub items_per_page: u32,
    pub total_items: u32,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub result: T,
    pub pagination: Option<PaginationMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    pub sender_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,
    pub recipient_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_photo_url: Option<String>,
    pub content: String,
    #[serde(rename = "messageSent", alias = "sentAt")]
    pub sent_at: DateTime<Utc>,
    #[serde(rename = "dateRead", alias = "readAt", default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Sets `read_at` unless it is already set. Returns whether it changed.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConnection {
    pub username: String,
    #[serde(default)]
    pub connection_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembership {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub connections: Vec<GroupConnection>,
}

impl GroupMembership {
    pub fn contains(&self, username: &str) -> bool {
        self.connections.iter().any(|c| c.username == username)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub is_main: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub known_as: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub introduction: Option<String>,
    #[serde(default)]
    pub looking_for: Option<String>,
    #[serde(default)]
    pub interests: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

/// The logged-in user as returned by the account endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub known_as: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_reads_server_field_names() {
        let json = r#"{
            "id": 7,
            "senderUsername": "alice",
            "recipientUsername": "bob",
            "content": "hi",
            "messageSent": "2024-05-01T10:00:00Z",
            "dateRead": null
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, 7);
        assert_eq!(msg.sender_username, "alice");
        assert!(msg.read_at.is_none());
    }

    #[test]
    fn mark_read_sets_once() {
        let json = r#"{"id":1,"senderUsername":"a","recipientUsername":"b","content":"x","sentAt":"2024-05-01T10:00:00Z"}"#;
        let mut msg: Message = serde_json::from_str(json).unwrap();
        let first = "2024-05-01T11:00:00Z".parse().unwrap();
        let second = "2024-05-01T12:00:00Z".parse().unwrap();

        assert!(msg.mark_read(first));
        assert!(!msg.mark_read(second));
        assert_eq!(msg.read_at, Some(first));
    }

    #[test]
    fn pagination_accepts_legacy_item_per_page() {
        let meta: PaginationMeta = serde_json::from_str(
            r#"{"currentPage":1,"itemPerPage":10,"totalItems":14,"totalPages":2}"#,
        )
        .unwrap();
        assert_eq!(meta.items_per_page, 10);
        assert_eq!(meta.total_pages, 2);
    }

    #[test]
    fn membership_contains_username() {
        let group: GroupMembership = serde_json::from_str(
            r#"{"name":"alice-bob","connections":[{"username":"alice","connectionId":"c1"}]}"#,
        )
        .unwrap();
        assert!(group.contains("alice"));
        assert!(!group.contains("bob"));
    }
}
