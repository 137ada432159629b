use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::cache::QueryCache;
use crate::fetcher::{FetchError, PaginatedFetcher};
use crate::http_client::HttpClient;
use crate::params::{MessageParams, UserParams};
use crate::types::{CacheEntry, Member, Message, User};

pub const USERS: &str = "users";
pub const MESSAGES: &str = "messages";

/// Member browsing with cached pages and the current filter selection.
pub struct MembersApi {
    http: Arc<dyn HttpClient>,
    fetcher: PaginatedFetcher<Vec<Member>>,
    defaults: UserParams,
    params: Mutex<UserParams>,
}

impl MembersApi {
    pub fn new(
        http: Arc<dyn HttpClient>,
        cache: Arc<QueryCache<Vec<Member>>>,
        user: &User,
    ) -> Self {
        let defaults = UserParams::for_user(user);
        Self {
            fetcher: PaginatedFetcher::new(http.clone(), cache),
            http,
            params: Mutex::new(defaults.clone()),
            defaults,
        }
    }

    fn lock_params(&self) -> MutexGuard<'_, UserParams> {
        self.params.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn user_params(&self) -> UserParams {
        self.lock_params().clone()
    }

    pub fn set_user_params(&self, params: UserParams) {
        *self.lock_params() = params;
    }

    pub fn reset_user_params(&self) -> UserParams {
        let mut params = self.lock_params();
        *params = self.defaults.clone();
        params.clone()
    }

    pub fn cache(&self) -> &Arc<QueryCache<Vec<Member>>> {
        self.fetcher.cache()
    }

    pub async fn get_members(
        &self,
        params: &UserParams,
    ) -> Result<Arc<CacheEntry<Vec<Member>>>, FetchError> {
        self.fetcher.fetch(USERS, params).await
    }

    /// Looks through cached pages first and only asks the server on a miss.
    pub async fn get_member(&self, username: &str) -> Result<Member, FetchError> {
        let cached = self
            .cache()
            .values()
            .iter()
            .flat_map(|entry| entry.result.iter())
            .find(|m| m.username == username)
            .cloned();
        if let Some(member) = cached {
            debug!(username, "member served from cache");
            return Ok(member);
        }

        let resp = self.http.get(&format!("{USERS}/{username}"), &[]).await?;
        serde_json::from_value(resp.body).map_err(FetchError::Decode)
    }

    /// Cached pages may hold the old profile, so they are dropped.
    pub async fn update_member(&self, member: &Member) -> Result<(), FetchError> {
        let body = serde_json::to_value(member).map_err(FetchError::Decode)?;
        self.http.put(USERS, &body).await?;
        self.cache().invalidate_endpoint(USERS);
        Ok(())
    }

    pub async fn set_main_photo(&self, photo_id: i64) -> Result<(), FetchError> {
        self.http
            .put(
                &format!("{USERS}/set-main-photo/{photo_id}"),
                &serde_json::Value::Object(Default::default()),
            )
            .await?;
        self.cache().invalidate_endpoint(USERS);
        Ok(())
    }

    pub async fn delete_photo(&self, photo_id: i64) -> Result<(), FetchError> {
        self.http
            .delete(&format!("{USERS}/delete-photo/{photo_id}"))
            .await?;
        self.cache().invalidate_endpoint(USERS);
        Ok(())
    }
}

/// Mailbox and thread endpoints. Mailbox pages are always fetched fresh.
pub struct MessagesApi {
    http: Arc<dyn HttpClient>,
    fetcher: PaginatedFetcher<Vec<Message>>,
}

impl MessagesApi {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            fetcher: PaginatedFetcher::new(http.clone(), Arc::new(QueryCache::unbounded())),
            http,
        }
    }

    pub async fn get_messages(
        &self,
        params: &MessageParams,
    ) -> Result<CacheEntry<Vec<Message>>, FetchError> {
        self.fetcher.fetch_uncached(MESSAGES, params).await
    }

    pub async fn get_message_thread(&self, username: &str) -> Result<Vec<Message>, FetchError> {
        let resp = self
            .http
            .get(&format!("{MESSAGES}/thread/{username}"), &[])
            .await?;
        serde_json::from_value(resp.body).map_err(FetchError::Decode)
    }

    pub async fn delete_message(&self, id: i64) -> Result<(), FetchError> {
        self.http.delete(&format!("{MESSAGES}/{id}")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::params::{Container, Page};
    use crate::testing::FakeHttp;

    fn user() -> User {
        User {
            username: "lisa".into(),
            token: "t".into(),
            known_as: None,
            gender: Some("female".into()),
            photo_url: None,
        }
    }

    fn members(http: &Arc<FakeHttp>) -> MembersApi {
        MembersApi::new(http.clone(), Arc::new(QueryCache::unbounded()), &user())
    }

    #[tokio::test]
    async fn users_scenario_is_served_from_cache_on_repeat() {
        let http = Arc::new(FakeHttp::new());
        http.respond(
            USERS,
            json!([{"username": "u1"}, {"username": "u2"}]),
            Some(r#"{"currentPage":1,"itemsPerPage":10,"totalItems":2,"totalPages":1}"#),
        );
        let api = members(&http);
        let params = UserParams {
            page: Page { number: 1, size: 10 },
            min_age: 18,
            max_age: 30,
            gender: "female".into(),
            order_by: "lastActive".into(),
        };

        let first = api.get_members(&params).await.unwrap();
        let names: Vec<&str> = first.result.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["u1", "u2"]);
        assert_eq!(first.pagination.as_ref().unwrap().total_pages, 1);

        let again = api.get_members(&params.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(http.call_count(), 1);

        let mut expected_query = vec![
            ("gender".to_string(), "female".to_string()),
            ("maxAge".to_string(), "30".to_string()),
            ("minAge".to_string(), "18".to_string()),
            ("orderBy".to_string(), "lastActive".to_string()),
            ("pageNumber".to_string(), "1".to_string()),
            ("pageSize".to_string(), "10".to_string()),
        ];
        let mut sent = http.calls()[0].query.clone();
        sent.sort();
        expected_query.sort();
        assert_eq!(sent, expected_query);
    }

    #[tokio::test]
    async fn get_member_prefers_cached_pages() {
        let http = Arc::new(FakeHttp::new());
        http.respond(USERS, json!([{"username": "u1", "city": "Oslo"}]), None);
        http.respond("users/u9", json!({"username": "u9"}), None);
        let api = members(&http);

        api.get_members(&api.user_params()).await.unwrap();
        let cached = api.get_member("u1").await.unwrap();
        assert_eq!(cached.city.as_deref(), Some("Oslo"));
        assert_eq!(http.call_count(), 1);

        let fetched = api.get_member("u9").await.unwrap();
        assert_eq!(fetched.username, "u9");
        assert_eq!(http.call_count(), 2);
    }

    #[tokio::test]
    async fn update_member_invalidates_cached_pages() {
        let http = Arc::new(FakeHttp::new());
        http.respond(USERS, json!([{"username": "u1"}]), None);
        let api = members(&http);

        api.get_members(&api.user_params()).await.unwrap();
        assert_eq!(api.cache().len(), 1);

        let member: Member = serde_json::from_value(json!({"username": "u1"})).unwrap();
        api.update_member(&member).await.unwrap();
        assert!(api.cache().is_empty());
        assert_eq!(http.calls()[1].method, "PUT");
    }

    #[test]
    fn user_params_reset_to_defaults() {
        let http = Arc::new(FakeHttp::new());
        let api = members(&http);
        let mut changed = api.user_params();
        changed.min_age = 40;
        api.set_user_params(changed.clone());
        assert_eq!(api.user_params(), changed);

        let reset = api.reset_user_params();
        assert_eq!(reset.min_age, 18);
        assert_eq!(reset.gender, "male");
        assert_eq!(api.user_params(), reset);
    }

    #[tokio::test]
    async fn message_endpoints() {
        let http = Arc::new(FakeHttp::new());
        let msg = json!({
            "id": 1,
            "senderUsername": "alice",
            "recipientUsername": "lisa",
            "content": "hi",
            "messageSent": "2024-05-01T10:00:00Z"
        });
        http.respond(
            MESSAGES,
            json!([msg.clone()]),
            Some(r#"{"currentPage":1,"itemsPerPage":5,"totalItems":1,"totalPages":1}"#),
        );
        http.respond("messages/thread/alice", json!([msg]), None);
        http.respond("messages/1", json!(null), None);
        let api = MessagesApi::new(http.clone());

        let params = MessageParams {
            page: Page { number: 1, size: 5 },
            container: Container::Unread,
        };
        let page = api.get_messages(&params).await.unwrap();
        assert_eq!(page.result.len(), 1);
        assert!(http.calls()[0]
            .query
            .contains(&("Container".to_string(), "Unread".to_string())));

        api.get_messages(&params).await.unwrap();
        assert_eq!(http.call_count(), 2);

        let thread = api.get_message_thread("alice").await.unwrap();
        assert_eq!(thread[0].sender_username, "alice");

        api.delete_message(1).await.unwrap();
        assert_eq!(http.calls()[3].method, "DELETE");
        assert_eq!(http.calls()[3].path, "messages/1");
    }
}
