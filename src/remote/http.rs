//! HTTP Remote Store - PostgREST/Supabase binding
//!
//! Handles all REST calls the sync core needs:
//! - Create / update / delete by id
//! - Fetch one record or all records changed since a cursor
//!
//! Every request asks for `return=representation` so the server's canonical
//! record (ids, timestamps) comes back and can be merged locally.

use super::{RemoteError, RemoteStore};
use crate::auth::AuthContext;
use crate::mapper::{millis_to_rfc3339, RemoteDto};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const REST_PREFIX: &str = "rest/v1/";

/// REST client for the remote store
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    auth: Arc<dyn AuthContext>,
}

impl HttpRemoteStore {
    /// Create new client against `base_url` (e.g. `https://project.supabase.co`)
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        auth: Arc<dyn AuthContext>,
    ) -> Result<Self, RemoteError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::Rejected { status: 0, message: format!("invalid base url: {}", e) })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            auth,
        })
    }

    fn table_url(&self, entity_type: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(&format!("{}{}", REST_PREFIX, entity_type))
            .map_err(|e| RemoteError::Rejected { status: 0, message: e.to_string() })
    }

    fn record_url(&self, entity_type: &str, id: &str) -> Result<Url, RemoteError> {
        let mut url = self.table_url(entity_type)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("Accept", "application/json")
            .header("Prefer", "return=representation");

        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }

        // Session token wins; anonymous calls fall back to the API key
        match self.auth.access_token().or_else(|| self.api_key.clone()) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(&self, entity_type: &str, dto: RemoteDto) -> Result<RemoteDto, RemoteError> {
        let url = self.table_url(entity_type)?;
        let response = self.request(Method::POST, url).json(&dto).send().await?;

        let rows: Vec<RemoteDto> = handle_response(response).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse("empty representation".into()))
    }

    async fn update(&self, entity_type: &str, dto: RemoteDto) -> Result<RemoteDto, RemoteError> {
        let id = dto
            .id()
            .ok_or_else(|| RemoteError::Rejected { status: 0, message: "record has no id".into() })?
            .to_string();

        let url = self.record_url(entity_type, &id)?;
        let response = self.request(Method::PATCH, url).json(&dto).send().await?;

        // PostgREST answers an update of a missing row with an empty array
        let rows: Vec<RemoteDto> = handle_response(response).await?;
        rows.into_iter().next().ok_or(RemoteError::NotFound)
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool, RemoteError> {
        let url = self.record_url(entity_type, id)?;
        let response = self.request(Method::DELETE, url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let rows: Vec<serde_json::Value> = handle_response(response).await?;
        Ok(!rows.is_empty())
    }

    async fn get_by_id(&self, entity_type: &str, id: &str) -> Result<Option<RemoteDto>, RemoteError> {
        let mut url = self.record_url(entity_type, id)?;
        url.query_pairs_mut().append_pair("select", "*");
        let response = self.request(Method::GET, url).send().await?;

        let rows: Vec<RemoteDto> = handle_response(response).await?;
        Ok(rows.into_iter().next())
    }

    async fn get_all(&self, entity_type: &str, since: Option<i64>) -> Result<Vec<RemoteDto>, RemoteError> {
        let mut url = self.table_url(entity_type)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            query.append_pair("order", "updated_at.asc");
            if let Some(since) = since {
                let since = millis_to_rfc3339(since)
                    .map_err(|e| RemoteError::Rejected { status: 0, message: e.to_string() })?;
                query.append_pair("updated_at", &format!("gte.{}", since));
            }
        }

        let response = self.request(Method::GET, url).send().await?;
        handle_response(response).await
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.message.or(body.error))
        .unwrap_or(text);

    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::REQUEST_TIMEOUT => RemoteError::Timeout,
        StatusCode::CONFLICT => RemoteError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
        s if s.is_server_error() => RemoteError::Server {
            status: s.as_u16(),
            message,
        },
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client_for(server: &Server) -> HttpRemoteStore {
        let session = Arc::new(Session::signed_in("u1", Some("user-token".into())));
        HttpRemoteStore::new(&server.url(), Some("anon-key".into()), Duration::from_secs(5), session).unwrap()
    }

    fn task_dto(id: &str) -> RemoteDto {
        RemoteDto::from_value(json!({
            "id": id,
            "user_id": "u1",
            "title": "Write spec",
            "created_at": "2026-01-01T00:00:00.000Z",
            "updated_at": "2026-01-01T00:00:00.000Z"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_posts_and_returns_representation() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/v1/tasks")
            .match_header("apikey", "anon-key")
            .match_header("authorization", "Bearer user-token")
            .match_header("prefer", "return=representation")
            .match_body(Matcher::PartialJson(json!({ "id": "t1", "title": "Write spec" })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":"t1","user_id":"u1","title":"Write spec","created_at":"2026-01-01T00:00:00+00:00","updated_at":"2026-01-01T00:00:01+00:00"}]"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let created = client.create("tasks", task_dto("t1")).await.unwrap();

        assert_eq!(created.id(), Some("t1"));
        assert_eq!(created.get("updated_at"), Some(&json!("2026-01-01T00:00:01+00:00")));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_not_found() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/rest/v1/tasks")
            .match_query(Matcher::UrlEncoded("id".into(), "eq.t1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.update("tasks", task_dto("t1")).await.unwrap_err();

        assert_eq!(err, RemoteError::NotFound);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/rest/v1/tasks")
            .with_status(503)
            .with_body(r#"{"message":"upstream unavailable"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.create("tasks", task_dto("t1")).await.unwrap_err();

        assert_eq!(
            err,
            RemoteError::Server { status: 503, message: "upstream unavailable".into() }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_validation_errors_are_permanent() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/rest/v1/tasks")
            .with_status(400)
            .with_body(r#"{"code":"23502","message":"null value in column \"title\""}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.create("tasks", task_dto("t1")).await.unwrap_err();

        assert!(matches!(err, RemoteError::Rejected { status: 400, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/rest/v1/tasks")
            .with_status(409)
            .with_body(r#"{"message":"duplicate key value violates unique constraint"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.create("tasks", task_dto("t1")).await.unwrap_err();

        assert!(matches!(err, RemoteError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_reports_whether_row_existed() {
        let mut server = Server::new_async().await;
        let _existing = server
            .mock("DELETE", "/rest/v1/tasks")
            .match_query(Matcher::UrlEncoded("id".into(), "eq.t1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":"t1"}]"#)
            .create_async()
            .await;
        let _missing = server
            .mock("DELETE", "/rest/v1/tasks")
            .match_query(Matcher::UrlEncoded("id".into(), "eq.t2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(client.delete("tasks", "t1").await.unwrap());
        assert!(!client.delete("tasks", "t2").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_all_since_cursor() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/tasks")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("order".into(), "updated_at.asc".into()),
                Matcher::UrlEncoded("updated_at".into(), "gte.2026-01-01T00:00:00.000Z".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":"t1","updated_at":"2026-01-01T00:00:00Z"},{"id":"t2","updated_at":"2026-01-02T00:00:00Z"}]"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let rows = client.get_all("tasks", Some(1_767_225_600_000)).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].id(), Some("t2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_by_id_missing_returns_none() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/rest/v1/goals")
            .match_query(Matcher::UrlEncoded("id".into(), "eq.g1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(client.get_by_id("goals", "g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let session = Arc::new(Session::new());
        // Port 9 (discard) on localhost is expected to refuse connections
        let client =
            HttpRemoteStore::new("http://127.0.0.1:9", None, Duration::from_secs(2), session).unwrap();

        let err = client.get_all("tasks", None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
