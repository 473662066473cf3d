//! REST collaborator interface.
//!
//! The engine consumes the server's conversation endpoints through the
//! [`ConversationApi`] trait; [`HttpApi`] is the production implementation.
//! Responses are returned as raw JSON values; shape normalization happens
//! fail-closed at the store boundary, not here.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use thiserror::Error;

use parley_shared::models::MessageContent;
use parley_shared::types::{ConversationId, ConversationKind, UserId};

/// Errors from the REST layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection-level failure (DNS, refused, reset, ...).
    #[error("request failed: {0}")]
    Http(String),

    /// The server answered with a non-success status.
    #[error("server returned status {0}")]
    Status(u16),

    /// The client-side timeout elapsed; the fetch was abandoned.
    #[error("request timed out")]
    Timeout,

    /// The fetch was superseded by a newer one.
    #[error("request canceled")]
    Canceled,

    /// The response body was not JSON.
    #[error("response body could not be decoded: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether a local retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Http(_) | ApiError::Status(500..=599))
    }

    /// Canceled and timed-out fetches are never surfaced as faults.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ApiError::Canceled | ApiError::Timeout)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Http(e.to_string())
        }
    }
}

/// Query options for the conversations list.
#[derive(Debug, Clone, Default)]
pub struct ConversationQuery {
    pub kind: Option<ConversationKind>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
}

/// Pagination options for a message-history fetch.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub limit: Option<u32>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
}

/// The server's conversation endpoints, as consumed by the engine.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Swap the bearer credential used on subsequent calls.
    fn set_credential(&self, _token: Option<String>) {}

    /// `GET /conversations[?type&limit&skip]`
    async fn fetch_conversations(&self, query: &ConversationQuery) -> Result<Value, ApiError>;

    /// `GET /conversations/:id/messages[?limit&before&after]`
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        page: &MessagePage,
    ) -> Result<Value, ApiError>;

    /// `POST /conversations/:id/messages`
    async fn post_message(
        &self,
        conversation: &ConversationId,
        content: &MessageContent,
    ) -> Result<Value, ApiError>;

    /// `POST /conversations/dm/:userId`
    async fn get_or_create_dm(&self, user: &UserId) -> Result<Value, ApiError>;

    /// `POST /conversations/:id/read`
    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), ApiError>;
}

/// Production implementation over HTTP.
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpApi {
    /// `base_url` is the API root without a trailing slash, e.g.
    /// `https://chat.example.com/api`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            token: RwLock::new(None),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        let token = self
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        resp.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    fn set_credential(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    async fn fetch_conversations(&self, query: &ConversationQuery) -> Result<Value, ApiError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(kind) = query.kind {
            params.push(("type", kind.as_str().to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(skip) = query.skip {
            params.push(("skip", skip.to_string()));
        }
        self.execute(self.request(Method::GET, "/conversations").query(&params))
            .await
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        page: &MessagePage,
    ) -> Result<Value, ApiError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(limit) = page.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(before) = page.before {
            params.push(("before", before.to_rfc3339()));
        }
        if let Some(after) = page.after {
            params.push(("after", after.to_rfc3339()));
        }
        let path = format!("/conversations/{}/messages", conversation);
        self.execute(self.request(Method::GET, &path).query(&params))
            .await
    }

    async fn post_message(
        &self,
        conversation: &ConversationId,
        content: &MessageContent,
    ) -> Result<Value, ApiError> {
        let path = format!("/conversations/{}/messages", conversation);
        self.execute(
            self.request(Method::POST, &path)
                .json(&json!({ "content": content })),
        )
        .await
    }

    async fn get_or_create_dm(&self, user: &UserId) -> Result<Value, ApiError> {
        let path = format!("/conversations/dm/{}", user);
        self.execute(self.request(Method::POST, &path).json(&json!({})))
            .await
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), ApiError> {
        let path = format!("/conversations/{}/read", conversation);
        let resp = self.request(Method::POST, &path).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Http("reset".into()).is_transient());
        assert!(ApiError::Status(503).is_transient());
        assert!(!ApiError::Status(404).is_transient());
        assert!(!ApiError::Timeout.is_transient());
        assert!(!ApiError::Canceled.is_transient());
    }

    #[test]
    fn test_canceled_classification() {
        assert!(ApiError::Canceled.is_canceled());
        assert!(ApiError::Timeout.is_canceled());
        assert!(!ApiError::Status(500).is_canceled());
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let api = HttpApi::new("http://localhost:5000/api/");
        assert_eq!(api.base_url, "http://localhost:5000/api");
    }
}
