//! Asynchronous client for the co-browsing recorder backend.
//!
//! The recorder process uses this crate to save event batches, poll and
//! acknowledge callouts, and append clips to team or private pages. The
//! [`RecorderApi`] trait is the seam the recorder engine is written against so
//! tests can swap in scripted backends.

pub mod kv_store;
pub mod types;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub use reqwest::StatusCode;

use crate::types::{
    Callout, CalloutAck, CalloutList, CalloutQuery, EventBatch, NewCallout, Page, PageAppend,
    PageList, PageScope,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} message={message}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        message: String,
    },
}

#[async_trait]
pub trait RecorderApi: Send + Sync {
    /// Cheap reachability check. Callers treat the answer as informational.
    async fn ping(&self) -> Result<(), ApiError>;

    async fn save_events(&self, batch: &EventBatch) -> Result<(), ApiError>;

    async fn fetch_callouts(&self, query: &CalloutQuery) -> Result<Vec<Callout>, ApiError>;

    async fn create_callout(&self, callout: &NewCallout) -> Result<Value, ApiError>;

    async fn acknowledge_callout(&self, ack: &CalloutAck) -> Result<Value, ApiError>;

    async fn list_pages(&self, scope: &PageScope) -> Result<Vec<Page>, ApiError>;

    async fn create_page(&self, scope: &PageScope, title: &str) -> Result<Page, ApiError>;

    async fn append_to_page(
        &self,
        scope: &PageScope,
        page_id: &str,
        entry: &PageAppend,
    ) -> Result<Value, ApiError>;
}

#[derive(Clone)]
pub struct RecorderClient {
    http: Client,
    base_url: String,
}

impl RecorderClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(Client::new(), base_url)
    }

    pub fn with_http(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RecorderApi for RecorderClient {
    async fn ping(&self) -> Result<(), ApiError> {
        let res = self.http.get(self.url("health")).send().await?;
        ensure_success(res).await.map(|_| ())
    }

    async fn save_events(&self, batch: &EventBatch) -> Result<(), ApiError> {
        let url = self.url(&format!("recordings/{}/events", batch.session_code));
        let res = self.http.post(url).json(batch).send().await?;
        ensure_success(res).await.map(|_| ())
    }

    async fn fetch_callouts(&self, query: &CalloutQuery) -> Result<Vec<Callout>, ApiError> {
        let mut params = vec![
            ("userCode", query.user_code.clone()),
            ("sessionCode", query.session_code.clone()),
        ];
        if let Some(since) = query.since {
            params.push(("since", since.to_rfc3339()));
        }
        let res = self
            .http
            .get(self.url("callouts"))
            .query(&params)
            .send()
            .await?;
        read_json::<CalloutList>(res).await.map(Into::into)
    }

    async fn create_callout(&self, callout: &NewCallout) -> Result<Value, ApiError> {
        let res = self
            .http
            .post(self.url("callouts"))
            .json(callout)
            .send()
            .await?;
        read_json_or_null(res).await
    }

    async fn acknowledge_callout(&self, ack: &CalloutAck) -> Result<Value, ApiError> {
        let url = self.url(&format!("callouts/{}/acknowledge", ack.callout_id));
        let res = self.http.post(url).json(ack).send().await?;
        read_json_or_null(res).await
    }

    async fn list_pages(&self, scope: &PageScope) -> Result<Vec<Page>, ApiError> {
        let res = self.http.get(self.url(&scope.path())).send().await?;
        read_json::<PageList>(res).await.map(Into::into)
    }

    async fn create_page(&self, scope: &PageScope, title: &str) -> Result<Page, ApiError> {
        let res = self
            .http
            .post(self.url(&scope.path()))
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await?;
        read_json(res).await
    }

    async fn append_to_page(
        &self,
        scope: &PageScope,
        page_id: &str,
        entry: &PageAppend,
    ) -> Result<Value, ApiError> {
        let url = self.url(&format!("{}/{}/append", scope.path(), page_id));
        let res = self.http.post(url).json(entry).send().await?;
        read_json_or_null(res).await
    }
}

async fn ensure_success(res: Response) -> Result<Response, ApiError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(ApiError::UnexpectedStatus {
        status,
        message: extract_message(&body, status),
    })
}

async fn read_json<T: DeserializeOwned>(res: Response) -> Result<T, ApiError> {
    let res = ensure_success(res).await?;
    Ok(res.json::<T>().await?)
}

/// Some endpoints answer 204 or an empty body; surface that as `null`.
async fn read_json_or_null(res: Response) -> Result<Value, ApiError> {
    let res = ensure_success(res).await?;
    let body = res.text().await?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

/// Pulls the human-readable `message` out of an error body when the backend
/// sent one, otherwise falls back to the raw body or the status reason.
pub fn extract_message(body: &str, status: reqwest::StatusCode) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        if let Some(Value::String(message)) = map.get("message") {
            return message.clone();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_message_field() {
        let msg = extract_message(
            r#"{"message":"page not found","code":404}"#,
            reqwest::StatusCode::NOT_FOUND,
        );
        assert_eq!(msg, "page not found");
    }

    #[test]
    fn falls_back_to_body_then_reason() {
        assert_eq!(
            extract_message("upstream exploded", reqwest::StatusCode::BAD_GATEWAY),
            "upstream exploded"
        );
        assert_eq!(
            extract_message("", reqwest::StatusCode::SERVICE_UNAVAILABLE),
            "Service Unavailable"
        );
    }

    #[test]
    fn trims_trailing_slash_from_base() {
        let client = RecorderClient::new("http://localhost:3000/api/");
        assert_eq!(client.base_url(), "http://localhost:3000/api");
        assert_eq!(client.url("/team"), "http://localhost:3000/api/team");
    }
}
