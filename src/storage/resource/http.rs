//! Blocking HTTP client for a resource API server.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::resource::{ResourceApi, MERGE_PATCH_CONTENT_TYPE};
use crate::storage::traits::StorageError;

/// Connection settings for [`HttpResourceApi`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpResourceApiConfig {
    /// Server URL, e.g. `https://10.0.0.1:6443`.
    pub base_url: String,
    /// Sent as `Authorization: Bearer ...` when set.
    pub bearer_token: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for HttpResourceApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            bearer_token: None,
            timeout_secs: 30,
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::ConnectionError(err.to_string())
    }
}

/// [`ResourceApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpResourceApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpResourceApi {
    /// Build a client.
    ///
    /// # Errors
    /// - `ConnectionError`: if the HTTP client cannot be constructed
    pub fn new(config: &HttpResourceApiConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.bearer_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<Value, StorageError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request.header(ACCEPT, "application/json").send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(StorageError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json()?)
    }
}

impl ResourceApi for HttpResourceApi {
    fn get(&self, path: &str) -> Result<Value, StorageError> {
        self.send(self.client.get(self.url(path)))
    }

    fn patch(&self, path: &str, merge_patch: &Value) -> Result<Value, StorageError> {
        let body = serde_json::to_vec(merge_patch)?;
        self.send(
            self.client
                .patch(self.url(path))
                .header(CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
                .body(body),
        )
    }
}
