//! REST collaborators: token refresh and thread loading over HTTP.

use crate::credentials::TokenService;
use crate::error::{LoadError, RefreshError};
use crate::navigation::{ThreadData, ThreadLoader};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_core::{Credential, Identity, ResourceId};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub identity: Identity,
}

/// HTTP backend rooted at `base_url` (e.g. `http://127.0.0.1:8080`).
#[derive(Debug, Clone)]
pub struct RestBackend {
    base_url: String,
    http: reqwest::Client,
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Obtain a token for `identity` from the demo login endpoint.
    pub async fn login(&self, identity: &Identity) -> Result<String, RefreshError> {
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest {
                identity: identity.clone(),
            })
            .send()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;
        token_from(response).await
    }
}

async fn token_from(response: reqwest::Response) -> Result<String, RefreshError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(RefreshError::Transient(format!("HTTP {status}")));
    }
    if !status.is_success() {
        return Err(RefreshError::Rejected(format!("HTTP {status}")));
    }
    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::InvalidToken(e.to_string()))?;
    Ok(body.token)
}

fn load_error(status: StatusCode, resource_id: &ResourceId) -> LoadError {
    match status {
        StatusCode::NOT_FOUND => LoadError::NotFound(resource_id.to_string()),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            LoadError::Transient(format!("HTTP {s}"))
        }
        s => LoadError::Rejected(format!("HTTP {s}")),
    }
}

#[async_trait]
impl TokenService for RestBackend {
    async fn refresh(&self, current: &Credential) -> Result<String, RefreshError> {
        tracing::debug!(component = "credentials", identity = %current.identity(), "requesting token refresh");
        let response = self
            .http
            .post(self.url("/auth/refresh"))
            .bearer_auth(current.token())
            .send()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;
        token_from(response).await
    }
}

#[async_trait]
impl ThreadLoader for RestBackend {
    async fn load(
        &self,
        resource_id: &ResourceId,
        cancel: CancellationToken,
    ) -> Result<ThreadData, LoadError> {
        let request = async {
            let response = self
                .http
                .get(self.url(&format!("/threads/{resource_id}")))
                .send()
                .await
                .map_err(|e| LoadError::Transient(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(load_error(status, resource_id));
            }
            response
                .json::<ThreadData>()
                .await
                .map_err(|e| LoadError::Transient(e.to_string()))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            result = request => result,
        }
    }
}
