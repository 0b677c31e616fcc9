use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::BackupApi;
use crate::config::AppConfig;
use crate::core::models::{BackupJob, SshTestResult, StartResponse};
use crate::error::{ApiError, ApiResult};

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// reqwest implementation of [`BackupApi`].
#[derive(Debug, Clone)]
pub struct HttpBackupApi {
    http: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpBackupApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: normalize(base_url.into()),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &AppConfig) -> ApiResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("bkmon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Network {
                context: "Failed to build HTTP client".into(),
                source: e,
            })?;

        Ok(Self::new(config.api_url.clone())
            .with_http_client(http)
            .with_token(config.api_token.clone())
            .with_timeout(config.request_timeout()))
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL plus `segments`, each percent-encoded as a single path segment.
    fn url(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| ApiError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl {
                url: self.base_url.clone(),
                reason: "cannot be a base".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.timeout(self.timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, context: &str) -> ApiResult<Response> {
        let resp = self
            .request(builder)
            .send()
            .await
            .map_err(|e| ApiError::Network {
                context: format!("{} ({})", context, self.base_url),
                source: e,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http { status, body });
        }

        Ok(resp)
    }

    async fn parse<T: DeserializeOwned>(resp: Response, context: &str) -> ApiResult<T> {
        let bytes = resp.bytes().await.map_err(|e| ApiError::Network {
            context: format!("Failed to read {} response", context),
            source: e,
        })?;
        if bytes.is_empty() {
            return Err(ApiError::InvalidResponse(format!("empty {} response", context)));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl BackupApi for HttpBackupApi {
    async fn start_backup(&self, client_id: &str) -> ApiResult<StartResponse> {
        let url = self.url(&["start", client_id])?;
        let resp = self.send(self.http.post(url), "Failed to start backup").await?;
        Self::parse(resp, "start").await
    }

    async fn active_jobs(&self) -> ApiResult<Vec<BackupJob>> {
        let url = self.url(&["jobs", "active"])?;
        let resp = self
            .send(self.http.get(url), "Failed to fetch active jobs")
            .await?;
        Self::parse(resp, "active jobs").await
    }

    async fn client_jobs(&self, client_id: &str, limit: usize) -> ApiResult<Vec<BackupJob>> {
        let url = self.url(&["jobs", client_id])?;
        let resp = self
            .send(
                self.http.get(url).query(&[("limit", limit)]),
                "Failed to fetch client jobs",
            )
            .await?;
        Self::parse(resp, "client jobs").await
    }

    async fn test_ssh(&self, client_id: &str) -> ApiResult<SshTestResult> {
        let url = self.url(&["test-ssh", client_id])?;
        let resp = self
            .send(self.http.post(url), "Failed to test SSH connection")
            .await?;
        let mut result: SshTestResult = Self::parse(resp, "SSH test").await?;
        result.client_id.get_or_insert_with(|| client_id.to_string());
        Ok(result)
    }
}
