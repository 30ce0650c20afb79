//! Thin JSON client for the assetforge HTTP API.

use anyhow::{Context, Result, bail};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Header the server reads the job owner from.
const USER_ID_HEADER: &str = "x-user-id";

pub struct ApiClient {
    base: Url,
    user: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str, user: &str) -> Result<Self> {
        let base = Url::parse(api_url).with_context(|| format!("invalid API URL '{}'", api_url))?;
        Ok(Self {
            base,
            user: user.to_string(),
            http: reqwest::Client::new(),
        })
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid request path '{}'", path))
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let request = self.http.get(self.url(path)?).query(query);
        self.send(request).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let request = self.http.post(self.url(path)?).json(body);
        self.send(request).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let request = request.header(USER_ID_HEADER, &self.user);
        let response = request.send().await.context("request to API server failed")?;
        debug!(status = %response.status(), url = %response.url(), "API response");
        read(response).await
    }
}

async fn read(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .with_context(|| format!("unreadable response ({})", status))?;
    if !status.is_success() {
        bail!("{}: {}", status, error_message(&body));
    }
    Ok(body)
}

/// The server's `{"error": ...}` message, or the raw body.
pub fn error_message(body: &Value) -> String {
    body.get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
