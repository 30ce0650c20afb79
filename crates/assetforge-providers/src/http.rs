//! Shared HTTP plumbing for the adapters.

use assetforge_core::provider::{ProviderFailure, ProviderResult};
use serde::de::DeserializeOwned;
use url::Url;

/// `base` joined with `path`, tolerating a trailing slash on either side.
pub(crate) fn endpoint(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub(crate) fn request_failed(err: reqwest::Error) -> ProviderFailure {
    ProviderFailure::Request(err.to_string())
}

/// Fail on non-2xx, otherwise decode the body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> ProviderResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderFailure::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|e| ProviderFailure::InvalidResponse(e.to_string()))
}

/// Fail on non-2xx, ignoring the body otherwise.
pub(crate) async fn expect_success(response: reqwest::Response) -> ProviderResult<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ProviderFailure::Status {
            status: status.as_u16(),
            body,
        })
    }
}
