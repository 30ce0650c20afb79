//! Hosted third-party image API adapter.
//!
//! Authenticated with a bearer key read from the environment when the
//! registry is built. A missing key does not stop registration; the
//! provider simply fails its health check.

use assetforge_core::generation::{GeneratedAsset, GenerationOutput, GenerationRequest};
use assetforge_core::provider::{
    GenerationProvider, ProgressSink, ProviderFailure, ProviderProgress, ProviderResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;
use url::Url;

use crate::http::{endpoint, expect_success, read_json, request_failed};
use crate::mapping::{HOSTED_API, enhance_prompt};

#[derive(Debug, Serialize)]
struct GenerationBody<'a> {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    width: u32,
    height: u32,
    samples: u32,
    steps: u32,
    cfg_scale: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    style_preset: &'static str,
    asset_category: &'static str,
    output_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    images: Vec<HostedImage>,
}

#[derive(Debug, Deserialize)]
struct HostedImage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    base64: Option<String>,
    #[serde(default)]
    seed: Option<u64>,
}

pub struct HostedApiProvider {
    id: String,
    base_url: Url,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HostedApiProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: Url,
        api_key: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            id: id.into(),
            base_url,
            api_key,
            client,
        }
    }

    fn bearer(&self) -> ProviderResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderFailure::Rejected("api key is not configured".to_string()))
    }
}

#[async_trait]
impl GenerationProvider for HostedApiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> ProviderResult<()> {
        let key = self.bearer()?;
        let response = self
            .client
            .get(endpoint(&self.base_url, "status"))
            .bearer_auth(key)
            .send()
            .await
            .map_err(request_failed)?;
        expect_success(response).await
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: &ProgressSink,
    ) -> ProviderResult<GenerationOutput> {
        let key = self.bearer()?;
        let started = Instant::now();
        let body = GenerationBody {
            prompt: enhance_prompt(request),
            negative_prompt: request.negative_prompt.as_deref(),
            width: request.width,
            height: request.height,
            samples: request.count,
            steps: request.effective_steps(),
            cfg_scale: request.effective_guidance_scale(),
            seed: request.seed,
            style_preset: HOSTED_API.style(request.style),
            asset_category: HOSTED_API.asset_type(request.asset_type),
            output_format: request.format.as_str(),
        };

        debug!(provider = %self.id, samples = request.count, "submitting batch");
        progress.report(ProviderProgress::new(0.0, "Submitted to hosted API"));
        let response = self
            .client
            .post(endpoint(&self.base_url, "images/generations"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(request_failed)?;
        let generated: GenerationResponse = read_json(response).await?;

        if generated.images.is_empty() {
            return Err(ProviderFailure::InvalidResponse(
                "response contained no images".to_string(),
            ));
        }

        let assets = generated
            .images
            .into_iter()
            .enumerate()
            .map(|(index, image)| {
                let uri = match (image.url, image.base64) {
                    (Some(url), _) => url,
                    (None, Some(data)) => {
                        format!("data:image/{};base64,{}", request.format.as_str(), data)
                    }
                    (None, None) => {
                        return Err(ProviderFailure::InvalidResponse(format!(
                            "image {} has neither url nor base64",
                            index
                        )));
                    }
                };
                Ok(GeneratedAsset {
                    id: image.id.unwrap_or_else(|| format!("{}-{}", self.id, index)),
                    uri,
                    width: request.width,
                    height: request.height,
                    format: request.format,
                    seed: image.seed,
                })
            })
            .collect::<ProviderResult<Vec<_>>>()?;

        progress.report(
            ProviderProgress::new(100.0, format!("Received {} assets", assets.len()))
                .with_payload(serde_json::json!({ "assetsCompleted": assets.len() })),
        );
        Ok(GenerationOutput {
            assets,
            provider: self.id.clone(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}
