//! Self-hosted model service adapter.
//!
//! The service exposes `GET /health`, `POST /generate` (one image per call)
//! and `POST /style-packs/train`.

use assetforge_core::generation::{
    GeneratedAsset, GenerationOutput, GenerationRequest, StylePackOutput, StylePackRequest,
};
use assetforge_core::provider::{
    GenerationProvider, ProgressSink, ProviderFailure, ProviderProgress, ProviderResult,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;
use url::Url;

use crate::http::{endpoint, expect_success, read_json, request_failed};
use crate::mapping::{LOCAL_SERVICE, enhance_prompt};

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    prompt: String,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    num_inference_steps: u32,
    guidance_scale: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    asset_type: &'static str,
    style: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    success: bool,
    #[serde(default)]
    generation_id: Option<String>,
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct TrainBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    reference_images: &'a [String],
    training_steps: u32,
    resolution: u32,
}

#[derive(Debug, Deserialize)]
struct TrainResponse {
    success: bool,
    #[serde(default)]
    style_pack_id: Option<String>,
    #[serde(default)]
    model_uri: Option<String>,
    #[serde(default)]
    final_loss: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct LocalServiceProvider {
    id: String,
    base_url: Url,
    client: reqwest::Client,
}

impl LocalServiceProvider {
    pub fn new(id: impl Into<String>, base_url: Url, client: reqwest::Client) -> Self {
        Self {
            id: id.into(),
            base_url,
            client,
        }
    }
}

#[async_trait]
impl GenerationProvider for LocalServiceProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> ProviderResult<()> {
        let response = self
            .client
            .get(endpoint(&self.base_url, "health"))
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
        let started = Instant::now();
        let prompt = enhance_prompt(request);
        let mut assets = Vec::with_capacity(request.count as usize);

        for index in 0..request.count {
            let seed = request.seed.map(|s| s.wrapping_add(u64::from(index)));
            let body = GenerateBody {
                prompt: prompt.clone(),
                negative_prompt: request.negative_prompt.as_deref().unwrap_or_default(),
                width: request.width,
                height: request.height,
                num_inference_steps: request.effective_steps(),
                guidance_scale: request.effective_guidance_scale(),
                seed,
                asset_type: LOCAL_SERVICE.asset_type(request.asset_type),
                style: LOCAL_SERVICE.style(request.style),
            };

            debug!(provider = %self.id, index, "requesting image");
            let response = self
                .client
                .post(endpoint(&self.base_url, "generate"))
                .json(&body)
                .send()
                .await
                .map_err(request_failed)?;
            let generated: GenerateResponse = read_json(response).await?;

            if !generated.success {
                return Err(ProviderFailure::Rejected(
                    generated
                        .error
                        .unwrap_or_else(|| "generation reported failure".to_string()),
                ));
            }
            let image = generated.image_base64.ok_or_else(|| {
                ProviderFailure::InvalidResponse("missing image_base64".to_string())
            })?;

            assets.push(GeneratedAsset {
                id: generated
                    .generation_id
                    .unwrap_or_else(|| format!("{}-{}", self.id, index)),
                uri: format!("data:image/{};base64,{}", request.format.as_str(), image),
                width: request.width,
                height: request.height,
                format: request.format,
                seed,
            });

            let done = index + 1;
            progress.report(
                ProviderProgress::new(
                    done as f32 * 100.0 / request.count as f32,
                    format!("Generated {} of {} assets", done, request.count),
                )
                .with_steps(done, request.count)
                .with_payload(serde_json::json!({ "assetsCompleted": done })),
            );
        }

        Ok(GenerationOutput {
            assets,
            provider: self.id.clone(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn train_style(
        &self,
        request: &StylePackRequest,
        progress: &ProgressSink,
    ) -> ProviderResult<StylePackOutput> {
        let body = TrainBody {
            name: &request.name,
            description: request.description.as_deref(),
            reference_images: &request.reference_images,
            training_steps: request.training_steps,
            resolution: request.resolution,
        };

        progress.report(ProviderProgress::new(0.0, "Training started").with_steps(0, request.training_steps));
        let response = self
            .client
            .post(endpoint(&self.base_url, "style-packs/train"))
            .json(&body)
            .send()
            .await
            .map_err(request_failed)?;
        let trained: TrainResponse = read_json(response).await?;

        if !trained.success {
            return Err(ProviderFailure::Rejected(
                trained
                    .error
                    .unwrap_or_else(|| "training reported failure".to_string()),
            ));
        }
        let (Some(style_pack_id), Some(model_uri)) = (trained.style_pack_id, trained.model_uri)
        else {
            return Err(ProviderFailure::InvalidResponse(
                "missing style_pack_id or model_uri".to_string(),
            ));
        };

        progress.report(
            ProviderProgress::new(100.0, "Training finished")
                .with_steps(request.training_steps, request.training_steps),
        );
        Ok(StylePackOutput {
            style_pack_id,
            name: request.name.clone(),
            model_uri,
            provider: self.id.clone(),
            final_loss: trained.final_loss,
            completed_at: Utc::now(),
        })
    }
}
