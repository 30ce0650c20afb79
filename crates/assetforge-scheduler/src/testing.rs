//! Scripted in-process providers and fixtures for scheduler tests.

use assetforge_core::generation::{
    AssetFormat, AssetType, GeneratedAsset, GenerationOutput, GenerationRequest, QualityLevel,
    StylePackOutput, StylePackRequest,
};
use assetforge_core::job::{JobPayload, NewJob, Priority};
use assetforge_core::provider::{
    GenerationProvider, ProgressSink, ProviderFailure, ProviderProgress, ProviderResult,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) enum HealthScript {
    Healthy,
    Fail(String),
    /// Never answers; only a timeout ends the check.
    Hang,
}

pub(crate) enum Generate {
    /// Report each percentage in turn, then return `assets` assets.
    Succeed { assets: usize, steps: Vec<f32> },
    Fail(String),
    Hang,
}

pub(crate) struct ScriptedProvider {
    id: String,
    health: HealthScript,
    generate: Generate,
    delay: Duration,
    health_checks: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// Healthy, returns one asset.
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            health: HealthScript::Healthy,
            generate: Generate::Succeed {
                assets: 1,
                steps: Vec::new(),
            },
            delay: Duration::ZERO,
            health_checks: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn health(mut self, health: HealthScript) -> Self {
        self.health = health;
        self
    }

    pub(crate) fn generate(mut self, generate: Generate) -> Self {
        self.generate = generate;
        self
    }

    /// Pause before answering each generation call.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// Prompts of every generation call received, in order.
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> ProviderResult<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        match &self.health {
            HealthScript::Healthy => Ok(()),
            HealthScript::Fail(msg) => Err(ProviderFailure::Request(msg.clone())),
            HealthScript::Hang => std::future::pending().await,
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: &ProgressSink,
    ) -> ProviderResult<GenerationOutput> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        tokio::time::sleep(self.delay).await;
        match &self.generate {
            Generate::Succeed { assets, steps } => {
                for pct in steps {
                    progress.report(ProviderProgress::new(*pct, format!("{}%", pct)));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(GenerationOutput {
                    assets: (0..*assets)
                        .map(|i| GeneratedAsset {
                            id: format!("{}-{}", self.id, i),
                            uri: format!("memory://{}/{}", self.id, i),
                            width: request.width,
                            height: request.height,
                            format: request.format,
                            seed: None,
                        })
                        .collect(),
                    provider: self.id.clone(),
                    processing_time_ms: self.delay.as_millis() as u64,
                })
            }
            Generate::Fail(msg) => Err(ProviderFailure::Status {
                status: 500,
                body: msg.clone(),
            }),
            Generate::Hang => std::future::pending().await,
        }
    }

    async fn train_style(
        &self,
        request: &StylePackRequest,
        _progress: &ProgressSink,
    ) -> ProviderResult<StylePackOutput> {
        self.prompts.lock().unwrap().push(request.name.clone());
        match &self.generate {
            Generate::Succeed { .. } => Ok(StylePackOutput {
                style_pack_id: format!("{}-pack", self.id),
                name: request.name.clone(),
                model_uri: format!("memory://{}/pack", self.id),
                provider: self.id.clone(),
                final_loss: Some(0.1),
                completed_at: Utc::now(),
            }),
            Generate::Fail(msg) => Err(ProviderFailure::Rejected(msg.clone())),
            Generate::Hang => std::future::pending().await,
        }
    }
}

pub(crate) fn knight_request(prompt: &str) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.to_string(),
        negative_prompt: None,
        asset_type: AssetType::CharacterDesign,
        style: None,
        quality: QualityLevel::Standard,
        format: AssetFormat::Png,
        width: 512,
        height: 512,
        count: 1,
        steps: None,
        guidance_scale: None,
        seed: None,
    }
}

pub(crate) fn knight_job(owner: &str, prompt: &str) -> NewJob {
    NewJob {
        owner_id: owner.to_string(),
        project_id: Some("proj-1".to_string()),
        payload: JobPayload::Generation(knight_request(prompt)),
        priority: Priority::Normal,
        delay: Duration::ZERO,
    }
}
