//! Generation and style-pack training payloads.
//!
//! These are the provider-neutral shapes a job carries. Provider adapters
//! translate them into their own request schemas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of game asset requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetType {
    CharacterDesign,
    EnvironmentArt,
    PropDesign,
    UiElement,
    ConceptArt,
}

impl AssetType {
    pub const ALL: [AssetType; 5] = [
        AssetType::CharacterDesign,
        AssetType::EnvironmentArt,
        AssetType::PropDesign,
        AssetType::UiElement,
        AssetType::ConceptArt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::CharacterDesign => "character-design",
            AssetType::EnvironmentArt => "environment-art",
            AssetType::PropDesign => "prop-design",
            AssetType::UiElement => "ui-element",
            AssetType::ConceptArt => "concept-art",
        }
    }
}

impl FromStr for AssetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown asset type '{}'", s))
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visual style hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StyleType {
    PixelArt,
    HandDrawn,
    Realistic,
    Cartoon,
    Minimalist,
}

impl StyleType {
    pub const ALL: [StyleType; 5] = [
        StyleType::PixelArt,
        StyleType::HandDrawn,
        StyleType::Realistic,
        StyleType::Cartoon,
        StyleType::Minimalist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StyleType::PixelArt => "pixel-art",
            StyleType::HandDrawn => "hand-drawn",
            StyleType::Realistic => "realistic",
            StyleType::Cartoon => "cartoon",
            StyleType::Minimalist => "minimalist",
        }
    }
}

impl FromStr for StyleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown style '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Draft,
    #[default]
    Standard,
    High,
    Production,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 4] = [
        QualityLevel::Draft,
        QualityLevel::Standard,
        QualityLevel::High,
        QualityLevel::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Draft => "draft",
            QualityLevel::Standard => "standard",
            QualityLevel::High => "high",
            QualityLevel::Production => "production",
        }
    }

    /// Default sampling steps for this quality level.
    pub fn default_steps(&self) -> u32 {
        match self {
            QualityLevel::Draft => 12,
            QualityLevel::Standard => 20,
            QualityLevel::High => 30,
            QualityLevel::Production => 50,
        }
    }
}

impl FromStr for QualityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown quality '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetFormat {
    #[default]
    Png,
    Webp,
    Svg,
    Jpg,
}

impl AssetFormat {
    pub const ALL: [AssetFormat; 4] = [
        AssetFormat::Png,
        AssetFormat::Webp,
        AssetFormat::Svg,
        AssetFormat::Jpg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetFormat::Png => "png",
            AssetFormat::Webp => "webp",
            AssetFormat::Svg => "svg",
            AssetFormat::Jpg => "jpg",
        }
    }
}

impl FromStr for AssetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown format '{}'", s))
    }
}

/// Provider-neutral generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub asset_type: AssetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StyleType>,
    #[serde(default)]
    pub quality: QualityLevel,
    #[serde(default)]
    pub format: AssetFormat,
    pub width: u32,
    pub height: u32,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Sampling steps, falling back to the quality level's default.
    pub fn effective_steps(&self) -> u32 {
        self.steps.unwrap_or_else(|| self.quality.default_steps())
    }

    pub fn effective_guidance_scale(&self) -> f32 {
        self.guidance_scale.unwrap_or(7.5)
    }
}

/// Style-pack (LoRA) training request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePackRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub reference_images: Vec<String>,
    pub training_steps: u32,
    pub resolution: u32,
}

/// A single generated asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedAsset {
    pub id: String,
    /// URL or `data:` URI of the image.
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub format: AssetFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutput {
    pub assets: Vec<GeneratedAsset>,
    pub provider: String,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePackOutput {
    pub style_pack_id: String,
    pub name: String,
    pub model_uri: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_loss: Option<f64>,
    pub completed_at: DateTime<Utc>,
}
