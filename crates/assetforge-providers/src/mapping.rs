//! Request-shape mapping tables.
//!
//! Each provider speaks its own vocabulary for asset types and styles. The
//! tables translate the generic enums; values a provider has no entry for
//! fall back to a fixed default instead of failing the request.

use assetforge_core::generation::{AssetType, GenerationRequest, QualityLevel, StyleType};

pub const FALLBACK_ASSET_TYPE: &str = "prop-design";
pub const FALLBACK_STYLE: &str = "realistic";

/// One provider's translation table.
#[derive(Debug)]
pub struct RequestMapping {
    pub asset_types: &'static [(AssetType, &'static str)],
    pub styles: &'static [(StyleType, &'static str)],
}

impl RequestMapping {
    pub fn asset_type(&self, asset_type: AssetType) -> &'static str {
        self.asset_types
            .iter()
            .find(|(t, _)| *t == asset_type)
            .map(|(_, label)| *label)
            .unwrap_or(FALLBACK_ASSET_TYPE)
    }

    /// No style requested maps to the fallback too.
    pub fn style(&self, style: Option<StyleType>) -> &'static str {
        style
            .and_then(|s| self.styles.iter().find(|(t, _)| *t == s))
            .map(|(_, label)| *label)
            .unwrap_or(FALLBACK_STYLE)
    }
}

/// Self-hosted model service.
pub static LOCAL_SERVICE: RequestMapping = RequestMapping {
    asset_types: &[
        (AssetType::CharacterDesign, "character-design"),
        (AssetType::EnvironmentArt, "environment-art"),
        (AssetType::PropDesign, "prop-design"),
        (AssetType::UiElement, "ui-element"),
    ],
    styles: &[
        (StyleType::PixelArt, "pixel-art"),
        (StyleType::HandDrawn, "hand-drawn"),
        (StyleType::Realistic, "realistic"),
        (StyleType::Cartoon, "cartoon"),
    ],
};

/// Hosted third-party API. Style names follow its preset catalogue.
pub static HOSTED_API: RequestMapping = RequestMapping {
    asset_types: &[
        (AssetType::CharacterDesign, "character-design"),
        (AssetType::EnvironmentArt, "environment-art"),
        (AssetType::PropDesign, "prop-design"),
        (AssetType::ConceptArt, "concept-art"),
    ],
    styles: &[
        (StyleType::PixelArt, "pixel-art"),
        (StyleType::HandDrawn, "line-art"),
        (StyleType::Realistic, "realistic"),
        (StyleType::Cartoon, "comic-book"),
    ],
};

/// Prompt with asset-type, style and quality hints appended.
pub fn enhance_prompt(request: &GenerationRequest) -> String {
    let mut prompt = request.prompt.clone();

    if let Some(style) = request.style {
        prompt.push_str(match style {
            StyleType::PixelArt => ", pixel art style, 8-bit graphics, retro gaming",
            StyleType::HandDrawn => ", hand drawn illustration, artistic sketch",
            StyleType::Realistic => ", photorealistic, detailed",
            StyleType::Cartoon => ", cartoon style, stylized, colorful",
            StyleType::Minimalist => ", minimalist design, clean, simple",
        });
    }

    prompt.push_str(match request.asset_type {
        AssetType::CharacterDesign => ", character design, full body, game character",
        AssetType::EnvironmentArt => ", environment art, landscape, game level",
        AssetType::PropDesign => ", game prop, object design, isolated on white background",
        AssetType::UiElement => ", UI element, interface design, clean graphics",
        AssetType::ConceptArt => ", concept art, exploratory sketch",
    });

    if matches!(request.quality, QualityLevel::High | QualityLevel::Production) {
        prompt.push_str(", high quality, detailed, professional");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetforge_core::generation::AssetFormat;

    #[test]
    fn unmapped_values_fall_back() {
        assert_eq!(LOCAL_SERVICE.asset_type(AssetType::ConceptArt), "prop-design");
        assert_eq!(LOCAL_SERVICE.style(Some(StyleType::Minimalist)), "realistic");
        assert_eq!(HOSTED_API.asset_type(AssetType::UiElement), "prop-design");
        assert_eq!(HOSTED_API.style(None), "realistic");
    }

    #[test]
    fn mapped_values_use_provider_vocabulary() {
        assert_eq!(HOSTED_API.style(Some(StyleType::Cartoon)), "comic-book");
        assert_eq!(
            LOCAL_SERVICE.asset_type(AssetType::CharacterDesign),
            "character-design"
        );
    }

    #[test]
    fn prompt_gets_type_and_style_hints() {
        let request = GenerationRequest {
            prompt: "knight".to_string(),
            negative_prompt: None,
            asset_type: AssetType::CharacterDesign,
            style: Some(StyleType::PixelArt),
            quality: QualityLevel::Production,
            format: AssetFormat::Png,
            width: 512,
            height: 512,
            count: 1,
            steps: None,
            guidance_scale: None,
            seed: None,
        };
        let prompt = enhance_prompt(&request);
        assert!(prompt.starts_with("knight, pixel art style"));
        assert!(prompt.contains("game character"));
        assert!(prompt.ends_with("professional"));
    }
}
