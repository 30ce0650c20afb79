//! Submission validation.
//!
//! Raw submission bodies are checked against a fixed schema and turned into
//! typed payloads. Nothing reaches the job store unless it passes here.

use serde::Deserialize;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::generation::{
    AssetFormat, AssetType, GenerationRequest, QualityLevel, StylePackRequest, StyleType,
};
use crate::job::{JobPayload, Priority, QueueName};
use crate::{Error, Result};

pub const PROMPT_LENGTH: RangeInclusive<usize> = 1..=1000;
pub const DIMENSION: RangeInclusive<u32> = 64..=2048;
pub const BATCH_SIZE: RangeInclusive<u32> = 1..=10;
pub const STEPS: RangeInclusive<u32> = 1..=150;
pub const GUIDANCE_SCALE: RangeInclusive<f32> = 1.0..=30.0;
pub const STYLE_PACK_NAME_LENGTH: RangeInclusive<usize> = 1..=100;
pub const REFERENCE_IMAGES: RangeInclusive<usize> = 5..=100;
pub const TRAINING_STEPS: RangeInclusive<u32> = 100..=5000;
pub const TRAINING_RESOLUTION: RangeInclusive<u32> = 256..=1024;
/// Seconds a submission may ask to be held back.
pub const DELAY_SECONDS: RangeInclusive<u32> = 0..=86_400;

const DEFAULT_DIMENSION: u32 = 512;
const DEFAULT_TRAINING_STEPS: u32 = 1000;

/// Raw asset-generation submission body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenerationSubmission {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub asset_type: String,
    pub style: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(alias = "batchSize")]
    pub count: Option<u32>,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub seed: Option<u64>,
    pub project_id: Option<String>,
    pub priority: Option<String>,
    pub delay_seconds: Option<u32>,
}

/// Raw style-pack training submission body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StylePackSubmission {
    pub name: String,
    pub description: Option<String>,
    pub reference_images: Vec<String>,
    pub training_steps: Option<u32>,
    pub resolution: Option<u32>,
    pub project_id: Option<String>,
    pub priority: Option<String>,
    pub delay_seconds: Option<u32>,
}

/// A submission that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedSubmission {
    pub payload: JobPayload,
    pub project_id: Option<String>,
    pub priority: Priority,
    pub delay: Duration,
}

/// Validate a JSON submission body for `queue`.
pub fn validate_submission(queue: QueueName, body: serde_json::Value) -> Result<ValidatedSubmission> {
    match queue {
        QueueName::AssetGeneration => {
            let raw: GenerationSubmission = serde_json::from_value(body)
                .map_err(|e| Error::Validation(format!("malformed body: {}", e)))?;
            validate_generation(raw)
        }
        QueueName::StylePackTraining => {
            let raw: StylePackSubmission = serde_json::from_value(body)
                .map_err(|e| Error::Validation(format!("malformed body: {}", e)))?;
            validate_style_pack(raw)
        }
    }
}

pub fn validate_generation(raw: GenerationSubmission) -> Result<ValidatedSubmission> {
    check_length("prompt", &raw.prompt, PROMPT_LENGTH)?;
    if let Some(negative) = &raw.negative_prompt {
        check_length("negativePrompt", negative, 0..=*PROMPT_LENGTH.end())?;
    }

    let asset_type: AssetType = raw.asset_type.parse().map_err(Error::Validation)?;
    let style = raw
        .style
        .as_deref()
        .map(str::parse::<StyleType>)
        .transpose()
        .map_err(Error::Validation)?;
    let quality = raw
        .quality
        .as_deref()
        .map(str::parse::<QualityLevel>)
        .transpose()
        .map_err(Error::Validation)?
        .unwrap_or_default();
    let format = raw
        .format
        .as_deref()
        .map(str::parse::<AssetFormat>)
        .transpose()
        .map_err(Error::Validation)?
        .unwrap_or_default();

    let width = check_range("width", raw.width.unwrap_or(DEFAULT_DIMENSION), DIMENSION)?;
    let height = check_range("height", raw.height.unwrap_or(DEFAULT_DIMENSION), DIMENSION)?;
    let count = check_range("count", raw.count.unwrap_or(1), BATCH_SIZE)?;
    let steps = raw
        .steps
        .map(|s| check_range("steps", s, STEPS))
        .transpose()?;
    if let Some(scale) = raw.guidance_scale {
        if !GUIDANCE_SCALE.contains(&scale) {
            return Err(Error::Validation(format!(
                "guidanceScale must be between {} and {}",
                GUIDANCE_SCALE.start(),
                GUIDANCE_SCALE.end()
            )));
        }
    }

    Ok(ValidatedSubmission {
        payload: JobPayload::Generation(GenerationRequest {
            prompt: raw.prompt,
            negative_prompt: raw.negative_prompt.filter(|p| !p.is_empty()),
            asset_type,
            style,
            quality,
            format,
            width,
            height,
            count,
            steps,
            guidance_scale: raw.guidance_scale,
            seed: raw.seed,
        }),
        project_id: non_empty(raw.project_id),
        priority: parse_priority(raw.priority.as_deref())?,
        delay: parse_delay(raw.delay_seconds)?,
    })
}

pub fn validate_style_pack(raw: StylePackSubmission) -> Result<ValidatedSubmission> {
    check_length("name", raw.name.trim(), STYLE_PACK_NAME_LENGTH)?;
    if !REFERENCE_IMAGES.contains(&raw.reference_images.len()) {
        return Err(Error::Validation(format!(
            "referenceImages must contain between {} and {} images",
            REFERENCE_IMAGES.start(),
            REFERENCE_IMAGES.end()
        )));
    }
    if raw.reference_images.iter().any(|r| r.trim().is_empty()) {
        return Err(Error::Validation(
            "referenceImages must not contain empty entries".to_string(),
        ));
    }
    let training_steps = check_range(
        "trainingSteps",
        raw.training_steps.unwrap_or(DEFAULT_TRAINING_STEPS),
        TRAINING_STEPS,
    )?;
    let resolution = check_range(
        "resolution",
        raw.resolution.unwrap_or(DEFAULT_DIMENSION),
        TRAINING_RESOLUTION,
    )?;

    Ok(ValidatedSubmission {
        payload: JobPayload::StylePack(StylePackRequest {
            name: raw.name.trim().to_string(),
            description: raw.description,
            reference_images: raw.reference_images,
            training_steps,
            resolution,
        }),
        project_id: non_empty(raw.project_id),
        priority: parse_priority(raw.priority.as_deref())?,
        delay: parse_delay(raw.delay_seconds)?,
    })
}

fn check_length(field: &str, value: &str, range: RangeInclusive<usize>) -> Result<()> {
    let len = value.chars().count();
    if range.contains(&len) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{} must be between {} and {} characters (got {})",
            field,
            range.start(),
            range.end(),
            len
        )))
    }
}

fn check_range(field: &str, value: u32, range: RangeInclusive<u32>) -> Result<u32> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(Error::Validation(format!(
            "{} must be between {} and {} (got {})",
            field,
            range.start(),
            range.end(),
            value
        )))
    }
}

fn parse_priority(raw: Option<&str>) -> Result<Priority> {
    raw.map(str::parse::<Priority>)
        .transpose()
        .map_err(Error::Validation)
        .map(Option::unwrap_or_default)
}

fn parse_delay(raw: Option<u32>) -> Result<Duration> {
    let seconds = check_range("delaySeconds", raw.unwrap_or(0), DELAY_SECONDS)?;
    Ok(Duration::from_secs(u64::from(seconds)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn knight() -> serde_json::Value {
        json!({
            "prompt": "knight",
            "assetType": "character-design",
            "width": 512,
            "height": 512,
            "count": 1
        })
    }

    #[test]
    fn accepts_minimal_generation_request() {
        let validated = validate_submission(QueueName::AssetGeneration, knight()).unwrap();
        let JobPayload::Generation(request) = validated.payload else {
            panic!("expected generation payload");
        };
        assert_eq!(request.asset_type, AssetType::CharacterDesign);
        assert_eq!(request.count, 1);
        assert_eq!(request.quality, QualityLevel::Standard);
        assert_eq!(validated.priority, Priority::Normal);
    }

    #[test]
    fn rejects_empty_prompt() {
        let mut body = knight();
        body["prompt"] = json!("");
        let err = validate_submission(QueueName::AssetGeneration, body).unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("prompt")));
    }

    #[test]
    fn rejects_overlong_prompt() {
        let mut body = knight();
        body["prompt"] = json!("a".repeat(1001));
        assert!(validate_submission(QueueName::AssetGeneration, body).is_err());
    }

    #[test]
    fn rejects_out_of_range_dimensions_and_batch() {
        for (field, value) in [("width", 32), ("height", 4096), ("count", 11), ("count", 0)] {
            let mut body = knight();
            body[field] = json!(value);
            let err = validate_submission(QueueName::AssetGeneration, body).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{} = {}", field, value);
        }
    }

    #[test]
    fn rejects_unknown_enums() {
        for (field, value) in [
            ("assetType", "sprite"),
            ("quality", "ultra"),
            ("format", "gif"),
            ("style", "oil"),
            ("priority", "asap"),
        ] {
            let mut body = knight();
            body[field] = json!(value);
            assert!(
                validate_submission(QueueName::AssetGeneration, body).is_err(),
                "{} = {}",
                field,
                value
            );
        }
    }

    #[test]
    fn accepts_batch_size_alias() {
        let body = json!({
            "prompt": "crate",
            "assetType": "prop-design",
            "batchSize": 4
        });
        let validated = validate_submission(QueueName::AssetGeneration, body).unwrap();
        let JobPayload::Generation(request) = validated.payload else {
            panic!("expected generation payload");
        };
        assert_eq!(request.count, 4);
        assert_eq!(request.width, 512);
    }

    #[test]
    fn style_pack_needs_enough_reference_images() {
        let body = json!({
            "name": "pixel",
            "referenceImages": ["a.png", "b.png"]
        });
        assert!(validate_submission(QueueName::StylePackTraining, body).is_err());

        let body = json!({
            "name": "pixel",
            "referenceImages": ["a.png", "b.png", "c.png", "d.png", "e.png"],
            "projectId": "proj-9"
        });
        let validated = validate_submission(QueueName::StylePackTraining, body).unwrap();
        assert_eq!(validated.project_id.as_deref(), Some("proj-9"));
        assert_eq!(validated.payload.queue(), QueueName::StylePackTraining);
    }

    #[test]
    fn delay_seconds_is_bounded() {
        let validated = validate_submission(QueueName::AssetGeneration, knight()).unwrap();
        assert_eq!(validated.delay, Duration::ZERO);

        let mut body = knight();
        body["delaySeconds"] = json!(90);
        let validated = validate_submission(QueueName::AssetGeneration, body).unwrap();
        assert_eq!(validated.delay, Duration::from_secs(90));

        let mut body = knight();
        body["delaySeconds"] = json!(86_401);
        let err = validate_submission(QueueName::AssetGeneration, body).unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("delaySeconds")));
    }

    #[test]
    fn generation_body_is_rejected_on_training_queue() {
        assert!(validate_submission(QueueName::StylePackTraining, knight()).is_err());
    }
}
