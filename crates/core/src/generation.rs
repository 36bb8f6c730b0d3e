//! Generation job payloads, request projections and submission validation.
//!
//! A [`CreateGenerationRequest`] is what a client submits; it is validated
//! and normalised into an immutable [`Job`] by [`CreateGenerationRequest::into_job`].
//! [`GenerationRequest`] is the read-only projection of a persisted request
//! handed back to clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::scheduling::{RequestStatus, PRIORITY_BACKGROUND, PRIORITY_NORMAL, PRIORITY_URGENT};
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum prompt (and negative prompt) length in characters.
pub const MAX_PROMPT_LENGTH: usize = 1500;
/// Maximum width or height in pixels.
pub const MAX_DIMENSION: i32 = 2048;
/// Maximum sampling steps.
pub const MAX_STEPS: i32 = 150;
/// Maximum images per request.
pub const MAX_QUANTITY: i32 = 10;
/// Accepted CFG scale range.
pub const MIN_CFG_SCALE: f64 = 1.0;
pub const MAX_CFG_SCALE: f64 = 30.0;
/// Maximum clip-skip value.
pub const MAX_CLIP_SKIP: i32 = 10;

/// Sampler names understood by the rendering workers.
pub const ALL_SAMPLERS: &[&str] = &[
    "Euler a",
    "Euler",
    "LMS",
    "Heun",
    "DPM2",
    "DPM2 a",
    "DPM++ 2S a",
    "DPM++ 2M",
    "DPM++ SDE",
    "DPM fast",
    "DPM adaptive",
    "LMS Karras",
    "DPM2 Karras",
    "DPM2 a Karras",
    "DPM++ 2S a Karras",
    "DPM++ 2M Karras",
    "DPM++ SDE Karras",
    "DDIM",
    "PLMS",
    "UniPC",
];

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Kind of asset a resource refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelType {
    Checkpoint,
    TextualInversion,
    Hypernetwork,
    AestheticGradient,
    #[serde(rename = "LORA")]
    Lora,
    LoCon,
    Controlnet,
    Poses,
    Wildcards,
    Other,
}

impl ModelType {
    pub fn is_primary(self) -> bool {
        self == ModelType::Checkpoint
    }
}

/// An asset used by a job.
///
/// `strength` only means something for auxiliary (non-checkpoint) resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub id: DbId,
    pub model_type: ModelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

impl ResourceReference {
    pub fn new(id: DbId, model_type: ModelType) -> Self {
        Self {
            id,
            model_type,
            strength: None,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength);
        self
    }
}

/// Auxiliary network settings stored in a [`Job`], keyed by resource id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalNetwork {
    pub model_type: ModelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

// ---------------------------------------------------------------------------
// Params and job
// ---------------------------------------------------------------------------

/// Sampling parameters of a job. Immutable once the job is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: i32,
    pub height: i32,
    pub sampler: String,
    pub steps: i32,
    pub cfg_scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_skip: Option<i32>,
}

/// The immutable payload describing what to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Images to produce, `1..=MAX_QUANTITY`. Kept here rather than in
    /// [`GenerationParams`] so a request has a single count.
    pub quantity: i32,
    pub priority: i32,
    /// The primary (checkpoint) model.
    pub model: ResourceReference,
    pub params: GenerationParams,
    #[serde(default)]
    pub additional_networks: BTreeMap<DbId, AdditionalNetwork>,
}

impl Job {
    /// Every resource the job needs, primary model first.
    pub fn resources(&self) -> Vec<ResourceReference> {
        std::iter::once(self.model.clone())
            .chain(
                self.additional_networks
                    .iter()
                    .map(|(id, network)| ResourceReference {
                        id: *id,
                        model_type: network.model_type,
                        strength: network.strength,
                    }),
            )
            .collect()
    }

    /// The submission that reproduces this job, for resubmitting a past
    /// request. Priority is left unset so a copy never inherits an
    /// elevated one.
    pub fn to_submission(&self) -> CreateGenerationRequest {
        let params = self.params.clone();
        CreateGenerationRequest {
            resources: self.resources(),
            prompt: params.prompt,
            negative_prompt: params.negative_prompt,
            width: params.width,
            height: params.height,
            sampler: params.sampler,
            steps: params.steps,
            cfg_scale: params.cfg_scale,
            seed: params.seed,
            clip_skip: params.clip_skip,
            quantity: self.quantity,
            priority: None,
        }
    }
}

/// A job submission as sent by clients.
///
/// Resources are a flat list; exactly one must be a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateGenerationRequest {
    pub resources: Vec<ResourceReference>,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub width: i32,
    pub height: i32,
    pub sampler: String,
    pub steps: i32,
    pub cfg_scale: f64,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub clip_skip: Option<i32>,
    pub quantity: i32,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl CreateGenerationRequest {
    /// Validate the submission and build the [`Job`] it describes.
    ///
    /// `allow_elevated_priority` is true for moderators; everyone else is
    /// limited to normal priority or below.
    pub fn into_job(self, allow_elevated_priority: bool) -> Result<Job, CoreError> {
        validate_quantity(self.quantity)?;
        let priority = self.priority.unwrap_or(PRIORITY_NORMAL);
        validate_priority(priority, allow_elevated_priority)?;

        let params = GenerationParams {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt.filter(|p| !p.trim().is_empty()),
            width: self.width,
            height: self.height,
            sampler: self.sampler,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            seed: self.seed,
            clip_skip: self.clip_skip,
        };
        validate_params(&params)?;

        let primary = validate_resources(&self.resources)?;
        let mut model = None;
        let mut additional_networks = BTreeMap::new();
        for resource in self.resources {
            if resource.model_type.is_primary() {
                model = Some(ResourceReference {
                    strength: None,
                    ..resource
                });
            } else {
                additional_networks.insert(
                    resource.id,
                    AdditionalNetwork {
                        model_type: resource.model_type,
                        strength: resource.strength,
                    },
                );
            }
        }
        let model = model.ok_or_else(|| {
            CoreError::Internal(format!("primary resource {primary} vanished during validation"))
        })?;

        Ok(Job {
            quantity: self.quantity,
            priority,
            model,
            params,
            additional_networks,
        })
    }
}

// ---------------------------------------------------------------------------
// Request projection
// ---------------------------------------------------------------------------

/// An image produced by a worker for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: DbId,
    pub hash: String,
    pub url: String,
    /// Flips from false to true once, when the upload finishes.
    pub available: bool,
    pub request_id: DbId,
}

/// An image reported by a worker callback, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGeneratedImage {
    pub hash: String,
    pub url: String,
    #[serde(default)]
    pub available: bool,
}

/// Read-only projection of a persisted generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: DbId,
    pub created_at: Timestamp,
    pub estimated_completion_date: Timestamp,
    pub status: RequestStatus,
    pub job: Job,
    #[serde(default)]
    pub images: Vec<GeneratedImage>,
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Validate the requested image count.
pub fn validate_quantity(quantity: i32) -> Result<(), CoreError> {
    if !(1..=MAX_QUANTITY).contains(&quantity) {
        return Err(CoreError::Validation(format!(
            "quantity must be between 1 and {MAX_QUANTITY}, got {quantity}"
        )));
    }
    Ok(())
}

/// Validate a job priority.
pub fn validate_priority(priority: i32, allow_elevated: bool) -> Result<(), CoreError> {
    if !(PRIORITY_BACKGROUND..=PRIORITY_URGENT).contains(&priority) {
        return Err(CoreError::Validation(format!(
            "priority must be between {PRIORITY_BACKGROUND} and {PRIORITY_URGENT}"
        )));
    }
    if priority > PRIORITY_NORMAL && !allow_elevated {
        return Err(CoreError::Validation(
            "Only moderators may submit jobs above normal priority".to_string(),
        ));
    }
    Ok(())
}

/// Validate sampling parameters.
///
/// Rules:
/// - Prompt must not be empty and must not exceed `MAX_PROMPT_LENGTH`.
/// - Width and height must be in `1..=MAX_DIMENSION`.
/// - Steps must be in `1..=MAX_STEPS`.
/// - CFG scale must be finite and within `MIN_CFG_SCALE..=MAX_CFG_SCALE`.
/// - Seed, when present, must be non-negative.
/// - Clip skip, when present, must be in `0..=MAX_CLIP_SKIP`.
/// - Sampler must be one of [`ALL_SAMPLERS`].
pub fn validate_params(params: &GenerationParams) -> Result<(), CoreError> {
    if params.prompt.trim().is_empty() {
        return Err(CoreError::Validation("prompt must not be empty".to_string()));
    }
    if params.prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(CoreError::Validation(format!(
            "prompt must not exceed {MAX_PROMPT_LENGTH} characters"
        )));
    }
    if let Some(negative) = &params.negative_prompt {
        if negative.chars().count() > MAX_PROMPT_LENGTH {
            return Err(CoreError::Validation(format!(
                "negative_prompt must not exceed {MAX_PROMPT_LENGTH} characters"
            )));
        }
    }
    for (name, value) in [("width", params.width), ("height", params.height)] {
        if value <= 0 || value > MAX_DIMENSION {
            return Err(CoreError::Validation(format!(
                "{name} must be between 1 and {MAX_DIMENSION}, got {value}"
            )));
        }
    }
    if params.steps <= 0 || params.steps > MAX_STEPS {
        return Err(CoreError::Validation(format!(
            "steps must be between 1 and {MAX_STEPS}, got {}",
            params.steps
        )));
    }
    if !params.cfg_scale.is_finite()
        || params.cfg_scale < MIN_CFG_SCALE
        || params.cfg_scale > MAX_CFG_SCALE
    {
        return Err(CoreError::Validation(format!(
            "cfg_scale must be between {MIN_CFG_SCALE} and {MAX_CFG_SCALE}"
        )));
    }
    if let Some(seed) = params.seed {
        if seed < 0 {
            return Err(CoreError::Validation("seed must be non-negative".to_string()));
        }
    }
    if let Some(clip_skip) = params.clip_skip {
        if !(0..=MAX_CLIP_SKIP).contains(&clip_skip) {
            return Err(CoreError::Validation(format!(
                "clip_skip must be between 0 and {MAX_CLIP_SKIP}"
            )));
        }
    }
    if !ALL_SAMPLERS.contains(&params.sampler.as_str()) {
        return Err(CoreError::Validation(format!(
            "Unknown sampler '{}'",
            params.sampler
        )));
    }
    Ok(())
}

/// Validate a job's resource list and return the id of the primary model.
///
/// Rules:
/// - Exactly one resource must be a `Checkpoint`.
/// - Resource ids must be unique.
/// - Strengths, when present, must be finite.
pub fn validate_resources(resources: &[ResourceReference]) -> Result<DbId, CoreError> {
    let checkpoints: Vec<DbId> = resources
        .iter()
        .filter(|r| r.model_type.is_primary())
        .map(|r| r.id)
        .collect();
    let primary = match checkpoints.as_slice() {
        [id] => *id,
        [] => {
            return Err(CoreError::Validation(
                "A checkpoint model is required".to_string(),
            ))
        }
        _ => {
            return Err(CoreError::Validation(format!(
                "Exactly one checkpoint model is allowed, got {}",
                checkpoints.len()
            )))
        }
    };

    let mut seen = std::collections::HashSet::with_capacity(resources.len());
    for resource in resources {
        if !seen.insert(resource.id) {
            return Err(CoreError::Validation(format!(
                "Duplicate resource id {}",
                resource.id
            )));
        }
        if let Some(strength) = resource.strength {
            if !strength.is_finite() {
                return Err(CoreError::Validation(format!(
                    "Strength for resource {} must be a finite number",
                    resource.id
                )));
            }
        }
    }

    Ok(primary)
}

/// Validate an image reported by a worker.
pub fn validate_new_image(image: &NewGeneratedImage) -> Result<(), CoreError> {
    if image.hash.trim().is_empty() {
        return Err(CoreError::Validation("image hash must not be empty".to_string()));
    }
    if image.url.trim().is_empty() {
        return Err(CoreError::Validation("image url must not be empty".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
