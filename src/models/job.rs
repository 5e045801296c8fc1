use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::Display;
use uuid::Uuid;

use crate::models::detection::DetectionResult;

/// Lifecycle state of an analysis job.
///
/// Transitions are monotonic: `Pending -> Processing -> {Completed | Failed}`.
/// A job never moves back to an earlier state, and both `Completed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// Request to analyze one uploaded image against a set of text prompts.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnalysisRequest {
    /// ID of a previously uploaded image
    #[garde(length(min = 1))]
    pub image_id: String,

    /// Text prompts guiding detection, at least one non-blank entry
    #[garde(length(min = 1))]
    pub prompts: Vec<String>,

    /// Bounding-box confidence threshold
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_box_threshold")]
    pub box_threshold: f64,

    /// Text-match confidence threshold
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_text_threshold")]
    pub text_threshold: f64,

    #[garde(skip)]
    #[serde(default = "default_true")]
    pub include_segmentation: bool,
}

fn default_box_threshold() -> f64 {
    0.35
}

fn default_text_threshold() -> f64 {
    0.25
}

fn default_true() -> bool {
    true
}

impl AnalysisRequest {
    pub fn new(image_id: impl Into<String>, prompts: Vec<String>) -> Self {
        Self {
            image_id: image_id.into(),
            prompts,
            box_threshold: default_box_threshold(),
            text_threshold: default_text_threshold(),
            include_segmentation: true,
        }
    }

    /// Trim prompts and drop entries that are blank after trimming. Called
    /// before validation, so a request whose prompts all normalize away
    /// fails the `length(min = 1)` rule.
    pub fn normalize(&mut self) {
        self.prompts = self
            .prompts
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }
}

/// The central record tracked by the job registry.
///
/// Invariants: `detections` is non-empty only when the status is
/// `Completed`; `error_message` is set exactly when the status is `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub image_id: String,
    pub status: JobStatus,
    pub detections: Vec<DetectionResult>,

    /// URL of the uploaded box/mask overlay image, when one was produced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization_url: Option<String>,

    /// Wall-clock duration of the background execution
    pub processing_time_ms: u64,

    /// Identifiers of the models that served the run
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_info: HashMap<String, String>,

    /// Run metadata: prompts, thresholds, detection counts
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AnalysisJob {
    /// Build the initial `Pending` record for a validated request.
    pub fn pending(request: &AnalysisRequest) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("prompts".into(), serde_json::json!(request.prompts));
        metadata.insert(
            "box_threshold".into(),
            serde_json::json!(request.box_threshold),
        );
        metadata.insert(
            "text_threshold".into(),
            serde_json::json!(request.text_threshold),
        );
        metadata.insert(
            "include_segmentation".into(),
            serde_json::json!(request.include_segmentation),
        );

        Self {
            id: Uuid::new_v4(),
            image_id: request.image_id.clone(),
            status: JobStatus::Pending,
            detections: Vec::new(),
            visualization_url: None,
            processing_time_ms: 0,
            model_info: HashMap::new(),
            metadata,
            created_at: Utc::now(),
            error_message: None,
        }
    }
}
