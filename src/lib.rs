//! Prompt-guided image analysis core.
//!
//! This library implements the asynchronous analysis-job orchestrator behind
//! promptscan: callers submit an uploaded image together with a set of text
//! prompts, a job record is created immediately, and detection (plus optional
//! mask segmentation) runs in the background against a pluggable inference
//! capability. Derived artifacts (segmentation masks and visualization
//! overlays) are persisted through a pluggable object-storage backend.
//!
//! The HTTP/API surface, user management, and raw image upload endpoints are
//! intentionally not part of this crate; embedding services construct an
//! [`services::orchestrator::AnalysisOrchestrator`] from the adapters in
//! [`services`] and a [`registry::JobRepository`], then expose it however
//! they see fit.

pub mod config;
pub mod models;
pub mod registry;
pub mod services;

pub use config::AppConfig;
pub use models::detection::{BoundingBox, DetectionResult, SegmentationMask};
pub use models::job::{AnalysisJob, AnalysisRequest, JobStatus};
pub use registry::{InMemoryJobRegistry, JobMutation, JobRepository, RegistryError};
pub use services::inference::{InferenceAdapter, InferenceError, RemoteInference};
pub use services::orchestrator::{AnalysisError, AnalysisOrchestrator, ExecutionLimits};
pub use services::storage::{LocalStorage, ObjectStorage, S3Storage, StorageError};
