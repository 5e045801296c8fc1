//! Keyed store of analysis jobs.
//!
//! The registry is the only shared mutable state in the core. Updates to a
//! single job are serialized; reads and operations on distinct job ids
//! proceed concurrently.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::detection::DetectionResult;
use crate::models::job::{AnalysisJob, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {0} already exists")]
    DuplicateId(Uuid),

    #[error("illegal status transition {from} -> {to} for job {id}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

/// An atomic state transition applied through [`JobRepository::update`].
#[derive(Debug, Clone)]
pub enum JobMutation {
    /// `Pending -> Processing`
    Start,
    /// `Processing -> Completed`, recording the structured results
    Complete {
        detections: Vec<DetectionResult>,
        visualization_url: Option<String>,
        processing_time_ms: u64,
        model_info: HashMap<String, String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    /// `Processing -> Failed`, recording a human-readable reason
    Fail {
        error: String,
        processing_time_ms: u64,
    },
}

impl JobMutation {
    fn target_status(&self) -> JobStatus {
        match self {
            JobMutation::Start => JobStatus::Processing,
            JobMutation::Complete { .. } => JobStatus::Completed,
            JobMutation::Fail { .. } => JobStatus::Failed,
        }
    }

    fn apply(self, job: &mut AnalysisJob) {
        job.status = self.target_status();
        match self {
            JobMutation::Start => {}
            JobMutation::Complete {
                detections,
                visualization_url,
                processing_time_ms,
                model_info,
                metadata,
            } => {
                job.detections = detections;
                job.visualization_url = visualization_url;
                job.processing_time_ms = processing_time_ms;
                job.model_info = model_info;
                job.metadata.extend(metadata);
            }
            JobMutation::Fail {
                error,
                processing_time_ms,
            } => {
                job.detections.clear();
                job.processing_time_ms = processing_time_ms;
                job.error_message = Some(error);
            }
        }
    }
}

/// Repository of [`AnalysisJob`] records, injected into the orchestrator.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job. Fails with [`RegistryError::DuplicateId`] when the
    /// id is already present.
    async fn create(&self, job: AnalysisJob) -> Result<(), RegistryError>;

    /// Snapshot of a job by id.
    async fn get(&self, id: Uuid) -> Result<AnalysisJob, RegistryError>;

    /// Apply an atomic state transition, enforcing monotonic status.
    async fn update(&self, id: Uuid, mutation: JobMutation) -> Result<AnalysisJob, RegistryError>;

    /// All jobs for an image, newest first.
    async fn list_by_image(&self, image_id: &str) -> Vec<AnalysisJob>;

    /// Remove a job record. Jobs are never deleted automatically; this is
    /// an explicit caller operation.
    async fn delete(&self, id: Uuid) -> Result<(), RegistryError>;
}

type JobSlot = Arc<RwLock<AnalysisJob>>;

/// In-process registry with two-level locking: the outer map lock is held
/// only for insert/remove/lookup, while a per-job lock serializes writers on
/// one id without blocking other jobs.
#[derive(Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<Uuid, JobSlot>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: Uuid) -> Result<JobSlot, RegistryError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRegistry {
    async fn create(&self, job: AnalysisJob) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::DuplicateId(job.id));
        }
        jobs.insert(job.id, Arc::new(RwLock::new(job)));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<AnalysisJob, RegistryError> {
        let slot = self.slot(id).await?;
        let job = slot.read().await;
        Ok(job.clone())
    }

    async fn update(&self, id: Uuid, mutation: JobMutation) -> Result<AnalysisJob, RegistryError> {
        let slot = self.slot(id).await?;
        let mut job = slot.write().await;
        let target = mutation.target_status();
        if !job.status.can_transition_to(target) {
            return Err(RegistryError::InvalidTransition {
                id,
                from: job.status,
                to: target,
            });
        }
        mutation.apply(&mut job);
        Ok(job.clone())
    }

    async fn list_by_image(&self, image_id: &str) -> Vec<AnalysisJob> {
        let slots: Vec<JobSlot> = self.jobs.read().await.values().cloned().collect();

        let mut matching = Vec::new();
        for slot in slots {
            let job = slot.read().await;
            if job.image_id == image_id {
                matching.push(job.clone());
            }
        }
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching
    }

    async fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }
}
