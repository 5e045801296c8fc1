//! The analysis-job orchestrator.
//!
//! `CreateJob` validates the request, resolves the image, inserts a
//! `Pending` record, and schedules background execution decoupled from the
//! caller. The background path drives the job state machine to a terminal
//! state exactly once: every failure, including timeouts, cancellation, and
//! panics inside the pipeline, is converted into a `Failed` job rather than
//! escaping the task.

use garde::Validate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::detection::DetectionResult;
use crate::models::job::{AnalysisJob, AnalysisRequest};
use crate::registry::{JobMutation, JobRepository, RegistryError};
use crate::services::assembler::ResultAssembler;
use crate::services::inference::{InferenceAdapter, InferenceRequest};
use crate::services::storage::{ObjectStorage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("invalid analysis request: {0}")]
    Validation(String),

    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Bounds on background execution.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Maximum number of jobs executing at once; further jobs wait in
    /// `Pending` until a slot frees up.
    pub max_concurrent_jobs: usize,
    /// Upper bound on one background execution, download through assembly.
    pub job_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            job_timeout: Duration::from_secs(300),
        }
    }
}

impl ExecutionLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
        }
    }
}

type LiveJobs = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

pub struct AnalysisOrchestrator {
    registry: Arc<dyn JobRepository>,
    storage: Arc<dyn ObjectStorage>,
    inference: Arc<dyn InferenceAdapter>,
    permits: Arc<Semaphore>,
    live: LiveJobs,
    job_timeout: Duration,
}

/// Everything the background path needs, cloned out of the orchestrator so
/// the spawned task owns its dependencies.
#[derive(Clone)]
struct ExecutionContext {
    registry: Arc<dyn JobRepository>,
    storage: Arc<dyn ObjectStorage>,
    inference: Arc<dyn InferenceAdapter>,
    permits: Arc<Semaphore>,
    live: LiveJobs,
    job_timeout: Duration,
}

/// Output of one successful background run.
struct RunOutput {
    detections: Vec<DetectionResult>,
    visualization_url: Option<String>,
    model_info: HashMap<String, String>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl AnalysisOrchestrator {
    pub fn new(
        registry: Arc<dyn JobRepository>,
        storage: Arc<dyn ObjectStorage>,
        inference: Arc<dyn InferenceAdapter>,
        limits: ExecutionLimits,
    ) -> Self {
        metrics::describe_counter!("analysis_jobs_total", "Total analysis jobs created");
        metrics::describe_counter!(
            "analysis_jobs_completed",
            "Total analysis jobs that completed"
        );
        metrics::describe_counter!("analysis_jobs_failed", "Total analysis jobs that failed");
        metrics::describe_counter!(
            "analysis_detections_dropped_total",
            "Raw detections dropped for degenerate geometry"
        );
        metrics::describe_histogram!(
            "analysis_processing_seconds",
            "Background execution time per analysis job"
        );

        Self {
            registry,
            storage,
            inference,
            permits: Arc::new(Semaphore::new(limits.max_concurrent_jobs)),
            live: Arc::new(Mutex::new(HashMap::new())),
            job_timeout: limits.job_timeout,
        }
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext {
            registry: Arc::clone(&self.registry),
            storage: Arc::clone(&self.storage),
            inference: Arc::clone(&self.inference),
            permits: Arc::clone(&self.permits),
            live: Arc::clone(&self.live),
            job_timeout: self.job_timeout,
        }
    }

    /// Validate the request, resolve the image, create a `Pending` job, and
    /// schedule its execution. Returns the `Pending` snapshot without
    /// waiting for execution to start.
    ///
    /// No job record is created when validation or image resolution fails.
    pub async fn create_job(
        &self,
        mut request: AnalysisRequest,
    ) -> Result<AnalysisJob, AnalysisError> {
        request.normalize();
        request
            .validate()
            .map_err(|e| AnalysisError::Validation(e.to_string()))?;

        let image_reference = match self
            .storage
            .resolve_image_reference(&request.image_id)
            .await
        {
            Ok(reference) => reference,
            Err(StorageError::NotFound(_)) => {
                return Err(AnalysisError::ImageNotFound(request.image_id.clone()));
            }
            Err(e) => return Err(AnalysisError::Storage(e)),
        };

        let job = AnalysisJob::pending(&request);
        self.registry.create(job.clone()).await?;
        metrics::counter!("analysis_jobs_total").increment(1);

        let token = CancellationToken::new();
        self.live.lock().await.insert(job.id, token.clone());

        let ctx = self.context();
        let job_id = job.id;
        let image_id = job.image_id.clone();
        tokio::spawn(async move {
            run_background(ctx, job_id, image_id, image_reference, request, token).await;
        });

        tracing::info!(
            job_id = %job.id,
            image_id = %job.image_id,
            prompts = job.metadata["prompts"].to_string(),
            "created analysis job"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<AnalysisJob, AnalysisError> {
        Ok(self.registry.get(id).await?)
    }

    pub async fn list_by_image(&self, image_id: &str) -> Vec<AnalysisJob> {
        self.registry.list_by_image(image_id).await
    }

    /// Remove a job record. A still-running execution is cancelled first.
    pub async fn delete_job(&self, id: Uuid) -> Result<(), AnalysisError> {
        if let Some(token) = self.live.lock().await.remove(&id) {
            token.cancel();
        }
        self.registry.delete(id).await?;
        tracing::info!(job_id = %id, "deleted analysis job");
        Ok(())
    }
}

/// Drive one job from `Pending` to a terminal state. Runs exactly once per
/// created job and never lets an error escape the task.
async fn run_background(
    ctx: ExecutionContext,
    job_id: Uuid,
    image_id: String,
    image_reference: String,
    request: AnalysisRequest,
    token: CancellationToken,
) {
    let _permit = match Arc::clone(&ctx.permits).acquire_owned().await {
        Ok(permit) => permit,
        // the semaphore is never closed while the orchestrator lives
        Err(_) => return,
    };

    if token.is_cancelled() {
        ctx.live.lock().await.remove(&job_id);
        return;
    }

    if let Err(e) = ctx.registry.update(job_id, JobMutation::Start).await {
        // deleted between creation and pickup, or a forced illegal state
        tracing::error!(job_id = %job_id, error = %e, "could not move job to processing");
        ctx.live.lock().await.remove(&job_id);
        return;
    }

    tracing::info!(job_id = %job_id, image_id = %image_id, "starting analysis");
    let started = Instant::now();

    // The pipeline runs in its own task so that a panic surfaces as a
    // JoinError here instead of tearing down this supervisor.
    let work = {
        let storage = Arc::clone(&ctx.storage);
        let inference = Arc::clone(&ctx.inference);
        let image_id = image_id.clone();
        tokio::spawn(async move {
            execute(storage, inference, job_id, image_id, image_reference, request).await
        })
    };
    let abort = work.abort_handle();

    let outcome: Result<RunOutput, String> = tokio::select! {
        _ = token.cancelled() => {
            abort.abort();
            Err("analysis cancelled".to_string())
        }
        joined = tokio::time::timeout(ctx.job_timeout, work) => match joined {
            Err(_) => {
                abort.abort();
                Err(format!(
                    "analysis timed out after {}s",
                    ctx.job_timeout.as_secs()
                ))
            }
            Ok(Err(join_error)) => Err(format!("analysis task aborted: {join_error}")),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(run))) => Ok(run),
        },
    };

    let elapsed_ms = started.elapsed().as_millis().max(1) as u64;

    match outcome {
        Ok(run) => {
            let detections = run.detections.len();
            let mutation = JobMutation::Complete {
                detections: run.detections,
                visualization_url: run.visualization_url,
                processing_time_ms: elapsed_ms,
                model_info: run.model_info,
                metadata: run.metadata,
            };
            match ctx.registry.update(job_id, mutation).await {
                Ok(_) => {
                    metrics::counter!("analysis_jobs_completed").increment(1);
                    metrics::histogram!("analysis_processing_seconds")
                        .record(elapsed_ms as f64 / 1000.0);
                    tracing::info!(
                        job_id = %job_id,
                        detections,
                        elapsed_ms,
                        "analysis completed"
                    );
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "could not record completion");
                }
            }
        }
        Err(message) => {
            metrics::counter!("analysis_jobs_failed").increment(1);
            tracing::error!(job_id = %job_id, error = %message, elapsed_ms, "analysis failed");
            let mutation = JobMutation::Fail {
                error: message,
                processing_time_ms: elapsed_ms,
            };
            if let Err(e) = ctx.registry.update(job_id, mutation).await {
                // the job was deleted while it ran; nothing left to record
                tracing::debug!(job_id = %job_id, error = %e, "failure outcome had no job to update");
            }
        }
    }

    ctx.live.lock().await.remove(&job_id);
}

/// The fallible pipeline: download, inference, assembly.
async fn execute(
    storage: Arc<dyn ObjectStorage>,
    inference: Arc<dyn InferenceAdapter>,
    job_id: Uuid,
    image_id: String,
    image_reference: String,
    request: AnalysisRequest,
) -> Result<RunOutput, Box<dyn std::error::Error + Send + Sync>> {
    tracing::debug!(job_id = %job_id, reference = %image_reference, "downloading image");
    let image = storage.download(&image_reference).await?;

    let inference_request = InferenceRequest {
        prompts: request.prompts.clone(),
        box_threshold: request.box_threshold,
        text_threshold: request.text_threshold,
        include_segmentation: request.include_segmentation,
    };
    tracing::debug!(
        job_id = %job_id,
        prompts = ?inference_request.prompts,
        degraded = inference.is_degraded(),
        "running inference"
    );
    let output = inference.analyze(&image, &inference_request).await?;

    let assembler = ResultAssembler::new(Arc::clone(&storage));
    let assembled = assembler
        .assemble(job_id, &image_id, output, request.include_segmentation)
        .await?;

    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "num_detections".into(),
        serde_json::json!(assembled.detections.len()),
    );
    metadata.insert("num_dropped".into(), serde_json::json!(assembled.dropped));

    Ok(RunOutput {
        detections: assembled.detections,
        visualization_url: assembled.visualization_url,
        model_info: inference.model_info(),
        metadata,
    })
}
