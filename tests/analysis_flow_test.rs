//! End-to-end flows through the orchestrator with the in-memory registry
//! and the local storage backend.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use promptscan::models::detection::InferenceOutput;
use promptscan::services::inference::InferenceAdapter;
use promptscan::services::storage::ObjectStorage;
use promptscan::{
    AnalysisError, AnalysisOrchestrator, AnalysisRequest, ExecutionLimits, InMemoryJobRegistry,
    JobStatus, LocalStorage, RemoteInference,
};

use helpers::{raw_detection, wait_for_terminal, MockInference};

struct Harness {
    _dir: tempfile::TempDir,
    storage: Arc<LocalStorage>,
    orchestrator: AnalysisOrchestrator,
}

fn harness_with(inference: Arc<dyn InferenceAdapter>, limits: ExecutionLimits) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path(), "local://store"));
    let orchestrator = AnalysisOrchestrator::new(
        Arc::new(InMemoryJobRegistry::new()),
        Arc::clone(&storage) as Arc<dyn ObjectStorage>,
        inference,
        limits,
    );
    Harness {
        _dir: dir,
        storage,
        orchestrator,
    }
}

async fn seed_image(harness: &Harness, image_id: &str) {
    harness
        .storage
        .upload_image(b"fake image bytes", image_id, "png")
        .await
        .unwrap();
}

/// Two prompts, two raw detections with masks: job completes with both
/// detections, a visualization reference, and a positive processing time.
#[tokio::test]
async fn completed_job_carries_detections_and_visualization() {
    let output = InferenceOutput {
        detections: vec![
            raw_detection("cyst", [10.0, 10.0, 60.0, 60.0], true),
            raw_detection("lesion", [80.0, 80.0, 140.0, 130.0], true),
        ],
        visualization: Some(vec![1, 2, 3]),
    };
    let harness = harness_with(
        Arc::new(MockInference::returning(output)),
        ExecutionLimits::default(),
    );
    seed_image(&harness, "img-a").await;

    let pending = harness
        .orchestrator
        .create_job(AnalysisRequest::new(
            "img-a",
            vec!["cyst".into(), "lesion".into()],
        ))
        .await
        .unwrap();
    assert_eq!(pending.status, JobStatus::Pending);

    let job = wait_for_terminal(&harness.orchestrator, pending.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.detections.len(), 2);
    assert!(job.visualization_url.is_some());
    assert!(job.processing_time_ms > 0);
    assert!(job.error_message.is_none());
    assert_eq!(job.metadata["num_detections"], serde_json::json!(2));
    assert_eq!(job.model_info.get("detector").unwrap(), "mock");

    for detection in &job.detections {
        assert!((0.0..=1.0).contains(&detection.confidence));
        let mask = detection.segmentation.as_ref().unwrap();
        assert!((0.0..=1.0).contains(&mask.confidence));
        // mask artifact is retrievable through storage
        harness.storage.download(&mask.mask_url).await.unwrap();
    }
}

/// An unresolvable image id rejects the request synchronously and leaves
/// no job behind.
#[tokio::test]
async fn unresolvable_image_creates_no_job() {
    let harness = harness_with(
        Arc::new(MockInference::failing("unused")),
        ExecutionLimits::default(),
    );

    let err = harness
        .orchestrator
        .create_job(AnalysisRequest::new("ghost", vec!["cyst".into()]))
        .await
        .unwrap_err();

    assert!(matches!(err, AnalysisError::ImageNotFound(_)));
    assert!(harness.orchestrator.list_by_image("ghost").await.is_empty());
    // a freshly minted id is unknown to the registry
    let err = harness
        .orchestrator
        .get_job(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Registry(_)));
}

/// Inference failure during background execution ends in Failed with a
/// message and no partial detections.
#[tokio::test]
async fn inference_failure_marks_job_failed() {
    let harness = harness_with(
        Arc::new(MockInference::failing("model exploded")),
        ExecutionLimits::default(),
    );
    seed_image(&harness, "img-b").await;

    let pending = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-b", vec!["cyst".into()]))
        .await
        .unwrap();

    let job = wait_for_terminal(&harness.orchestrator, pending.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.detections.is_empty());
    let message = job.error_message.unwrap();
    assert!(message.contains("model exploded"));
}

/// Blank prompts are trimmed away; what survives drives the analysis.
#[tokio::test]
async fn blank_prompts_are_normalized() {
    let harness = harness_with(
        Arc::new(MockInference::returning(InferenceOutput::default())),
        ExecutionLimits::default(),
    );
    seed_image(&harness, "img-c").await;

    let job = harness
        .orchestrator
        .create_job(AnalysisRequest::new(
            "img-c",
            vec![" ".into(), "lesion".into()],
        ))
        .await
        .unwrap();
    assert_eq!(job.metadata["prompts"], serde_json::json!(["lesion"]));

    // all-blank prompt lists are a validation error, and no job appears
    let err = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-c", vec![" ".into(), "\t".into()]))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Validation(_)));
    assert_eq!(harness.orchestrator.list_by_image("img-c").await.len(), 1);
}

/// Degraded-mode inference still completes the job with one synthetic
/// detection per prompt and strictly decreasing confidences.
#[tokio::test]
async fn degraded_mode_completes_with_synthetic_detections() {
    let inference = Arc::new(RemoteInference::new(None));
    assert!(inference.is_degraded());

    let harness = harness_with(inference, ExecutionLimits::default());
    seed_image(&harness, "img-d").await;

    let pending = harness
        .orchestrator
        .create_job(AnalysisRequest::new(
            "img-d",
            vec!["cyst".into(), "lesion".into(), "nodule".into()],
        ))
        .await
        .unwrap();

    let job = wait_for_terminal(&harness.orchestrator, pending.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.detections.len(), 3);
    assert_eq!(job.model_info.get("mode").unwrap(), "degraded");

    let confidences: Vec<f64> = job.detections.iter().map(|d| d.confidence).collect();
    for pair in confidences.windows(2) {
        assert!(pair[1] < pair[0], "expected strictly decreasing confidence");
    }
    for detection in &job.detections {
        assert!(detection.segmentation.is_some());
    }
    assert!(job.visualization_url.is_some());
}

/// Raw detections with degenerate geometry are dropped and counted, not
/// surfaced as malformed boxes.
#[tokio::test]
async fn degenerate_raw_boxes_are_dropped_and_counted() {
    let output = InferenceOutput {
        detections: vec![
            raw_detection("good", [0.0, 0.0, 50.0, 50.0], false),
            raw_detection("bad", [50.0, 50.0, 50.0, 90.0], false),
        ],
        visualization: None,
    };
    let harness = harness_with(
        Arc::new(MockInference::returning(output)),
        ExecutionLimits::default(),
    );
    seed_image(&harness, "img-e").await;

    let pending = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-e", vec!["thing".into()]))
        .await
        .unwrap();
    let job = wait_for_terminal(&harness.orchestrator, pending.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.detections.len(), 1);
    assert_eq!(job.detections[0].label, "good");
    assert_eq!(job.metadata["num_dropped"], serde_json::json!(1));
}

/// A stuck model is bounded by the execution timeout.
#[tokio::test]
async fn stuck_inference_times_out_as_failed() {
    let limits = ExecutionLimits {
        max_concurrent_jobs: 2,
        job_timeout: Duration::from_millis(100),
    };
    let harness = harness_with(Arc::new(MockInference::hanging()), limits);
    seed_image(&harness, "img-f").await;

    let pending = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-f", vec!["cyst".into()]))
        .await
        .unwrap();
    let job = wait_for_terminal(&harness.orchestrator, pending.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("timed out"));
}

/// Deleting a job cancels its execution and removes the record.
#[tokio::test]
async fn delete_cancels_running_job() {
    let harness = harness_with(
        Arc::new(MockInference::hanging()),
        ExecutionLimits::default(),
    );
    seed_image(&harness, "img-g").await;

    let pending = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-g", vec!["cyst".into()]))
        .await
        .unwrap();

    // let the background task pick the job up
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.orchestrator.delete_job(pending.id).await.unwrap();
    let err = harness.orchestrator.get_job(pending.id).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Registry(_)));

    // deleting again reports the missing record
    assert!(harness.orchestrator.delete_job(pending.id).await.is_err());
}

/// Jobs for one image list newest first and exclude other images.
#[tokio::test]
async fn list_by_image_is_scoped_and_ordered() {
    let harness = harness_with(
        Arc::new(MockInference::returning(InferenceOutput::default())),
        ExecutionLimits::default(),
    );
    seed_image(&harness, "img-h").await;
    seed_image(&harness, "img-i").await;

    let first = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-h", vec!["cyst".into()]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-h", vec!["lesion".into()]))
        .await
        .unwrap();
    harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-i", vec!["cyst".into()]))
        .await
        .unwrap();

    let listed = harness.orchestrator.list_by_image("img-h").await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
}

/// Once terminal, a job's status never changes again.
#[tokio::test]
async fn terminal_status_is_stable() {
    let harness = harness_with(
        Arc::new(MockInference::returning(InferenceOutput::default())),
        ExecutionLimits::default(),
    );
    seed_image(&harness, "img-j").await;

    let pending = harness
        .orchestrator
        .create_job(AnalysisRequest::new("img-j", vec!["cyst".into()]))
        .await
        .unwrap();
    let completed = wait_for_terminal(&harness.orchestrator, pending.id).await;
    assert_eq!(completed.status, JobStatus::Completed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = harness.orchestrator.get_job(pending.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Completed);
    assert_eq!(again.processing_time_ms, completed.processing_time_ms);
}

/// Many jobs across distinct images complete under the concurrency bound.
#[tokio::test]
async fn concurrent_jobs_all_reach_terminal_states() {
    let limits = ExecutionLimits {
        max_concurrent_jobs: 3,
        job_timeout: Duration::from_secs(30),
    };
    let harness = harness_with(
        Arc::new(MockInference::returning(InferenceOutput {
            detections: vec![raw_detection("thing", [0.0, 0.0, 10.0, 10.0], false)],
            visualization: None,
        })),
        limits,
    );

    let mut pending = Vec::new();
    for i in 0..10 {
        let image_id = format!("img-k{i}");
        seed_image(&harness, &image_id).await;
        let job = harness
            .orchestrator
            .create_job(AnalysisRequest::new(image_id, vec!["thing".into()]))
            .await
            .unwrap();
        pending.push(job);
    }

    let results = futures::future::join_all(
        pending
            .iter()
            .map(|job| wait_for_terminal(&harness.orchestrator, job.id)),
    )
    .await;

    for job in results {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.detections.len(), 1);
    }
}
