//! Shared helpers for analysis-flow tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use promptscan::models::detection::{InferenceOutput, RawDetection};
use promptscan::services::inference::{InferenceAdapter, InferenceError, InferenceRequest};
use promptscan::{AnalysisJob, AnalysisOrchestrator};

/// Scripted inference capability for driving the orchestrator through
/// success, failure, and stuck-model paths.
pub enum MockBehavior {
    /// Return this output on every call
    Output(InferenceOutput),
    /// Fail with this message on every call
    Fail(String),
    /// Never return, for timeout and cancellation tests
    Hang,
}

pub struct MockInference {
    pub behavior: MockBehavior,
}

impl MockInference {
    pub fn returning(output: InferenceOutput) -> Self {
        Self {
            behavior: MockBehavior::Output(output),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            behavior: MockBehavior::Fail(message.to_string()),
        }
    }

    pub fn hanging() -> Self {
        Self {
            behavior: MockBehavior::Hang,
        }
    }
}

#[async_trait]
impl InferenceAdapter for MockInference {
    async fn analyze(
        &self,
        _image: &[u8],
        _request: &InferenceRequest,
    ) -> Result<InferenceOutput, InferenceError> {
        match &self.behavior {
            MockBehavior::Output(output) => Ok(output.clone()),
            MockBehavior::Fail(message) => Err(InferenceError::Protocol(message.clone())),
            MockBehavior::Hang => {
                loop {
                    sleep(Duration::from_secs(3600)).await;
                }
            }
        }
    }

    fn is_degraded(&self) -> bool {
        false
    }

    fn model_info(&self) -> HashMap<String, String> {
        HashMap::from([("detector".to_string(), "mock".to_string())])
    }
}

/// Build a raw detection in corner-pair form.
pub fn raw_detection(label: &str, bbox: [f64; 4], with_mask: bool) -> RawDetection {
    RawDetection {
        label: label.to_string(),
        confidence: 0.8,
        bbox,
        mask: with_mask.then(|| vec![0x89, 0x50, 0x4e, 0x47]),
        mask_confidence: Some(0.9),
        area_pixels: Some(2500),
        attributes: HashMap::new(),
    }
}

/// Poll until the job reaches a terminal state.
pub async fn wait_for_terminal(orchestrator: &AnalysisOrchestrator, id: Uuid) -> AnalysisJob {
    for _ in 0..200 {
        let job = orchestrator
            .get_job(id)
            .await
            .expect("job disappeared while polling");
        if job.status.is_terminal() {
            return job;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} did not reach a terminal state in time");
}
