//! Transformation of raw inference output into the structured detection
//! model, including per-detection artifact upload.

use std::sync::Arc;
use uuid::Uuid;

use crate::models::detection::{
    BoundingBox, DetectionResult, InferenceOutput, SegmentationMask,
};
use crate::services::storage::{ObjectStorage, StorageError};

/// Structured results of one analysis run.
#[derive(Debug)]
pub struct AssembledResults {
    pub detections: Vec<DetectionResult>,
    pub visualization_url: Option<String>,
    /// Raw detections discarded for degenerate geometry
    pub dropped: usize,
}

pub struct ResultAssembler {
    storage: Arc<dyn ObjectStorage>,
}

impl ResultAssembler {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// Convert raw detections into [`DetectionResult`]s, uploading each mask
    /// under a fresh detection id scoped to the image, and upload the run
    /// visualization when the capability produced one.
    ///
    /// Raw boxes with non-positive derived width or height are dropped,
    /// logged, and counted rather than propagated.
    pub async fn assemble(
        &self,
        job_id: Uuid,
        image_id: &str,
        output: InferenceOutput,
        include_segmentation: bool,
    ) -> Result<AssembledResults, StorageError> {
        let mut detections = Vec::with_capacity(output.detections.len());
        let mut dropped = 0usize;

        for raw in output.detections {
            let Some(bounding_box) = BoundingBox::from_corners(raw.bbox) else {
                dropped += 1;
                tracing::warn!(
                    job_id = %job_id,
                    label = %raw.label,
                    bbox = ?raw.bbox,
                    "dropping detection with degenerate geometry"
                );
                metrics::counter!("analysis_detections_dropped_total").increment(1);
                continue;
            };

            let confidence = raw.confidence.clamp(0.0, 1.0);

            let segmentation = match (include_segmentation, raw.mask) {
                (true, Some(mask_bytes)) => {
                    let detection_id = Uuid::new_v4();
                    let mask_url = self
                        .storage
                        .upload_mask(&mask_bytes, image_id, detection_id)
                        .await?;
                    Some(SegmentationMask {
                        mask_url,
                        mask_data: None,
                        area_pixels: raw.area_pixels.unwrap_or(0),
                        area_mm2: None,
                        perimeter_pixels: None,
                        confidence: raw.mask_confidence.unwrap_or(confidence).clamp(0.0, 1.0),
                    })
                }
                _ => None,
            };

            detections.push(DetectionResult {
                label: raw.label,
                confidence,
                bounding_box,
                segmentation,
                attributes: raw.attributes,
            });
        }

        let visualization_url = match output.visualization {
            Some(bytes) if !bytes.is_empty() => Some(
                self.storage
                    .upload_visualization(&bytes, image_id, job_id)
                    .await?,
            ),
            _ => None,
        };

        Ok(AssembledResults {
            detections,
            visualization_url,
            dropped,
        })
    }
}
