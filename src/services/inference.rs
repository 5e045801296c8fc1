//! Inference capability boundary.
//!
//! [`RemoteInference`] talks to a detection/segmentation model server over
//! HTTP. The endpoint is probed lazily, exactly once per process: if it is
//! missing or unreachable, the adapter switches permanently into an explicit
//! degraded mode and serves deterministic synthetic results so the rest of
//! the pipeline stays exercised and operable. Degraded mode is a declared
//! capability, observable through [`InferenceAdapter::is_degraded`], not a
//! swallowed error.

use async_trait::async_trait;
use base64::Engine;
use image::{GenericImageView, ImageFormat, Rgb, RgbImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;

use crate::config::AppConfig;
use crate::models::detection::{InferenceOutput, RawDetection};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model server response malformed: {0}")]
    Protocol(String),

    #[error("failed to decode artifact payload: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Parameters of one analysis run, as handed to the capability.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompts: Vec<String>,
    pub box_threshold: f64,
    pub text_threshold: f64,
    pub include_segmentation: bool,
}

/// Capability boundary to the object-detection/segmentation model.
/// Implementations must be safe to call concurrently for independent jobs.
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    async fn analyze(
        &self,
        image: &[u8],
        request: &InferenceRequest,
    ) -> Result<InferenceOutput, InferenceError>;

    /// True when the adapter is serving synthetic fallback results.
    fn is_degraded(&self) -> bool;

    /// Identifiers of the models behind this adapter, recorded on the job.
    fn model_info(&self) -> HashMap<String, String>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    image: String,
    prompts: &'a [String],
    box_threshold: f64,
    text_threshold: f64,
    include_segmentation: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    detections: Vec<WireDetection>,
    /// Base64-encoded overlay PNG
    visualization: Option<String>,
}

#[derive(Deserialize)]
struct WireDetection {
    label: String,
    confidence: f64,
    bbox: [f64; 4],
    /// Base64-encoded mask PNG
    mask: Option<String>,
    mask_confidence: Option<f64>,
    area: Option<u64>,
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
}

/// Client for a detection/segmentation model server, with a synthetic
/// fallback when the server is unavailable.
pub struct RemoteInference {
    http: Client,
    endpoint: Option<String>,
    /// Set exactly once by the first `analyze` call; true means the model
    /// server answered the readiness probe.
    ready: OnceCell<bool>,
    degraded: AtomicBool,
}

impl RemoteInference {
    pub fn new(endpoint: Option<String>) -> Self {
        // With no endpoint configured there is nothing to probe; declare
        // degraded mode up front so callers can observe it immediately.
        let degraded = endpoint.is_none();
        Self {
            http: Client::new(),
            endpoint,
            ready: OnceCell::new(),
            degraded: AtomicBool::new(degraded),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.inference_url.clone())
    }

    /// Probe the model server at most once per process lifetime.
    async fn ensure_ready(&self) -> bool {
        *self
            .ready
            .get_or_init(|| async {
                let Some(endpoint) = self.endpoint.as_deref() else {
                    tracing::warn!("no inference endpoint configured, running in degraded mode");
                    return false;
                };

                let probe = self
                    .http
                    .get(format!("{}/healthz", endpoint.trim_end_matches('/')))
                    .send()
                    .await
                    .and_then(|response| response.error_for_status());

                match probe {
                    Ok(_) => {
                        tracing::info!(endpoint, "model server ready");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            endpoint,
                            error = %e,
                            "model server unavailable, switching to degraded mode"
                        );
                        self.degraded.store(true, Ordering::Relaxed);
                        false
                    }
                }
            })
            .await
    }

    async fn analyze_remote(
        &self,
        endpoint: &str,
        image: &[u8],
        request: &InferenceRequest,
    ) -> Result<InferenceOutput, InferenceError> {
        let endpoint = endpoint.trim_end_matches('/');

        let body = WireRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
            prompts: &request.prompts,
            box_threshold: request.box_threshold,
            text_threshold: request.text_threshold,
            include_segmentation: request.include_segmentation,
        };

        let response: WireResponse = self
            .http
            .post(format!("{endpoint}/v1/analyze"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let b64 = &base64::engine::general_purpose::STANDARD;
        let mut detections = Vec::with_capacity(response.detections.len());
        for wire in response.detections {
            if wire.label.is_empty() {
                return Err(InferenceError::Protocol(
                    "detection with empty label".to_string(),
                ));
            }
            let mask = wire.mask.map(|m| b64.decode(m)).transpose()?;
            detections.push(RawDetection {
                label: wire.label,
                confidence: wire.confidence,
                bbox: wire.bbox,
                mask,
                mask_confidence: wire.mask_confidence,
                area_pixels: wire.area,
                attributes: wire.attributes,
            });
        }

        let visualization = response.visualization.map(|v| b64.decode(v)).transpose()?;

        Ok(InferenceOutput {
            detections,
            visualization,
        })
    }
}

#[async_trait]
impl InferenceAdapter for RemoteInference {
    async fn analyze(
        &self,
        image: &[u8],
        request: &InferenceRequest,
    ) -> Result<InferenceOutput, InferenceError> {
        match (self.ensure_ready().await, self.endpoint.as_deref()) {
            (true, Some(endpoint)) => self.analyze_remote(endpoint, image, request).await,
            _ => Ok(synthetic_output(image, request)),
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn model_info(&self) -> HashMap<String, String> {
        let mut info = HashMap::new();
        if self.is_degraded() {
            info.insert("mode".into(), "degraded".into());
            info.insert("detector".into(), "synthetic".into());
        } else {
            info.insert("mode".into(), "remote".into());
            info.insert("detector".into(), "grounding-dino-swint-ogc".into());
            info.insert("segmenter".into(), "sam-vit-h".into());
        }
        info
    }
}

const SYNTHETIC_BOX_FRACTION: f64 = 0.3;

/// Deterministic fallback result set: one detection per prompt with strictly
/// decreasing confidence, boxes laid out diagonally across the frame, and a
/// rectangular mask matching each box.
pub fn synthetic_output(image: &[u8], request: &InferenceRequest) -> InferenceOutput {
    let decoded = image::load_from_memory(image).ok();
    let (width, height) = decoded
        .as_ref()
        .map(|img| img.dimensions())
        .unwrap_or((640, 480));
    let (w, h) = (width as f64, height as f64);

    let mut detections = Vec::with_capacity(request.prompts.len());
    for (i, prompt) in request.prompts.iter().enumerate() {
        // cycle the diagonal offset so boxes stay inside the frame
        let offset = 0.2 + 0.1 * ((i % 5) as f64);
        let x1 = w * offset;
        let y1 = h * offset;
        let x2 = (x1 + w * SYNTHETIC_BOX_FRACTION).min(w);
        let y2 = (y1 + h * SYNTHETIC_BOX_FRACTION).min(h);

        let confidence = 0.85 * 0.9f64.powi(i as i32);

        let (mask, mask_confidence, area_pixels) = if request.include_segmentation {
            let mask = render_box_mask(width, height, [x1, y1, x2, y2]);
            let area = ((x2 - x1) as u64) * ((y2 - y1) as u64);
            (Some(mask), Some(0.9), Some(area))
        } else {
            (None, None, None)
        };

        let mut attributes = HashMap::new();
        attributes.insert("synthetic".into(), serde_json::json!(true));

        detections.push(RawDetection {
            label: prompt.clone(),
            confidence,
            bbox: [x1, y1, x2, y2],
            mask,
            mask_confidence,
            area_pixels,
            attributes,
        });
    }

    let mut canvas = decoded
        .map(|img| img.to_rgb8())
        .unwrap_or_else(|| RgbImage::new(width, height));
    for detection in &detections {
        draw_box_outline(&mut canvas, detection.bbox, Rgb([0, 255, 0]));
    }
    let visualization = encode_png(&canvas);

    tracing::info!(
        detections = detections.len(),
        "generated synthetic inference results"
    );

    InferenceOutput {
        detections,
        visualization,
    }
}

/// Render a binary mask covering the given box, encoded as a grayscale PNG.
fn render_box_mask(width: u32, height: u32, bbox: [f64; 4]) -> Vec<u8> {
    let mut mask = image::GrayImage::new(width, height);
    let x1 = bbox[0].max(0.0) as u32;
    let y1 = bbox[1].max(0.0) as u32;
    let x2 = (bbox[2] as u32).min(width);
    let y2 = (bbox[3] as u32).min(height);
    for y in y1..y2 {
        for x in x1..x2 {
            mask.put_pixel(x, y, image::Luma([255]));
        }
    }

    let mut bytes = Vec::new();
    // encoding an in-memory buffer does not fail
    let _ = mask.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png);
    bytes
}

/// Draw a 2px box outline, clamped to the image bounds.
fn draw_box_outline(canvas: &mut RgbImage, bbox: [f64; 4], color: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    let x1 = bbox[0].max(0.0) as u32;
    let y1 = bbox[1].max(0.0) as u32;
    let x2 = (bbox[2] as u32).min(width.saturating_sub(1));
    let y2 = (bbox[3] as u32).min(height.saturating_sub(1));

    for x in x1..=x2 {
        for dy in 0..2u32 {
            if y1 + dy < height {
                canvas.put_pixel(x, y1 + dy, color);
            }
            if y2 >= dy {
                canvas.put_pixel(x, y2 - dy, color);
            }
        }
    }
    for y in y1..=y2 {
        for dx in 0..2u32 {
            if x1 + dx < width {
                canvas.put_pixel(x1 + dx, y, color);
            }
            if x2 >= dx {
                canvas.put_pixel(x2 - dx, y, color);
            }
        }
    }
}

fn encode_png(canvas: &RgbImage) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    canvas
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .ok()?;
    Some(bytes)
}
