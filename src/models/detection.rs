use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Axis-aligned bounding box anchored at its top-left corner.
///
/// Width and height are strictly positive by construction; a raw corner pair
/// that would produce degenerate geometry is rejected in
/// [`BoundingBox::from_corners`] rather than clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Convert a `[x1, y1, x2, y2]` corner pair into top-left + extent form.
    ///
    /// Returns `None` when `x2 <= x1` or `y2 <= y1`.
    pub fn from_corners(corners: [f64; 4]) -> Option<Self> {
        let [x1, y1, x2, y2] = corners;
        let width = x2 - x1;
        let height = y2 - y1;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(Self {
            x: x1,
            y: y1,
            width,
            height,
        })
    }

    /// X coordinate of the bottom-right corner.
    pub fn x2(&self) -> f64 {
        self.x + self.width
    }

    /// Y coordinate of the bottom-right corner.
    pub fn y2(&self) -> f64 {
        self.y + self.height
    }

    /// `[x1, y1, x2, y2]` form.
    pub fn to_xyxy(&self) -> [f64; 4] {
        [self.x, self.y, self.x2(), self.y2()]
    }
}

/// Pixel-level region associated with a detection. The mask image itself is
/// owned by the storage backend once uploaded; the job only holds the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationMask {
    /// URL of the persisted mask image
    pub mask_url: String,

    /// Optional inline mask payload (PNG bytes, base64 on the wire)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_data: Option<Vec<u8>>,

    /// Mask area in pixels
    pub area_pixels: u64,

    /// Physical area, when calibration data is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_mm2: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub perimeter_pixels: Option<f64>,

    /// Segmentation confidence in [0, 1]
    pub confidence: f64,
}

/// One located, labeled, confidence-scored finding within an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub label: String,

    /// Detection confidence in [0, 1]
    pub confidence: f64,

    pub bounding_box: BoundingBox,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<SegmentationMask>,

    /// Passthrough attributes from the inference capability
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// One detection as produced by the inference capability, before assembly.
/// The box is in `[x1, y1, x2, y2]` corner-pair form.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
    /// Rendered mask image bytes (PNG), when segmentation ran
    pub mask: Option<Vec<u8>>,
    pub mask_confidence: Option<f64>,
    pub area_pixels: Option<u64>,
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Raw output of one inference run.
#[derive(Debug, Clone, Default)]
pub struct InferenceOutput {
    pub detections: Vec<RawDetection>,
    /// Rendered overlay of boxes/masks on the source image, if the
    /// capability produced one
    pub visualization: Option<Vec<u8>>,
}
