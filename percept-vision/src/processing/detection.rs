//! Object detection stage

use crate::error::VisionError;
use crate::frame::Frame;
use crate::models::{Detector, RawDetection};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

/// Detections kept per frame, highest confidence first
pub const MAX_DETECTIONS: usize = 100;

/// Wraps the opaque model: contains panics and drops malformed output
pub struct DetectionPipeline {
    detector: Arc<dyn Detector>,
}

impl DetectionPipeline {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self { detector }
    }

    /// Run the model on a frame
    pub fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, VisionError> {
        debug!("Running object detection on frame {}", frame.sequence);

        let detector = &self.detector;
        let mut detections = panic::catch_unwind(AssertUnwindSafe(|| detector.infer(frame)))
            .map_err(|cause| {
                let msg = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                VisionError::Model(format!("Detector panicked: {}", msg))
            })??;

        detections.retain(|d| d.bbox.is_valid() && d.confidence.is_finite() && d.confidence >= 0.0);
        for d in detections.iter_mut() {
            d.confidence = d.confidence.min(1.0);
        }

        if detections.len() > MAX_DETECTIONS {
            detections.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            detections.truncate(MAX_DETECTIONS);
        }

        debug!("Detected {} objects", detections.len());
        Ok(detections)
    }
}
