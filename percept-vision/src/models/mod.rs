//! Detection model interface

use crate::error::VisionError;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in image pixels, top-left origin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width >= 0.0
            && self.height >= 0.0
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn bottom_center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height)
    }

    /// Intersection over union, 0 for invalid or disjoint boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        if !self.is_valid() || !other.is_valid() {
            return 0.0;
        }

        let inter_x_min = self.x.max(other.x);
        let inter_y_min = self.y.max(other.y);
        let inter_x_max = (self.x + self.width).min(other.x + other.width);
        let inter_y_max = (self.y + self.height).min(other.y + other.height);

        if inter_x_max <= inter_x_min || inter_y_max <= inter_y_min {
            return 0.0;
        }

        let inter_area = (inter_x_max - inter_x_min) * (inter_y_max - inter_y_min);
        let union_area = self.width * self.height + other.width * other.height - inter_area;
        if union_area <= 0.0 {
            return 0.0;
        }

        (inter_area / union_area).clamp(0.0, 1.0)
    }
}

/// Detection as emitted by the model for a single frame
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Opaque object detector. Called synchronously from the detection thread
/// and allowed to be slow.
#[cfg_attr(test, mockall::automock)]
pub trait Detector: Send + Sync {
    fn infer(&self, frame: &Frame) -> Result<Vec<RawDetection>, VisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_and_partial() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);

        let c = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // 50 / 150
        assert!((a.iou(&c) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_invalid_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0)), 0.0);
        assert_eq!(a.iou(&BoundingBox::new(0.0, 0.0, -1.0, 1.0)), 0.0);
        assert_eq!(BoundingBox::new(0.0, 0.0, 0.0, 0.0).iou(&a), 0.0);
    }

    #[test]
    fn test_anchors() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(b.center(), (25.0, 40.0));
        assert_eq!(b.bottom_center(), (25.0, 60.0));
    }
}
