//! Ground-plane back-projection of image detections

use crate::config::ProjectionAnchor;
use crate::error::VisionError;
use crate::frame::CameraIntrinsics;
use crate::processing::SmoothedDetection;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// `|n · r|` below this (relative to `|r|`) counts as a ray parallel to the plane
pub const PARALLEL_EPSILON: f64 = 1e-6;

/// Plane `n · X = d` in the camera frame, `n` of unit length
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundPlane {
    normal: Vector3<f64>,
    distance: f64,
}

impl GroundPlane {
    /// Normalizes `normal`, scaling `distance` accordingly
    pub fn new(normal: [f64; 3], distance: f64) -> Result<Self, VisionError> {
        let n = Vector3::from(normal);
        let norm = n.norm();
        if !norm.is_finite() || !distance.is_finite() || norm < PARALLEL_EPSILON {
            return Err(VisionError::Projection(format!(
                "Invalid ground plane: normal {:?}, distance {}",
                normal, distance
            )));
        }
        Ok(Self {
            normal: n / norm,
            distance: distance / norm,
        })
    }

    pub fn normal(&self) -> &Vector3<f64> {
        &self.normal
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Signed distance of a point from the plane
    pub fn signed_distance(&self, point: &Vector3<f64>) -> f64 {
        self.normal.dot(point) - self.distance
    }
}

/// A detection placed in 3D, camera frame, meters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection3D {
    pub slot_id: u64,
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub position: [f64; 3],
}

/// Intersect the ray through pixel `(u, v)` with the plane.
///
/// `None` when the ray is parallel to the plane, the intersection lies behind
/// the camera, or the result is not finite.
pub fn back_project(u: f64, v: f64, intrinsics: &CameraIntrinsics, plane: &GroundPlane) -> Option<Vector3<f64>> {
    let ray = intrinsics.ray(u, v);
    let denom = plane.normal.dot(&ray);
    if denom.abs() <= PARALLEL_EPSILON * ray.norm() {
        return None;
    }

    let t = plane.distance / denom;
    if !t.is_finite() || t <= 0.0 {
        return None;
    }

    let point = ray * t;
    point.iter().all(|c| c.is_finite()).then_some(point)
}

/// Stateless projector; safe to call from any thread with a plane snapshot
#[derive(Debug, Clone, Copy)]
pub struct GroundPlaneProjector {
    anchor: ProjectionAnchor,
}

impl GroundPlaneProjector {
    pub fn new(anchor: ProjectionAnchor) -> Self {
        Self { anchor }
    }

    pub fn anchor(&self) -> ProjectionAnchor {
        self.anchor
    }

    pub fn project(
        &self,
        detection: &SmoothedDetection,
        intrinsics: &CameraIntrinsics,
        plane: &GroundPlane,
    ) -> Option<ObjectDetection3D> {
        let (u, v) = match self.anchor {
            ProjectionAnchor::Center => detection.bbox.center(),
            ProjectionAnchor::BottomCenter => detection.bbox.bottom_center(),
        };
        let point = back_project(u as f64, v as f64, intrinsics, plane)?;

        Some(ObjectDetection3D {
            slot_id: detection.slot_id,
            class_id: detection.class_id,
            label: detection.label.clone(),
            confidence: detection.confidence,
            position: [point.x, point.y, point.z],
        })
    }

    /// Project every detection; undefined projections are left out
    pub fn project_all(
        &self,
        detections: &[SmoothedDetection],
        intrinsics: &CameraIntrinsics,
        plane: &GroundPlane,
    ) -> Vec<ObjectDetection3D> {
        detections
            .iter()
            .filter_map(|d| self.project(d, intrinsics, plane))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(525.0, 525.0, 320.0, 240.0).unwrap()
    }

    /// Floor 1.5 m below a camera with y pointing down
    fn floor() -> GroundPlane {
        GroundPlane::new([0.0, 1.0, 0.0], 1.5).unwrap()
    }

    fn detection_at(u: f32, v: f32) -> SmoothedDetection {
        SmoothedDetection {
            slot_id: 1,
            class_id: 0,
            label: "person".to_string(),
            raw_confidence: 0.9,
            confidence: 0.9,
            bbox: BoundingBox::new(u - 10.0, v - 10.0, 20.0, 20.0),
        }
    }

    #[test]
    fn test_round_trip_point_on_plane() {
        let k = intrinsics();
        let plane = floor();
        let point = Vector3::new(0.7, 1.5, 4.0);
        assert!(plane.signed_distance(&point).abs() < 1e-12);

        let (u, v) = k.project(&point).unwrap();
        let back = back_project(u, v, &k, &plane).unwrap();
        assert!((back - point).norm() < 1e-9);
    }

    #[test]
    fn test_parallel_ray_is_undefined() {
        let k = intrinsics();
        // Principal ray (0, 0, 1) is parallel to a plane with normal along y
        assert!(back_project(320.0, 240.0, &k, &floor()).is_none());
    }

    #[test]
    fn test_intersection_behind_camera_is_undefined() {
        let k = intrinsics();
        // Pixel above the horizon looks up, the floor is behind
        assert!(back_project(320.0, 100.0, &k, &floor()).is_none());
    }

    #[test]
    fn test_plane_normalization() {
        let plane = GroundPlane::new([0.0, 2.0, 0.0], 3.0).unwrap();
        assert!((plane.normal().norm() - 1.0).abs() < 1e-12);
        assert!((plane.distance() - 1.5).abs() < 1e-12);

        assert!(GroundPlane::new([0.0, 0.0, 0.0], 1.0).is_err());
        assert!(GroundPlane::new([f64::NAN, 1.0, 0.0], 1.0).is_err());
        assert!(GroundPlane::new([0.0, 1.0, 0.0], f64::INFINITY).is_err());
    }

    #[test]
    fn test_projector_anchors() {
        let k = intrinsics();
        let plane = floor();

        let center = GroundPlaneProjector::new(ProjectionAnchor::Center);
        let bottom = GroundPlaneProjector::new(ProjectionAnchor::BottomCenter);
        let det = detection_at(320.0, 400.0);

        let a = center.project(&det, &k, &plane).unwrap();
        let b = bottom.project(&det, &k, &plane).unwrap();
        assert!((a.position[1] - 1.5).abs() < 1e-9);
        // The lower pixel hits the floor closer to the camera
        assert!(b.position[2] < a.position[2]);
        assert_eq!(a.label, "person");
    }

    #[test]
    fn test_project_all_drops_degenerate() {
        let k = intrinsics();
        let projector = GroundPlaneProjector::new(ProjectionAnchor::Center);
        let dets = vec![detection_at(320.0, 400.0), detection_at(320.0, 240.0)];
        let out = projector.project_all(&dets, &k, &floor());
        assert_eq!(out.len(), 1);
    }
}
