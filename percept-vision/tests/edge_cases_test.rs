//! Edge case tests for percept-vision

use percept_core::Stamp;
use percept_vision::{
    back_project, BoundingBox, CameraIntrinsics, FrameSynchronizer, GroundPlane, InputSample, ImageBuffer,
    PipelineConfig, RawDetection, TemporalSmoother,
};
use std::time::Duration;

fn color(ms: u64) -> InputSample {
    InputSample::Color {
        stamp: Stamp::from_millis(ms),
        image: ImageBuffer::filled(2, 2, 3, 0).unwrap(),
    }
}

fn calibration(ms: u64) -> InputSample {
    InputSample::Calibration {
        stamp: Stamp::from_millis(ms),
        intrinsics: CameraIntrinsics::new(10.0, 10.0, 1.0, 1.0).unwrap(),
    }
}

#[test]
fn test_sync_out_of_order_arrivals() {
    let mut sync = FrameSynchronizer::new(Duration::from_millis(5), 8, true);
    assert!(sync.push(color(200)).is_none());
    assert!(sync.push(color(100)).is_none());
    let fused = sync.push(calibration(101)).expect("older colour frame matches");
    assert_eq!(fused.stamp, Stamp::from_millis(100));
    // The newer colour frame is still waiting for its calibration
    assert_eq!(sync.buffered(), 1);
    assert!(sync.push(calibration(199)).is_some());
}

#[test]
fn test_sync_tolerance_boundary_is_inclusive() {
    let mut sync = FrameSynchronizer::new(Duration::from_millis(5), 8, true);
    sync.push(color(100));
    assert!(sync.push(calibration(105)).is_some());

    sync.push(color(200));
    assert!(sync.push(calibration(206)).is_none());
}

#[test]
fn test_smoother_handles_empty_iterations() {
    let mut smoother = TemporalSmoother::new(3, 0.3);
    for _ in 0..10 {
        assert!(smoother.update(&[], |_| String::new()).is_empty());
    }
}

#[test]
fn test_smoother_many_objects_same_class() {
    let mut smoother = TemporalSmoother::new(2, 0.5);
    let detections: Vec<RawDetection> = (0..20)
        .map(|i| RawDetection {
            class_id: 7,
            confidence: 0.6,
            bbox: BoundingBox::new(i as f32 * 50.0, 0.0, 20.0, 20.0),
        })
        .collect();

    let first = smoother.update(&detections, |_| "truck".to_string());
    let second = smoother.update(&detections, |_| "truck".to_string());
    assert_eq!(first.len(), 20);
    assert_eq!(second.len(), 20);
    let mut ids: Vec<u64> = second.iter().map(|d| d.slot_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[test]
fn test_projection_plane_through_camera() {
    // d = 0: every intersection is the origin, t = 0 is rejected
    let k = CameraIntrinsics::new(100.0, 100.0, 50.0, 50.0).unwrap();
    let plane = GroundPlane::new([0.0, 1.0, 0.0], 0.0).unwrap();
    assert!(back_project(50.0, 80.0, &k, &plane).is_none());
}

#[test]
fn test_projection_nearly_parallel_is_finite_or_none() {
    let k = CameraIntrinsics::new(100.0, 100.0, 50.0, 50.0).unwrap();
    let plane = GroundPlane::new([0.0, 1.0, 0.0], 1.0).unwrap();
    for dv in [1e-12, 1e-9, 1e-6, 1e-3] {
        if let Some(p) = back_project(50.0, 50.0 + dv, &k, &plane) {
            assert!(p.iter().all(|c| c.is_finite()));
        }
    }
}

#[test]
fn test_config_round_trips_through_json() {
    let config = PipelineConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: PipelineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.smoothing_window, config.smoothing_window);
    assert_eq!(back.class_labels, config.class_labels);
}

#[test]
fn test_config_empty_object_is_default() {
    let config: PipelineConfig = serde_json::from_str("{}").unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.resolution, (640, 480));
}
