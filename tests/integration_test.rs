use percept_core::Stamp;
use percept_vision::{
    BoundingBox, CameraIntrinsics, CancelResponse, DepthImage, Detector, EpisodeState, Frame, ImageBuffer,
    PerceptionPipeline, PipelineConfig, ProjectionAnchor, RawDetection, VisionError,
};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 120;

/// Always reports one chair standing on the floor
struct ChairDetector;

impl Detector for ChairDetector {
    fn infer(&self, _frame: &Frame) -> Result<Vec<RawDetection>, VisionError> {
        Ok(vec![RawDetection {
            class_id: 56,
            confidence: 0.75,
            bbox: BoundingBox::new(60.0, 60.0, 40.0, 40.0),
        }])
    }
}

fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(100.0, 100.0, 80.0, 60.0).unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let give_up = Instant::now() + timeout;
    while Instant::now() < give_up {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_end_to_end_rgbd_with_ground_plane() {
    let config = PipelineConfig {
        resolution: (WIDTH, HEIGHT),
        smoothing_window: 4,
        projection_anchor: ProjectionAnchor::BottomCenter,
        ..PipelineConfig::default()
    };
    let pipeline = PerceptionPipeline::new(config, Arc::new(ChairDetector)).unwrap();
    let mut events = pipeline.subscribe();
    let input = pipeline.start().unwrap();
    pipeline.update_ground_plane([0.0, 1.0, 0.0], 1.4).unwrap();

    // One set, all three channels within tolerance
    input.push_calibration(Stamp::from_millis(1000), intrinsics()).unwrap();
    input
        .push_depth(
            Stamp::from_millis(1008),
            DepthImage::new(WIDTH, HEIGHT, vec![3.0; (WIDTH * HEIGHT) as usize]).unwrap(),
        )
        .unwrap();
    input
        .push_color(Stamp::from_millis(1012), ImageBuffer::filled(WIDTH, HEIGHT, 3, 50).unwrap())
        .unwrap();

    // After one smoothing window the confidence equals the model output
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline
            .latest_report()
            .map(|r| r.detections.len() == 1 && (r.detections[0].confidence - 0.75).abs() < 1e-4)
            .unwrap_or(false)
    }));

    let report = pipeline.latest_report().unwrap();
    assert_eq!(report.detections[0].label, "chair");
    assert_eq!(report.detections[0].bbox, BoundingBox::new(60.0, 60.0, 40.0, 40.0));
    assert_eq!(pipeline.metrics().frames_fused, 1);

    let event = tokio_test::block_on(async {
        loop {
            match events.recv().await {
                Ok(event) if !event.objects.is_empty() && (event.detections[0].confidence - 0.75).abs() < 1e-4 => {
                    break event
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    });

    // Bottom centre (80, 100): ray (0, 0.4, 1), floor at y = 1.4
    let position = event.objects[0].position;
    assert!(position[0].abs() < 1e-9);
    assert!((position[1] - 1.4).abs() < 1e-9);
    assert!((position[2] - 3.5).abs() < 1e-9);
    assert_eq!(event.object_count, 1);

    pipeline.stop();
    assert!(!pipeline.is_running());
}

#[test]
fn test_episode_protocol_contract() {
    let config = PipelineConfig {
        resolution: (WIDTH, HEIGHT),
        ..PipelineConfig::default()
    };
    let pipeline = PerceptionPipeline::new(config, Arc::new(ChairDetector)).unwrap();
    let _input = pipeline.start().unwrap();

    assert_eq!(pipeline.cancel_check(), CancelResponse::NoActiveEpisode);

    // No frames ever arrive: the episode ends at its deadline
    let deadline = Duration::from_millis(150);
    let ticket = pipeline.check_for_objects(Some(deadline)).unwrap();
    assert!(matches!(pipeline.check_for_objects(None), Err(VisionError::Busy)));
    assert_eq!(pipeline.metrics().episodes_busy, 1);

    let result = ticket.wait().unwrap();
    assert_eq!(result.state, EpisodeState::Succeeded);
    assert!(result.detections().is_empty());
    // Deadline plus one idle detector iteration, with scheduling slack
    assert!(result.elapsed < deadline + Duration::from_millis(500));
    assert!(wait_until(Duration::from_secs(1), || pipeline.episode_state() == EpisodeState::Idle));

    let second = pipeline.check_for_objects(Some(Duration::from_secs(10))).unwrap();
    assert!(second.id() > result.id);
    pipeline.stop();
    assert_eq!(second.wait().unwrap().state, EpisodeState::Preempted);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_episode_awaited_from_async_caller() {
    let config = PipelineConfig {
        resolution: (WIDTH, HEIGHT),
        monocular: true,
        ..PipelineConfig::default()
    };
    let pipeline = PerceptionPipeline::new(config, Arc::new(ChairDetector)).unwrap();
    let input = pipeline.start().unwrap();

    let ticket = pipeline.check_for_objects(Some(Duration::from_secs(5))).unwrap();
    input.push_color(Stamp::from_millis(10), ImageBuffer::filled(WIDTH, HEIGHT, 3, 0).unwrap()).unwrap();
    input.push_calibration(Stamp::from_millis(11), intrinsics()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), ticket.result())
        .await
        .expect("episode finished in time")
        .unwrap();
    assert_eq!(result.state, EpisodeState::Succeeded);
    assert_eq!(result.stamp, Some(Stamp::from_millis(10)));

    tokio::task::spawn_blocking(move || pipeline.stop()).await.unwrap();
}

#[test]
fn test_config_file_drives_pipeline() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "resolution: [160, 120]\nsmoothing_window: 2\nclass_labels: [\"a\", \"b\"]\nepisode_timeout_ms: 200"
    )
    .unwrap();

    let config = PipelineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.class_labels.len(), 2);
    assert_eq!(config.episode_timeout(), Duration::from_millis(200));
    let pipeline = PerceptionPipeline::new(config, Arc::new(ChairDetector)).unwrap();
    assert_eq!(pipeline.config().smoothing_window, 2);
    assert_eq!(pipeline.config().label_for(1), "b");
}
