//! Configuration for percept-vision

use crate::error::VisionError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// COCO class names (80 classes)
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Largest accepted smoothing window
pub const MAX_SMOOTHING_WINDOW: usize = 64;

/// Which pixel of a detection box is back-projected onto the ground plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionAnchor {
    /// Box center
    Center,
    /// Middle of the bottom edge, where an upright object touches the ground
    BottomCenter,
}

/// Pipeline configuration. Read once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame resolution (width, height)
    pub resolution: (u32, u32),
    /// Bytes per pixel of the colour stream
    pub channels: u8,
    /// Class id to label mapping
    pub class_labels: Vec<String>,
    /// Number of detector iterations averaged into a smoothed confidence
    pub smoothing_window: usize,
    /// Minimum smoothed confidence for a detection to be published
    pub detection_threshold: f32,
    /// IoU a new detection needs to continue an existing smoothing slot
    pub match_iou_threshold: f32,
    /// Colour + calibration only, no depth stream
    pub monocular: bool,
    /// Maximum timestamp skew inside a fused frame
    pub sync_tolerance_ms: u64,
    /// Samples buffered per input channel before the oldest is evicted
    pub sync_queue_size: usize,
    /// Minimum period of a detector iteration (0 runs at model throughput)
    pub detect_interval_ms: u64,
    /// Deadline applied to episodes started without one
    pub episode_timeout_ms: u64,
    /// Pixel used for ground-plane back-projection
    pub projection_anchor: ProjectionAnchor,
    /// Render annotated images
    pub enable_display: bool,
    /// Log every published report
    pub enable_console_output: bool,
    /// Capacity of the outbound broadcast streams
    pub event_buffer_size: usize,
    /// Capacity of the inbound sample queue
    pub input_buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolution: (640, 480),
            channels: 3,
            class_labels: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
            smoothing_window: 3,
            detection_threshold: 0.3,
            match_iou_threshold: 0.3,
            monocular: false,
            sync_tolerance_ms: 30,
            sync_queue_size: 10,
            detect_interval_ms: 0,
            episode_timeout_ms: 5000,
            projection_anchor: ProjectionAnchor::Center,
            enable_display: false,
            enable_console_output: false,
            event_buffer_size: 64,
            input_buffer_size: 64,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML, YAML or JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VisionError> {
        let config: PipelineConfig = percept_core::load_config(path)?;
        config.validate().map_err(VisionError::Config)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            return Err("Resolution must be non-zero".to_string());
        }

        if self.resolution.0 > 7680 || self.resolution.1 > 4320 {
            return Err("Resolution too large (max 8K)".to_string());
        }

        // Check for potential overflow in buffer size calculations
        self.resolution
            .0
            .checked_mul(self.resolution.1)
            .and_then(|p| p.checked_mul(self.channels as u32))
            .ok_or_else(|| "Resolution would cause integer overflow".to_string())?;

        if self.channels == 0 || self.channels > 4 {
            return Err("Channels must be between 1 and 4".to_string());
        }

        if self.class_labels.is_empty() {
            return Err("At least one class label is required".to_string());
        }

        if self.smoothing_window == 0 || self.smoothing_window > MAX_SMOOTHING_WINDOW {
            return Err(format!(
                "Smoothing window must be between 1 and {}",
                MAX_SMOOTHING_WINDOW
            ));
        }

        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err("Detection threshold must be within [0, 1]".to_string());
        }

        if !(0.0..=1.0).contains(&self.match_iou_threshold) {
            return Err("Match IoU threshold must be within [0, 1]".to_string());
        }

        if self.sync_tolerance_ms == 0 {
            return Err("Sync tolerance must be greater than 0".to_string());
        }

        if self.sync_queue_size == 0 {
            return Err("Sync queue size must be greater than 0".to_string());
        }

        if self.episode_timeout_ms == 0 {
            return Err("Episode timeout must be greater than 0".to_string());
        }

        if self.event_buffer_size == 0 || self.input_buffer_size == 0 {
            return Err("Buffer sizes must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn sync_tolerance(&self) -> Duration {
        Duration::from_millis(self.sync_tolerance_ms)
    }

    pub fn detect_interval(&self) -> Duration {
        Duration::from_millis(self.detect_interval_ms)
    }

    pub fn episode_timeout(&self) -> Duration {
        Duration::from_millis(self.episode_timeout_ms)
    }

    /// Label for a class id, falling back to `class_<id>` for unknown ids
    pub fn label_for(&self, class_id: usize) -> String {
        self.class_labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}
