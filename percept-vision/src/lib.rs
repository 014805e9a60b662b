//! percept-vision: real-time detection pipeline
//!
//! Colour, depth and calibration samples are fused by approximate time,
//! handed through a three-slot frame ring to a detection thread that runs an
//! opaque model and smooths its confidences over time, and published as a
//! continuous event stream with optional ground-plane 3D positions. A
//! goal/cancel episode protocol lets callers request a bounded one-shot check.

pub mod annotation;
pub mod capture;
pub mod config;
pub mod episode;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod processing;
pub mod projection;
pub mod publish;
pub mod ring;
pub mod state;
pub mod sync;

pub use annotation::{AnnotatedImage, BoxAnnotator, FrameAnnotator};
pub use capture::FrameInput;
pub use config::{PipelineConfig, ProjectionAnchor};
pub use episode::{CancelResponse, EpisodeOutcome, EpisodeResult, EpisodeState, EpisodeTicket};
pub use error::VisionError;
pub use frame::{CameraIntrinsics, DepthImage, Frame, ImageBuffer};
pub use metrics::MetricsSnapshot;
pub use models::{BoundingBox, Detector, RawDetection};
pub use pipeline::PerceptionPipeline;
pub use processing::{DetectionReport, SmoothedDetection, TemporalSmoother};
pub use projection::{back_project, GroundPlane, GroundPlaneProjector, ObjectDetection3D};
pub use publish::DetectionEvent;
pub use ring::{FrameRing, RingSlot, SlotLease};
pub use sync::{FrameSynchronizer, InputSample};
