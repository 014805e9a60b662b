//! Detection, smoothing and the detection thread

pub mod detection;
pub mod smoothing;
pub mod worker;

pub use detection::DetectionPipeline;
pub use smoothing::{SmoothedDetection, TemporalSmoother};
pub use worker::DetectionReport;
pub(crate) use worker::DetectionWorker;
