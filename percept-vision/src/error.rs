//! Error types for percept-vision

use percept_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Synchronization error: {0}")]
    Sync(String),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("An episode is already running")]
    Busy,

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl From<VisionError> for CoreError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Core(inner) => inner,
            VisionError::Config(msg) => CoreError::Configuration(msg),
            other => CoreError::Concurrency(format!("Vision error: {}", other)),
        }
    }
}
