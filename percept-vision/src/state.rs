//! Shared pipeline state handed to every thread
//!
//! Each field has its own lock sized to its access pattern. Locks guard only
//! the swap of a shared reference; no lock is held across inference,
//! projection or I/O.

use crate::annotation::AnnotatedImage;
use crate::config::PipelineConfig;
use crate::episode::EpisodeController;
use crate::metrics::PipelineMetrics;
use crate::processing::DetectionReport;
use crate::projection::GroundPlane;
use crate::publish::DetectionEvent;
use crate::ring::FrameRing;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Upper bound on how long a thread goes without checking the running flag
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub ring: Arc<FrameRing>,
    pub episodes: EpisodeController,
    pub metrics: Arc<PipelineMetrics>,
    running: RwLock<bool>,
    ground_plane: RwLock<Option<GroundPlane>>,
    latest: RwLock<Option<Arc<DetectionReport>>>,
    events: broadcast::Sender<DetectionEvent>,
    annotated: broadcast::Sender<AnnotatedImage>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        let (annotated, _) = broadcast::channel(config.event_buffer_size.max(1));

        Self {
            episodes: EpisodeController::new(config.episode_timeout(), Arc::clone(&metrics)),
            config: Arc::new(config),
            ring: Arc::new(FrameRing::new()),
            metrics,
            running: RwLock::new(false),
            ground_plane: RwLock::new(None),
            latest: RwLock::new(None),
            events,
            annotated,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Flip the running flag, returning the previous value
    pub fn set_running(&self, running: bool) -> bool {
        std::mem::replace(&mut *self.running.write(), running)
    }

    /// Last known plane; no freshness check
    pub fn ground_plane(&self) -> Option<GroundPlane> {
        *self.ground_plane.read()
    }

    pub fn set_ground_plane(&self, plane: GroundPlane) {
        *self.ground_plane.write() = Some(plane);
    }

    pub fn latest_report(&self) -> Option<Arc<DetectionReport>> {
        self.latest.read().clone()
    }

    pub fn set_latest_report(&self, report: Arc<DetectionReport>) {
        *self.latest.write() = Some(report);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DetectionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_annotated(&self) -> broadcast::Receiver<AnnotatedImage> {
        self.annotated.subscribe()
    }

    /// Broadcast an event; having no subscribers is not an error
    pub fn publish_event(&self, event: DetectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn publish_annotated(&self, image: AnnotatedImage) {
        let _ = self.annotated.send(image);
    }

    /// Sleep for `duration` in short steps, returning early on shutdown
    pub fn sleep_while_running(&self, duration: Duration) {
        let until = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= until || !self.is_running() {
                return;
            }
            std::thread::sleep((until - now).min(POLL_INTERVAL));
        }
    }
}
