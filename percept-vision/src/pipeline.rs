//! Perception pipeline facade
//!
//! Owns the shared context and the three pipeline threads (capture,
//! detection, publish) and exposes the inbound, outbound and episode
//! interfaces.

use crate::annotation::{AnnotatedImage, FrameAnnotator};
use crate::capture::{input_channel, CaptureLoop, FrameInput};
use crate::config::PipelineConfig;
use crate::episode::{CancelResponse, EpisodeState, EpisodeTicket};
use crate::error::VisionError;
use crate::metrics::MetricsSnapshot;
use crate::models::Detector;
use crate::processing::{DetectionPipeline, DetectionReport, DetectionWorker};
use crate::projection::GroundPlane;
use crate::publish::{DetectionEvent, Publisher};
use crate::state::PipelineContext;
use crossbeam::channel;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Reports buffered between the detection and publish threads. A newer
/// report replaces an unpublished one.
const REPORT_QUEUE_SIZE: usize = 1;

pub struct PerceptionPipeline {
    ctx: Arc<PipelineContext>,
    detector: Arc<dyn Detector>,
    annotator: Option<Arc<dyn FrameAnnotator>>,
    input: RwLock<Option<FrameInput>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PerceptionPipeline {
    /// Create a stopped pipeline. The configuration is validated here and
    /// immutable afterwards.
    pub fn new(config: PipelineConfig, detector: Arc<dyn Detector>) -> Result<Self, VisionError> {
        config
            .validate()
            .map_err(|e| VisionError::Config(format!("Invalid pipeline config: {}", e)))?;

        Ok(Self {
            ctx: Arc::new(PipelineContext::new(config)),
            detector,
            annotator: None,
            input: RwLock::new(None),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Renderer used for the annotated stream when `enable_display` is set
    pub fn with_annotator(mut self, annotator: Arc<dyn FrameAnnotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    /// Spawn the pipeline threads and return the inbound handle
    pub fn start(&self) -> Result<FrameInput, VisionError> {
        if self.ctx.set_running(true) {
            return Err(VisionError::Processing("Pipeline already running".to_string()));
        }

        let (input, samples) = input_channel(self.ctx.config.input_buffer_size, Arc::clone(&self.ctx.metrics));
        let (report_tx, report_rx) = channel::bounded(REPORT_QUEUE_SIZE);

        let capture = CaptureLoop::new(Arc::clone(&self.ctx), samples);
        let worker = DetectionWorker::new(
            Arc::clone(&self.ctx),
            DetectionPipeline::new(Arc::clone(&self.detector)),
            report_tx,
            report_rx.clone(),
        );
        let publisher = Publisher::new(Arc::clone(&self.ctx), report_rx, self.annotator.clone());

        let spawned = self
            .spawn("percept-capture", move || capture.run())
            .and_then(|_| self.spawn("percept-detect", move || worker.run()))
            .and_then(|_| self.spawn("percept-publish", move || publisher.run()));
        if let Err(e) = spawned {
            error!("Failed to start pipeline: {}", e);
            self.stop();
            return Err(e);
        }

        *self.input.write() = Some(input.clone());
        info!(
            "Perception pipeline started ({}x{}, window {}, {})",
            self.ctx.config.resolution.0,
            self.ctx.config.resolution.1,
            self.ctx.config.smoothing_window,
            if self.ctx.config.monocular { "monocular" } else { "rgb-d" }
        );
        Ok(input)
    }

    fn spawn<F>(&self, name: &str, body: F) -> Result<(), VisionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| VisionError::Processing(format!("Failed to spawn {}: {}", name, e)))?;
        self.handles.lock().push(handle);
        Ok(())
    }

    /// Stop all threads. A running episode is preempted. Idempotent.
    pub fn stop(&self) {
        let was_running = self.ctx.set_running(false);
        self.ctx.episodes.abort();
        *self.input.write() = None;

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("pipeline").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked", name);
            }
        }

        if was_running {
            info!("Perception pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    /// Inbound handle of the running pipeline
    pub fn input(&self) -> Option<FrameInput> {
        self.input.read().clone()
    }

    /// Continuous result stream
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.ctx.subscribe_events()
    }

    pub fn subscribe_annotated(&self) -> broadcast::Receiver<AnnotatedImage> {
        self.ctx.subscribe_annotated()
    }

    /// Replace the ground-plane estimate (`normal · X = distance`, camera frame)
    pub fn update_ground_plane(&self, normal: [f64; 3], distance: f64) -> Result<(), VisionError> {
        let plane = GroundPlane::new(normal, distance).map_err(|e| {
            warn!("Ignoring ground plane update: {}", e);
            e
        })?;
        self.ctx.set_ground_plane(plane);
        Ok(())
    }

    /// Start a "check for objects" episode. `deadline` defaults to the
    /// configured episode timeout.
    pub fn check_for_objects(&self, deadline: Option<Duration>) -> Result<EpisodeTicket, VisionError> {
        if !self.ctx.is_running() {
            return Err(VisionError::NotRunning);
        }
        let ticket = self.ctx.episodes.start(deadline)?;

        // Lost a race with stop(); nobody would ever finish this episode
        if !self.ctx.is_running() {
            self.ctx.episodes.abort();
        }
        Ok(ticket)
    }

    pub fn cancel_check(&self) -> CancelResponse {
        self.ctx.episodes.cancel()
    }

    pub fn episode_state(&self) -> EpisodeState {
        self.ctx.episodes.state()
    }

    /// Most recent completed smoothing pass
    pub fn latest_report(&self) -> Option<Arc<DetectionReport>> {
        self.ctx.latest_report()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }
}

impl Drop for PerceptionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
