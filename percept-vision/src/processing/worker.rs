//! Detection thread: model, smoothing, episode polling

use crate::frame::CameraIntrinsics;
use crate::processing::{DetectionPipeline, SmoothedDetection, TemporalSmoother};
use crate::ring::SlotLease;
use crate::state::{PipelineContext, POLL_INTERVAL};
use crossbeam::channel::{Receiver, Sender, TrySendError};
use percept_core::Stamp;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause before running the model again on a frame it has already seen
const REPEAT_BACKOFF: Duration = Duration::from_millis(2);

/// Result of one completed smoothing pass
#[derive(Debug, Clone)]
pub struct DetectionReport {
    /// Counter of completed passes
    pub sequence: u64,
    /// Sequence of the frame the pass ran on
    pub frame_sequence: u64,
    pub stamp: Stamp,
    /// When the pass checked out its frame
    pub started_at: Instant,
    /// Smoothed detections at or above the detection threshold
    pub detections: Vec<SmoothedDetection>,
    pub intrinsics: Option<CameraIntrinsics>,
    /// Completed passes per second, measured between consecutive passes
    pub fps: f64,
}

pub(crate) struct DetectionWorker {
    ctx: Arc<PipelineContext>,
    pipeline: DetectionPipeline,
    smoother: TemporalSmoother,
    reports: Sender<Arc<DetectionReport>>,
    /// Same queue as `reports`; used to evict an unpublished report
    backlog: Receiver<Arc<DetectionReport>>,
    sequence: u64,
    last_frame: Option<u64>,
    last_completion: Option<Instant>,
}

impl DetectionWorker {
    pub fn new(
        ctx: Arc<PipelineContext>,
        pipeline: DetectionPipeline,
        reports: Sender<Arc<DetectionReport>>,
        backlog: Receiver<Arc<DetectionReport>>,
    ) -> Self {
        let smoother = TemporalSmoother::new(ctx.config.smoothing_window, ctx.config.match_iou_threshold);
        Self {
            ctx,
            pipeline,
            smoother,
            reports,
            backlog,
            sequence: 0,
            last_frame: None,
            last_completion: None,
        }
    }

    pub fn run(mut self) {
        info!("Detection thread started (window {})", self.smoother.window());

        loop {
            if !self.ctx.is_running() {
                break;
            }

            // Deadlines are enforced here, also while no frame is available
            let latest = self.ctx.latest_report();
            self.ctx.episodes.poll(latest.as_deref());

            let Some(lease) = self.ctx.ring.checkout_timeout(POLL_INTERVAL) else {
                continue;
            };

            if self.last_frame == Some(lease.frame().sequence) {
                std::thread::sleep(REPEAT_BACKOFF);
            }

            let started_at = Instant::now();
            self.iterate(lease, started_at);

            let interval = self.ctx.config.detect_interval();
            let elapsed = started_at.elapsed();
            if elapsed < interval {
                self.ctx.sleep_while_running(interval - elapsed);
            }
        }

        info!("Detection thread stopped after {} passes", self.sequence);
    }

    /// One pass over the leased frame. The lease is released before the
    /// report is handed on.
    pub fn iterate(&mut self, lease: SlotLease, started_at: Instant) {
        let frame = lease.frame();
        self.last_frame = Some(frame.sequence);
        let raw = match self.pipeline.detect(frame) {
            Ok(raw) => raw,
            Err(e) => {
                // Smoothing state is kept; the next pass continues from it
                warn!("Detection failed on frame {}: {}", frame.sequence, e);
                self.ctx.metrics.record_model_failure();
                return;
            }
        };
        let inference_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        self.ctx.metrics.record_detector_iteration(inference_ms);

        let config = Arc::clone(&self.ctx.config);
        let detections: Vec<SmoothedDetection> = self
            .smoother
            .update(&raw, |id| config.label_for(id))
            .into_iter()
            .filter(|d| d.confidence >= config.detection_threshold)
            .collect();

        let now = Instant::now();
        let fps = self
            .last_completion
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .filter(|secs| *secs > 0.0)
            .map(|secs| 1.0 / secs)
            .unwrap_or(0.0);
        self.last_completion = Some(now);
        self.sequence += 1;

        let report = Arc::new(DetectionReport {
            sequence: self.sequence,
            frame_sequence: frame.sequence,
            stamp: frame.stamp,
            started_at,
            detections,
            intrinsics: frame.intrinsics.clone(),
            fps,
        });
        drop(lease);

        self.ctx.set_latest_report(Arc::clone(&report));
        self.ctx.episodes.poll(Some(&report));

        if config.enable_console_output {
            let labels: Vec<String> = report
                .detections
                .iter()
                .map(|d| format!("{}: {:.0}%", d.label, d.confidence * 100.0))
                .collect();
            info!(
                "FPS: {:.1} | frame {} | objects: {} [{}]",
                report.fps,
                report.frame_sequence,
                report.detections.len(),
                labels.join(", ")
            );
        }

        self.hand_off(report);
    }

    /// Queue the report for the publisher. When the queue is full the oldest
    /// unpublished report is replaced, so the newest one always gets through.
    fn hand_off(&self, mut report: Arc<DetectionReport>) {
        loop {
            match self.reports.try_send(report) {
                Ok(()) => return,
                Err(TrySendError::Full(pending)) => {
                    if let Ok(stale) = self.backlog.try_recv() {
                        debug!("Publisher busy, report {} superseded", stale.sequence);
                    }
                    report = pending;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Publisher gone, report not forwarded");
                    return;
                }
            }
        }
    }
}
