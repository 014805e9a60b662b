//! Inbound sample queue and the capture thread

use crate::error::VisionError;
use crate::frame::{CameraIntrinsics, DepthImage, Frame, ImageBuffer};
use crate::metrics::PipelineMetrics;
use crate::state::{PipelineContext, POLL_INTERVAL};
use crate::sync::{FrameSynchronizer, FusedSample, InputSample};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use percept_core::Stamp;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point for the transport layer. Cheap to clone; every clone feeds
/// the same capture thread.
#[derive(Clone)]
pub struct FrameInput {
    sender: Sender<InputSample>,
    metrics: Arc<PipelineMetrics>,
}

impl FrameInput {
    /// Queue a sample without blocking. A full queue drops the sample;
    /// only a stopped pipeline is an error.
    pub fn push(&self, sample: InputSample) -> Result<(), VisionError> {
        match self.sender.try_send(sample) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(sample)) => {
                self.metrics.record_input_overflow();
                debug!("Input queue full, dropping {:?} sample", sample.channel());
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(VisionError::ChannelClosed("capture input".to_string()))
            }
        }
    }

    pub fn push_color(&self, stamp: Stamp, image: ImageBuffer) -> Result<(), VisionError> {
        self.push(InputSample::Color { stamp, image })
    }

    pub fn push_depth(&self, stamp: Stamp, depth: DepthImage) -> Result<(), VisionError> {
        self.push(InputSample::Depth { stamp, depth })
    }

    pub fn push_calibration(&self, stamp: Stamp, intrinsics: CameraIntrinsics) -> Result<(), VisionError> {
        self.push(InputSample::Calibration { stamp, intrinsics })
    }
}

/// Create the bounded input queue
pub(crate) fn input_channel(capacity: usize, metrics: Arc<PipelineMetrics>) -> (FrameInput, Receiver<InputSample>) {
    let (sender, receiver) = channel::bounded(capacity.max(1));
    (FrameInput { sender, metrics }, receiver)
}

/// Fuses input samples and writes complete frames into the ring
pub(crate) struct CaptureLoop {
    ctx: Arc<PipelineContext>,
    input: Receiver<InputSample>,
    synchronizer: FrameSynchronizer,
    sequence: u64,
}

impl CaptureLoop {
    pub fn new(ctx: Arc<PipelineContext>, input: Receiver<InputSample>) -> Self {
        let synchronizer = FrameSynchronizer::new(
            ctx.config.sync_tolerance(),
            ctx.config.sync_queue_size,
            ctx.config.monocular,
        );
        Self {
            ctx,
            input,
            synchronizer,
            sequence: 0,
        }
    }

    pub fn run(mut self) {
        info!(
            "Capture thread started ({} mode)",
            if self.synchronizer.is_monocular() { "monocular" } else { "rgb-d" }
        );

        loop {
            if !self.ctx.is_running() {
                break;
            }

            match self.input.recv_timeout(POLL_INTERVAL) {
                Ok(sample) => self.handle(sample),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Input queue closed, stopping capture thread");
                    break;
                }
            }
        }

        info!("Capture thread stopped after {} frames", self.sequence);
    }

    fn handle(&mut self, sample: InputSample) {
        let misses = self.synchronizer.misses();
        let fused = self.synchronizer.push(sample);
        self.ctx.metrics.record_sync_misses(self.synchronizer.misses() - misses);

        if let Some(fused) = fused {
            self.ctx.metrics.record_fused_frame();
            self.store(fused);
        }
    }

    fn store(&mut self, fused: FusedSample) {
        if let Err(reason) = self.check_geometry(&fused) {
            warn!("Rejecting fused frame at {:.3}s: {}", fused.stamp.as_secs_f64(), reason);
            self.ctx.metrics.record_rejected_frame();
            return;
        }

        let Some(fill) = self.ctx.ring.begin_fill() else {
            debug!("No free ring slot, dropping frame at {:.3}s", fused.stamp.as_secs_f64());
            self.ctx.metrics.record_ring_overrun();
            return;
        };

        self.sequence += 1;
        let frame = Frame {
            sequence: self.sequence,
            stamp: fused.stamp,
            image: fused.image,
            depth: fused.depth,
            intrinsics: Some(fused.intrinsics),
        };
        debug!("Frame {} committed to slot {}", frame.sequence, fill.slot().index());
        self.ctx.ring.commit_fill(fill, frame);
    }

    fn check_geometry(&self, fused: &FusedSample) -> Result<(), String> {
        let (width, height) = self.ctx.config.resolution;
        let image = &fused.image;
        if image.width() != width || image.height() != height || image.channels() != self.ctx.config.channels {
            return Err(format!(
                "image is {}x{}x{}, expected {}x{}x{}",
                image.width(),
                image.height(),
                image.channels(),
                width,
                height,
                self.ctx.config.channels
            ));
        }

        if let Some(depth) = &fused.depth {
            if depth.width() != width || depth.height() != height {
                return Err(format!(
                    "depth is {}x{}, expected {}x{}",
                    depth.width(),
                    depth.height(),
                    width,
                    height
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn context(monocular: bool) -> Arc<PipelineContext> {
        let config = PipelineConfig {
            resolution: (4, 2),
            monocular,
            ..PipelineConfig::default()
        };
        let ctx = Arc::new(PipelineContext::new(config));
        ctx.set_running(true);
        ctx
    }

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(100.0, 100.0, 2.0, 1.0).unwrap()
    }

    #[test]
    fn test_full_queue_drops_without_error() {
        let metrics = Arc::new(PipelineMetrics::new());
        let (input, _receiver) = input_channel(1, Arc::clone(&metrics));
        let image = ImageBuffer::filled(4, 2, 3, 0).unwrap();

        input.push_color(Stamp::from_millis(1), image.clone()).unwrap();
        input.push_color(Stamp::from_millis(2), image).unwrap();
        assert_eq!(metrics.snapshot().input_overflows, 1);
    }

    #[test]
    fn test_closed_queue_is_an_error() {
        let metrics = Arc::new(PipelineMetrics::new());
        let (input, receiver) = input_channel(4, metrics);
        drop(receiver);
        assert!(matches!(
            input.push_calibration(Stamp::ZERO, intrinsics()),
            Err(VisionError::ChannelClosed(_))
        ));
    }

    #[test]
    fn test_fused_set_lands_in_ring() {
        let ctx = context(false);
        let (_input, receiver) = input_channel(8, Arc::clone(&ctx.metrics));
        let mut capture = CaptureLoop::new(Arc::clone(&ctx), receiver);

        capture.handle(InputSample::Calibration {
            stamp: Stamp::from_millis(100),
            intrinsics: intrinsics(),
        });
        capture.handle(InputSample::Depth {
            stamp: Stamp::from_millis(105),
            depth: DepthImage::new(4, 2, vec![1.0; 8]).unwrap(),
        });
        capture.handle(InputSample::Color {
            stamp: Stamp::from_millis(110),
            image: ImageBuffer::filled(4, 2, 3, 9).unwrap(),
        });

        let lease = ctx.ring.checkout().expect("frame committed");
        assert_eq!(lease.frame().sequence, 1);
        assert!(lease.frame().depth.is_some());
        assert!(lease.frame().intrinsics.is_some());
        assert_eq!(ctx.metrics.snapshot().frames_fused, 1);
    }

    #[test]
    fn test_wrong_geometry_is_rejected() {
        let ctx = context(true);
        let (_input, receiver) = input_channel(8, Arc::clone(&ctx.metrics));
        let mut capture = CaptureLoop::new(Arc::clone(&ctx), receiver);

        capture.handle(InputSample::Calibration {
            stamp: Stamp::from_millis(10),
            intrinsics: intrinsics(),
        });
        capture.handle(InputSample::Color {
            stamp: Stamp::from_millis(10),
            image: ImageBuffer::filled(8, 8, 3, 0).unwrap(),
        });

        assert!(ctx.ring.checkout().is_none());
        let snap = ctx.metrics.snapshot();
        assert_eq!(snap.frames_fused, 1);
        assert_eq!(snap.frames_rejected, 1);
    }

    #[test]
    fn test_run_exits_when_stopped() {
        let ctx = context(true);
        let (_input, receiver) = input_channel(8, Arc::clone(&ctx.metrics));
        let capture = CaptureLoop::new(Arc::clone(&ctx), receiver);

        let handle = std::thread::spawn(move || capture.run());
        ctx.set_running(false);
        handle.join().unwrap();
    }
}
