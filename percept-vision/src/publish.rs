//! Publish thread: projection, continuous event stream, annotated images

use crate::annotation::{AnnotatedImage, FrameAnnotator};
use crate::processing::{DetectionReport, SmoothedDetection};
use crate::projection::{GroundPlaneProjector, ObjectDetection3D};
use crate::state::{PipelineContext, POLL_INTERVAL};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use percept_core::Stamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One event of the continuous result stream, emitted per smoothing pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub sequence: u64,
    pub frame_sequence: u64,
    pub stamp: Stamp,
    pub detections: Vec<SmoothedDetection>,
    /// Detections with a defined ground-plane projection
    pub objects: Vec<ObjectDetection3D>,
    pub object_count: usize,
    pub class_counts: BTreeMap<String, usize>,
    pub fps: f64,
}

impl DetectionEvent {
    pub fn new(report: &DetectionReport, objects: Vec<ObjectDetection3D>) -> Self {
        let mut class_counts = BTreeMap::new();
        for detection in &report.detections {
            *class_counts.entry(detection.label.clone()).or_insert(0) += 1;
        }

        Self {
            sequence: report.sequence,
            frame_sequence: report.frame_sequence,
            stamp: report.stamp,
            detections: report.detections.clone(),
            objects,
            object_count: report.detections.len(),
            class_counts,
            fps: report.fps,
        }
    }
}

pub(crate) struct Publisher {
    ctx: Arc<PipelineContext>,
    reports: Receiver<Arc<DetectionReport>>,
    projector: GroundPlaneProjector,
    annotator: Option<Arc<dyn FrameAnnotator>>,
}

impl Publisher {
    pub fn new(
        ctx: Arc<PipelineContext>,
        reports: Receiver<Arc<DetectionReport>>,
        annotator: Option<Arc<dyn FrameAnnotator>>,
    ) -> Self {
        let projector = GroundPlaneProjector::new(ctx.config.projection_anchor);
        Self {
            ctx,
            reports,
            projector,
            annotator,
        }
    }

    pub fn run(self) {
        info!("Publish thread started");

        loop {
            if !self.ctx.is_running() {
                break;
            }

            match self.reports.recv_timeout(POLL_INTERVAL) {
                Ok(report) => self.publish(&report),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Report queue closed");
                    break;
                }
            }
        }

        info!("Publish thread stopped");
    }

    pub fn publish(&self, report: &DetectionReport) {
        let objects = self.project(report);
        self.ctx.publish_event(DetectionEvent::new(report, objects));
        self.ctx.metrics.record_report_published(report.fps);

        if self.ctx.config.enable_display {
            self.annotate(report);
        }
    }

    fn project(&self, report: &DetectionReport) -> Vec<ObjectDetection3D> {
        // Snapshot; a concurrent plane update only affects later reports
        let (Some(intrinsics), Some(plane)) = (report.intrinsics.as_ref(), self.ctx.ground_plane()) else {
            return Vec::new();
        };

        let objects = self.projector.project_all(&report.detections, intrinsics, &plane);
        let dropped = report.detections.len() - objects.len();
        if dropped > 0 {
            debug!("{} detections without a ground-plane intersection", dropped);
        }
        self.ctx.metrics.record_projections_dropped(dropped);
        objects
    }

    fn annotate(&self, report: &DetectionReport) {
        let Some(annotator) = self.annotator.as_ref() else {
            return;
        };
        // Boxes go onto the current frame, not necessarily the one detected on
        let Some(lease) = self.ctx.ring.checkout() else {
            return;
        };

        match annotator.annotate(lease.frame(), &report.detections) {
            Ok(image) => self.ctx.publish_annotated(AnnotatedImage {
                report_sequence: report.sequence,
                frame_sequence: lease.frame().sequence,
                stamp: lease.frame().stamp,
                image,
            }),
            Err(e) => warn!("Annotation failed: {}", e),
        }
    }
}
