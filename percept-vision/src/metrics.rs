//! Pipeline counters, exported through the `metrics` facade and readable in-process

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of every pipeline counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_fused: u64,
    pub sync_misses: u64,
    pub input_overflows: u64,
    pub frames_rejected: u64,
    pub ring_overruns: u64,
    pub detector_iterations: u64,
    pub model_failures: u64,
    pub reports_published: u64,
    pub projections_dropped: u64,
    pub episodes_started: u64,
    pub episodes_succeeded: u64,
    pub episodes_preempted: u64,
    pub episodes_busy: u64,
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    frames_fused: AtomicU64,
    sync_misses: AtomicU64,
    input_overflows: AtomicU64,
    frames_rejected: AtomicU64,
    ring_overruns: AtomicU64,
    detector_iterations: AtomicU64,
    model_failures: AtomicU64,
    reports_published: AtomicU64,
    projections_dropped: AtomicU64,
    episodes_started: AtomicU64,
    episodes_succeeded: AtomicU64,
    episodes_preempted: AtomicU64,
    episodes_busy: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fused_frame(&self) {
        self.frames_fused.fetch_add(1, Ordering::Relaxed);
        counter!("percept_frames_fused_total").increment(1);
    }

    pub fn record_sync_misses(&self, misses: u64) {
        if misses == 0 {
            return;
        }
        self.sync_misses.fetch_add(misses, Ordering::Relaxed);
        counter!("percept_sync_misses_total").increment(misses);
    }

    pub fn record_input_overflow(&self) {
        self.input_overflows.fetch_add(1, Ordering::Relaxed);
        counter!("percept_input_overflows_total").increment(1);
    }

    pub fn record_rejected_frame(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        counter!("percept_frames_rejected_total").increment(1);
    }

    pub fn record_ring_overrun(&self) {
        self.ring_overruns.fetch_add(1, Ordering::Relaxed);
        counter!("percept_ring_overruns_total").increment(1);
    }

    pub fn record_detector_iteration(&self, inference_ms: f64) {
        self.detector_iterations.fetch_add(1, Ordering::Relaxed);
        counter!("percept_detector_iterations_total").increment(1);
        histogram!("percept_inference_duration_ms").record(inference_ms);
    }

    pub fn record_model_failure(&self) {
        self.model_failures.fetch_add(1, Ordering::Relaxed);
        counter!("percept_model_failures_total").increment(1);
    }

    pub fn record_report_published(&self, fps: f64) {
        self.reports_published.fetch_add(1, Ordering::Relaxed);
        counter!("percept_reports_published_total").increment(1);
        gauge!("percept_detector_fps").set(fps);
    }

    pub fn record_projections_dropped(&self, dropped: usize) {
        if dropped == 0 {
            return;
        }
        self.projections_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        counter!("percept_projections_dropped_total").increment(dropped as u64);
    }

    pub fn record_episode_started(&self) {
        self.episodes_started.fetch_add(1, Ordering::Relaxed);
        counter!("percept_episodes_started_total").increment(1);
    }

    pub fn record_episode_succeeded(&self) {
        self.episodes_succeeded.fetch_add(1, Ordering::Relaxed);
        counter!("percept_episodes_succeeded_total").increment(1);
    }

    pub fn record_episode_preempted(&self) {
        self.episodes_preempted.fetch_add(1, Ordering::Relaxed);
        counter!("percept_episodes_preempted_total").increment(1);
    }

    pub fn record_episode_busy(&self) {
        self.episodes_busy.fetch_add(1, Ordering::Relaxed);
        counter!("percept_episodes_busy_total").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_fused: self.frames_fused.load(Ordering::Relaxed),
            sync_misses: self.sync_misses.load(Ordering::Relaxed),
            input_overflows: self.input_overflows.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            ring_overruns: self.ring_overruns.load(Ordering::Relaxed),
            detector_iterations: self.detector_iterations.load(Ordering::Relaxed),
            model_failures: self.model_failures.load(Ordering::Relaxed),
            reports_published: self.reports_published.load(Ordering::Relaxed),
            projections_dropped: self.projections_dropped.load(Ordering::Relaxed),
            episodes_started: self.episodes_started.load(Ordering::Relaxed),
            episodes_succeeded: self.episodes_succeeded.load(Ordering::Relaxed),
            episodes_preempted: self.episodes_preempted.load(Ordering::Relaxed),
            episodes_busy: self.episodes_busy.load(Ordering::Relaxed),
        }
    }
}
