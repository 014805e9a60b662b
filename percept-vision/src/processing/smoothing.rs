//! Temporal smoothing of detection confidence across detector iterations

use crate::models::{BoundingBox, RawDetection};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Upper bound on live slots
const MAX_SLOTS: usize = 1000;

/// A detection with its confidence averaged over the smoothing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedDetection {
    /// Stable id of the smoothing slot this detection belongs to
    pub slot_id: u64,
    pub class_id: usize,
    pub label: String,
    /// Confidence reported by the model in the latest iteration (0 if missed)
    pub raw_confidence: f32,
    /// Exponentially weighted average over the window
    pub confidence: f32,
    /// Most recent box of the slot
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone)]
struct SmoothingSlot {
    id: u64,
    class_id: usize,
    bbox: BoundingBox,
    /// Newest first, always `window` long
    history: VecDeque<f32>,
}

impl SmoothingSlot {
    fn push(&mut self, confidence: f32) {
        self.history.push_front(confidence);
        self.history.pop_back();
    }

    fn latest(&self) -> f32 {
        self.history.front().copied().unwrap_or(0.0)
    }

    fn is_dead(&self) -> bool {
        self.history.iter().all(|&c| c <= 0.0)
    }
}

/// Averages per-slot confidence over the last `window` iterations.
///
/// A slot is one object of one class followed across iterations by IoU.
/// Its history holds exactly `window` samples, newest first; an iteration
/// that does not see the object contributes 0. Sample `k` (0 = newest) has
/// weight `(1 - 1/window)^k`, normalized over the full window, so a new
/// object reaches its true confidence after `window` iterations and a
/// single-frame blip is damped. Slots with an all-zero history are removed.
pub struct TemporalSmoother {
    window: usize,
    weights: Vec<f32>,
    iou_threshold: f32,
    slots: Vec<SmoothingSlot>,
    next_id: u64,
}

impl TemporalSmoother {
    pub fn new(window: usize, iou_threshold: f32) -> Self {
        let window = window.max(1);
        let decay = 1.0 - 1.0 / window as f32;
        let raw: Vec<f32> = (0..window).map(|k| decay.powi(k as i32)).collect();
        let total: f32 = raw.iter().sum();
        let weights = raw.into_iter().map(|w| w / total).collect();

        Self {
            window,
            weights,
            iou_threshold,
            slots: Vec::new(),
            next_id: 1,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }

    /// Fold one iteration's detections in and return every live slot
    pub fn update<F>(&mut self, detections: &[RawDetection], label_for: F) -> Vec<SmoothedDetection>
    where
        F: Fn(usize) -> String,
    {
        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .partial_cmp(&detections[a].confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut updated = vec![false; self.slots.len()];
        let mut fresh = Vec::new();

        for idx in order {
            let detection = &detections[idx];
            let mut best: Option<(usize, f32)> = None;

            for (slot_idx, slot) in self.slots.iter().enumerate() {
                if updated[slot_idx] || slot.class_id != detection.class_id {
                    continue;
                }
                let iou = detection.bbox.iou(&slot.bbox);
                if iou >= self.iou_threshold && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((slot_idx, iou));
                }
            }

            match best {
                Some((slot_idx, _)) => {
                    let slot = &mut self.slots[slot_idx];
                    slot.push(detection.confidence);
                    slot.bbox = detection.bbox;
                    updated[slot_idx] = true;
                }
                None => fresh.push(detection),
            }
        }

        // Slots not seen in this iteration decay
        for (slot, seen) in self.slots.iter_mut().zip(updated.iter()) {
            if !seen {
                slot.push(0.0);
            }
        }
        self.slots.retain(|s| !s.is_dead());

        for detection in fresh {
            if self.slots.len() >= MAX_SLOTS {
                debug!("Smoothing slot limit reached, dropping detection");
                break;
            }
            let mut history: VecDeque<f32> = std::iter::repeat(0.0).take(self.window).collect();
            history.push_front(detection.confidence);
            history.pop_back();

            let slot = SmoothingSlot {
                id: self.next_id,
                class_id: detection.class_id,
                bbox: detection.bbox,
                history,
            };
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !slot.is_dead() {
                self.slots.push(slot);
            }
        }

        self.slots
            .iter()
            .map(|slot| SmoothedDetection {
                slot_id: slot.id,
                class_id: slot.class_id,
                label: label_for(slot.class_id),
                raw_confidence: slot.latest(),
                confidence: self.smoothed(slot),
                bbox: slot.bbox,
            })
            .collect()
    }

    fn smoothed(&self, slot: &SmoothingSlot) -> f32 {
        slot.history
            .iter()
            .zip(self.weights.iter())
            .map(|(c, w)| c * w)
            .sum::<f32>()
            .clamp(0.0, 1.0)
    }
}
