//! Approximate-time synchronization of the colour, depth and calibration streams

use crate::frame::{CameraIntrinsics, DepthImage, ImageBuffer};
use percept_core::Stamp;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Input channel a sample arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Color,
    Depth,
    Calibration,
}

/// A sample from one of the inbound streams
#[derive(Debug, Clone)]
pub enum InputSample {
    Color { stamp: Stamp, image: ImageBuffer },
    Depth { stamp: Stamp, depth: DepthImage },
    Calibration { stamp: Stamp, intrinsics: CameraIntrinsics },
}

impl InputSample {
    pub fn channel(&self) -> Channel {
        match self {
            InputSample::Color { .. } => Channel::Color,
            InputSample::Depth { .. } => Channel::Depth,
            InputSample::Calibration { .. } => Channel::Calibration,
        }
    }

    pub fn stamp(&self) -> Stamp {
        match self {
            InputSample::Color { stamp, .. }
            | InputSample::Depth { stamp, .. }
            | InputSample::Calibration { stamp, .. } => *stamp,
        }
    }
}

/// One matched set of samples. `depth` is `None` in monocular mode.
#[derive(Debug, Clone)]
pub struct FusedSample {
    /// Stamp of the colour image
    pub stamp: Stamp,
    pub image: ImageBuffer,
    pub depth: Option<DepthImage>,
    pub intrinsics: CameraIntrinsics,
    /// Largest stamp difference inside the set
    pub skew: Duration,
}

/// Fuses independently arriving samples into frames.
///
/// Each arrival is combined with the buffered samples of every other required
/// channel. The combination with the smallest stamp spread is emitted when
/// that spread is within the tolerance, and everything at or before it is
/// discarded. After every push no complete set within tolerance is left
/// buffered.
/// Queues are bounded; samples evicted without ever matching are counted as
/// synchronization misses.
pub struct FrameSynchronizer {
    tolerance: Duration,
    queue_size: usize,
    monocular: bool,
    color: VecDeque<(Stamp, ImageBuffer)>,
    depth: VecDeque<(Stamp, DepthImage)>,
    calibration: VecDeque<(Stamp, CameraIntrinsics)>,
    misses: u64,
}

impl FrameSynchronizer {
    pub fn new(tolerance: Duration, queue_size: usize, monocular: bool) -> Self {
        Self {
            tolerance,
            queue_size: queue_size.max(1),
            monocular,
            color: VecDeque::new(),
            depth: VecDeque::new(),
            calibration: VecDeque::new(),
            misses: 0,
        }
    }

    pub fn is_monocular(&self) -> bool {
        self.monocular
    }

    /// Samples dropped so far without being part of a fused set
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Number of samples currently buffered across all channels
    pub fn buffered(&self) -> usize {
        self.color.len() + self.depth.len() + self.calibration.len()
    }

    /// Stamps currently buffered on one channel, oldest first
    pub fn pending(&self, channel: Channel) -> Vec<Stamp> {
        match channel {
            Channel::Color => self.color.iter().map(|(s, _)| *s).collect(),
            Channel::Depth => self.depth.iter().map(|(s, _)| *s).collect(),
            Channel::Calibration => self.calibration.iter().map(|(s, _)| *s).collect(),
        }
    }

    /// Feed one sample. Returns a fused set when this arrival completes one.
    pub fn push(&mut self, sample: InputSample) -> Option<FusedSample> {
        let channel = sample.channel();
        let index = match sample {
            InputSample::Color { stamp, image } => {
                Self::enqueue(&mut self.color, stamp, image, self.queue_size, &mut self.misses)
            }
            InputSample::Depth { stamp, depth } => {
                if self.monocular {
                    // Depth is not part of a monocular set
                    return None;
                }
                Self::enqueue(&mut self.depth, stamp, depth, self.queue_size, &mut self.misses)
            }
            InputSample::Calibration { stamp, intrinsics } => {
                Self::enqueue(&mut self.calibration, stamp, intrinsics, self.queue_size, &mut self.misses)
            }
        }?;
        self.try_match(channel, index)
    }

    /// Insert keeping the queue sorted by stamp. Returns the final index of
    /// the new sample, `None` if it fell off the horizon right away.
    fn enqueue<T>(
        queue: &mut VecDeque<(Stamp, T)>,
        stamp: Stamp,
        value: T,
        limit: usize,
        misses: &mut u64,
    ) -> Option<usize> {
        // Arrivals are usually in order
        let at = queue.iter().rposition(|(s, _)| *s <= stamp).map(|p| p + 1).unwrap_or(0);
        queue.insert(at, (stamp, value));

        let mut pos = Some(at);
        while queue.len() > limit {
            queue.pop_front();
            *misses += 1;
            pos = pos.and_then(|p| p.checked_sub(1));
        }
        pos
    }

    /// Indices of `queue` within `tolerance` of `pivot`, or just the pivot
    /// itself when `queue` is the pivot's channel
    fn candidates<T>(queue: &VecDeque<(Stamp, T)>, pinned: Option<usize>, pivot: Stamp, tolerance: Duration) -> Vec<usize> {
        match pinned {
            Some(idx) => vec![idx],
            None => queue
                .iter()
                .enumerate()
                .filter(|(_, (s, _))| s.abs_diff(pivot) <= tolerance)
                .map(|(i, _)| i)
                .collect(),
        }
    }

    /// Find the tightest set containing the new sample. Any set that does
    /// not contain it was already rejected on an earlier arrival.
    fn try_match(&mut self, channel: Channel, index: usize) -> Option<FusedSample> {
        let pivot = match channel {
            Channel::Color => self.color.get(index)?.0,
            Channel::Depth => self.depth.get(index)?.0,
            Channel::Calibration => self.calibration.get(index)?.0,
        };
        let pinned = |c: Channel| (c == channel).then_some(index);

        let colors = Self::candidates(&self.color, pinned(Channel::Color), pivot, self.tolerance);
        let calibrations = Self::candidates(&self.calibration, pinned(Channel::Calibration), pivot, self.tolerance);
        let depths: Vec<Option<usize>> = if self.monocular {
            vec![None]
        } else {
            Self::candidates(&self.depth, pinned(Channel::Depth), pivot, self.tolerance)
                .into_iter()
                .map(Some)
                .collect()
        };

        let mut best: Option<(usize, usize, Option<usize>, Duration)> = None;
        for &c in &colors {
            for &k in &calibrations {
                for &d in &depths {
                    let mut lo = self.color[c].0.min(self.calibration[k].0);
                    let mut hi = self.color[c].0.max(self.calibration[k].0);
                    if let Some(d) = d {
                        lo = lo.min(self.depth[d].0);
                        hi = hi.max(self.depth[d].0);
                    }
                    let spread = hi.abs_diff(lo);
                    // Later candidates win ties, preferring newer samples
                    if spread <= self.tolerance && best.map_or(true, |(_, _, _, b)| spread <= b) {
                        best = Some((c, k, d, spread));
                    }
                }
            }
        }
        let (color_idx, calib_idx, depth_idx, skew) = best?;

        // Everything older than the matched samples can never match later
        let (stamp, image) = Self::take_at(&mut self.color, color_idx, &mut self.misses)?;
        let (_, intrinsics) = Self::take_at(&mut self.calibration, calib_idx, &mut self.misses)?;
        let depth = match depth_idx {
            Some(i) => Some(Self::take_at(&mut self.depth, i, &mut self.misses)?.1),
            None => None,
        };

        debug!("Fused frame at {:?} (skew {:?})", stamp, skew);
        Some(FusedSample { stamp, image, depth, intrinsics, skew })
    }

    fn take_at<T>(queue: &mut VecDeque<(Stamp, T)>, idx: usize, misses: &mut u64) -> Option<(Stamp, T)> {
        *misses += idx as u64;
        queue.drain(..idx);
        queue.pop_front()
    }
}
