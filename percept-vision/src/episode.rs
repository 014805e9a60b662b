//! Goal/cancel protocol for bounded "check for objects" requests
//!
//! At most one episode runs at a time. The detection thread polls the
//! controller once per iteration; the controller finishes the episode as
//! soon as a detection pass that began after the episode started has
//! completed, or when the deadline passes.

use crate::error::VisionError;
use crate::metrics::PipelineMetrics;
use crate::processing::{DetectionReport, SmoothedDetection};
use parking_lot::RwLock;
use percept_core::Stamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpisodeState {
    Idle,
    Running,
    Succeeded,
    Preempted,
}

/// Payload delivered to the caller on a terminal transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EpisodeOutcome {
    /// Smoothed detections of the pass the episode finished on
    Detections(Vec<SmoothedDetection>),
    /// Deadline reached before any detection pass completed
    TimedOutEmpty,
    /// Cancelled, or the pipeline shut down
    Preempted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeResult {
    pub id: u64,
    /// `Succeeded` or `Preempted`
    pub state: EpisodeState,
    pub outcome: EpisodeOutcome,
    pub elapsed: Duration,
    /// Capture stamp of the frame the detections were computed on
    pub stamp: Option<Stamp>,
}

impl EpisodeResult {
    pub fn detections(&self) -> &[SmoothedDetection] {
        match &self.outcome {
            EpisodeOutcome::Detections(list) => list,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResponse {
    Acknowledged,
    NoActiveEpisode,
}

/// Handle on an accepted episode; resolves once the episode terminates
#[derive(Debug)]
pub struct EpisodeTicket {
    id: u64,
    receiver: oneshot::Receiver<EpisodeResult>,
}

impl EpisodeTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the current thread until the result arrives.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`result`](Self::result) there.
    pub fn wait(self) -> Result<EpisodeResult, VisionError> {
        self.receiver
            .blocking_recv()
            .map_err(|_| VisionError::ChannelClosed("episode result".to_string()))
    }

    /// Block for at most `timeout`; `Ok(None)` if the episode is still running
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<EpisodeResult>, VisionError> {
        let give_up = Instant::now() + timeout;
        loop {
            match self.receiver.try_recv() {
                Ok(result) => return Ok(Some(result)),
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(VisionError::ChannelClosed("episode result".to_string()))
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    if Instant::now() >= give_up {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }

    pub async fn result(self) -> Result<EpisodeResult, VisionError> {
        self.receiver
            .await
            .map_err(|_| VisionError::ChannelClosed("episode result".to_string()))
    }
}

struct ActiveEpisode {
    id: u64,
    started_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<EpisodeResult>,
}

struct EpisodeSlot {
    state: EpisodeState,
    active: Option<ActiveEpisode>,
    next_id: u64,
}

pub struct EpisodeController {
    slot: RwLock<EpisodeSlot>,
    default_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl EpisodeController {
    pub fn new(default_timeout: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            slot: RwLock::new(EpisodeSlot {
                state: EpisodeState::Idle,
                active: None,
                next_id: 1,
            }),
            default_timeout,
            metrics,
        }
    }

    pub fn state(&self) -> EpisodeState {
        self.slot.read().state
    }

    /// Id of the running episode, if any
    pub fn active_id(&self) -> Option<u64> {
        self.slot.read().active.as_ref().map(|a| a.id)
    }

    /// Start an episode. Rejected with [`VisionError::Busy`] while one is running.
    pub fn start(&self, deadline: Option<Duration>) -> Result<EpisodeTicket, VisionError> {
        let timeout = deadline.unwrap_or(self.default_timeout);
        let (reply, receiver) = oneshot::channel();

        let mut slot = self.slot.write();
        if slot.state == EpisodeState::Running {
            drop(slot);
            self.metrics.record_episode_busy();
            debug!("Episode start rejected, another episode is running");
            return Err(VisionError::Busy);
        }

        let id = slot.next_id;
        slot.next_id += 1;
        let started_at = Instant::now();
        let deadline = started_at
            .checked_add(timeout)
            .or_else(|| started_at.checked_add(Duration::from_secs(86_400)))
            .unwrap_or(started_at);

        slot.state = EpisodeState::Running;
        slot.active = Some(ActiveEpisode {
            id,
            started_at,
            deadline,
            reply,
        });
        drop(slot);

        self.metrics.record_episode_started();
        info!("Episode {} started, deadline {:?}", id, timeout);
        Ok(EpisodeTicket { id, receiver })
    }

    pub fn cancel(&self) -> CancelResponse {
        if self.finish(EpisodeState::Preempted, EpisodeOutcome::Preempted, None) {
            CancelResponse::Acknowledged
        } else {
            CancelResponse::NoActiveEpisode
        }
    }

    /// Preempt whatever is running; used on shutdown
    pub fn abort(&self) {
        if self.finish(EpisodeState::Preempted, EpisodeOutcome::Preempted, None) {
            info!("Running episode preempted by shutdown");
        }
    }

    /// Check the running episode against the latest report
    pub fn poll(&self, latest: Option<&DetectionReport>) {
        self.poll_at(Instant::now(), latest);
    }

    pub fn poll_at(&self, now: Instant, latest: Option<&DetectionReport>) {
        let (id, started_at, deadline) = match self.slot.read().active.as_ref() {
            Some(active) => (active.id, active.started_at, active.deadline),
            None => return,
        };

        let outcome = match latest {
            Some(report) if report.started_at >= started_at => {
                Some((EpisodeOutcome::Detections(report.detections.clone()), Some(report.stamp)))
            }
            _ if now >= deadline => Some(match latest {
                Some(report) => (EpisodeOutcome::Detections(report.detections.clone()), Some(report.stamp)),
                None => (EpisodeOutcome::TimedOutEmpty, None),
            }),
            _ => None,
        };

        if let Some((outcome, stamp)) = outcome {
            self.finish_if(id, EpisodeState::Succeeded, outcome, stamp);
        }
    }

    fn finish(&self, state: EpisodeState, outcome: EpisodeOutcome, stamp: Option<Stamp>) -> bool {
        let active = {
            let mut slot = self.slot.write();
            match slot.active.take() {
                Some(active) => {
                    slot.state = state;
                    active
                }
                None => return false,
            }
        };
        self.deliver(active, state, outcome, stamp);
        true
    }

    /// Finish only if the episode polled is still the running one
    fn finish_if(&self, id: u64, state: EpisodeState, outcome: EpisodeOutcome, stamp: Option<Stamp>) {
        let active = {
            let mut slot = self.slot.write();
            match slot.active.take() {
                Some(active) if active.id == id => {
                    slot.state = state;
                    active
                }
                other => {
                    slot.active = other;
                    return;
                }
            }
        };
        self.deliver(active, state, outcome, stamp);
    }

    fn deliver(&self, active: ActiveEpisode, state: EpisodeState, outcome: EpisodeOutcome, stamp: Option<Stamp>) {
        match state {
            EpisodeState::Preempted => self.metrics.record_episode_preempted(),
            _ => self.metrics.record_episode_succeeded(),
        }

        let result = EpisodeResult {
            id: active.id,
            state,
            outcome,
            elapsed: active.started_at.elapsed(),
            stamp,
        };
        info!("Episode {} finished: {:?}", active.id, state);

        if active.reply.send(result).is_err() {
            debug!("Episode {} result dropped, caller went away", active.id);
        }

        let mut slot = self.slot.write();
        if slot.active.is_none() && slot.state == state {
            slot.state = EpisodeState::Idle;
        }
    }
}
