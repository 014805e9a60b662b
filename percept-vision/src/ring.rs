//! Triple-buffered frame handoff between the capture thread and its readers
//!
//! Three slots rotate between three roles: the fill target of the single
//! writer, the stable slot (last fully written frame) and slots leased to
//! readers. The writer never waits for readers and readers never wait for the
//! writer; a reader may be served a slightly old frame, but always a complete
//! one.

use crate::frame::Frame;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of slots in the ring
pub const RING_SLOTS: usize = 3;

/// Index of one ring slot, always `< RING_SLOTS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingSlot(usize);

impl RingSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct Slot {
    frame: RwLock<Option<Arc<Frame>>>,
    readers: AtomicUsize,
}

impl Slot {
    fn empty() -> Self {
        Self {
            frame: RwLock::new(None),
            readers: AtomicUsize::new(0),
        }
    }
}

/// Fill target handed to the writer by [`FrameRing::begin_fill`]
#[derive(Debug)]
#[must_use = "a fill slot does nothing until committed"]
pub struct FillSlot {
    slot: RingSlot,
}

impl FillSlot {
    pub fn slot(&self) -> RingSlot {
        self.slot
    }
}

pub struct FrameRing {
    slots: [Slot; RING_SLOTS],
    stable: RwLock<Option<usize>>,
    generation: Mutex<u64>,
    published: Condvar,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            slots: [Slot::empty(), Slot::empty(), Slot::empty()],
            stable: RwLock::new(None),
            generation: Mutex::new(0),
            published: Condvar::new(),
        }
    }

    /// Pick a slot that is neither stable nor leased to a reader.
    ///
    /// Returns `None` when every non-stable slot is leased, which can only
    /// happen with two or more readers holding old generations. The caller
    /// drops the frame instead of waiting.
    pub fn begin_fill(&self) -> Option<FillSlot> {
        let stable = *self.stable.read();
        (0..RING_SLOTS)
            .filter(|&i| Some(i) != stable)
            .find(|&i| self.slots[i].readers.load(Ordering::Acquire) == 0)
            .map(|i| FillSlot { slot: RingSlot(i) })
    }

    /// Store the frame in the fill slot and make it the stable slot
    pub fn commit_fill(&self, fill: FillSlot, frame: Frame) {
        let idx = fill.slot.0;
        *self.slots[idx].frame.write() = Some(Arc::new(frame));
        *self.stable.write() = Some(idx);

        let mut generation = self.generation.lock();
        *generation += 1;
        self.published.notify_all();
    }

    /// Lease the current stable slot, `None` before the first commit
    pub fn checkout(self: &Arc<Self>) -> Option<SlotLease> {
        // The read guard keeps the stable index fixed until the lease is counted
        let stable = self.stable.read();
        let idx = (*stable)?;
        self.slots[idx].readers.fetch_add(1, Ordering::AcqRel);
        drop(stable);

        match self.slots[idx].frame.read().clone() {
            Some(frame) => Some(SlotLease {
                ring: Arc::clone(self),
                slot: RingSlot(idx),
                frame,
            }),
            None => {
                self.slots[idx].readers.fetch_sub(1, Ordering::AcqRel);
                None
            }
        }
    }

    /// Like [`checkout`](Self::checkout) but waits up to `timeout` for the
    /// first frame to be committed
    pub fn checkout_timeout(self: &Arc<Self>, timeout: Duration) -> Option<SlotLease> {
        if let Some(lease) = self.checkout() {
            return Some(lease);
        }

        let mut generation = self.generation.lock();
        if *generation == 0 {
            self.published.wait_for(&mut generation, timeout);
        }
        drop(generation);
        self.checkout()
    }

    /// Give a lease back; equivalent to dropping it
    pub fn release(&self, lease: SlotLease) {
        drop(lease);
    }

    /// Current reader count of a slot
    pub fn readers(&self, slot: RingSlot) -> usize {
        self.slots[slot.0].readers.load(Ordering::Acquire)
    }

    /// Slot holding the last committed frame
    pub fn stable_slot(&self) -> Option<RingSlot> {
        self.stable.read().map(RingSlot)
    }

    /// Number of frames committed so far
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }
}

/// Read access to one committed frame. The slot cannot be refilled while any
/// lease on it is alive; dropping the lease releases it.
pub struct SlotLease {
    ring: Arc<FrameRing>,
    slot: RingSlot,
    frame: Arc<Frame>,
}

impl SlotLease {
    pub fn slot(&self) -> RingSlot {
        self.slot
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Shared handle to the frame that outlives the lease
    pub fn frame_arc(&self) -> Arc<Frame> {
        Arc::clone(&self.frame)
    }
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease")
            .field("slot", &self.slot)
            .field("sequence", &self.frame.sequence)
            .finish()
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.ring.slots[self.slot.0].readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImageBuffer;
    use percept_core::Stamp;

    fn frame(sequence: u64) -> Frame {
        Frame {
            sequence,
            stamp: Stamp::from_millis(sequence),
            image: ImageBuffer::filled(2, 2, 1, sequence as u8).unwrap(),
            depth: None,
            intrinsics: None,
        }
    }

    fn fill(ring: &FrameRing, sequence: u64) -> RingSlot {
        let target = ring.begin_fill().expect("free slot");
        let slot = target.slot();
        ring.commit_fill(target, frame(sequence));
        slot
    }

    #[test]
    fn test_empty_ring_has_nothing_to_checkout() {
        let ring = Arc::new(FrameRing::new());
        assert!(ring.checkout().is_none());
        assert!(ring.stable_slot().is_none());
        assert_eq!(ring.generation(), 0);
    }

    #[test]
    fn test_commit_makes_slot_stable() {
        let ring = Arc::new(FrameRing::new());
        let slot = fill(&ring, 1);
        assert_eq!(ring.stable_slot(), Some(slot));

        let lease = ring.checkout().unwrap();
        assert_eq!(lease.slot(), slot);
        assert_eq!(lease.frame().sequence, 1);
        assert_eq!(ring.readers(slot), 1);

        ring.release(lease);
        assert_eq!(ring.readers(slot), 0);
    }

    #[test]
    fn test_fill_never_targets_stable_or_leased_slot() {
        let ring = Arc::new(FrameRing::new());
        fill(&ring, 1);
        let held = ring.checkout().unwrap();

        for seq in 2..20 {
            let target = ring.begin_fill().unwrap();
            assert_ne!(Some(target.slot()), ring.stable_slot());
            assert_ne!(target.slot(), held.slot());
            ring.commit_fill(target, frame(seq));
        }
        // The leased frame is untouched
        assert_eq!(held.frame().sequence, 1);
    }

    #[test]
    fn test_two_stale_readers_block_fill() {
        let ring = Arc::new(FrameRing::new());
        fill(&ring, 1);
        let a = ring.checkout().unwrap();
        fill(&ring, 2);
        let b = ring.checkout().unwrap();
        fill(&ring, 3);

        // Slots of `a` and `b` are leased and the third is stable
        assert_ne!(a.slot(), b.slot());
        assert!(ring.begin_fill().is_none());

        drop(a);
        assert!(ring.begin_fill().is_some());
        drop(b);
    }

    #[test]
    fn test_checkout_timeout_waits_for_first_frame() {
        let ring = Arc::new(FrameRing::new());
        assert!(ring.checkout_timeout(Duration::from_millis(10)).is_none());

        let writer = Arc::clone(&ring);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            fill(&writer, 7);
        });

        let lease = ring.checkout_timeout(Duration::from_secs(2));
        handle.join().unwrap();
        let lease = lease.or_else(|| ring.checkout()).expect("frame after commit");
        assert_eq!(lease.frame().sequence, 7);
    }

    #[test]
    fn test_frame_arc_outlives_lease() {
        let ring = Arc::new(FrameRing::new());
        let slot = fill(&ring, 3);
        let lease = ring.checkout().unwrap();
        let frame = lease.frame_arc();
        drop(lease);
        assert_eq!(ring.readers(slot), 0);
        assert_eq!(frame.sequence, 3);
    }
}
