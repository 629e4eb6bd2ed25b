//! Latest-frame handoff between the engine thread and the output sinks.

use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct SlotState {
    seq: u64,
    frame: Option<Arc<RgbImage>>,
}

/// Single-frame mailbox. Writers replace, readers take a cheap `Arc` clone.
///
/// Every publish bumps a sequence number so readers can tell a new frame
/// from one they have already sent.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // A panicking writer cannot leave the slot half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, frame: RgbImage) -> u64 {
        let mut state = self.lock();
        state.seq += 1;
        state.frame = Some(Arc::new(frame));
        state.seq
    }

    /// The current frame and its sequence number, if any.
    pub fn latest(&self) -> Option<(u64, Arc<RgbImage>)> {
        let state = self.lock();
        state.frame.as_ref().map(|f| (state.seq, Arc::clone(f)))
    }

    pub fn clear(&self) {
        self.lock().frame = None;
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frame.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot() {
        let slot = FrameSlot::new();
        assert!(slot.is_empty());
        assert!(slot.latest().is_none());
    }

    #[test]
    fn test_latest_write_wins() {
        let slot = FrameSlot::new();
        slot.publish(RgbImage::new(2, 2));
        let seq = slot.publish(RgbImage::new(4, 4));
        let (latest_seq, frame) = slot.latest().unwrap();
        assert_eq!(latest_seq, seq);
        assert_eq!(frame.dimensions(), (4, 4));
    }

    #[test]
    fn test_clear_keeps_sequence_monotonic() {
        let slot = FrameSlot::new();
        let first = slot.publish(RgbImage::new(2, 2));
        slot.clear();
        assert!(slot.latest().is_none());
        let second = slot.publish(RgbImage::new(2, 2));
        assert!(second > first);
    }

    #[test]
    fn test_readers_keep_their_frame_after_replace() {
        let slot = FrameSlot::new();
        slot.publish(RgbImage::new(2, 2));
        let (_, held) = slot.latest().unwrap();
        slot.publish(RgbImage::new(8, 8));
        assert_eq!(held.dimensions(), (2, 2));
    }
}
