//! Far-end reference ring
//!
//! Single producer (playback mixer), single consumer (capture processor).
//! Bounded to one second of audio; frames older than the retained window are
//! pruned on the reader side so the buffer always covers at least the AEC
//! tail length.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use sona_core::{ReferenceFrame, SampleRate};

/// Retained window behind the newest frame, nanoseconds. Must stay at or
/// above the AEC tail length (200 ms); one second bounds memory.
const MAX_DELAY_NS: u64 = 1_000_000_000;

/// Ring capacity in frames: one second of 60 ms frames, rounded up.
const CAPACITY_FRAMES: usize = 17;

/// Timestamped ring of decoded playback frames at the pipeline rate.
#[derive(Clone)]
pub struct ReferenceRing {
    frames: Arc<Mutex<VecDeque<ReferenceFrame>>>,
}

impl Default for ReferenceRing {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceRing {
    pub fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(VecDeque::with_capacity(CAPACITY_FRAMES))),
        }
    }

    /// Append a decoded pre-mix frame. Drops the oldest entry when full.
    pub fn push(&self, frame: ReferenceFrame) {
        let mut frames = self.frames.lock();
        if frames.len() >= CAPACITY_FRAMES {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Frame whose presentation timestamp is closest to `target_ts_ns`.
    ///
    /// Prunes entries older than the retained window while searching.
    pub fn closest(&self, target_ts_ns: u64) -> Option<ReferenceFrame> {
        let mut frames = self.frames.lock();

        while let Some(front) = frames.front() {
            if front.presentation_ts_ns + MAX_DELAY_NS < target_ts_ns {
                frames.pop_front();
            } else {
                break;
            }
        }

        frames
            .iter()
            .min_by_key(|f| f.presentation_ts_ns.abs_diff(target_ts_ns))
            .cloned()
    }

    /// Whether any reference audio is currently retained.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Drop everything (session teardown or abort).
    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    /// Duration currently covered by the ring, milliseconds.
    pub fn covered_ms(&self) -> u64 {
        let frames = self.frames.lock();
        let samples: usize = frames.iter().map(|f| f.samples.len()).sum();
        (samples as u64 * 1000) / SampleRate::Hz16000.as_u32() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(ts_ms: u64) -> ReferenceFrame {
        ReferenceFrame::new(vec![0.1; 960], ts_ms * 1_000_000)
    }

    #[test]
    fn test_closest_picks_nearest_timestamp() {
        let ring = ReferenceRing::new();
        ring.push(frame_at(0));
        ring.push(frame_at(60));
        ring.push(frame_at(120));

        let hit = ring.closest(70 * 1_000_000).unwrap();
        assert_eq!(hit.presentation_ts_ns, 60 * 1_000_000);
    }

    #[test]
    fn test_bounded_to_capacity() {
        let ring = ReferenceRing::new();
        for i in 0..40 {
            ring.push(frame_at(i * 60));
        }
        assert!(ring.len() <= CAPACITY_FRAMES);
        // Oldest frames were the ones dropped
        let oldest = ring.closest(0).unwrap();
        assert!(oldest.presentation_ts_ns >= 23 * 60 * 1_000_000);
    }

    #[test]
    fn test_stale_frames_pruned() {
        let ring = ReferenceRing::new();
        ring.push(frame_at(0));
        ring.push(frame_at(2_000));

        // Reading far ahead prunes the entry a full window behind
        let _ = ring.closest(2_100 * 1_000_000);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_clear() {
        let ring = ReferenceRing::new();
        ring.push(frame_at(0));
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.covered_ms(), 0);
    }

    #[test]
    fn test_covered_window_exceeds_aec_tail() {
        let ring = ReferenceRing::new();
        for i in 0..CAPACITY_FRAMES as u64 {
            ring.push(frame_at(i * 60));
        }
        assert!(ring.covered_ms() >= 200);
    }
}
