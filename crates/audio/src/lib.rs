//! Audio I/O, resampling, echo cancellation and playback mixing
//!
//! Capture path: device frames -> resample to 16 kHz -> capture processor
//! (AEC + NS + HPF + AGC) -> tee to {wake detector (pre-AEC), VAD + encoder}.
//! Playback path: decoded TTS frames -> reference ring (AEC far end) ->
//! resample to device rate -> mixer -> output stream.
//!
//! The device callbacks never block and never touch the async runtime: the
//! capture callback pushes into a bounded queue that drops the oldest block
//! on overflow, the output callback pulls from a sample ring and emits
//! silence on underrun.

pub mod aec;
pub mod capture;
pub mod device;
pub mod playback;
pub mod reference;
pub mod resampler;

pub use aec::{CaptureProcessor, NlmsCanceller};
pub use capture::{CaptureWorker, RawTap};
pub use device::{AudioDevice, CAPTURE_QUEUE_FRAMES};
pub use playback::PlaybackMixer;
pub use reference::ReferenceRing;
pub use resampler::StreamResampler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared audio-path counters. Recoverable faults are surfaced here instead
/// of propagating as errors.
#[derive(Debug, Default)]
pub struct AudioMetrics {
    /// Capture blocks dropped because the queue was full
    pub capture_drops: AtomicU64,
    /// Output callbacks that ran dry
    pub playback_underruns: AtomicU64,
    /// Sequence gaps introduced by drops or stream rebuilds
    pub frame_gaps: AtomicU64,
    /// Input stream rebuilds performed
    pub stream_rebuilds: AtomicU64,
}

impl AudioMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn capture_drops(&self) -> u64 {
        self.capture_drops.load(Ordering::Relaxed)
    }

    pub fn playback_underruns(&self) -> u64 {
        self.playback_underruns.load(Ordering::Relaxed)
    }

    pub fn frame_gaps(&self) -> u64 {
        self.frame_gaps.load(Ordering::Relaxed)
    }

    pub fn stream_rebuilds(&self) -> u64 {
        self.stream_rebuilds.load(Ordering::Relaxed)
    }
}
