//! Frame-level speech analysis: voice activity and wake-word detection
//!
//! Both detectors consume 16 kHz mono pipeline frames. The VAD runs on the
//! echo-cancelled capture; the wake detector runs on the raw microphone tap
//! so a wake word spoken over TTS playback still lands.

pub mod vad;
pub mod wake;

pub use vad::{SileroVad, VadConfig, VadEngine, VadResult, VadState};
pub use wake::{KeywordScorer, WakeEvent, WakeWordDetector};

use thiserror::Error;

/// Pipeline errors. Per-frame failures are non-fatal: the frame is dropped
/// and the stream continues.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("vad error: {0}")]
    Vad(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("wake word error: {0}")]
    WakeWord(String),
}
