//! Voice activity detection

mod silero;

pub use silero::SileroVad;

use sona_core::AudioFrame;

use crate::PipelineError;

/// VAD configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Speech probability threshold (0.0 - 1.0)
    pub threshold: f32,
    /// Chunk size in samples (512 at 16 kHz = 32 ms)
    pub chunk_size: usize,
    /// Sample rate (must be 16000)
    pub sample_rate: u32,
    /// Consecutive speech needed to confirm SPEECH, milliseconds
    pub min_speech_ms: u32,
    /// Consecutive silence needed to confirm silence, milliseconds
    pub silence_timeout_ms: u32,
    /// Energy floor in dB for quick silence rejection
    pub energy_floor_db: f32,
    /// Path to the Silero ONNX model
    pub model_path: String,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            chunk_size: 512,
            sample_rate: 16000,
            min_speech_ms: 200,
            silence_timeout_ms: 800,
            energy_floor_db: -55.0,
            model_path: "models/vad/silero_vad.onnx".to_string(),
        }
    }
}

impl VadConfig {
    pub fn from_options(options: &sona_config::VadOptions) -> Self {
        Self {
            threshold: options.threshold,
            min_speech_ms: options.min_speech_ms,
            silence_timeout_ms: options.silence_timeout_ms,
            model_path: options.model_path.clone(),
            ..Self::default()
        }
    }

    /// Duration of one internal chunk, milliseconds
    pub fn chunk_ms(&self) -> u32 {
        (self.chunk_size as u32 * 1000) / self.sample_rate
    }

    /// Chunks of consecutive speech required to enter SPEECH
    pub fn min_speech_chunks(&self) -> usize {
        (self.min_speech_ms as usize).div_ceil(self.chunk_ms() as usize)
    }

    /// Chunks of consecutive silence required to leave SPEECH
    pub fn min_silence_chunks(&self) -> usize {
        (self.silence_timeout_ms as usize).div_ceil(self.chunk_ms() as usize)
    }
}

/// Hysteresis state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    /// Positive chunks accumulating toward confirmation
    SpeechStart,
    Speech,
    /// Negative chunks accumulating toward end of utterance
    SpeechEnd,
}

/// Per-frame outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadResult {
    Silence,
    PotentialSpeechStart,
    SpeechConfirmed,
    SpeechContinue,
    PotentialSpeechEnd,
    /// Silence held for the configured timeout; end of utterance
    SpeechEnd,
}

/// Frame-level VAD interface
pub trait VadEngine: Send + Sync {
    /// Process one frame; returns state, smoothed probability and result.
    fn process_frame(
        &self,
        frame: &AudioFrame,
    ) -> Result<(VadState, f32, VadResult), PipelineError>;

    fn reset(&self);

    fn state(&self) -> VadState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_math() {
        let config = VadConfig::default();
        assert_eq!(config.chunk_ms(), 32);
        assert_eq!(config.min_speech_chunks(), 7); // ceil(200/32)
        assert_eq!(config.min_silence_chunks(), 25); // ceil(800/32)
    }

    #[test]
    fn test_from_options() {
        let mut options = sona_config::VadOptions::default();
        options.silence_timeout_ms = 640;
        let config = VadConfig::from_options(&options);
        assert_eq!(config.min_silence_chunks(), 20);
    }
}
