//! Silero VAD with energy fallback
//!
//! Runs the Silero ONNX classifier (stateful LSTM, 512-sample chunks at
//! 16 kHz) when the `onnx` feature is enabled and the model file exists;
//! otherwise falls back to an energy-based detector with the same hysteresis.
//!
//! Input frames are buffered to chunk size internally, so callers can feed
//! 60 ms pipeline frames directly.

use parking_lot::Mutex;

use sona_core::AudioFrame;

use super::{VadConfig, VadEngine, VadResult, VadState};
use crate::PipelineError;

#[cfg(feature = "onnx")]
use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};

/// Probability smoothing factor (new sample weight).
const PROB_SMOOTHING: f32 = 0.3;

struct SileroMutableState {
    /// LSTM hidden state [2, 64]
    #[cfg(feature = "onnx")]
    h_state: ndarray::Array2<f32>,
    /// LSTM cell state [2, 64]
    #[cfg(feature = "onnx")]
    c_state: ndarray::Array2<f32>,
    state: VadState,
    speech_chunks: usize,
    silence_chunks: usize,
    smoothed_prob: f32,
    audio_buffer: Vec<f32>,
}

impl SileroMutableState {
    fn new(chunk_size: usize) -> Self {
        Self {
            #[cfg(feature = "onnx")]
            h_state: ndarray::Array2::zeros((2, 64)),
            #[cfg(feature = "onnx")]
            c_state: ndarray::Array2::zeros((2, 64)),
            state: VadState::Silence,
            speech_chunks: 0,
            silence_chunks: 0,
            smoothed_prob: 0.0,
            audio_buffer: Vec::with_capacity(chunk_size),
        }
    }
}

/// Silero VAD
pub struct SileroVad {
    #[cfg(feature = "onnx")]
    session: Option<Mutex<Session>>,
    config: VadConfig,
    mutable: Mutex<SileroMutableState>,
}

impl SileroVad {
    /// Create a VAD; loads the ONNX model when available, else energy mode.
    pub fn new(config: VadConfig) -> Result<Self, PipelineError> {
        #[cfg(feature = "onnx")]
        let session = {
            let path = std::path::Path::new(&config.model_path);
            if path.exists() {
                let session = Session::builder()
                    .map_err(|e| PipelineError::Model(e.to_string()))?
                    .with_optimization_level(GraphOptimizationLevel::Level3)
                    .map_err(|e| PipelineError::Model(e.to_string()))?
                    .with_intra_threads(1)
                    .map_err(|e| PipelineError::Model(e.to_string()))?
                    .commit_from_file(path)
                    .map_err(|e| PipelineError::Model(e.to_string()))?;
                tracing::info!(model = %config.model_path, "silero vad loaded");
                Some(Mutex::new(session))
            } else {
                tracing::warn!(
                    model = %config.model_path,
                    "vad model not found, using energy detection"
                );
                None
            }
        };

        let chunk_size = config.chunk_size;
        Ok(Self {
            #[cfg(feature = "onnx")]
            session,
            config,
            mutable: Mutex::new(SileroMutableState::new(chunk_size)),
        })
    }

    /// Process buffered chunks out of one frame.
    ///
    /// The lock is held across inference and the state update so interleaved
    /// callers cannot tear the LSTM state.
    pub fn process(
        &self,
        frame: &AudioFrame,
    ) -> Result<(VadState, f32, VadResult), PipelineError> {
        let mut state = self.mutable.lock();

        // Obvious silence skips inference but still advances hysteresis
        // chunk-by-chunk so the timeout math stays exact.
        let skip_inference = frame.energy_db < self.config.energy_floor_db;

        state.audio_buffer.extend_from_slice(&frame.samples);

        let mut result = self.current_result(&state);
        while state.audio_buffer.len() >= self.config.chunk_size {
            let chunk: Vec<f32> = state
                .audio_buffer
                .drain(..self.config.chunk_size)
                .collect();
            let prob = if skip_inference {
                0.0
            } else {
                self.chunk_probability(&mut state, &chunk)?
            };
            let is_speech = prob >= self.config.threshold;
            let chunk_result = self.update_state(&mut state, is_speech, prob);
            // Edge results must survive to the frame boundary even when a
            // later chunk in the same frame reports steady state.
            result = combine_results(result, chunk_result);
        }

        let prob = state.smoothed_prob;
        Ok((state.state, prob, result))
    }

    fn current_result(&self, state: &SileroMutableState) -> VadResult {
        match state.state {
            VadState::Speech => VadResult::SpeechContinue,
            VadState::SpeechStart => VadResult::PotentialSpeechStart,
            VadState::SpeechEnd => VadResult::PotentialSpeechEnd,
            VadState::Silence => VadResult::Silence,
        }
    }

    #[cfg(feature = "onnx")]
    fn chunk_probability(
        &self,
        state: &mut SileroMutableState,
        chunk: &[f32],
    ) -> Result<f32, PipelineError> {
        let Some(session) = &self.session else {
            return Ok(energy_probability(chunk, self.config.energy_floor_db));
        };

        let input = ndarray::Array2::from_shape_vec((1, chunk.len()), chunk.to_vec())
            .map_err(|e| PipelineError::Vad(e.to_string()))?;
        let sr = ndarray::arr1(&[self.config.sample_rate as i64]);

        let input_tensor =
            Tensor::from_array(input).map_err(|e| PipelineError::Model(e.to_string()))?;
        let sr_tensor = Tensor::from_array(sr).map_err(|e| PipelineError::Model(e.to_string()))?;
        let h_tensor = Tensor::from_array(state.h_state.clone())
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let c_tensor = Tensor::from_array(state.c_state.clone())
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let mut session = session.lock();
        let outputs = session
            .run(ort::inputs![
                "input" => input_tensor,
                "sr" => sr_tensor,
                "h" => h_tensor,
                "c" => c_tensor,
            ])
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let (_, speech_data) = outputs
            .get("output")
            .ok_or_else(|| PipelineError::Model("missing output tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let prob = speech_data.first().copied().unwrap_or(0.0);

        for (name, target) in [("hn", &mut state.h_state), ("cn", &mut state.c_state)] {
            if let Some(out) = outputs.get(name) {
                let (shape, data) = out
                    .try_extract_tensor::<f32>()
                    .map_err(|e| PipelineError::Model(e.to_string()))?;
                let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                if dims.len() == 2 && data.len() == dims[0] * dims[1] {
                    let new = ndarray::ArrayView2::from_shape((dims[0], dims[1]), data)
                        .map_err(|e| PipelineError::Model(e.to_string()))?;
                    target.assign(&new);
                }
            }
        }

        Ok(prob)
    }

    #[cfg(not(feature = "onnx"))]
    fn chunk_probability(
        &self,
        _state: &mut SileroMutableState,
        chunk: &[f32],
    ) -> Result<f32, PipelineError> {
        Ok(energy_probability(chunk, self.config.energy_floor_db))
    }

    fn update_state(
        &self,
        state: &mut SileroMutableState,
        is_speech: bool,
        probability: f32,
    ) -> VadResult {
        state.smoothed_prob =
            PROB_SMOOTHING * probability + (1.0 - PROB_SMOOTHING) * state.smoothed_prob;

        match (state.state, is_speech) {
            (VadState::Silence, true) => {
                state.state = VadState::SpeechStart;
                state.speech_chunks = 1;
                state.silence_chunks = 0;
                VadResult::PotentialSpeechStart
            }

            (VadState::SpeechStart, true) => {
                state.speech_chunks += 1;
                if state.speech_chunks >= self.config.min_speech_chunks() {
                    state.state = VadState::Speech;
                    VadResult::SpeechConfirmed
                } else {
                    VadResult::PotentialSpeechStart
                }
            }

            (VadState::SpeechStart, false) => {
                state.state = VadState::Silence;
                state.speech_chunks = 0;
                VadResult::Silence
            }

            (VadState::Speech, true) => {
                state.silence_chunks = 0;
                VadResult::SpeechContinue
            }

            (VadState::Speech, false) => {
                state.state = VadState::SpeechEnd;
                state.silence_chunks = 1;
                VadResult::PotentialSpeechEnd
            }

            (VadState::SpeechEnd, true) => {
                state.state = VadState::Speech;
                state.silence_chunks = 0;
                VadResult::SpeechContinue
            }

            (VadState::SpeechEnd, false) => {
                state.silence_chunks += 1;
                if state.silence_chunks >= self.config.min_silence_chunks() {
                    state.state = VadState::Silence;
                    state.speech_chunks = 0;
                    state.silence_chunks = 0;
                    VadResult::SpeechEnd
                } else {
                    VadResult::PotentialSpeechEnd
                }
            }

            (VadState::Silence, false) => VadResult::Silence,
        }
    }
}

impl VadEngine for SileroVad {
    fn process_frame(
        &self,
        frame: &AudioFrame,
    ) -> Result<(VadState, f32, VadResult), PipelineError> {
        self.process(frame)
    }

    fn reset(&self) {
        let mut state = self.mutable.lock();
        state.state = VadState::Silence;
        state.speech_chunks = 0;
        state.silence_chunks = 0;
        state.smoothed_prob = 0.0;
        state.audio_buffer.clear();
        #[cfg(feature = "onnx")]
        {
            state.h_state.fill(0.0);
            state.c_state.fill(0.0);
        }
    }

    fn state(&self) -> VadState {
        self.mutable.lock().state
    }
}

/// Keep edge transitions visible across the chunks of one frame.
fn combine_results(prev: VadResult, next: VadResult) -> VadResult {
    match (prev, next) {
        (VadResult::SpeechEnd, _) | (_, VadResult::SpeechEnd) => VadResult::SpeechEnd,
        (VadResult::SpeechConfirmed, VadResult::SpeechContinue)
        | (VadResult::SpeechConfirmed, VadResult::PotentialSpeechEnd) => VadResult::SpeechConfirmed,
        (_, next) => next,
    }
}

/// Energy-based probability used when no model is available.
fn energy_probability(chunk: &[f32], floor_db: f32) -> f32 {
    let energy: f32 = chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len().max(1) as f32;
    let energy_db = 10.0 * energy.max(1e-10).log10();
    let threshold_db = floor_db + 10.0;
    if energy_db > threshold_db {
        ((energy_db - threshold_db) / 30.0).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sona_core::{Channels, SampleRate};

    fn speech_frame(seq: u64) -> AudioFrame {
        let samples: Vec<f32> = (0..960).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        AudioFrame::new(samples, SampleRate::Hz16000, Channels::Mono, seq)
    }

    fn silence_frame(seq: u64) -> AudioFrame {
        AudioFrame::silence(SampleRate::Hz16000, Channels::Mono, seq)
    }

    fn vad() -> SileroVad {
        let config = VadConfig {
            model_path: "does-not-exist.onnx".into(),
            ..VadConfig::default()
        };
        SileroVad::new(config).unwrap()
    }

    #[test]
    fn test_starts_in_silence() {
        let vad = vad();
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn test_silence_stays_silent() {
        let vad = vad();
        for seq in 0..10 {
            let (state, prob, _) = vad.process(&silence_frame(seq)).unwrap();
            assert_eq!(state, VadState::Silence);
            assert!(prob < 0.5);
        }
    }

    /// Speech must be confirmed within 300 ms of onset.
    #[test]
    fn test_speech_confirmed_within_300ms() {
        let vad = vad();
        let mut confirmed_at_ms = None;
        for seq in 0..10u64 {
            let (state, _, _) = vad.process(&speech_frame(seq)).unwrap();
            if state == VadState::Speech {
                confirmed_at_ms = Some((seq + 1) * 60);
                break;
            }
        }
        let at = confirmed_at_ms.expect("speech never confirmed");
        assert!(at <= 300, "confirmed only after {at} ms");
    }

    /// End of utterance within 1000 ms of offset at the 800 ms timeout.
    #[test]
    fn test_end_of_utterance_timing() {
        let vad = vad();
        for seq in 0..10u64 {
            vad.process(&speech_frame(seq)).unwrap();
        }
        assert_eq!(vad.state(), VadState::Speech);

        let mut end_at_ms = None;
        for seq in 10..40u64 {
            let (_, _, result) = vad.process(&silence_frame(seq)).unwrap();
            if result == VadResult::SpeechEnd {
                end_at_ms = Some((seq - 9) * 60);
                break;
            }
        }
        let at = end_at_ms.expect("utterance never ended");
        // 800 ms of silence chunks; chunk boundaries straddling the offset
        // can shave one frame off the wall-clock figure.
        assert!(at >= 700, "ended too early at {at} ms");
        assert!(at <= 1000, "ended only after {at} ms");
    }

    #[test]
    fn test_short_blip_does_not_confirm() {
        let vad = vad();
        vad.process(&speech_frame(0)).unwrap();
        let (state, _, _) = vad.process(&silence_frame(1)).unwrap();
        // One noisy frame falls back to silence without confirmation
        assert_ne!(state, VadState::Speech);
    }

    #[test]
    fn test_reset() {
        let vad = vad();
        for seq in 0..10u64 {
            vad.process(&speech_frame(seq)).unwrap();
        }
        VadEngine::reset(&vad);
        assert_eq!(vad.state(), VadState::Silence);
    }
}
