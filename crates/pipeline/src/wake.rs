//! Wake-word detection
//!
//! Keyword spotting over a one-second sliding window of the raw (pre-AEC)
//! microphone stream. Armed while the session is IDLE (optionally during
//! SPEAKING for barge-in); on fire the detector pauses itself until the
//! session returns to IDLE.
//!
//! Scoring is pluggable: the ONNX classifier (behind the `onnx` feature)
//! scores the window against the model's label vocabulary; keyword and
//! pronunciation matching therefore follow whatever vocabulary the shipped
//! model carries.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use sona_config::WakeWordOptions;
use sona_core::AudioFrame;

use crate::PipelineError;

/// Sliding window length: one second at 16 kHz.
const WINDOW_SAMPLES: usize = 16_000;

/// A wake trigger: keyword, confidence and the capture timestamp of the
/// frame that completed the detection.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeEvent {
    pub keyword: String,
    pub confidence: f32,
    pub timestamp_ns: u64,
}

/// Scores a window of 16 kHz samples against the keyword set.
pub trait KeywordScorer: Send {
    /// Best (keyword, confidence) for the window, if any keyword scored.
    fn score(&mut self, window: &[f32]) -> Result<Option<(String, f32)>, PipelineError>;
}

/// Wake-word detector state machine around a scorer.
pub struct WakeWordDetector {
    options: WakeWordOptions,
    scorer: Option<Box<dyn KeywordScorer>>,
    window: VecDeque<f32>,
    paused: bool,
    last_fire: Option<Instant>,
}

impl WakeWordDetector {
    /// Build from options; loads the ONNX scorer when the feature and model
    /// are available. Without a scorer the detector stays disabled.
    pub fn new(options: WakeWordOptions) -> Self {
        let scorer: Option<Box<dyn KeywordScorer>> = if !options.enabled {
            None
        } else {
            #[cfg(feature = "onnx")]
            {
                match onnx::OnnxScorer::new(&options) {
                    Ok(s) => Some(Box::new(s)),
                    Err(e) => {
                        tracing::warn!(error = %e, "wake model unavailable, detector disabled");
                        None
                    }
                }
            }
            #[cfg(not(feature = "onnx"))]
            {
                tracing::info!("built without onnx, wake detector disabled");
                None
            }
        };

        Self {
            options,
            scorer,
            window: VecDeque::with_capacity(WINDOW_SAMPLES),
            paused: false,
            last_fire: None,
        }
    }

    /// Build with an explicit scorer (tests, alternative models).
    pub fn with_scorer(options: WakeWordOptions, scorer: Box<dyn KeywordScorer>) -> Self {
        Self {
            options,
            scorer: Some(scorer),
            window: VecDeque::with_capacity(WINDOW_SAMPLES),
            paused: false,
            last_fire: None,
        }
    }

    /// Whether a scorer is loaded at all.
    pub fn is_enabled(&self) -> bool {
        self.scorer.is_some()
    }

    /// Pause after a trigger; resumed when the session returns to IDLE.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.window.clear();
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Feed one raw frame; fires when a keyword clears the threshold outside
    /// the refractory interval.
    pub fn process(&mut self, frame: &AudioFrame) -> Result<Option<WakeEvent>, PipelineError> {
        let Some(scorer) = self.scorer.as_mut() else {
            return Ok(None);
        };
        if self.paused {
            return Ok(None);
        }

        self.window.extend(frame.samples.iter().copied());
        while self.window.len() > WINDOW_SAMPLES {
            self.window.pop_front();
        }
        if self.window.len() < WINDOW_SAMPLES {
            return Ok(None);
        }

        let window: Vec<f32> = self.window.iter().copied().collect();
        let Some((keyword, confidence)) = scorer.score(&window)? else {
            return Ok(None);
        };

        if confidence < self.options.threshold {
            return Ok(None);
        }

        let refractory = Duration::from_millis(self.options.min_interval_ms);
        if let Some(last) = self.last_fire {
            if last.elapsed() < refractory {
                return Ok(None);
            }
        }

        self.last_fire = Some(Instant::now());
        self.pause();

        tracing::info!(keyword = %keyword, confidence, "wake word detected");
        Ok(Some(WakeEvent {
            keyword,
            confidence,
            timestamp_ns: frame.capture_ts_ns,
        }))
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    //! ONNX keyword classifier: one logit per label, softmax over the set.

    use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};

    use sona_config::WakeWordOptions;

    use super::KeywordScorer;
    use crate::PipelineError;

    pub struct OnnxScorer {
        session: Session,
        labels: Vec<String>,
    }

    impl OnnxScorer {
        pub fn new(options: &WakeWordOptions) -> Result<Self, PipelineError> {
            let path = std::path::Path::new(&options.model_path);
            if !path.exists() {
                return Err(PipelineError::WakeWord(format!(
                    "model not found: {}",
                    options.model_path
                )));
            }

            let session = Session::builder()
                .map_err(|e| PipelineError::Model(e.to_string()))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| PipelineError::Model(e.to_string()))?
                .with_intra_threads(1)
                .map_err(|e| PipelineError::Model(e.to_string()))?
                .commit_from_file(path)
                .map_err(|e| PipelineError::Model(e.to_string()))?;

            tracing::info!(model = %options.model_path, "wake model loaded");
            Ok(Self {
                session,
                labels: options.keywords.clone(),
            })
        }
    }

    impl KeywordScorer for OnnxScorer {
        fn score(&mut self, window: &[f32]) -> Result<Option<(String, f32)>, PipelineError> {
            let input = ndarray::Array2::from_shape_vec((1, window.len()), window.to_vec())
                .map_err(|e| PipelineError::WakeWord(e.to_string()))?;
            let input_tensor =
                Tensor::from_array(input).map_err(|e| PipelineError::Model(e.to_string()))?;

            let outputs = self
                .session
                .run(ort::inputs!["input" => input_tensor])
                .map_err(|e| PipelineError::Model(e.to_string()))?;

            let (_, logits) = outputs
                .get("output")
                .ok_or_else(|| PipelineError::Model("missing output tensor".to_string()))?
                .try_extract_tensor::<f32>()
                .map_err(|e| PipelineError::Model(e.to_string()))?;

            // Softmax over the label set; index 0 is reserved for background
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
            let sum: f32 = exp.iter().sum();

            let best = exp
                .iter()
                .enumerate()
                .skip(1)
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));

            Ok(best.and_then(|(idx, e)| {
                let confidence = e / sum;
                self.labels
                    .get(idx - 1)
                    .map(|label| (label.clone(), confidence))
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sona_core::{Channels, SampleRate};

    /// Scorer that fires above a fixed energy, for exercising the state
    /// machine without a model.
    struct EnergyScorer {
        keyword: String,
        confidence: f32,
    }

    impl KeywordScorer for EnergyScorer {
        fn score(&mut self, window: &[f32]) -> Result<Option<(String, f32)>, PipelineError> {
            let energy: f32 = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
            if energy > 0.01 {
                Ok(Some((self.keyword.clone(), self.confidence)))
            } else {
                Ok(None)
            }
        }
    }

    fn loud_frame(seq: u64) -> AudioFrame {
        let samples: Vec<f32> = (0..960).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        AudioFrame::with_capture_ts(samples, SampleRate::Hz16000, Channels::Mono, seq, seq * 60_000_000)
    }

    fn detector(confidence: f32) -> WakeWordDetector {
        WakeWordDetector::with_scorer(
            WakeWordOptions::default(),
            Box::new(EnergyScorer {
                keyword: "hey sona".into(),
                confidence,
            }),
        )
    }

    #[test]
    fn test_fires_after_window_fills() {
        let mut det = detector(0.9);
        let mut fired = None;
        for seq in 0..30u64 {
            if let Some(ev) = det.process(&loud_frame(seq)).unwrap() {
                fired = Some((seq, ev));
                break;
            }
        }
        let (seq, ev) = fired.expect("never fired");
        // Needs a full one-second window first
        assert!(seq >= 16);
        assert_eq!(ev.keyword, "hey sona");
        assert!(ev.confidence >= 0.6);
    }

    #[test]
    fn test_below_threshold_does_not_fire() {
        let mut det = detector(0.4);
        for seq in 0..40u64 {
            assert!(det.process(&loud_frame(seq)).unwrap().is_none());
        }
    }

    #[test]
    fn test_pauses_after_fire() {
        let mut det = detector(0.9);
        let mut fired = false;
        for seq in 0..30u64 {
            if det.process(&loud_frame(seq)).unwrap().is_some() {
                fired = true;
                break;
            }
        }
        assert!(fired);
        assert!(det.is_paused());

        // Paused detector ignores further audio
        for seq in 30..60u64 {
            assert!(det.process(&loud_frame(seq)).unwrap().is_none());
        }

        det.resume();
        assert!(!det.is_paused());
    }

    #[test]
    fn test_disabled_without_scorer() {
        let mut options = WakeWordOptions::default();
        options.enabled = false;
        let mut det = WakeWordDetector::new(options);
        assert!(!det.is_enabled());
        assert!(det.process(&loud_frame(0)).unwrap().is_none());
    }
}
