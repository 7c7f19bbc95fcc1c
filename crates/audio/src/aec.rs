//! Capture processing: echo cancellation, noise suppression, high-pass
//! filtering and gain control
//!
//! Per 60 ms frame: when playback is active the far-end reference frame whose
//! presentation timestamp is closest to `capture_ts - stream_delay` feeds the
//! reverse path of the echo canceller before the near-end capture is
//! processed. Without a reference (nothing playing) the frame is processed
//! with echo cancellation skipped.

use nnnoiseless::DenoiseState;
use std::collections::VecDeque;

use sona_config::{AecOptions, AgcMode, NoiseSuppressionLevel};
use sona_core::{AudioFrame, ReferenceFrame};

use crate::resampler::StreamResampler;

/// Echo tail covered by the adaptive filter: 200 ms at 16 kHz.
const FILTER_TAPS: usize = 3200;

/// NLMS step size.
const NLMS_MU: f32 = 0.5;

/// Regularization added to the far-end power estimate.
const NLMS_EPS: f32 = 1e-3;

/// Smoothing factor for stream delay re-estimates.
const DELAY_ALPHA: f32 = 0.25;

/// High-pass corner frequency, Hz.
const HPF_CUTOFF_HZ: f32 = 80.0;

/// Normalized-LMS echo canceller over a 200 ms tail.
pub struct NlmsCanceller {
    weights: Vec<f32>,
    delay_line: Vec<f32>,
    pos: usize,
    power: f32,
}

impl Default for NlmsCanceller {
    fn default() -> Self {
        Self::new()
    }
}

impl NlmsCanceller {
    pub fn new() -> Self {
        Self {
            weights: vec![0.0; FILTER_TAPS],
            delay_line: vec![0.0; FILTER_TAPS],
            pos: 0,
            power: 0.0,
        }
    }

    /// Cancel the far-end estimate out of the near-end capture.
    ///
    /// `far` and `near` are time-aligned and equal length; the output is the
    /// residual (near minus estimated echo).
    pub fn cancel(&mut self, far: &[f32], near: &[f32]) -> Vec<f32> {
        debug_assert_eq!(far.len(), near.len());
        let mut out = Vec::with_capacity(near.len());

        for (x, d) in far.iter().zip(near.iter()) {
            let old = self.delay_line[self.pos];
            self.power += x * x - old * old;
            self.power = self.power.max(0.0);
            self.delay_line[self.pos] = *x;

            // delay_line viewed newest-to-oldest starting at pos
            let idx = self.pos;
            let (head, tail) = self.delay_line.split_at(idx + 1);

            let mut estimate = 0.0f32;
            for (w, s) in self
                .weights
                .iter()
                .zip(head.iter().rev().chain(tail.iter().rev()))
            {
                estimate += w * s;
            }

            let residual = d - estimate;
            let gain = NLMS_MU * residual / (self.power + NLMS_EPS);
            for (w, s) in self
                .weights
                .iter_mut()
                .zip(head.iter().rev().chain(tail.iter().rev()))
            {
                *w += gain * s;
            }

            self.pos = (self.pos + 1) % FILTER_TAPS;
            out.push(residual);
        }

        out
    }

    /// Advance the far-end delay line without adapting (capture suppressed).
    pub fn feed_far_only(&mut self, far: &[f32]) {
        for x in far {
            let old = self.delay_line[self.pos];
            self.power += x * x - old * old;
            self.power = self.power.max(0.0);
            self.delay_line[self.pos] = *x;
            self.pos = (self.pos + 1) % FILTER_TAPS;
        }
    }

    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.delay_line.fill(0.0);
        self.power = 0.0;
        self.pos = 0;
    }
}

/// Second-order high-pass (transposed direct form II).
struct HighPass {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl HighPass {
    fn new(cutoff_hz: f32, sample_rate: f32) -> Self {
        let w0 = 2.0 * std::f32::consts::PI * cutoff_hz / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let q = std::f32::consts::FRAC_1_SQRT_2;
        let alpha = sin_w0 / (2.0 * q);
        let a0 = 1.0 + alpha;

        Self {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn process(&mut self, samples: &mut [f32]) {
        for s in samples {
            let x = *s;
            let y = self.b0 * x + self.z1;
            self.z1 = self.b1 * x - self.a1 * y + self.z2;
            self.z2 = self.b2 * x - self.a2 * y;
            *s = y;
        }
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// RNNoise-based suppressor. RNNoise is a fixed 48 kHz algorithm (its
/// 480-sample frame is 10 ms at 48 kHz), so the pipeline signal is
/// resampled up, denoised, and resampled back: a 60 ms frame at 16 kHz is
/// exactly 6 x 480 samples at 48 kHz. The suppression level selects a
/// wet/dry mix, applied at 48 kHz where the two signals are aligned.
struct NoiseSuppressor {
    state: Box<DenoiseState<'static>>,
    to_48k: StreamResampler,
    to_16k: StreamResampler,
    /// Denoised 16 kHz samples ready to replace input
    ready: VecDeque<f32>,
    wet: f32,
}

impl NoiseSuppressor {
    fn new(level: NoiseSuppressionLevel) -> Self {
        let wet = match level {
            NoiseSuppressionLevel::Low => 0.4,
            NoiseSuppressionLevel::Moderate => 0.7,
            NoiseSuppressionLevel::High => 0.9,
            NoiseSuppressionLevel::VeryHigh => 1.0,
        };
        Self {
            state: DenoiseState::new(),
            to_48k: StreamResampler::new(16_000, 48_000)
                .expect("16k to 48k resampler"),
            to_16k: StreamResampler::new(48_000, 16_000)
                .expect("48k to 16k resampler"),
            ready: VecDeque::new(),
            wet,
        }
    }

    fn process(&mut self, samples: &mut [f32]) {
        const SCALE: f32 = 32768.0;
        let mut denoised = [0.0f32; DenoiseState::FRAME_SIZE];
        let mut scaled = [0.0f32; DenoiseState::FRAME_SIZE];

        self.to_48k.push(samples);
        while let Some(mut chunk) = self.to_48k.pop_exact(DenoiseState::FRAME_SIZE) {
            // RNNoise operates on i16-range floats
            for (dst, src) in scaled.iter_mut().zip(chunk.iter()) {
                *dst = src * SCALE;
            }
            self.state.process_frame(&mut denoised, &scaled);
            for (dry, den) in chunk.iter_mut().zip(denoised.iter()) {
                *dry = self.wet * (den / SCALE) + (1.0 - self.wet) * *dry;
            }
            self.to_16k.push(&chunk);
        }
        self.ready.extend(self.to_16k.pop_all());

        // Replace in place, oldest output first. Converter warm-up can run
        // a few samples short on the first frame; that tail stays dry.
        let available = self.ready.len().min(samples.len());
        for slot in samples[..available].iter_mut() {
            *slot = self.ready.pop_front().unwrap_or(0.0);
        }
    }

    fn reset(&mut self) {
        self.state = DenoiseState::new();
        self.to_48k.reset();
        self.to_16k.reset();
        self.ready.clear();
    }
}

/// Digital gain control toward a target peak level.
struct DigitalAgc {
    mode: AgcMode,
    target_peak: f32,
    max_gain: f32,
    limiter: bool,
    gain: f32,
}

impl DigitalAgc {
    fn new(mode: AgcMode, target_level_dbfs: u8, compression_gain_db: u8, limiter: bool) -> Self {
        let target_peak = 10f32.powf(-(target_level_dbfs as f32) / 20.0);
        let max_gain = 10f32.powf(compression_gain_db as f32 / 20.0);
        let gain = match mode {
            AgcMode::FixedDigital => max_gain,
            _ => 1.0,
        };
        Self {
            mode,
            target_peak,
            max_gain,
            limiter,
            gain,
        }
    }

    fn process(&mut self, samples: &mut [f32]) {
        if !matches!(self.mode, AgcMode::FixedDigital) {
            let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            if peak > 1e-4 {
                let desired = (self.target_peak / peak).clamp(1.0 / self.max_gain, self.max_gain);
                // One-pole smoothing keeps gain changes inaudible
                self.gain += 0.1 * (desired - self.gain);
            }
        }

        for s in samples.iter_mut() {
            *s *= self.gain;
            if self.limiter {
                *s = s.clamp(-1.0, 1.0);
            }
        }
    }

    fn reset(&mut self) {
        self.gain = match self.mode {
            AgcMode::FixedDigital => self.max_gain,
            _ => 1.0,
        };
    }
}

/// Full capture-side processor chain.
pub struct CaptureProcessor {
    options: AecOptions,
    canceller: NlmsCanceller,
    high_pass: Option<HighPass>,
    suppressor: Option<NoiseSuppressor>,
    agc: Option<DigitalAgc>,
    stream_delay_ms: f32,
}

impl CaptureProcessor {
    pub fn new(options: AecOptions) -> Self {
        let high_pass = options
            .high_pass
            .then(|| HighPass::new(HPF_CUTOFF_HZ, 16000.0));
        let suppressor = options
            .noise_suppression
            .enabled
            .then(|| NoiseSuppressor::new(options.noise_suppression.level));
        let agc = options.agc.enabled.then(|| {
            DigitalAgc::new(
                options.agc.mode,
                options.agc.target_level_dbfs,
                options.agc.compression_gain_db,
                options.agc.limiter,
            )
        });
        let stream_delay_ms = options.stream_delay_ms as f32;

        Self {
            options,
            canceller: NlmsCanceller::new(),
            high_pass,
            suppressor,
            agc,
            stream_delay_ms,
        }
    }

    /// Current smoothed capture<->playback delay estimate.
    pub fn stream_delay_ms(&self) -> f32 {
        self.stream_delay_ms
    }

    /// Fold a fresh delay measurement into the estimate (playback restart).
    pub fn update_stream_delay(&mut self, measured_ms: f32) {
        self.stream_delay_ms =
            DELAY_ALPHA * measured_ms + (1.0 - DELAY_ALPHA) * self.stream_delay_ms;
    }

    /// Process one near-end capture frame.
    ///
    /// `reference` is the already-aligned far-end frame, or None when nothing
    /// is playing; echo cancellation is skipped for reference-less frames.
    pub fn process(&mut self, frame: &AudioFrame, reference: Option<&ReferenceFrame>) -> AudioFrame {
        let mut samples: Vec<f32> = frame.samples.to_vec();

        if let Some(hpf) = self.high_pass.as_mut() {
            hpf.process(&mut samples);
        }

        if self.options.enabled {
            if let Some(reference) = reference {
                let far = align_reference(&reference.samples, samples.len());
                samples = self.canceller.cancel(&far, &samples);
            }
        }

        if let Some(ns) = self.suppressor.as_mut() {
            ns.process(&mut samples);
        }

        if let Some(agc) = self.agc.as_mut() {
            agc.process(&mut samples);
        }

        let mut out = AudioFrame::new(samples, frame.sample_rate, frame.channels, frame.sequence);
        out.capture_ts_ns = frame.capture_ts_ns;
        out
    }

    /// The aligned reference for a capture timestamp, expressed as the
    /// target presentation timestamp to search the ring for.
    pub fn reference_target_ts(&self, capture_ts_ns: u64) -> u64 {
        let delay_ns = (self.stream_delay_ms.max(0.0) as u64) * 1_000_000;
        capture_ts_ns.saturating_sub(delay_ns)
    }

    /// Reset all filter state between sessions.
    pub fn reset(&mut self) {
        self.canceller.reset();
        if let Some(hpf) = self.high_pass.as_mut() {
            hpf.reset();
        }
        if let Some(ns) = self.suppressor.as_mut() {
            ns.reset();
        }
        if let Some(agc) = self.agc.as_mut() {
            agc.reset();
        }
        self.stream_delay_ms = self.options.stream_delay_ms as f32;
    }
}

/// Pad or trim the reference to the capture frame length.
fn align_reference(reference: &[f32], len: usize) -> Vec<f32> {
    let mut far = Vec::with_capacity(len);
    far.extend(reference.iter().copied().take(len));
    far.resize(len, 0.0);
    far
}

#[cfg(test)]
mod tests {
    use super::*;
    use sona_core::{Channels, SampleRate};

    fn energy(samples: &[f32]) -> f32 {
        samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
    }

    fn tone(len: usize, start: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                ((start + i) as f32 * 2.0 * std::f32::consts::PI * 1000.0 / 16000.0).sin() * 0.5
            })
            .collect()
    }

    /// Far-end tone through a fixed FIR echo path converges to >= 15 dB ERLE.
    #[test]
    fn test_nlms_erle_on_fir_echo_path() {
        let mut canceller = NlmsCanceller::new();

        // Acoustic path: 40 ms delay, 0.6 gain
        let delay = 640usize;
        let gain = 0.6f32;

        let mut history: Vec<f32> = vec![0.0; delay];
        let mut last_near_e = 0.0;
        let mut last_res_e = 0.0;

        // ~1 s of audio in 60 ms frames, well past the convergence window
        for f in 0..16 {
            let far = tone(960, f * 960);
            history.extend_from_slice(&far);

            let base = history.len() - 960 - delay;
            let near: Vec<f32> = (0..960).map(|i| history[base + i] * gain).collect();

            let residual = canceller.cancel(&far, &near);
            last_near_e = energy(&near);
            last_res_e = energy(&residual);
        }

        let erle_db = 10.0 * (last_near_e / last_res_e.max(1e-12)).log10();
        assert!(erle_db >= 15.0, "ERLE only {erle_db:.1} dB");
    }

    #[test]
    fn test_high_pass_removes_dc() {
        let mut hpf = HighPass::new(80.0, 16000.0);
        let mut samples = vec![0.5f32; 1600];
        hpf.process(&mut samples);
        // DC settles toward zero
        let tail = &samples[1200..];
        assert!(energy(tail) < 1e-4);
    }

    #[test]
    fn test_agc_raises_quiet_input() {
        let mut agc = DigitalAgc::new(AgcMode::AdaptiveDigital, 3, 9, true);
        let mut frame = vec![0.05f32; 960];
        for _ in 0..50 {
            frame = vec![0.05f32; 960];
            agc.process(&mut frame);
        }
        assert!(frame[0] > 0.05);
    }

    #[test]
    fn test_agc_limiter_clamps() {
        let mut agc = DigitalAgc::new(AgcMode::FixedDigital, 3, 12, true);
        let mut samples = vec![0.9f32; 960];
        agc.process(&mut samples);
        assert!(samples.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_processor_without_reference_passes_speech() {
        let mut processor = CaptureProcessor::new(AecOptions::default());
        // Several frames so the NS converters and AGC settle
        let mut last = None;
        for seq in 0..5u64 {
            let frame = AudioFrame::new(
                tone(960, seq as usize * 960),
                SampleRate::Hz16000,
                Channels::Mono,
                seq,
            );
            let out = processor.process(&frame, None);
            assert_eq!(out.samples.len(), 960);
            last = Some(out);
        }
        // A speech-band tone is attenuated at most, never wiped out
        assert!(last.unwrap().energy_db > -40.0);
    }

    #[test]
    fn test_stream_delay_smoothing() {
        let mut processor = CaptureProcessor::new(AecOptions::default());
        let initial = processor.stream_delay_ms();
        processor.update_stream_delay(initial + 80.0);
        let smoothed = processor.stream_delay_ms();
        assert!(smoothed > initial);
        assert!(smoothed < initial + 80.0);
        assert!((smoothed - (initial + 0.25 * 80.0)).abs() < 0.01);
    }

    #[test]
    fn test_reference_target_ts_subtracts_delay() {
        let processor = CaptureProcessor::new(AecOptions::default());
        let capture_ts = 1_000_000_000u64;
        let target = processor.reference_target_ts(capture_ts);
        assert!(target < capture_ts);
    }
}
