//! Audio frame types and utilities

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed frame cadence of the capture/playback pipeline.
pub const FRAME_DURATION_MS: u32 = 60;

/// Supported audio sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - telephony
    Hz8000,
    /// 16kHz - pipeline rate (capture, VAD, Opus)
    #[default]
    Hz16000,
    /// 22.05kHz
    Hz22050,
    /// 24kHz - TTS output from some servers
    Hz24000,
    /// 32kHz
    Hz32000,
    /// 44.1kHz - CD quality
    Hz44100,
    /// 48kHz - professional audio
    Hz48000,
}

impl SampleRate {
    /// Get sample rate as u32
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz32000 => 32000,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Map a raw rate to a supported variant
    pub fn from_u32(rate: u32) -> Option<Self> {
        match rate {
            8000 => Some(SampleRate::Hz8000),
            16000 => Some(SampleRate::Hz16000),
            22050 => Some(SampleRate::Hz22050),
            24000 => Some(SampleRate::Hz24000),
            32000 => Some(SampleRate::Hz32000),
            44100 => Some(SampleRate::Hz44100),
            48000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }

    /// Samples per channel in one pipeline frame (60 ms)
    pub fn samples_per_frame(&self) -> usize {
        (self.as_u32() as usize * FRAME_DURATION_MS as usize) / 1000
    }

    /// Samples per millisecond
    pub fn samples_per_ms(&self) -> usize {
        self.as_u32() as usize / 1000
    }
}

/// Audio channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Channels {
    #[default]
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(&self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

/// One captured or decoded audio frame.
///
/// Samples are stored as f32 normalized to [-1.0, 1.0]; the device and wire
/// boundaries are 16-bit PCM and convert via [`AudioFrame::from_pcm16`] /
/// [`AudioFrame::to_pcm16`].
#[derive(Clone)]
pub struct AudioFrame {
    /// Raw audio samples (f32, normalized to [-1.0, 1.0])
    pub samples: Arc<[f32]>,
    /// Sample rate
    pub sample_rate: SampleRate,
    /// Number of channels
    pub channels: Channels,
    /// Strictly increasing sequence number per stream
    pub sequence: u64,
    /// Capture timestamp in nanoseconds since stream start
    pub capture_ts_ns: u64,
    /// Timestamp when the frame was created
    pub timestamp: Instant,
    /// Duration of this frame
    pub duration: Duration,
    /// RMS energy in dB, computed at construction
    pub energy_db: f32,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("capture_ts_ns", &self.capture_ts_ns)
            .field("energy_db", &self.energy_db)
            .finish()
    }
}

impl AudioFrame {
    /// Create a new audio frame from f32 samples
    pub fn new(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
    ) -> Self {
        let duration = Duration::from_secs_f64(
            samples.len() as f64 / (sample_rate.as_u32() as f64 * channels.count() as f64),
        );
        let energy_db = Self::energy_db_of(&samples);

        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            sequence,
            capture_ts_ns: 0,
            timestamp: Instant::now(),
            duration,
            energy_db,
        }
    }

    /// Create a frame with an explicit capture timestamp
    pub fn with_capture_ts(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
        capture_ts_ns: u64,
    ) -> Self {
        let mut frame = Self::new(samples, sample_rate, channels, sequence);
        frame.capture_ts_ns = capture_ts_ns;
        frame
    }

    /// A frame of silence at the given rate
    pub fn silence(sample_rate: SampleRate, channels: Channels, sequence: u64) -> Self {
        let len = sample_rate.samples_per_frame() * channels.count();
        Self::new(vec![0.0; len], sample_rate, channels, sequence)
    }

    /// Calculate RMS energy in decibels
    fn energy_db_of(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return -96.0;
        }
        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_squares / samples.len() as f32).sqrt();
        if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            -96.0
        }
    }

    /// Convert from PCM16 bytes (little-endian)
    pub fn from_pcm16(
        bytes: &[u8],
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
    ) -> Self {
        const PCM16_NORMALIZE: f32 = 32768.0;

        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|chunk| {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                sample as f32 / PCM16_NORMALIZE
            })
            .collect();

        Self::new(samples, sample_rate, channels, sequence)
    }

    /// Convert to PCM16 bytes (little-endian)
    pub fn to_pcm16(&self) -> Vec<u8> {
        const PCM16_SCALE: f32 = 32767.0;

        self.samples
            .iter()
            .flat_map(|&sample| {
                let clamped = sample.clamp(-1.0, 1.0);
                let pcm16 = (clamped * PCM16_SCALE) as i16;
                pcm16.to_le_bytes()
            })
            .collect()
    }

    /// Convert samples to i16 (codec boundary)
    pub fn to_i16(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect()
    }

    /// Convert stereo to mono by averaging channels
    pub fn to_mono(&self) -> Self {
        if self.channels == Channels::Mono {
            return self.clone();
        }

        let mono: Vec<f32> = self
            .samples
            .chunks_exact(2)
            .map(|chunk| (chunk[0] + chunk[1]) / 2.0)
            .collect();

        let mut frame = Self::new(mono, self.sample_rate, Channels::Mono, self.sequence);
        frame.capture_ts_ns = self.capture_ts_ns;
        frame
    }

    /// Whether the frame has the exact pipeline length for its rate
    pub fn is_full_frame(&self) -> bool {
        self.samples.len() == self.sample_rate.samples_per_frame() * self.channels.count()
    }

    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// A decoded playback frame retained as the AEC far-end reference.
///
/// Appended by the playback mixer when a frame is queued for output; pruned
/// by the reader once older than the retained window (>= the AEC tail).
#[derive(Clone)]
pub struct ReferenceFrame {
    /// Samples at the pipeline rate (16 kHz mono)
    pub samples: Arc<[f32]>,
    /// Presentation timestamp in nanoseconds since stream start
    pub presentation_ts_ns: u64,
}

impl ReferenceFrame {
    pub fn new(samples: Vec<f32>, presentation_ts_ns: u64) -> Self {
        Self {
            samples: samples.into(),
            presentation_ts_ns,
        }
    }
}

impl std::fmt::Debug for ReferenceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceFrame")
            .field("samples_len", &self.samples.len())
            .field("presentation_ts_ns", &self.presentation_ts_ns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_conversions() {
        assert_eq!(SampleRate::Hz16000.as_u32(), 16000);
        assert_eq!(SampleRate::Hz16000.samples_per_frame(), 960);
        assert_eq!(SampleRate::Hz48000.samples_per_frame(), 2880);
        assert_eq!(SampleRate::Hz24000.samples_per_frame(), 1440);
        assert_eq!(SampleRate::from_u32(44100), Some(SampleRate::Hz44100));
        assert_eq!(SampleRate::from_u32(11025), None);
    }

    #[test]
    fn test_audio_frame_from_pcm16() {
        let pcm16: Vec<u8> = vec![0x00, 0x40, 0x00, 0xC0]; // two samples
        let frame = AudioFrame::from_pcm16(&pcm16, SampleRate::Hz16000, Channels::Mono, 0);

        assert_eq!(frame.samples.len(), 2);
        assert!(frame.samples[0] > 0.0);
        assert!(frame.samples[1] < 0.0);
    }

    #[test]
    fn test_pcm16_round_trip() {
        let samples: Vec<f32> = (0..960).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        let frame = AudioFrame::new(samples, SampleRate::Hz16000, Channels::Mono, 7);
        let bytes = frame.to_pcm16();
        let back = AudioFrame::from_pcm16(&bytes, SampleRate::Hz16000, Channels::Mono, 7);

        assert_eq!(back.samples.len(), frame.samples.len());
        for (a, b) in frame.samples.iter().zip(back.samples.iter()) {
            assert!((a - b).abs() < 1.0 / 32000.0);
        }
    }

    #[test]
    fn test_energy_calculation() {
        let silent = AudioFrame::silence(SampleRate::Hz16000, Channels::Mono, 0);
        assert!(silent.energy_db < -90.0);

        let loud = AudioFrame::new(vec![0.5; 960], SampleRate::Hz16000, Channels::Mono, 0);
        assert!(loud.energy_db > -10.0);
    }

    #[test]
    fn test_full_frame_check() {
        let full = AudioFrame::silence(SampleRate::Hz16000, Channels::Mono, 0);
        assert!(full.is_full_frame());

        let short = AudioFrame::new(vec![0.0; 100], SampleRate::Hz16000, Channels::Mono, 0);
        assert!(!short.is_full_frame());
    }

    #[test]
    fn test_stereo_to_mono() {
        let stereo = AudioFrame::new(
            vec![0.2, 0.4, -0.2, -0.4],
            SampleRate::Hz16000,
            Channels::Stereo,
            3,
        );
        let mono = stereo.to_mono();
        assert_eq!(mono.samples.len(), 2);
        assert!((mono.samples[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono.sequence, 3);
    }
}
