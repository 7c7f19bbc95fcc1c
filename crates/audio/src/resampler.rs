//! Streaming polyphase resampler
//!
//! Wraps rubato's FFT resampler with an input accumulator and an output
//! residual so callers can feed arbitrary block sizes and read back exact
//! frame lengths. The filter delay line lives inside rubato; `reset()`
//! discards all state between sessions.

use rubato::{FftFixedIn, Resampler};
use std::collections::VecDeque;

use sona_core::error::DeviceError;

/// Chunk fed to the inner resampler per process call: 5 ms at the input
/// rate, the ceiling on added buffering latency.
fn chunk_samples(rate: u32) -> usize {
    (rate / 200) as usize
}

/// Streaming converter between two fixed sample rates, mono.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    from_rate: u32,
    to_rate: u32,
    chunk: usize,
    pending_in: VecDeque<f32>,
    ready_out: VecDeque<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, DeviceError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(DeviceError::StreamBuild(format!(
                "invalid resample pair {from_rate} -> {to_rate}"
            )));
        }

        let chunk = chunk_samples(from_rate);
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk, 2, 1)
                    .map_err(|e| DeviceError::StreamBuild(format!("resampler init: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            from_rate,
            to_rate,
            chunk,
            pending_in: VecDeque::new(),
            ready_out: VecDeque::new(),
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Feed input samples; converted output accumulates internally.
    pub fn push(&mut self, input: &[f32]) {
        if self.inner.is_none() {
            self.ready_out.extend(input.iter().copied());
            return;
        }

        self.pending_in.extend(input.iter().copied());

        while self.pending_in.len() >= self.chunk {
            let block: Vec<f32> = self.pending_in.drain(..self.chunk).collect();
            let resampler = self.inner.as_mut().expect("checked above");
            match resampler.process(&[block], None) {
                Ok(mut out) => {
                    self.ready_out.extend(out.remove(0));
                }
                Err(e) => {
                    // One bad block is dropped; the stream continues.
                    tracing::warn!(error = %e, "resampler process failed, dropping block");
                }
            }
        }
    }

    /// Number of converted samples ready to read.
    pub fn available(&self) -> usize {
        self.ready_out.len()
    }

    /// Pop exactly `len` converted samples, or None if not enough yet.
    pub fn pop_exact(&mut self, len: usize) -> Option<Vec<f32>> {
        if self.ready_out.len() < len {
            return None;
        }
        Some(self.ready_out.drain(..len).collect())
    }

    /// Pop everything converted so far.
    pub fn pop_all(&mut self) -> Vec<f32> {
        self.ready_out.drain(..).collect()
    }

    /// Discard all state between sessions.
    pub fn reset(&mut self) {
        self.pending_in.clear();
        self.ready_out.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut rs = StreamResampler::new(16000, 16000).unwrap();
        rs.push(&[0.1, 0.2, 0.3]);
        assert_eq!(rs.pop_all(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_48k_to_16k_ratio() {
        let mut rs = StreamResampler::new(48000, 16000).unwrap();
        // 300 ms of input
        let input: Vec<f32> = (0..14400)
            .map(|i| (i as f32 * 0.02).sin() * 0.4)
            .collect();
        rs.push(&input);
        let out = rs.pop_all();
        // floor(N * 16000/48000) with residual carried in the filter
        assert!(out.len() <= 4800);
        assert!(out.len() > 4800 - 480, "only {} samples out", out.len());
    }

    #[test]
    fn test_16k_to_48k_frame_assembly() {
        let mut rs = StreamResampler::new(16000, 48000).unwrap();
        let input = vec![0.25f32; 960 * 4];
        rs.push(&input);
        // Four 60 ms frames in should produce close to four 60 ms frames out
        let mut frames = 0;
        while rs.pop_exact(2880).is_some() {
            frames += 1;
        }
        assert!(frames >= 3, "only {frames} full output frames");
    }

    #[test]
    fn test_44100_supported() {
        let mut rs = StreamResampler::new(44100, 16000).unwrap();
        rs.push(&vec![0.0f32; 4410]);
        // 100 ms in -> about 1600 samples out once the filter fills
        assert!(rs.available() <= 1600);
    }

    #[test]
    fn test_reset_discards_state() {
        let mut rs = StreamResampler::new(48000, 16000).unwrap();
        rs.push(&vec![0.5f32; 4800]);
        rs.reset();
        assert_eq!(rs.available(), 0);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(StreamResampler::new(0, 16000).is_err());
    }
}
