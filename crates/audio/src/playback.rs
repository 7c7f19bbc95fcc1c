//! Playback mixer
//!
//! Decoded TTS frames are (1) copied pre-mix into the far-end reference ring
//! at the pipeline rate and (2) resampled to the device rate, gain-scaled and
//! queued for the output stream. The sample ring between the mixer and the
//! output callback holds one second of audio; a full ring blocks the producer
//! (the decoder) because dropping audio during TTS is audibly worse than
//! buffering.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sona_core::{AudioFrame, ReferenceFrame, SampleRate};

use crate::reference::ReferenceRing;
use crate::resampler::StreamResampler;

/// Sample queue between the mixer and the output callback.
///
/// Also carries the playback-active flag the capture worker polls to decide
/// whether an AEC reference should exist for a frame.
#[derive(Clone)]
pub struct PlaybackRing {
    ring: Arc<Mutex<HeapRb<f32>>>,
    underruns: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
}

impl PlaybackRing {
    pub fn new(capacity_samples: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(HeapRb::new(capacity_samples))),
            underruns: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Playback counts as active while flagged and audio remains queued.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.occupied() > 0
    }

    /// Push samples, waiting while the ring is full. Called from async
    /// context only; the output callback never blocks.
    pub async fn push_blocking(&self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            {
                let mut ring = self.ring.lock();
                while offset < samples.len() {
                    if ring.try_push(samples[offset]).is_err() {
                        break;
                    }
                    offset += 1;
                }
            }
            if offset < samples.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// Pop up to `out.len()` samples into `out`; returns how many were
    /// written. Remaining slots are the caller's silence to fill.
    pub fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut ring = self.ring.lock();
        let mut written = 0;
        for slot in out.iter_mut() {
            match ring.try_pop() {
                Some(s) => {
                    *slot = s;
                    written += 1;
                }
                None => break,
            }
        }
        written
    }

    pub fn occupied(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn clear(&self) {
        self.ring.lock().clear();
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// Mixes decoded TTS into the output stream and feeds the AEC reference.
pub struct PlaybackMixer {
    ring: PlaybackRing,
    to_device: Mutex<StreamResampler>,
    to_reference: Option<Mutex<StreamResampler>>,
    reference: ReferenceRing,
    gain: f32,
    device_rate: u32,
    decode_rate: u32,
    /// Presentation clock: nanoseconds of audio queued since session start
    presentation_ns: AtomicU64,
}

impl PlaybackMixer {
    pub fn new(
        ring: PlaybackRing,
        reference: ReferenceRing,
        decode_rate: u32,
        device_rate: u32,
        gain: f32,
    ) -> Result<Self, sona_core::error::DeviceError> {
        let to_device = Mutex::new(StreamResampler::new(decode_rate, device_rate)?);
        let to_reference = if decode_rate != SampleRate::Hz16000.as_u32() {
            Some(Mutex::new(StreamResampler::new(
                decode_rate,
                SampleRate::Hz16000.as_u32(),
            )?))
        } else {
            None
        };

        Ok(Self {
            ring,
            to_device,
            to_reference,
            reference,
            gain,
            device_rate,
            decode_rate,
            presentation_ns: AtomicU64::new(0),
        })
    }

    /// Queue one decoded frame for output.
    pub async fn play(&self, frame: &AudioFrame) {
        debug_assert_eq!(frame.sample_rate.as_u32(), self.decode_rate);

        // Pre-mix copy for the echo canceller, at the pipeline rate.
        let reference_samples = match &self.to_reference {
            Some(rs) => {
                let mut rs = rs.lock();
                rs.push(&frame.samples);
                rs.pop_all()
            }
            None => frame.samples.to_vec(),
        };

        let frame_ns = frame.duration.as_nanos() as u64;
        let ts = self.presentation_ns.fetch_add(frame_ns, Ordering::Relaxed);
        if !reference_samples.is_empty() {
            self.reference
                .push(ReferenceFrame::new(reference_samples, ts));
        }

        // Device-rate samples for the output callback.
        let device_samples = {
            let mut rs = self.to_device.lock();
            rs.push(&frame.samples);
            let mut out = rs.pop_all();
            if (self.gain - 1.0).abs() > f32::EPSILON {
                for s in out.iter_mut() {
                    *s *= self.gain;
                }
            }
            out
        };

        self.ring.set_active(true);
        self.ring.push_blocking(&device_samples).await;
    }

    /// Drain all queued audio (abort / barge-in).
    pub fn drain(&self) {
        self.ring.clear();
        self.ring.set_active(false);
        self.reference.clear();
    }

    /// Milliseconds of audio queued but not yet played.
    pub fn queued_ms(&self) -> u64 {
        (self.ring.occupied() as u64 * 1000) / self.device_rate as u64
    }

    /// Whether playback audio is queued and flowing.
    pub fn is_active(&self) -> bool {
        self.ring.is_active()
    }

    pub fn set_inactive(&self) {
        self.ring.set_active(false);
    }

    /// Reset clocks and converters for a new session.
    pub fn reset(&self) {
        self.drain();
        self.presentation_ns.store(0, Ordering::Relaxed);
        self.to_device.lock().reset();
        if let Some(rs) = &self.to_reference {
            rs.lock().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sona_core::Channels;

    fn decoded_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.3; 960], SampleRate::Hz16000, Channels::Mono, seq)
    }

    #[tokio::test]
    async fn test_play_queues_device_samples_and_reference() {
        let ring = PlaybackRing::new(48000);
        let reference = ReferenceRing::new();
        let mixer =
            PlaybackMixer::new(ring.clone(), reference.clone(), 16000, 48000, 1.0).unwrap();

        mixer.play(&decoded_frame(0)).await;
        mixer.play(&decoded_frame(1)).await;

        assert!(ring.occupied() > 0);
        assert_eq!(reference.len(), 2);
        assert!(mixer.is_active());
    }

    #[tokio::test]
    async fn test_reference_timestamps_advance() {
        let mixer = PlaybackMixer::new(
            PlaybackRing::new(48000),
            ReferenceRing::new(),
            16000,
            16000,
            1.0,
        )
        .unwrap();

        mixer.play(&decoded_frame(0)).await;
        mixer.play(&decoded_frame(1)).await;

        // Second frame sits one frame duration later on the clock
        let hit = mixer.reference.closest(60_000_000).unwrap();
        assert_eq!(hit.presentation_ts_ns, 60_000_000);
    }

    #[tokio::test]
    async fn test_drain_empties_everything() {
        let ring = PlaybackRing::new(48000);
        let reference = ReferenceRing::new();
        let mixer =
            PlaybackMixer::new(ring.clone(), reference.clone(), 16000, 16000, 1.0).unwrap();

        mixer.play(&decoded_frame(0)).await;
        mixer.drain();

        assert_eq!(ring.occupied(), 0);
        assert!(reference.is_empty());
        assert_eq!(mixer.queued_ms(), 0);
    }

    #[test]
    fn test_ring_pop_reports_shortfall() {
        let ring = PlaybackRing::new(16);
        let mut out = vec![1.0f32; 8];
        let written = ring.pop_into(&mut out);
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_gain_applied() {
        let ring = PlaybackRing::new(48000);
        let mixer = PlaybackMixer::new(ring.clone(), ReferenceRing::new(), 16000, 16000, 0.5)
            .unwrap();

        mixer.play(&decoded_frame(0)).await;
        let mut out = vec![0.0f32; 16];
        ring.pop_into(&mut out);
        assert!(out.iter().all(|s| (*s - 0.15).abs() < 1e-6));
    }
}
