//! Opus framing for the capture and playback paths
//!
//! Encoder: 16 kHz mono, 60 ms frames, VoIP profile, 24 kbps VBR with inband
//! FEC. One packet per frame, at most [`MAX_PACKET_BYTES`].
//!
//! Decoder: tracks the envelope sequence number; a gap of up to
//! [`MAX_PLC_GAP`] missing frames is concealed with PLC, larger gaps flush
//! decoder state. A failed decode drops the packet, resets state and yields
//! one silent frame.

use parking_lot::Mutex;

use sona_core::{AudioFrame, Channels, CodecError, SampleRate};

/// Upper bound on one encoded packet
pub const MAX_PACKET_BYTES: usize = 512;

/// Largest sequence gap concealed frame-by-frame before a state flush
pub const MAX_PLC_GAP: u64 = 5;

const ENCODER_BITRATE: i32 = 24_000;

/// Opus encoder for outgoing 16 kHz / 60 ms mono frames
pub struct OpusEncoder {
    inner: Mutex<opus::Encoder>,
    frame_samples: usize,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, CodecError> {
        let mut encoder = opus::Encoder::new(
            SampleRate::Hz16000.as_u32(),
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| CodecError::Init(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(ENCODER_BITRATE))
            .map_err(|e| CodecError::Init(e.to_string()))?;
        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| CodecError::Init(e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(encoder),
            frame_samples: SampleRate::Hz16000.samples_per_frame(),
        })
    }

    /// Encode one full pipeline frame into a single packet.
    pub fn encode(&self, frame: &AudioFrame) -> Result<Vec<u8>, CodecError> {
        if frame.samples.len() != self.frame_samples {
            return Err(CodecError::Encode(format!(
                "expected {} samples, got {}",
                self.frame_samples,
                frame.samples.len()
            )));
        }

        let pcm = frame.to_i16();
        self.inner
            .lock()
            .encode_vec(&pcm, MAX_PACKET_BYTES)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Reset encoder state between sessions.
    pub fn reset(&self) {
        if let Err(e) = self.inner.lock().reset_state() {
            tracing::warn!(error = %e, "opus encoder reset failed");
        }
    }
}

/// Outcome of feeding one transport packet to the decoder
#[derive(Debug)]
pub struct DecodeOutput {
    /// Concealed frames for missing sequence numbers, in order, then the
    /// decoded frame for the packet itself.
    pub frames: Vec<AudioFrame>,
    /// How many frames were synthesized by PLC
    pub concealed: u64,
    /// Whether decoder state was flushed because the gap was too large
    pub flushed: bool,
}

/// Opus decoder for inbound TTS packets
pub struct OpusDecoder {
    inner: Mutex<opus::Decoder>,
    sample_rate: SampleRate,
    frame_samples: usize,
    last_sequence: Mutex<Option<u64>>,
    out_sequence: Mutex<u64>,
}

impl OpusDecoder {
    pub fn new(sample_rate: SampleRate) -> Result<Self, CodecError> {
        let decoder = opus::Decoder::new(sample_rate.as_u32(), opus::Channels::Mono)
            .map_err(|e| CodecError::Init(e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(decoder),
            sample_rate,
            frame_samples: sample_rate.samples_per_frame(),
            last_sequence: Mutex::new(None),
            out_sequence: Mutex::new(0),
        })
    }

    /// Decode one packet carrying the given envelope sequence number.
    ///
    /// Missing sequences up to [`MAX_PLC_GAP`] are concealed; a larger gap
    /// flushes decoder state and resumes from the new sequence.
    pub fn decode(&self, sequence: u64, packet: &[u8]) -> Result<DecodeOutput, CodecError> {
        let mut frames = Vec::new();
        let mut concealed = 0;
        let mut flushed = false;

        let gap = {
            let last = self.last_sequence.lock();
            match *last {
                Some(prev) if sequence > prev + 1 => sequence - prev - 1,
                _ => 0,
            }
        };

        if gap > 0 {
            if gap <= MAX_PLC_GAP {
                for _ in 0..gap {
                    frames.push(self.conceal_one()?);
                    concealed += 1;
                }
            } else {
                tracing::warn!(gap, "sequence gap too large, flushing decoder state");
                self.flush();
                flushed = true;
            }
        }

        let mut pcm = vec![0i16; self.frame_samples];
        let decoded = {
            let mut decoder = self.inner.lock();
            decoder.decode(packet, &mut pcm, false)
        };

        match decoded {
            Ok(n) => {
                pcm.truncate(n);
                frames.push(self.frame_from_pcm(&pcm));
            }
            Err(e) => {
                // Drop the packet, reset state, emit one silent frame.
                self.flush();
                frames.push(self.silent_frame());
                *self.last_sequence.lock() = Some(sequence);
                tracing::warn!(error = %e, sequence, "opus decode failed, dropped packet");
                return Ok(DecodeOutput {
                    frames,
                    concealed,
                    flushed: true,
                });
            }
        }

        *self.last_sequence.lock() = Some(sequence);
        Ok(DecodeOutput {
            frames,
            concealed,
            flushed,
        })
    }

    /// Synthesize one frame via packet-loss concealment.
    fn conceal_one(&self) -> Result<AudioFrame, CodecError> {
        let mut pcm = vec![0i16; self.frame_samples];
        let n = {
            let mut decoder = self.inner.lock();
            decoder
                .decode(&[], &mut pcm, false)
                .map_err(|e| CodecError::Decode(e.to_string()))?
        };
        pcm.truncate(n);
        Ok(self.frame_from_pcm(&pcm))
    }

    fn frame_from_pcm(&self, pcm: &[i16]) -> AudioFrame {
        let samples: Vec<f32> = pcm.iter().map(|&s| s as f32 / 32768.0).collect();
        let seq = {
            let mut out = self.out_sequence.lock();
            let seq = *out;
            *out += 1;
            seq
        };
        AudioFrame::new(samples, self.sample_rate, Channels::Mono, seq)
    }

    fn silent_frame(&self) -> AudioFrame {
        let seq = {
            let mut out = self.out_sequence.lock();
            let seq = *out;
            *out += 1;
            seq
        };
        AudioFrame::silence(self.sample_rate, Channels::Mono, seq)
    }

    /// Flush decoder state (large gap or new session).
    pub fn flush(&self) {
        if let Err(e) = self.inner.lock().reset_state() {
            tracing::warn!(error = %e, "opus decoder reset failed");
        }
    }

    /// Reset for a fresh session: state, sequence tracking and output numbering.
    pub fn reset(&self) {
        self.flush();
        *self.last_sequence.lock() = None;
        *self.out_sequence.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_frame(seq: u64) -> AudioFrame {
        let samples: Vec<f32> = (0..960)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 16000.0).sin() * 0.5)
            .collect();
        AudioFrame::new(samples, SampleRate::Hz16000, Channels::Mono, seq)
    }

    #[test]
    fn test_encode_packet_size_bound() {
        let encoder = OpusEncoder::new().unwrap();
        let packet = encoder.encode(&tone_frame(0)).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() <= MAX_PACKET_BYTES);
    }

    #[test]
    fn test_encode_rejects_wrong_length() {
        let encoder = OpusEncoder::new().unwrap();
        let short = AudioFrame::new(vec![0.0; 480], SampleRate::Hz16000, Channels::Mono, 0);
        assert!(encoder.encode(&short).is_err());
    }

    #[test]
    fn test_round_trip_length() {
        let encoder = OpusEncoder::new().unwrap();
        let decoder = OpusDecoder::new(SampleRate::Hz16000).unwrap();

        for seq in 0..5u64 {
            let packet = encoder.encode(&tone_frame(seq)).unwrap();
            let out = decoder.decode(seq, &packet).unwrap();
            assert_eq!(out.frames.len(), 1);
            // Equal length up to codec padding
            let got = out.frames[0].samples.len();
            assert!((got as i64 - 960).abs() <= 1, "got {got} samples");
        }
    }

    #[test]
    fn test_small_gap_concealed() {
        let encoder = OpusEncoder::new().unwrap();
        let decoder = OpusDecoder::new(SampleRate::Hz16000).unwrap();

        let p0 = encoder.encode(&tone_frame(0)).unwrap();
        decoder.decode(0, &p0).unwrap();

        // Sequences 1 and 2 lost
        let p3 = encoder.encode(&tone_frame(3)).unwrap();
        let out = decoder.decode(3, &p3).unwrap();
        assert_eq!(out.concealed, 2);
        assert_eq!(out.frames.len(), 3);
        assert!(!out.flushed);
    }

    #[test]
    fn test_large_gap_flushes() {
        let encoder = OpusEncoder::new().unwrap();
        let decoder = OpusDecoder::new(SampleRate::Hz16000).unwrap();

        let p0 = encoder.encode(&tone_frame(0)).unwrap();
        decoder.decode(0, &p0).unwrap();

        let p9 = encoder.encode(&tone_frame(9)).unwrap();
        let out = decoder.decode(9, &p9).unwrap();
        assert_eq!(out.concealed, 0);
        assert!(out.flushed);
        assert_eq!(out.frames.len(), 1);
    }

    #[test]
    fn test_garbage_packet_yields_silence() {
        let decoder = OpusDecoder::new(SampleRate::Hz16000).unwrap();
        // Code-3 TOC byte without the mandatory frame-count byte is invalid
        let out = decoder.decode(0, &[0x03]).unwrap();
        assert_eq!(out.frames.len(), 1);
        assert!(out.frames[0].energy_db < -90.0);
    }

    #[test]
    fn test_decoder_output_sequence_monotonic() {
        let encoder = OpusEncoder::new().unwrap();
        let decoder = OpusDecoder::new(SampleRate::Hz16000).unwrap();

        let mut last = None;
        for seq in 0..4u64 {
            let packet = encoder.encode(&tone_frame(seq)).unwrap();
            for frame in decoder.decode(seq, &packet).unwrap().frames {
                if let Some(prev) = last {
                    assert!(frame.sequence > prev);
                }
                last = Some(frame.sequence);
            }
        }
    }
}
