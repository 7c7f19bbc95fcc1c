//! Capture worker
//!
//! A dedicated thread that owns the duplex device and runs the compute-bound
//! part of the capture chain: device blocks -> resample to 16 kHz -> fixed
//! 60 ms frames -> capture processor (AEC et al). Processed frames flow into
//! the async pipeline over a bounded channel; the raw pre-AEC frames are
//! teed to the wake-word tap.
//!
//! cpal streams are not Send, so the device is opened inside the thread and
//! the open result is handed back over a one-shot init channel. The thread
//! also services mid-session stream failures: it rebuilds the failing stream
//! (3 attempts, 500 ms backoff) and reports a fatal device error when the
//! budget is exhausted. Frame sequence numbers stay monotonic across
//! rebuilds; the gap metric marks the discontinuity.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sona_config::{AecOptions, AudioOptions};
use sona_core::error::DeviceError;
use sona_core::{AudioFrame, Channels, SampleRate};

use crate::aec::CaptureProcessor;
use crate::device::AudioDevice;
use crate::playback::PlaybackRing;
use crate::reference::ReferenceRing;
use crate::resampler::StreamResampler;
use crate::AudioMetrics;

/// Depth of the pre-AEC tap feeding the wake detector.
const RAW_TAP_FRAMES: usize = 16;

/// How long the worker waits for a device block before re-checking flags.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Pre-AEC frame tap for the wake-word detector.
///
/// Bounded; a slow reader loses the oldest frames, never the newest.
#[derive(Clone)]
pub struct RawTap {
    rx: Receiver<AudioFrame>,
}

impl RawTap {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Handle to the running capture worker.
pub struct CaptureWorker {
    join: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl CaptureWorker {
    /// Open the device on a fresh thread and start the capture chain.
    ///
    /// Blocks until the device open result is known. Returns the worker
    /// handle, the wake tap and the device output rate (for the mixer).
    pub fn spawn(
        audio_options: AudioOptions,
        aec_options: AecOptions,
        playback: PlaybackRing,
        reference: ReferenceRing,
        frame_tx: tokio::sync::mpsc::Sender<AudioFrame>,
        fatal_tx: tokio::sync::mpsc::UnboundedSender<DeviceError>,
        metrics: Arc<AudioMetrics>,
    ) -> Result<(Self, RawTap, u32), DeviceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let (raw_tx, raw_rx) = bounded(RAW_TAP_FRAMES);
        let raw_rx_for_drop = raw_rx.clone();
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<u32, DeviceError>>();

        let join = std::thread::Builder::new()
            .name("sona-capture".into())
            .spawn(move || {
                let (mut device, capture_rx) =
                    match AudioDevice::open(&audio_options, metrics.clone(), playback.clone()) {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };

                let input_rate = device.input_rate();
                let output_rate = device.output_rate();

                let mut resampler =
                    match StreamResampler::new(input_rate, SampleRate::Hz16000.as_u32()) {
                        Ok(rs) => rs,
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };

                if let Err(e) = device.start() {
                    let _ = init_tx.send(Err(e));
                    return;
                }
                let _ = init_tx.send(Ok(output_rate));

                let mut processor = CaptureProcessor::new(aec_options);
                run_capture_loop(
                    &mut device,
                    &capture_rx,
                    &mut resampler,
                    &mut processor,
                    &reference,
                    &playback,
                    output_rate,
                    &raw_tx,
                    &raw_rx_for_drop,
                    &frame_tx,
                    &fatal_tx,
                    &metrics,
                    &stop_flag,
                );

                device.stop();
                tracing::debug!("capture worker stopped");
            })
            .map_err(|e| DeviceError::StreamBuild(e.to_string()))?;

        let output_rate = match init_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(DeviceError::AudioDeviceUnavailable(
                    "capture worker died during init".into(),
                ));
            }
        };

        Ok((
            Self {
                join: Some(join),
                stop,
            },
            RawTap { rx: raw_rx },
            output_rate,
        ))
    }

    /// Signal the worker to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_capture_loop(
    device: &mut AudioDevice,
    capture_rx: &Receiver<Vec<f32>>,
    resampler: &mut StreamResampler,
    processor: &mut CaptureProcessor,
    reference: &ReferenceRing,
    playback: &PlaybackRing,
    output_rate: u32,
    raw_tx: &Sender<AudioFrame>,
    raw_rx: &Receiver<AudioFrame>,
    frame_tx: &tokio::sync::mpsc::Sender<AudioFrame>,
    fatal_tx: &tokio::sync::mpsc::UnboundedSender<DeviceError>,
    metrics: &AudioMetrics,
    stop_flag: &AtomicBool,
) {
    let frame_samples = SampleRate::Hz16000.samples_per_frame();
    let mut sequence: u64 = 0;
    let mut total_samples: u64 = 0;
    let mut playback_was_active = false;

    loop {
        if stop_flag.load(Ordering::Acquire) {
            // Drain whatever the callback queued, then exit.
            while capture_rx.try_recv().is_ok() {}
            return;
        }

        if device.take_input_failure() {
            if let Err(e) = device.rebuild_input() {
                tracing::error!(error = %e, "input stream lost");
                let _ = fatal_tx.send(e);
                return;
            }
            metrics.frame_gaps.fetch_add(1, Ordering::Relaxed);
            resampler.reset();
        }
        if device.take_output_failure() {
            if let Err(e) = device.rebuild_output() {
                tracing::error!(error = %e, "output stream lost");
                let _ = fatal_tx.send(e);
                return;
            }
        }

        let block = match capture_rx.recv_timeout(POLL_TIMEOUT) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        resampler.push(&block);

        while let Some(samples) = resampler.pop_exact(frame_samples) {
            let capture_ts_ns =
                total_samples * 1_000_000_000 / SampleRate::Hz16000.as_u32() as u64;
            total_samples += frame_samples as u64;

            let frame = AudioFrame::with_capture_ts(
                samples,
                SampleRate::Hz16000,
                Channels::Mono,
                sequence,
                capture_ts_ns,
            );
            sequence += 1;

            tee_raw(raw_tx, raw_rx, frame.clone());

            let playback_active = playback.is_active();
            if playback_active && !playback_was_active {
                // Playback restarted: fold the queue depth into the delay
                // estimate.
                let queued_ms = (playback.occupied() as u64 * 1000) / output_rate as u64;
                let measured = processor.stream_delay_ms().max(queued_ms as f32);
                processor.update_stream_delay(measured);
            }
            playback_was_active = playback_active;

            let far = if playback_active {
                reference.closest(processor.reference_target_ts(capture_ts_ns))
            } else {
                None
            };

            let processed = processor.process(&frame, far.as_ref());

            if let Err(e) = frame_tx.try_send(processed) {
                match e {
                    tokio::sync::mpsc::error::TrySendError::Full(_) => {
                        metrics.capture_drops.fetch_add(1, Ordering::Relaxed);
                        metrics.frame_gaps.fetch_add(1, Ordering::Relaxed);
                    }
                    tokio::sync::mpsc::error::TrySendError::Closed(_) => return,
                }
            }
        }
    }
}

/// Tee to the wake tap, dropping the oldest frame when the reader lags.
fn tee_raw(tx: &Sender<AudioFrame>, rx: &Receiver<AudioFrame>, frame: AudioFrame) {
    if let Err(TrySendError::Full(frame)) = tx.try_send(frame) {
        let _ = rx.try_recv();
        let _ = tx.try_send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tee_raw_drop_oldest() {
        let (tx, rx) = bounded(2);
        let frame =
            |seq| AudioFrame::new(vec![0.0; 960], SampleRate::Hz16000, Channels::Mono, seq);

        tee_raw(&tx, &rx, frame(0));
        tee_raw(&tx, &rx, frame(1));
        tee_raw(&tx, &rx, frame(2));

        assert_eq!(rx.try_recv().unwrap().sequence, 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
    }

    #[test]
    fn test_raw_tap_drain() {
        let (tx, rx) = bounded(4);
        let tap = RawTap { rx };
        tx.send(AudioFrame::silence(SampleRate::Hz16000, Channels::Mono, 0))
            .unwrap();
        tap.drain();
        assert!(tap.recv_timeout(Duration::from_millis(1)).is_none());
    }
}
