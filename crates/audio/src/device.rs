//! Duplex audio device layer (cpal)
//!
//! Opens one input and one output stream at the device native rate.
//! Enumeration and selection happen once at startup; hot-swap is not
//! supported. Stream open failure is fatal (`AudioDeviceUnavailable`);
//! mid-session read/write errors trigger a rebuild, up to three attempts
//! with 500 ms backoff, before `AudioStreamLost` is reported.
//!
//! Callbacks never block: the input callback pushes mono blocks into a
//! bounded queue (dropping the oldest block on overflow), the output
//! callback drains the playback ring and fills silence on underrun.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sona_config::AudioOptions;
use sona_core::error::DeviceError;

use crate::playback::PlaybackRing;
use crate::AudioMetrics;

/// Bounded capture queue depth in device blocks (~480 ms at 60 ms blocks).
pub const CAPTURE_QUEUE_FRAMES: usize = 8;

/// Rebuild budget for a failing stream.
const REBUILD_ATTEMPTS: u32 = 3;
const REBUILD_BACKOFF: Duration = Duration::from_millis(500);

/// Duplex device pair with running streams.
pub struct AudioDevice {
    input: cpal::Device,
    output: cpal::Device,
    input_config: StreamConfig,
    input_format: SampleFormat,
    output_config: StreamConfig,
    output_format: SampleFormat,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
    capture_tx: Sender<Vec<f32>>,
    capture_rx_for_drop: Receiver<Vec<f32>>,
    playback: PlaybackRing,
    input_failed: Arc<AtomicBool>,
    output_failed: Arc<AtomicBool>,
    metrics: Arc<AudioMetrics>,
}

impl AudioDevice {
    /// Enumerate, select and configure devices. Streams are not started yet.
    ///
    /// Returns the device plus the capture queue receiver for the worker.
    pub fn open(
        options: &AudioOptions,
        metrics: Arc<AudioMetrics>,
        playback: PlaybackRing,
    ) -> Result<(Self, Receiver<Vec<f32>>), DeviceError> {
        let host = cpal::default_host();

        let input = pick_device(&host, options.input_device.as_deref(), true)?;
        let output = pick_device(&host, options.output_device.as_deref(), false)?;

        let input_supported = input
            .default_input_config()
            .map_err(|e| DeviceError::AudioDeviceUnavailable(format!("input config: {e}")))?;
        let output_supported = output
            .default_output_config()
            .map_err(|e| DeviceError::AudioDeviceUnavailable(format!("output config: {e}")))?;

        let input_format = input_supported.sample_format();
        let output_format = output_supported.sample_format();
        let input_config: StreamConfig = input_supported.into();
        let output_config: StreamConfig = output_supported.into();

        tracing::info!(
            input = %input.name().unwrap_or_else(|_| "unknown".into()),
            input_rate = input_config.sample_rate.0,
            output = %output.name().unwrap_or_else(|_| "unknown".into()),
            output_rate = output_config.sample_rate.0,
            "audio devices selected"
        );

        let (capture_tx, capture_rx) = bounded(CAPTURE_QUEUE_FRAMES);

        Ok((
            Self {
                input,
                output,
                input_config,
                input_format,
                output_config,
                output_format,
                input_stream: None,
                output_stream: None,
                capture_tx,
                capture_rx_for_drop: capture_rx.clone(),
                playback,
                input_failed: Arc::new(AtomicBool::new(false)),
                output_failed: Arc::new(AtomicBool::new(false)),
                metrics,
            },
            capture_rx,
        ))
    }

    pub fn input_rate(&self) -> u32 {
        self.input_config.sample_rate.0
    }

    pub fn output_rate(&self) -> u32 {
        self.output_config.sample_rate.0
    }

    pub fn playback_ring(&self) -> PlaybackRing {
        self.playback.clone()
    }

    /// Build and start both streams. Fatal on failure.
    pub fn start(&mut self) -> Result<(), DeviceError> {
        let input_stream = self.build_input_stream()?;
        let output_stream = self.build_output_stream()?;

        input_stream
            .play()
            .map_err(|e| DeviceError::AudioDeviceUnavailable(format!("input start: {e}")))?;
        output_stream
            .play()
            .map_err(|e| DeviceError::AudioDeviceUnavailable(format!("output start: {e}")))?;

        self.input_stream = Some(input_stream);
        self.output_stream = Some(output_stream);
        tracing::info!("audio streams started");
        Ok(())
    }

    /// Stop and drop both streams.
    pub fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        self.playback.clear();
    }

    /// Whether the input stream reported an error since the last check.
    pub fn take_input_failure(&self) -> bool {
        self.input_failed.swap(false, Ordering::AcqRel)
    }

    /// Whether the output stream reported an error since the last check.
    pub fn take_output_failure(&self) -> bool {
        self.output_failed.swap(false, Ordering::AcqRel)
    }

    /// Rebuild the input stream after a mid-session error.
    ///
    /// Up to three attempts with 500 ms backoff; exhaustion is fatal.
    pub fn rebuild_input(&mut self) -> Result<(), DeviceError> {
        self.input_stream = None;

        let mut last_err = String::new();
        for attempt in 1..=REBUILD_ATTEMPTS {
            std::thread::sleep(REBUILD_BACKOFF);
            match self.build_input_stream().and_then(|s| {
                s.play()
                    .map_err(|e| DeviceError::StreamBuild(e.to_string()))?;
                Ok(s)
            }) {
                Ok(stream) => {
                    self.input_stream = Some(stream);
                    self.metrics.stream_rebuilds.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(attempt, "input stream rebuilt");
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    tracing::warn!(attempt, error = %last_err, "input stream rebuild failed");
                }
            }
        }

        Err(DeviceError::AudioStreamLost(last_err))
    }

    /// Rebuild the output stream after a mid-session error.
    pub fn rebuild_output(&mut self) -> Result<(), DeviceError> {
        self.output_stream = None;

        let mut last_err = String::new();
        for attempt in 1..=REBUILD_ATTEMPTS {
            std::thread::sleep(REBUILD_BACKOFF);
            match self.build_output_stream().and_then(|s| {
                s.play()
                    .map_err(|e| DeviceError::StreamBuild(e.to_string()))?;
                Ok(s)
            }) {
                Ok(stream) => {
                    self.output_stream = Some(stream);
                    self.metrics.stream_rebuilds.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(attempt, "output stream rebuilt");
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    tracing::warn!(attempt, error = %last_err, "output stream rebuild failed");
                }
            }
        }

        Err(DeviceError::AudioStreamLost(last_err))
    }

    fn build_input_stream(&self) -> Result<Stream, DeviceError> {
        let channels = self.input_config.channels as usize;
        let tx = self.capture_tx.clone();
        let rx = self.capture_rx_for_drop.clone();
        let metrics = self.metrics.clone();
        let failed = self.input_failed.clone();

        let err_fn = move |err| {
            tracing::error!(error = %err, "input stream error");
            failed.store(true, Ordering::Release);
        };

        let stream = match self.input_format {
            SampleFormat::F32 => self
                .input
                .build_input_stream(
                    &self.input_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        push_capture(&tx, &rx, &metrics, downmix(data, channels));
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| DeviceError::StreamBuild(e.to_string()))?,
            SampleFormat::I16 => self
                .input
                .build_input_stream(
                    &self.input_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let floats: Vec<f32> =
                            data.iter().map(|&s| s as f32 / 32768.0).collect();
                        push_capture(&tx, &rx, &metrics, downmix(&floats, channels));
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| DeviceError::StreamBuild(e.to_string()))?,
            other => {
                return Err(DeviceError::AudioDeviceUnavailable(format!(
                    "unsupported input sample format {other:?}"
                )))
            }
        };

        Ok(stream)
    }

    fn build_output_stream(&self) -> Result<Stream, DeviceError> {
        let channels = self.output_config.channels as usize;
        let ring = self.playback.clone();
        let failed = self.output_failed.clone();

        let err_fn = move |err| {
            tracing::error!(error = %err, "output stream error");
            failed.store(true, Ordering::Release);
        };

        let stream = match self.output_format {
            SampleFormat::F32 => self
                .output
                .build_output_stream(
                    &self.output_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill_output(&ring, data, channels);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| DeviceError::StreamBuild(e.to_string()))?,
            SampleFormat::I16 => self
                .output
                .build_output_stream(
                    &self.output_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let mut floats = vec![0.0f32; data.len()];
                        fill_output(&ring, &mut floats, channels);
                        for (dst, src) in data.iter_mut().zip(floats.iter()) {
                            *dst = (src.clamp(-1.0, 1.0) * 32767.0) as i16;
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| DeviceError::StreamBuild(e.to_string()))?,
            other => {
                return Err(DeviceError::AudioDeviceUnavailable(format!(
                    "unsupported output sample format {other:?}"
                )))
            }
        };

        Ok(stream)
    }
}

/// Select a device by configured name, else the system default.
fn pick_device(
    host: &cpal::Host,
    name: Option<&str>,
    input: bool,
) -> Result<cpal::Device, DeviceError> {
    if let Some(wanted) = name {
        let devices = if input {
            host.input_devices()
        } else {
            host.output_devices()
        }
        .map_err(|e| DeviceError::AudioDeviceUnavailable(e.to_string()))?;

        for device in devices {
            if device.name().map(|n| n == wanted).unwrap_or(false) {
                return Ok(device);
            }
        }
        tracing::warn!(wanted, "configured device not found, using default");
    }

    let fallback = if input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };

    fallback.ok_or_else(|| {
        DeviceError::AudioDeviceUnavailable(
            if input { "no input device" } else { "no output device" }.to_string(),
        )
    })
}

/// Average interleaved channels down to mono.
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        data.to_vec()
    } else {
        data.chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Bounded push that favors freshness: a full queue drops the oldest block.
fn push_capture(
    tx: &Sender<Vec<f32>>,
    rx: &Receiver<Vec<f32>>,
    metrics: &AudioMetrics,
    block: Vec<f32>,
) {
    if let Err(crossbeam_channel::TrySendError::Full(block)) = tx.try_send(block) {
        let _ = rx.try_recv();
        metrics.capture_drops.fetch_add(1, Ordering::Relaxed);
        metrics.frame_gaps.fetch_add(1, Ordering::Relaxed);
        let _ = tx.try_send(block);
    }
}

/// Fill an interleaved output buffer from the mono playback ring.
fn fill_output(ring: &PlaybackRing, data: &mut [f32], channels: usize) {
    let frames = data.len() / channels.max(1);
    let mut mono = vec![0.0f32; frames];
    let written = ring.pop_into(&mut mono);

    if written < frames {
        ring.record_underrun();
    }

    for (i, sample) in mono.iter().enumerate() {
        for c in 0..channels {
            data[i * channels + c] = *sample;
        }
    }
}
