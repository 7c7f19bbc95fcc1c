//! Resource manager
//!
//! Startup proceeds in dependency order: audio device + capture worker,
//! playback mixer, wake-word thread, tool registry, then the session core.
//! Teardown is the strict reverse; each component gets two seconds to stop
//! before it is force-cancelled. All long-running tasks observe the shared
//! shutdown watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use sona_audio::{AudioMetrics, CaptureWorker, PlaybackMixer, RawTap, ReferenceRing};
use sona_audio::playback::PlaybackRing;
use sona_config::Settings;
use sona_core::{ClientEvent, DeviceState, Error, SampleRate};
use sona_pipeline::{WakeEvent, WakeWordDetector};
use sona_tools::ToolRegistry;

use crate::app::{AppCommand, AppDeps, Application, TransportFactory};
use crate::builtin::register_builtin_tools;

/// Grace period before a component is force-cancelled at teardown.
const STOP_BUDGET: Duration = Duration::from_secs(2);

/// Playback ring capacity: one second at the highest supported device rate.
const PLAYBACK_RING_SAMPLES: usize = 48_000;

/// Bounded queue between the capture worker and the control loop.
const FRAME_QUEUE_DEPTH: usize = 8;

/// Front-end handle to a running client.
pub struct ClientHandle {
    pub command_tx: mpsc::Sender<AppCommand>,
    pub events: broadcast::Receiver<ClientEvent>,
    pub state: watch::Receiver<DeviceState>,
}

/// Owns component lifetimes and the ordered startup/teardown.
pub struct ResourceManager {
    shutdown_tx: watch::Sender<bool>,
    capture: Option<CaptureWorker>,
    wake_stop: Arc<AtomicBool>,
    wake_join: Option<std::thread::JoinHandle<()>>,
    app_task: Option<tokio::task::JoinHandle<Result<(), Error>>>,
    pub metrics: Arc<AudioMetrics>,
}

impl ResourceManager {
    /// Bring the whole stack up. Any failure here is fatal init.
    pub async fn start(
        settings: Settings,
        token: String,
        transport_name: &'static str,
        transport_factory: TransportFactory,
    ) -> Result<(Self, ClientHandle), Error> {
        let metrics = AudioMetrics::shared();
        let (shutdown_tx, _) = watch::channel(false);

        // Audio: reference ring and playback ring exist before both users.
        let reference = ReferenceRing::new();
        let playback_ring = PlaybackRing::new(PLAYBACK_RING_SAMPLES);

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let (capture, raw_tap, output_rate) = CaptureWorker::spawn(
            settings.audio.clone(),
            settings.aec.clone(),
            playback_ring.clone(),
            reference.clone(),
            frame_tx,
            fatal_tx,
            metrics.clone(),
        )
        .map_err(Error::Device)?;

        let decode_rate = SampleRate::from_u32(settings.audio.output_sample_rate)
            .ok_or_else(|| Error::Config("unsupported output sample rate".into()))?;
        let mixer = Arc::new(
            PlaybackMixer::new(
                playback_ring,
                reference,
                decode_rate.as_u32(),
                output_rate,
                settings.audio.playback_gain,
            )
            .map_err(Error::Device)?,
        );

        // State watch precedes the application so observers can subscribe.
        let (state_tx, state_rx) = watch::channel(DeviceState::Idle);

        // Tools: registered now, sealed when the dispatcher starts.
        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(&registry, state_rx.clone())?;

        // Wake detector thread on the raw tap.
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let wake_stop = Arc::new(AtomicBool::new(false));
        let wake_join = spawn_wake_thread(
            &settings,
            raw_tap,
            state_rx.clone(),
            wake_tx,
            wake_stop.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel(16);

        let mut app = Application::new(AppDeps {
            settings,
            token,
            state_tx,
            transport_name,
            transport_factory,
            mixer,
            frame_rx,
            wake_rx,
            fatal_rx,
            command_rx,
            registry,
        })?;

        let events = app.subscribe();
        let shutdown_rx = shutdown_tx.subscribe();
        let app_task = tokio::spawn(async move { app.run(shutdown_rx).await });

        let handle = ClientHandle {
            command_tx,
            events,
            state: state_rx,
        };

        Ok((
            Self {
                shutdown_tx,
                capture: Some(capture),
                wake_stop,
                wake_join,
                app_task: Some(app_task),
                metrics,
            },
            handle,
        ))
    }

    /// Tear everything down in reverse startup order.
    ///
    /// Returns the session core's exit result.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        // 1. Session core: signal, wait, force-cancel past the budget.
        let _ = self.shutdown_tx.send(true);
        let result = match self.app_task.take() {
            Some(mut task) => match tokio::time::timeout(STOP_BUDGET, &mut task).await {
                Ok(joined) => joined.unwrap_or(Err(Error::Cancelled)),
                Err(_) => {
                    tracing::warn!("session core missed the stop budget, cancelled");
                    task.abort();
                    Ok(())
                }
            },
            None => Ok(()),
        };

        // 2. Wake thread.
        self.wake_stop.store(true, Ordering::Release);
        if let Some(join) = self.wake_join.take() {
            let _ = join.join();
        }

        // 3. Capture worker (stops the device streams).
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }

        tracing::info!(
            capture_drops = self.metrics.capture_drops(),
            underruns = self.metrics.playback_underruns(),
            gaps = self.metrics.frame_gaps(),
            rebuilds = self.metrics.stream_rebuilds(),
            "shutdown complete"
        );
        result
    }
}

/// Wake detection thread: consumes the raw tap while armed, pauses after a
/// trigger and resumes once the session is idle again.
fn spawn_wake_thread(
    settings: &Settings,
    tap: RawTap,
    state_rx: watch::Receiver<DeviceState>,
    wake_tx: mpsc::UnboundedSender<WakeEvent>,
    stop: Arc<AtomicBool>,
) -> Option<std::thread::JoinHandle<()>> {
    let options = settings.wake_word.clone();
    if !options.enabled {
        return None;
    }
    let detect_during_speaking = options.detect_during_speaking;

    let join = std::thread::Builder::new()
        .name("sona-wake".into())
        .spawn(move || {
            let mut detector = WakeWordDetector::new(options);
            if !detector.is_enabled() {
                tracing::info!("wake detector has no scorer, thread exiting");
                return;
            }

            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }

                let state = *state_rx.borrow();
                let armed = state == DeviceState::Idle
                    || (detect_during_speaking && state == DeviceState::Speaking);

                if state == DeviceState::Idle && detector.is_paused() {
                    detector.resume();
                }

                if !armed {
                    tap.drain();
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }

                let Some(frame) = tap.recv_timeout(Duration::from_millis(100)) else {
                    continue;
                };
                match detector.process(&frame) {
                    Ok(Some(event)) => {
                        if wake_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // One bad frame is dropped; detection continues.
                        tracing::warn!(error = %e, "wake scoring failed");
                    }
                }
            }
            tracing::debug!("wake thread stopped");
        })
        .ok();

    join
}
