//! End-to-end session scenarios over a mock transport
//!
//! Synthetic PCM stands in for the capture worker; the mock transport
//! auto-acks `hello` with a fresh session id per connection, records
//! everything the client sends and lets tests inject server traffic and
//! connection loss.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use sona_audio::playback::PlaybackRing;
use sona_audio::{PlaybackMixer, ReferenceRing};
use sona_client::app::{AppCommand, AppDeps, Application, TransportFactory};
use sona_codec::OpusEncoder;
use sona_config::Settings;
use sona_core::{AudioFrame, Channels, ClientEvent, DeviceState, SampleRate, TransportError};
use sona_pipeline::WakeEvent;
use sona_tools::ToolRegistry;
use sona_transport::{Transport, TransportMessage};

#[derive(Debug, Clone)]
enum Sent {
    Text(Value),
    Binary(usize),
}

/// Shared server side of the mock transport.
#[derive(Clone, Default)]
struct MockServer {
    sent: Arc<Mutex<Vec<Sent>>>,
    to_client: Arc<Mutex<Option<mpsc::UnboundedSender<Result<TransportMessage, TransportError>>>>>,
    sessions: Arc<AtomicU64>,
}

impl MockServer {
    fn push_to_client(&self, message: Result<TransportMessage, TransportError>) {
        if let Some(tx) = self.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    fn send_text(&self, json: Value) {
        self.push_to_client(Ok(TransportMessage::Text(json.to_string())));
    }

    fn send_audio(&self, packet: Vec<u8>) {
        self.push_to_client(Ok(TransportMessage::Binary {
            sequence: None,
            packet,
        }));
    }

    fn drop_connection(&self) {
        self.push_to_client(Err(TransportError::Closed("injected".into())));
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn texts_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text(v) if v["type"] == kind => Some(v),
                _ => None,
            })
            .collect()
    }

    fn binary_count(&self) -> usize {
        self.sent()
            .into_iter()
            .filter(|s| matches!(s, Sent::Binary(n) if *n > 0))
            .count()
    }

    fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    server: MockServer,
    rx: Option<mpsc::UnboundedReceiver<Result<TransportMessage, TransportError>>>,
    connected: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, _token: &str) -> Result<(), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.server.to_client.lock().unwrap() = Some(tx);
        self.rx = Some(rx);
        self.connected = true;
        Ok(())
    }

    async fn send_text(&self, json: String) -> Result<(), TransportError> {
        let value: Value = serde_json::from_str(&json).unwrap();

        // Auto-ack hello with a fresh session id.
        if value["type"] == "hello" {
            let n = self.server.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            self.server.send_text(serde_json::json!({
                "type": "hello",
                "transport": "websocket",
                "session_id": format!("session-{n}"),
            }));
        }

        self.server.sent.lock().unwrap().push(Sent::Text(value));
        Ok(())
    }

    async fn send_binary(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.server
            .sent
            .lock()
            .unwrap()
            .push(Sent::Binary(packet.len()));
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportMessage, TransportError> {
        match self.rx.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(item) => item,
                None => Err(TransportError::Closed("mock ended".into())),
            },
            None => Err(TransportError::Closed("not connected".into())),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

struct Harness {
    server: MockServer,
    command_tx: mpsc::Sender<AppCommand>,
    frame_tx: mpsc::Sender<AudioFrame>,
    wake_tx: mpsc::UnboundedSender<WakeEvent>,
    state_rx: watch::Receiver<DeviceState>,
    events: tokio::sync::broadcast::Receiver<ClientEvent>,
    shutdown_tx: watch::Sender<bool>,
    _fatal_tx: mpsc::UnboundedSender<sona_core::error::DeviceError>,
    sequence: u64,
}

impl Harness {
    fn start(aec_enabled: bool) -> Self {
        let mut settings = Settings::default();
        settings.aec.enabled = aec_enabled;
        settings.wake_word.enabled = false;
        settings.vad.model_path = "missing.onnx".into();

        let server = MockServer::default();
        let factory_server = server.clone();
        let factory: TransportFactory = Box::new(move || {
            Box::new(MockTransport {
                server: factory_server.clone(),
                rx: None,
                connected: false,
            })
        });

        let mixer = Arc::new(
            PlaybackMixer::new(PlaybackRing::new(48_000), ReferenceRing::new(), 16_000, 16_000, 1.0)
                .unwrap(),
        );

        let (state_tx, state_rx) = watch::channel(DeviceState::Idle);
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(16);

        let mut app = Application::new(AppDeps {
            settings,
            token: "test-token".into(),
            state_tx,
            transport_name: "websocket",
            transport_factory: factory,
            mixer,
            frame_rx,
            wake_rx,
            fatal_rx,
            command_rx,
            registry: Arc::new(ToolRegistry::new()),
        })
        .unwrap();

        let events = app.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = app.run(shutdown_rx).await;
        });

        Self {
            server,
            command_tx,
            frame_tx,
            wake_tx,
            state_rx,
            events,
            shutdown_tx,
            _fatal_tx: fatal_tx,
            sequence: 0,
        }
    }

    async fn wait_for_state(&mut self, want: DeviceState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if *self.state_rx.borrow() == want {
                return;
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {want:?}"));
            if tokio::time::timeout(remaining, self.state_rx.changed())
                .await
                .is_err()
            {
                panic!("timed out waiting for {want:?}, at {:?}", *self.state_rx.borrow());
            }
        }
    }

    fn speech_frame(&mut self) -> AudioFrame {
        let seq = self.sequence;
        self.sequence += 1;
        let samples: Vec<f32> = (0..960).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        AudioFrame::with_capture_ts(
            samples,
            SampleRate::Hz16000,
            Channels::Mono,
            seq,
            seq * 60_000_000,
        )
    }

    fn silence_frame(&mut self) -> AudioFrame {
        let seq = self.sequence;
        self.sequence += 1;
        AudioFrame::with_capture_ts(
            vec![0.0; 960],
            SampleRate::Hz16000,
            Channels::Mono,
            seq,
            seq * 60_000_000,
        )
    }

    async fn feed_speech(&mut self, frames: usize) {
        for _ in 0..frames {
            let frame = self.speech_frame();
            self.frame_tx.send(frame).await.unwrap();
        }
    }

    async fn feed_silence(&mut self, frames: usize) {
        for _ in 0..frames {
            let frame = self.silence_frame();
            self.frame_tx.send(frame).await.unwrap();
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// S1: wake -> listen -> end of utterance in auto-stop mode.
#[tokio::test(start_paused = true)]
async fn wake_listen_end_of_utterance() {
    let mut h = Harness::start(false); // no AEC: auto-stop mode

    h.wake_tx
        .send(WakeEvent {
            keyword: "hey sona".into(),
            confidence: 0.9,
            timestamp_ns: 0,
        })
        .unwrap();

    h.wait_for_state(DeviceState::Listening).await;

    // Wake detection was forwarded as listen/detect
    h.settle().await;
    let detects = h.server.texts_of_type("listen");
    assert!(detects.iter().any(|m| m["state"] == "detect" && m["text"] == "hey sona"));
    assert!(detects.iter().any(|m| m["state"] == "start" && m["mode"] == "auto"));

    // 1.5 s of speech, then 1 s of silence
    h.feed_speech(25).await;
    h.feed_silence(17).await;
    h.settle().await;

    // At least 25 opus frames went out, and the turn closed
    assert!(h.server.binary_count() >= 25, "only {} frames", h.server.binary_count());
    let listens = h.server.texts_of_type("listen");
    assert!(listens.iter().any(|m| m["state"] == "stop"));

    // End-of-utterance event was published
    let mut saw_eou = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, ClientEvent::EndOfUtterance) {
            saw_eou = true;
        }
    }
    assert!(saw_eou);

    let _ = h.shutdown_tx.send(true);
}

/// S2: user interruption during TTS in realtime mode.
#[tokio::test(start_paused = true)]
async fn interruption_during_tts() {
    let mut h = Harness::start(true); // AEC on: realtime mode

    h.command_tx.send(AppCommand::Start).await.unwrap();
    h.wait_for_state(DeviceState::Listening).await;

    // Server starts a TTS turn with real opus audio
    let encoder = OpusEncoder::new().unwrap();
    let tone: Vec<f32> = (0..960).map(|i| (i as f32 * 0.2).sin() * 0.4).collect();
    let frame = AudioFrame::new(tone, SampleRate::Hz16000, Channels::Mono, 0);
    h.server
        .send_text(serde_json::json!({"type": "tts", "state": "start"}));
    h.server.send_audio(encoder.encode(&frame).unwrap());

    h.wait_for_state(DeviceState::Speaking).await;

    // User speaks for ~400 ms: barge-in
    h.feed_speech(7).await;
    h.wait_for_state(DeviceState::Aborting).await;

    h.settle().await;
    let aborts = h.server.texts_of_type("abort");
    assert!(aborts.iter().any(|m| m["reason"] == "user_interrupt"));

    // Server acks the abort; session resumes listening
    h.server.send_text(serde_json::json!({"type": "abort"}));
    h.wait_for_state(DeviceState::Listening).await;

    let _ = h.shutdown_tx.send(true);
}

/// S5: transport loss while listening reconnects onto a fresh session id.
#[tokio::test(start_paused = true)]
async fn transport_loss_and_reconnect() {
    let mut h = Harness::start(true);

    h.command_tx.send(AppCommand::Start).await.unwrap();
    h.wait_for_state(DeviceState::Listening).await;
    assert_eq!(h.server.session_count(), 1);

    h.server.drop_connection();
    h.wait_for_state(DeviceState::Connecting).await;
    h.wait_for_state(DeviceState::Listening).await;

    // A second hello handshake ran: fresh session
    assert_eq!(h.server.session_count(), 2);

    // Audio resumes on the new session
    h.feed_speech(3).await;
    h.settle().await;
    assert!(h.server.binary_count() >= 3);

    let _ = h.shutdown_tx.send(true);
}

/// Stop command returns the session to idle from anywhere.
#[tokio::test(start_paused = true)]
async fn stop_returns_to_idle() {
    let mut h = Harness::start(true);

    h.command_tx.send(AppCommand::Start).await.unwrap();
    h.wait_for_state(DeviceState::Listening).await;

    h.command_tx.send(AppCommand::Stop).await.unwrap();
    h.wait_for_state(DeviceState::Idle).await;

    let _ = h.shutdown_tx.send(true);
}

/// Server goodbye tears the session down.
#[tokio::test(start_paused = true)]
async fn goodbye_closes_session() {
    let mut h = Harness::start(true);

    h.command_tx.send(AppCommand::Start).await.unwrap();
    h.wait_for_state(DeviceState::Listening).await;

    h.server.send_text(serde_json::json!({"type": "goodbye"}));
    h.wait_for_state(DeviceState::Idle).await;

    let _ = h.shutdown_tx.send(true);
}

/// Malformed and unknown control messages are dropped without killing the
/// session.
#[tokio::test(start_paused = true)]
async fn protocol_errors_are_non_fatal() {
    let mut h = Harness::start(true);

    h.command_tx.send(AppCommand::Start).await.unwrap();
    h.wait_for_state(DeviceState::Listening).await;

    h.server
        .push_to_client(Ok(TransportMessage::Text("{broken".into())));
    h.server.send_text(serde_json::json!({"type": "mystery"}));
    h.settle().await;

    assert_eq!(*h.state_rx.borrow(), DeviceState::Listening);
    h.feed_speech(2).await;
    h.settle().await;
    assert!(h.server.binary_count() >= 2);

    let _ = h.shutdown_tx.send(true);
}
