//! Session/dialog state machine
//!
//! Orchestrates IDLE / CONNECTING / LISTENING / SPEAKING / ABORTING. The
//! state machine is the only writer of the session state; every other
//! component observes it through the watch channel or the event broadcast.
//!
//! Capture frames, wake events, inbound transport messages, tool responses
//! and front-end commands all arrive over channels and are handled on one
//! cooperative loop; compute-heavy work (device I/O, AEC, wake scoring)
//! happens on dedicated threads upstream.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use sona_audio::PlaybackMixer;
use sona_codec::{OpusDecoder, OpusEncoder};
use sona_config::Settings;
use sona_core::error::DeviceError;
use sona_core::{
    AbortReason, AudioFrame, ClientEvent, DeviceState, Error, ListeningMode, SampleRate,
    TransportError,
};
use sona_pipeline::{SileroVad, VadConfig, VadEngine, VadResult, WakeEvent};
use sona_tools::{McpDispatcher, ToolRegistry};
use sona_transport::{
    AudioParams, Backoff, InboundItem, InboundMessage, OutboundMessage, TransportHandle,
    TransportMessage, TtsState,
};

/// Builds a fresh, unconnected transport for each session.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn sona_transport::Transport> + Send + Sync>;

/// Commands exposed to front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCommand {
    /// Start an automatic conversation (mode picked from AEC availability)
    Start,
    /// Stop the conversation and return to idle
    Stop,
    /// Push-to-talk press
    ManualStart,
    /// Push-to-talk release
    ManualStop,
}

/// Everything the application needs from the resource manager.
pub struct AppDeps {
    pub settings: Settings,
    pub token: String,
    /// State watch created by the resource manager so collaborators (wake
    /// thread, built-in tools) can observe before the application exists.
    /// The application remains the only writer.
    pub state_tx: watch::Sender<DeviceState>,
    pub transport_name: &'static str,
    pub transport_factory: TransportFactory,
    pub mixer: Arc<PlaybackMixer>,
    pub frame_rx: mpsc::Receiver<AudioFrame>,
    pub wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
    pub fatal_rx: mpsc::UnboundedReceiver<DeviceError>,
    pub command_rx: mpsc::Receiver<AppCommand>,
    pub registry: Arc<ToolRegistry>,
}

/// The session core.
pub struct Application {
    settings: Settings,
    token: String,
    transport_name: &'static str,
    transport_factory: TransportFactory,

    state_tx: watch::Sender<DeviceState>,
    events_tx: broadcast::Sender<ClientEvent>,

    session_id: String,
    generation: u64,
    listening_mode: ListeningMode,
    keep_listening: bool,
    /// A listen turn is open: capture frames are encoded and sent
    turn_open: bool,

    vad: SileroVad,
    encoder: OpusEncoder,
    decoder: OpusDecoder,
    mixer: Arc<PlaybackMixer>,

    transport: Option<TransportHandle>,
    /// Receive-side packet numbering for order-preserving transports
    ws_rx_sequence: u64,

    dispatcher: McpDispatcher,
    mcp_out_rx: mpsc::Receiver<Value>,

    frame_rx: mpsc::Receiver<AudioFrame>,
    wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
    fatal_rx: mpsc::UnboundedReceiver<DeviceError>,
    command_rx: mpsc::Receiver<AppCommand>,
    inbound_tx: mpsc::Sender<InboundItem>,
    inbound_rx: mpsc::Receiver<InboundItem>,
}

impl Application {
    pub fn new(deps: AppDeps) -> Result<Self, Error> {
        let state_tx = deps.state_tx;
        let (events_tx, _) = broadcast::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (mcp_out_tx, mcp_out_rx) = mpsc::channel(64);

        let vad = SileroVad::new(VadConfig::from_options(&deps.settings.vad))
            .map_err(|e| Error::Config(e.to_string()))?;
        let encoder = OpusEncoder::new()?;
        let decode_rate = SampleRate::from_u32(deps.settings.audio.output_sample_rate)
            .ok_or_else(|| Error::Config("unsupported output sample rate".into()))?;
        let decoder = OpusDecoder::new(decode_rate)?;

        let dispatcher =
            McpDispatcher::new(deps.registry, deps.settings.tools.clone(), mcp_out_tx);

        // AEC gives us full duplex; without it fall back to auto-stop turns.
        let listening_mode = if deps.settings.aec.enabled {
            ListeningMode::Realtime
        } else {
            ListeningMode::AutoStop
        };

        Ok(Self {
            settings: deps.settings,
            token: deps.token,
            transport_name: deps.transport_name,
            transport_factory: deps.transport_factory,
            state_tx,
            events_tx,
            session_id: String::new(),
            generation: 0,
            listening_mode,
            keep_listening: false,
            turn_open: false,
            vad,
            encoder,
            decoder,
            mixer: deps.mixer,
            transport: None,
            ws_rx_sequence: 0,
            dispatcher,
            mcp_out_rx,
            frame_rx: deps.frame_rx,
            wake_rx: deps.wake_rx,
            fatal_rx: deps.fatal_rx,
            command_rx: deps.command_rx,
            inbound_tx,
            inbound_rx,
        })
    }

    /// Observe the session state (read-only).
    pub fn state_watch(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    /// Run the control loop until shutdown.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.close_session().await;
                        return Ok(());
                    }
                }
                Some(command) = self.command_rx.recv() => {
                    self.on_command(command).await;
                }
                Some(frame) = self.frame_rx.recv() => {
                    self.on_capture_frame(frame).await;
                }
                Some(event) = self.wake_rx.recv() => {
                    self.on_wake(event).await;
                }
                Some(fatal) = self.fatal_rx.recv() => {
                    self.emit_error("audio_device", &fatal.to_string());
                    self.close_session().await;
                    return Err(Error::Device(fatal));
                }
                Some(item) = self.inbound_rx.recv() => {
                    if let Err(e) = self.on_inbound(item).await {
                        return Err(e);
                    }
                }
                Some(response) = self.mcp_out_rx.recv() => {
                    self.send_json(OutboundMessage::mcp(&self.session_id, response)).await;
                }
                else => return Ok(()),
            }
        }
    }

    // ---- state ----

    fn set_state(&self, to: DeviceState) {
        let from = *self.state_tx.borrow();
        if from == to {
            return;
        }
        tracing::info!(from = from.as_str(), to = to.as_str(), "session state");
        // send_replace: the transition must land even with no observers left
        self.state_tx.send_replace(to);
        let _ = self.events_tx.send(ClientEvent::StateChanged { from, to });
    }

    fn emit_error(&self, reason_code: &str, message: &str) {
        tracing::error!(reason_code, message, "session error");
        let _ = self.events_tx.send(ClientEvent::Error {
            reason_code: reason_code.to_string(),
            message: message.to_string(),
        });
    }

    // ---- commands & wake ----

    async fn on_command(&mut self, command: AppCommand) {
        match command {
            AppCommand::Start => {
                if self.state() == DeviceState::Idle {
                    self.keep_listening = true;
                    self.start_conversation(self.listening_mode, None).await;
                }
            }
            AppCommand::Stop => {
                if self.state() == DeviceState::Speaking {
                    self.abort_speaking(AbortReason::UserInterruption).await;
                }
                self.close_session().await;
            }
            AppCommand::ManualStart => {
                self.keep_listening = false;
                if self.state() == DeviceState::Speaking {
                    self.abort_speaking(AbortReason::UserInterruption).await;
                }
                if self.state() == DeviceState::Idle {
                    self.start_conversation(ListeningMode::Manual, None).await;
                } else {
                    self.open_turn(ListeningMode::Manual).await;
                }
            }
            AppCommand::ManualStop => {
                if self.state() == DeviceState::Listening {
                    self.send_json(OutboundMessage::listen_stop(&self.session_id))
                        .await;
                    self.turn_open = false;
                }
            }
        }
    }

    async fn on_wake(&mut self, event: WakeEvent) {
        let _ = self.events_tx.send(ClientEvent::WakeDetected {
            keyword: event.keyword.clone(),
            confidence: event.confidence,
            timestamp_ns: event.timestamp_ns,
        });

        match self.state() {
            DeviceState::Idle => {
                self.keep_listening = true;
                self.start_conversation(self.listening_mode, Some(&event.keyword))
                    .await;
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::WakeWordDetected).await;
            }
            _ => {}
        }
    }

    // ---- connection lifecycle ----

    /// IDLE -> CONNECTING -> LISTENING (hello handshake in between).
    async fn start_conversation(&mut self, mode: ListeningMode, wake_word: Option<&str>) {
        self.set_state(DeviceState::Connecting);

        match self.establish_session().await {
            Ok(()) => {
                if let Some(keyword) = wake_word {
                    self.send_json(OutboundMessage::listen_detect(&self.session_id, keyword))
                        .await;
                }
                self.set_state(DeviceState::Listening);
                self.open_turn(mode).await;
            }
            Err(e) => {
                self.emit_error("connect_failed", &e.to_string());
                self.teardown_transport().await;
                self.set_state(DeviceState::Idle);
            }
        }
    }

    /// Connect, say hello, wait for the ack. A fresh session every time.
    async fn establish_session(&mut self) -> Result<(), Error> {
        let mut transport = (self.transport_factory)();

        let connect_timeout = Duration::from_secs(self.settings.network.connect_timeout_secs);
        tokio::time::timeout(connect_timeout, transport.connect(&self.token))
            .await
            .map_err(|_| Error::Transport(TransportError::ConnectTimeout))??;

        self.generation += 1;
        let handle = TransportHandle::spawn(transport, self.inbound_tx.clone(), self.generation);

        if let Err(e) = handle
            .send_text(OutboundMessage::hello(
                self.transport_name,
                &AudioParams::default(),
            ))
            .await
        {
            handle.close().await;
            return Err(Error::Transport(e));
        }

        let ack = match self.await_hello_ack().await {
            Ok(ack) => ack,
            Err(e) => {
                handle.close().await;
                return Err(e);
            }
        };

        self.session_id = ack
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Some(params) = &ack.audio_params {
            if params.sample_rate != self.settings.audio.output_sample_rate {
                tracing::warn!(
                    negotiated = params.sample_rate,
                    configured = self.settings.audio.output_sample_rate,
                    "server offered a different output rate, keeping configured decoder"
                );
            }
        }

        self.transport = Some(handle);
        self.ws_rx_sequence = 0;
        self.decoder.reset();
        self.mixer.reset();
        VadEngine::reset(&self.vad);

        tracing::info!(session_id = %self.session_id, "session established");
        Ok(())
    }

    /// Wait for the server hello; everything else is premature and dropped.
    async fn await_hello_ack(&mut self) -> Result<sona_transport::HelloAck, Error> {
        let hello_timeout = Duration::from_secs(self.settings.network.hello_timeout_secs);
        let deadline = tokio::time::Instant::now() + hello_timeout;

        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(Error::Transport(TransportError::HelloTimeout))?;
            let item = tokio::time::timeout(remaining, self.inbound_rx.recv())
                .await
                .map_err(|_| Error::Transport(TransportError::HelloTimeout))?
                .ok_or(Error::Transport(TransportError::HelloTimeout))?;

            let (generation, message) = item;
            if generation != self.generation {
                continue;
            }
            match message {
                Ok(TransportMessage::Text(text)) => match InboundMessage::parse(&text) {
                    Ok(InboundMessage::Hello(ack)) => return Ok(ack),
                    Ok(_) | Err(_) => continue,
                },
                Ok(_) => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    /// Send `listen start` and begin streaming capture.
    async fn open_turn(&mut self, mode: ListeningMode) {
        self.listening_mode = mode;
        self.turn_open = true;
        VadEngine::reset(&self.vad);
        self.send_json(OutboundMessage::listen_start(&self.session_id, mode))
            .await;
    }

    /// Transport loss while active: CONNECTING, retry with backoff, then
    /// either a fresh session or IDLE + TransportFailed.
    async fn reconnect(&mut self) -> Result<(), Error> {
        self.teardown_transport().await;
        self.set_state(DeviceState::Connecting);

        let mut backoff = Backoff::new(self.settings.network.max_reconnect_attempts);
        while let Some(delay) = backoff.next_delay() {
            tracing::info!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::time::sleep(delay).await;

            match self.establish_session().await {
                Ok(()) => {
                    self.set_state(DeviceState::Listening);
                    self.open_turn(self.listening_mode).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reconnect attempt failed");
                    self.teardown_transport().await;
                }
            }
        }

        let failed = TransportError::TransportFailed {
            attempts: self.settings.network.max_reconnect_attempts,
            reason: "reconnect budget exhausted".into(),
        };
        self.emit_error("transport_failed", &failed.to_string());
        self.set_state(DeviceState::Idle);
        Err(Error::Transport(failed))
    }

    async fn teardown_transport(&mut self) {
        if let Some(handle) = self.transport.take() {
            handle.close().await;
        }
        self.turn_open = false;
    }

    /// Any -> IDLE.
    async fn close_session(&mut self) {
        self.keep_listening = false;
        self.mixer.drain();
        self.decoder.reset();
        VadEngine::reset(&self.vad);
        self.teardown_transport().await;
        self.session_id.clear();
        self.set_state(DeviceState::Idle);
    }

    // ---- capture path ----

    async fn on_capture_frame(&mut self, frame: AudioFrame) {
        match self.state() {
            DeviceState::Listening => {
                if !self.turn_open {
                    return;
                }

                // VAD errors drop one frame, never the session.
                let vad_result = match self.vad.process(&frame) {
                    Ok((_, _, result)) => result,
                    Err(e) => {
                        tracing::warn!(error = %e, "vad failed, frame dropped");
                        return;
                    }
                };

                self.send_encoded(&frame).await;

                if vad_result == VadResult::SpeechEnd
                    && self.listening_mode == ListeningMode::AutoStop
                {
                    let _ = self.events_tx.send(ClientEvent::EndOfUtterance);
                    // Final empty frame flags the end of the utterance, then
                    // the turn closes.
                    if let Some(handle) = &self.transport {
                        let _ = handle.send_binary(Vec::new()).await;
                    }
                    self.send_json(OutboundMessage::listen_stop(&self.session_id))
                        .await;
                    self.turn_open = false;
                }
            }

            DeviceState::Speaking => {
                if self.listening_mode != ListeningMode::Realtime {
                    return;
                }

                // Full duplex: keep streaming, and barge in once user speech
                // is confirmed.
                let confirmed = matches!(
                    self.vad.process(&frame),
                    Ok((sona_pipeline::VadState::Speech, _, _))
                );
                self.send_encoded(&frame).await;

                if confirmed {
                    self.abort_speaking(AbortReason::UserInterruption).await;
                }
            }

            _ => {}
        }
    }

    async fn send_encoded(&mut self, frame: &AudioFrame) {
        let packet = match self.encoder.encode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "encode failed, frame dropped");
                self.encoder.reset();
                return;
            }
        };
        if let Some(handle) = &self.transport {
            let _ = handle.send_binary(packet).await;
        }
    }

    /// SPEAKING -> ABORTING: tell the server, drain playback immediately.
    async fn abort_speaking(&mut self, reason: AbortReason) {
        self.send_json(OutboundMessage::abort(&self.session_id, reason))
            .await;
        self.mixer.drain();
        self.decoder.reset();
        self.set_state(DeviceState::Aborting);
        let _ = self.events_tx.send(ClientEvent::Aborted { reason });
    }

    // ---- inbound ----

    async fn on_inbound(&mut self, item: InboundItem) -> Result<(), Error> {
        let (generation, message) = item;
        if generation != self.generation {
            // Leftover from a torn-down connection
            return Ok(());
        }

        match message {
            Ok(TransportMessage::Text(text)) => {
                self.on_control_message(&text).await;
                Ok(())
            }
            Ok(TransportMessage::Binary { sequence, packet }) => {
                self.on_audio_packet(sequence, packet).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport error");
                if self.state() == DeviceState::Idle {
                    return Ok(());
                }
                // Budget exhaustion ends the control loop; the process exit
                // code reports the transport fatal.
                self.reconnect().await
            }
        }
    }

    async fn on_control_message(&mut self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                // Protocol errors: log and drop, never abort the session.
                tracing::warn!(error = %e, "dropped control message");
                return;
            }
        };

        match message {
            InboundMessage::Hello(_) => {
                tracing::debug!("unexpected hello mid-session, ignored");
            }

            InboundMessage::Tts { state, text } => match state {
                TtsState::Start => {
                    if self.state() == DeviceState::Listening {
                        self.set_state(DeviceState::Speaking);
                    }
                }
                TtsState::SentenceStart => {
                    if let Some(text) = text {
                        let _ = self.events_tx.send(ClientEvent::TtsSentence { text });
                    }
                }
                TtsState::Stop => self.on_turn_end().await,
            },

            InboundMessage::TurnEnd => self.on_turn_end().await,

            InboundMessage::Stt { text } => {
                let _ = self.events_tx.send(ClientEvent::IncomingTranscript { text });
            }

            InboundMessage::Listen { .. } => {
                tracing::debug!("server-driven listen message ignored");
            }

            InboundMessage::Abort { .. } => {
                if self.state() == DeviceState::Aborting {
                    self.set_state(DeviceState::Listening);
                    self.open_turn(self.listening_mode).await;
                }
            }

            InboundMessage::Mcp { payload } => {
                self.dispatcher.handle(payload).await;
            }

            InboundMessage::Iot { payload } => {
                // Legacy family: same JSON-RPC envelope, still dispatched.
                if let Some(rpc) = payload.get("payload") {
                    self.dispatcher.handle(rpc.clone()).await;
                } else {
                    tracing::debug!("iot message without payload, ignored");
                }
            }

            InboundMessage::Goodbye { session_id } => {
                if session_id.is_none() || session_id.as_deref() == Some(&self.session_id) {
                    self.close_session().await;
                }
            }
        }
    }

    /// Server finished its turn.
    async fn on_turn_end(&mut self) {
        match self.state() {
            DeviceState::Speaking | DeviceState::Aborting => {
                if self.keep_listening {
                    self.set_state(DeviceState::Listening);
                    self.open_turn(self.listening_mode).await;
                } else {
                    self.close_session().await;
                }
            }
            _ => {}
        }
    }

    async fn on_audio_packet(&mut self, sequence: Option<u64>, packet: Vec<u8>) {
        let state = self.state();
        if !matches!(state, DeviceState::Listening | DeviceState::Speaking) {
            // Stale audio (aborted or torn-down turn) is dropped.
            return;
        }

        // First inbound audio packet of a turn starts playback.
        if state == DeviceState::Listening {
            self.set_state(DeviceState::Speaking);
        }

        if packet.is_empty() {
            return;
        }
        let sequence = sequence.unwrap_or_else(|| {
            let seq = self.ws_rx_sequence;
            self.ws_rx_sequence = seq + 1;
            seq
        });

        match self.decoder.decode(sequence, &packet) {
            Ok(output) => {
                for frame in output.frames {
                    self.mixer.play(&frame).await;
                }
            }
            Err(e) => {
                // Codec errors reset state and the stream continues.
                tracing::warn!(error = %e, "decode failed, packet dropped");
                self.decoder.flush();
            }
        }
    }

    async fn send_json(&self, json: String) {
        if let Some(handle) = &self.transport {
            if let Err(e) = handle.send_text(json).await {
                tracing::warn!(error = %e, "control send failed");
            }
        }
    }
}
