//! Client event notifications
//!
//! Components publish events on a broadcast channel instead of holding
//! references to each other; front-ends subscribe to drive their display.

use crate::state::{AbortReason, DeviceState};

/// Events published by the session core.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Session state changed
    StateChanged { from: DeviceState, to: DeviceState },
    /// Wake word fired
    WakeDetected {
        keyword: String,
        confidence: f32,
        timestamp_ns: u64,
    },
    /// VAD detected end of utterance while listening
    EndOfUtterance,
    /// Speech-to-text result from the server
    IncomingTranscript { text: String },
    /// TTS sentence text from the server
    TtsSentence { text: String },
    /// In-flight TTS was aborted
    Aborted { reason: AbortReason },
    /// A human-readable failure surfaced to the UI
    Error { reason_code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_cloneable() {
        let ev = ClientEvent::StateChanged {
            from: DeviceState::Idle,
            to: DeviceState::Connecting,
        };
        let _copy = ev.clone();
    }
}
