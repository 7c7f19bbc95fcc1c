//! Session state, listening modes and abort reasons

use serde::{Deserialize, Serialize};

/// Device/session state.
///
/// The session state machine is the only writer; every other component
/// observes the state through notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
    Aborting,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
            DeviceState::Aborting => "aborting",
        }
    }
}

/// How a listening turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Server stops the turn when the client reports end of utterance
    #[default]
    AutoStop,
    /// Push-to-talk: the user stops the turn explicitly
    Manual,
    /// Full duplex: capture stays live during playback (requires AEC)
    Realtime,
}

impl ListeningMode {
    /// Wire encoding used in `listen` messages
    pub fn wire_name(&self) -> &'static str {
        match self {
            ListeningMode::AutoStop => "auto",
            ListeningMode::Manual => "manual",
            ListeningMode::Realtime => "realtime",
        }
    }
}

/// Reason an in-flight TTS turn was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    #[default]
    None,
    WakeWordDetected,
    UserInterruption,
}

impl AbortReason {
    pub fn wire_name(&self) -> &'static str {
        match self {
            AbortReason::None => "none",
            AbortReason::WakeWordDetected => "wake_word_detected",
            AbortReason::UserInterruption => "user_interrupt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(DeviceState::Idle.as_str(), "idle");
        assert_eq!(DeviceState::Aborting.as_str(), "aborting");
    }

    #[test]
    fn test_listening_mode_wire_names() {
        assert_eq!(ListeningMode::AutoStop.wire_name(), "auto");
        assert_eq!(ListeningMode::Manual.wire_name(), "manual");
        assert_eq!(ListeningMode::Realtime.wire_name(), "realtime");
    }

    #[test]
    fn test_abort_reason_wire_names() {
        assert_eq!(AbortReason::WakeWordDetected.wire_name(), "wake_word_detected");
        assert_eq!(AbortReason::UserInterruption.wire_name(), "user_interrupt");
    }
}
