//! Error taxonomy
//!
//! Recoverable errors are handled in-component and surfaced as metrics;
//! non-recoverable errors propagate to the state machine which transitions
//! the session. Cancellation is a normal shutdown path and is never logged
//! as an error.

use thiserror::Error;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Missing mandatory fields or out-of-range values. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Normal shutdown path
    #[error("cancelled")]
    Cancelled,
}

/// Audio device errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Stream open failure. Fatal to the session.
    #[error("audio device unavailable: {0}")]
    AudioDeviceUnavailable(String),

    /// Mid-session stream loss after rebuild attempts were exhausted.
    #[error("audio stream lost: {0}")]
    AudioStreamLost(String),

    #[error("stream build failed: {0}")]
    StreamBuild(String),
}

/// Codec errors. Recoverable: drop packet, reset state, continue.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("opus encode failed: {0}")]
    Encode(String),

    #[error("opus decode failed: {0}")]
    Decode(String),

    #[error("codec init failed: {0}")]
    Init(String),
}

/// Transport errors. Trigger the reconnect protocol.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("hello handshake timed out")]
    HelloTimeout,

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection closed: {0}")]
    Closed(String),

    /// Raised after the reconnect budget is exhausted.
    #[error("transport failed after {attempts} attempts: {reason}")]
    TransportFailed { attempts: u32, reason: String },
}

/// Protocol errors: unknown message type or malformed JSON.
/// Logged and dropped; never abort the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    MalformedJson(String),

    #[error("unknown message type: {0}")]
    UnknownMessage(String),
}

/// Tool dispatch errors, mapped onto JSON-RPC error codes by the dispatcher.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("method not found: {0}")]
    NotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("tool execution failed: {0}")]
    Execution(String),

    #[error("tool call timed out after {0}s")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Device(DeviceError::AudioDeviceUnavailable("no input".into()));
        assert!(err.to_string().contains("audio device unavailable"));

        let err = Error::from(TransportError::TransportFailed {
            attempts: 5,
            reason: "dns".into(),
        });
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn test_cancelled_is_not_a_failure_message() {
        assert_eq!(Error::Cancelled.to_string(), "cancelled");
    }
}
