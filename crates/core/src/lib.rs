//! Core types for the sona voice client
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame types and sample-rate math
//! - Session state, listening mode and abort reason enums
//! - Client event notifications
//! - Error taxonomy

pub mod audio;
pub mod error;
pub mod event;
pub mod state;

pub use audio::{AudioFrame, Channels, ReferenceFrame, SampleRate, FRAME_DURATION_MS};
pub use error::{CodecError, DeviceError, Error, ProtocolError, Result, ToolError, TransportError};
pub use event::ClientEvent;
pub use state::{AbortReason, DeviceState, ListeningMode};
