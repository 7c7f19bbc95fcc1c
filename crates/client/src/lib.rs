//! Session core of the sona voice client
//!
//! Wires the audio stack, codecs, detectors, transport and tool dispatcher
//! together under the session/dialog state machine, and owns their ordered
//! startup and teardown.

pub mod app;
pub mod builtin;
pub mod resources;

pub use app::{AppCommand, AppDeps, Application, TransportFactory};
pub use resources::ResourceManager;
