//! Settings and persisted device state for the sona voice client
//!
//! Configuration is layered: `config/default.yaml`, then `config/{env}.yaml`,
//! then environment variables prefixed with `SONA_`. All sections carry serde
//! defaults so a missing file still yields a runnable configuration; the
//! `validate()` pass rejects out-of-range values at startup.

mod identity;
mod settings;

pub use identity::{DeviceIdentity, TokenCache};
pub use settings::{
    AecOptions, AgcMode, AgcOptions, AudioOptions, MqttOptions, NetworkOptions,
    NoiseSuppressionLevel, NoiseSuppressionOptions, ObservabilityOptions, Settings, ToolOptions,
    TransportKind, VadOptions, WakeWordOptions,
};

use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("missing mandatory field: {0}")]
    Missing(String),

    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for sona_core::Error {
    fn from(err: ConfigError) -> Self {
        sona_core::Error::Config(err.to_string())
    }
}
