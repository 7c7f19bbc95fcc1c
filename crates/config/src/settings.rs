//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Which transport variant to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Websocket,
    Mqtt,
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Network and transport configuration
    #[serde(default)]
    pub network: NetworkOptions,

    /// Audio device configuration
    #[serde(default)]
    pub audio: AudioOptions,

    /// Echo cancellation / capture processing configuration
    #[serde(default)]
    pub aec: AecOptions,

    /// Voice activity detection configuration
    #[serde(default)]
    pub vad: VadOptions,

    /// Wake word detection configuration
    #[serde(default)]
    pub wake_word: WakeWordOptions,

    /// Tool dispatcher configuration
    #[serde(default)]
    pub tools: ToolOptions,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityOptions,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOptions {
    /// Preferred transport
    #[serde(default)]
    pub transport: TransportKind,

    /// WebSocket endpoint
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,

    /// MQTT endpoint settings
    #[serde(default)]
    pub mqtt: MqttOptions,

    /// Transport connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Hello handshake timeout in seconds
    #[serde(default = "default_hello_timeout_secs")]
    pub hello_timeout_secs: u64,

    /// Consecutive reconnect failures before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_websocket_url() -> String {
    "wss://localhost:8000/ws".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_hello_timeout_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::Websocket,
            websocket_url: default_websocket_url(),
            mqtt: MqttOptions::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            hello_timeout_secs: default_hello_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// MQTT transport settings: one publish/subscribe topic pair each for
/// audio (QoS 0) and control JSON (QoS 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttOptions {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub tls: bool,

    #[serde(default = "default_publish_audio_topic")]
    pub publish_audio_topic: String,

    #[serde(default = "default_publish_control_topic")]
    pub publish_control_topic: String,

    #[serde(default = "default_subscribe_audio_topic")]
    pub subscribe_audio_topic: String,

    #[serde(default = "default_subscribe_control_topic")]
    pub subscribe_control_topic: String,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_publish_audio_topic() -> String {
    "sona/up/audio".to_string()
}

fn default_publish_control_topic() -> String {
    "sona/up/control".to_string()
}

fn default_subscribe_audio_topic() -> String {
    "sona/down/audio".to_string()
}

fn default_subscribe_control_topic() -> String {
    "sona/down/control".to_string()
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: true,
            publish_audio_topic: default_publish_audio_topic(),
            publish_control_topic: default_publish_control_topic(),
            subscribe_audio_topic: default_subscribe_audio_topic(),
            subscribe_control_topic: default_subscribe_control_topic(),
        }
    }
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioOptions {
    /// Input device name; system default when absent
    #[serde(default)]
    pub input_device: Option<String>,

    /// Output device name; system default when absent
    #[serde(default)]
    pub output_device: Option<String>,

    /// Decode rate of inbound TTS (16000 or 24000)
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Playback gain applied by the mixer, 0.0..=1.0
    #[serde(default = "default_playback_gain")]
    pub playback_gain: f32,
}

fn default_output_sample_rate() -> u32 {
    16000
}

fn default_playback_gain() -> f32 {
    1.0
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            output_sample_rate: default_output_sample_rate(),
            playback_gain: default_playback_gain(),
        }
    }
}

/// Noise suppression strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NoiseSuppressionLevel {
    Low,
    Moderate,
    #[default]
    High,
    VeryHigh,
}

/// AGC operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgcMode {
    /// Treated as AdaptiveDigital on desktop hosts
    AdaptiveAnalog,
    #[default]
    AdaptiveDigital,
    FixedDigital,
}

/// Noise suppression options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseSuppressionOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub level: NoiseSuppressionLevel,
}

impl Default for NoiseSuppressionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            level: NoiseSuppressionLevel::High,
        }
    }
}

/// Automatic gain control options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgcOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub mode: AgcMode,

    /// Target level below full scale, positive dB
    #[serde(default = "default_target_level_dbfs")]
    pub target_level_dbfs: u8,

    #[serde(default = "default_compression_gain_db")]
    pub compression_gain_db: u8,

    #[serde(default = "default_true")]
    pub limiter: bool,
}

fn default_target_level_dbfs() -> u8 {
    3
}

fn default_compression_gain_db() -> u8 {
    9
}

impl Default for AgcOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AgcMode::AdaptiveDigital,
            target_level_dbfs: default_target_level_dbfs(),
            compression_gain_db: default_compression_gain_db(),
            limiter: true,
        }
    }
}

/// Capture processing options: echo cancellation, noise suppression,
/// high-pass filtering and gain control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AecOptions {
    /// Echo cancellation on/off
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lighter mobile-tuned echo path (unused on desktop)
    #[serde(default)]
    pub mobile_mode: bool,

    #[serde(default)]
    pub noise_suppression: NoiseSuppressionOptions,

    #[serde(default = "default_true")]
    pub high_pass: bool,

    #[serde(default)]
    pub agc: AgcOptions,

    /// Initial estimate of the capture->playback round trip, milliseconds
    #[serde(default = "default_stream_delay_ms")]
    pub stream_delay_ms: u32,
}

fn default_stream_delay_ms() -> u32 {
    40
}

impl Default for AecOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            mobile_mode: false,
            noise_suppression: NoiseSuppressionOptions::default(),
            high_pass: true,
            agc: AgcOptions::default(),
            stream_delay_ms: default_stream_delay_ms(),
        }
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadOptions {
    /// Speech probability threshold
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    /// Consecutive speech needed to enter SPEECH, milliseconds
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,

    /// Consecutive silence needed to leave SPEECH, milliseconds
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u32,

    /// Path to the Silero ONNX model
    #[serde(default = "default_vad_model_path")]
    pub model_path: String,
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_min_speech_ms() -> u32 {
    200
}

fn default_silence_timeout_ms() -> u32 {
    800
}

fn default_vad_model_path() -> String {
    "models/vad/silero_vad.onnx".to_string()
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            min_speech_ms: default_min_speech_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
            model_path: default_vad_model_path(),
        }
    }
}

/// Wake word detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeWordOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the keyword-spotting ONNX model
    #[serde(default = "default_wake_model_path")]
    pub model_path: String,

    /// Keywords matched against the model's label vocabulary
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,

    /// Confidence threshold
    #[serde(default = "default_wake_threshold")]
    pub threshold: f32,

    /// Refractory interval between triggers, milliseconds
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Also run during SPEAKING to allow barge-in
    #[serde(default)]
    pub detect_during_speaking: bool,
}

fn default_wake_model_path() -> String {
    "models/wake/kws.onnx".to_string()
}

fn default_keywords() -> Vec<String> {
    vec!["hey sona".to_string()]
}

fn default_wake_threshold() -> f32 {
    0.6
}

fn default_min_interval_ms() -> u64 {
    1500
}

impl Default for WakeWordOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            model_path: default_wake_model_path(),
            keywords: default_keywords(),
            threshold: default_wake_threshold(),
            min_interval_ms: default_min_interval_ms(),
            detect_during_speaking: false,
        }
    }
}

/// Tool dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOptions {
    /// Concurrent tool call bound; additional calls queue
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-call deadline in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// tools/list page size
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_call_timeout_secs() -> u64 {
    20
}

fn default_list_page_size() -> usize {
    32
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            call_timeout_secs: default_call_timeout_secs(),
            list_page_size: default_list_page_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityOptions {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityOptions {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from files and environment.
    ///
    /// Priority: env vars (`SONA_*`) > `config/{env}.yaml` > `config/default.yaml`
    /// > struct defaults.
    pub fn load(env: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(File::with_name("config/default").required(false));

        if let Some(env) = env {
            builder = builder.add_source(File::with_name(&format!("config/{env}")).required(false));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("SONA").separator("__"))
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings. Out-of-range values are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.websocket_url.is_empty() {
            return Err(ConfigError::Missing("network.websocket_url".into()));
        }
        if !self.network.websocket_url.starts_with("ws://")
            && !self.network.websocket_url.starts_with("wss://")
        {
            return Err(ConfigError::InvalidValue {
                field: "network.websocket_url".into(),
                message: "must start with ws:// or wss://".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(ConfigError::InvalidValue {
                field: "vad.threshold".into(),
                message: format!("must be between 0.0 and 1.0, got {}", self.vad.threshold),
            });
        }
        if self.vad.silence_timeout_ms < 100 || self.vad.silence_timeout_ms > 10_000 {
            return Err(ConfigError::InvalidValue {
                field: "vad.silence_timeout_ms".into(),
                message: "must be between 100 and 10000".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.wake_word.threshold) {
            return Err(ConfigError::InvalidValue {
                field: "wake_word.threshold".into(),
                message: format!("must be between 0.0 and 1.0, got {}", self.wake_word.threshold),
            });
        }

        if self.audio.output_sample_rate != 16000 && self.audio.output_sample_rate != 24000 {
            return Err(ConfigError::InvalidValue {
                field: "audio.output_sample_rate".into(),
                message: "must be 16000 or 24000".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.audio.playback_gain) {
            return Err(ConfigError::InvalidValue {
                field: "audio.playback_gain".into(),
                message: "must be between 0.0 and 1.0".into(),
            });
        }

        if self.tools.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tools.max_concurrent".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.tools.list_page_size == 0 || self.tools.list_page_size > 32 {
            return Err(ConfigError::InvalidValue {
                field: "tools.list_page_size".into(),
                message: "must be between 1 and 32".into(),
            });
        }

        if self.aec.stream_delay_ms > 500 {
            return Err(ConfigError::InvalidValue {
                field: "aec.stream_delay_ms".into(),
                message: "must be at most 500".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.vad.silence_timeout_ms, 800);
        assert_eq!(settings.tools.max_concurrent, 8);
        assert_eq!(settings.tools.call_timeout_secs, 20);
        assert!((settings.wake_word.threshold - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_vad_threshold_rejected() {
        let mut settings = Settings::default();
        settings.vad.threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_websocket_url_rejected() {
        let mut settings = Settings::default();
        settings.network.websocket_url = "http://not-a-ws".into();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_output_rate_must_be_supported() {
        let mut settings = Settings::default();
        settings.audio.output_sample_rate = 44100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_page_size_capped() {
        let mut settings = Settings::default();
        settings.tools.list_page_size = 64;
        assert!(settings.validate().is_err());
    }
}
