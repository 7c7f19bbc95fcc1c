//! Duplex transports: WebSocket and MQTT
//!
//! Both variants implement the same [`Transport`] interface: framed text
//! (JSON control) and binary (one Opus packet per message), TLS in transit.
//! Reconnection policy (exponential backoff with jitter, bounded attempts)
//! is provided by [`Backoff`] and driven by the session state machine; each
//! reconnect starts a fresh session, there is no mid-stream resumption.

pub mod backoff;
pub mod handle;
pub mod messages;
pub mod mqtt;
pub mod websocket;

pub use backoff::Backoff;
pub use handle::{InboundItem, TransportCmd, TransportHandle};
pub use messages::{
    AudioParams, HelloAck, InboundMessage, ListenState, OutboundMessage, TtsState,
    PROTOCOL_VERSION,
};
pub use mqtt::MqttTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;

use sona_core::TransportError;

/// One message received from the peer.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    /// A JSON control message
    Text(String),
    /// One Opus packet. `sequence` is carried in-band on MQTT (4-byte
    /// big-endian prefix); WebSocket delivery is order-preserving and the
    /// receiver numbers packets itself.
    Binary {
        sequence: Option<u64>,
        packet: Vec<u8>,
    },
}

/// Bidirectional message channel to the AI service.
#[async_trait]
pub trait Transport: Send {
    /// Establish the channel using the validated session token.
    async fn connect(&mut self, token: &str) -> Result<(), TransportError>;

    /// Send one JSON control message.
    async fn send_text(&self, json: String) -> Result<(), TransportError>;

    /// Send one Opus packet.
    async fn send_binary(&self, packet: Vec<u8>) -> Result<(), TransportError>;

    /// Receive the next message. Errors indicate connection loss.
    async fn recv(&mut self) -> Result<TransportMessage, TransportError>;

    /// Close the channel.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the channel is currently open.
    fn is_connected(&self) -> bool;
}
