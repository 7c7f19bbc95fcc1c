//! MQTT transport
//!
//! One publish topic each for capture audio and control JSON, one subscribe
//! topic each for playback audio and control JSON. Audio uses QoS 0 (stale
//! frames are worthless), control uses QoS 1. MQTT does not guarantee
//! cross-topic ordering, so each audio payload carries a 4-byte big-endian
//! sequence prefix the decoder uses for loss detection.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions as RumqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use sona_config::MqttOptions;
use sona_core::TransportError;

use crate::{Transport, TransportMessage};

const KEEP_ALIVE: Duration = Duration::from_secs(20);

/// MQTT variant of the transport interface.
pub struct MqttTransport {
    options: MqttOptions,
    client_id: String,
    device_id: String,
    connect_timeout: Duration,
    client: Option<AsyncClient>,
    event_loop: Option<Mutex<EventLoop>>,
    sequence: AtomicU32,
    connected: bool,
}

impl MqttTransport {
    pub fn new(
        options: MqttOptions,
        device_id: impl Into<String>,
        client_id: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            options,
            client_id: client_id.into(),
            device_id: device_id.into(),
            connect_timeout,
            client: None,
            event_loop: None,
            sequence: AtomicU32::new(0),
            connected: false,
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, token: &str) -> Result<(), TransportError> {
        let mut mqtt_options = RumqttOptions::new(
            self.client_id.clone(),
            self.options.host.clone(),
            self.options.port,
        );
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        mqtt_options.set_credentials(self.device_id.clone(), token);
        if self.options.tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 32);

        // Wait for the broker acknowledgement before reporting success.
        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(TransportError::ConnectTimeout)?;
            match tokio::time::timeout(remaining, event_loop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(TransportError::ConnectFailed(e.to_string())),
                Err(_) => return Err(TransportError::ConnectTimeout),
            }
        }

        client
            .subscribe(self.options.subscribe_audio_topic.as_str(), QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        client
            .subscribe(
                self.options.subscribe_control_topic.as_str(),
                QoS::AtLeastOnce,
            )
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        self.client = Some(client);
        self.event_loop = Some(Mutex::new(event_loop));
        self.sequence.store(0, Ordering::Relaxed);
        self.connected = true;

        tracing::info!(
            host = %self.options.host,
            port = self.options.port,
            "mqtt connected"
        );
        Ok(())
    }

    async fn send_text(&self, json: String) -> Result<(), TransportError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError::Send("not connected".into()))?;
        client
            .publish(
                self.options.publish_control_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                json,
            )
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_binary(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut payload = Vec::with_capacity(packet.len() + 4);
        payload.extend_from_slice(&sequence.to_be_bytes());
        payload.extend_from_slice(&packet);

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError::Send("not connected".into()))?;
        client
            .publish(
                self.options.publish_audio_topic.as_str(),
                QoS::AtMostOnce,
                false,
                payload,
            )
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<TransportMessage, TransportError> {
        let event_loop = self
            .event_loop
            .as_mut()
            .ok_or_else(|| TransportError::Closed("not connected".into()))?
            .get_mut();

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == self.options.subscribe_audio_topic {
                        if publish.payload.len() < 4 {
                            tracing::warn!(
                                len = publish.payload.len(),
                                "audio payload shorter than sequence prefix, dropped"
                            );
                            continue;
                        }
                        let sequence = u32::from_be_bytes([
                            publish.payload[0],
                            publish.payload[1],
                            publish.payload[2],
                            publish.payload[3],
                        ]) as u64;
                        return Ok(TransportMessage::Binary {
                            sequence: Some(sequence),
                            packet: publish.payload[4..].to_vec(),
                        });
                    } else if publish.topic == self.options.subscribe_control_topic {
                        let text = String::from_utf8_lossy(&publish.payload).into_owned();
                        return Ok(TransportMessage::Text(text));
                    } else {
                        tracing::debug!(topic = %publish.topic, "unexpected topic, ignored");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected = false;
                    return Err(TransportError::Closed("broker disconnect".into()));
                }
                Ok(_) => continue,
                Err(e) => {
                    self.connected = false;
                    return Err(TransportError::Closed(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.event_loop = None;
        self.connected = false;
        tracing::debug!("mqtt closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = MqttTransport::new(
            MqttOptions::default(),
            "device",
            "client",
            Duration::from_secs(1),
        );
        assert!(!transport.is_connected());
        assert!(transport.send_text("{}".into()).await.is_err());
    }

    #[test]
    fn test_sequence_prefix_layout() {
        // The prefix the decoder strips: 4-byte big-endian counter
        let sequence: u32 = 0x01020304;
        let mut payload = sequence.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xAA, 0xBB]);

        let parsed =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64;
        assert_eq!(parsed, 0x01020304);
        assert_eq!(&payload[4..], &[0xAA, 0xBB]);
    }
}
