//! WebSocket transport
//!
//! Single TLS connection. Text frames carry one JSON control message each,
//! binary frames one Opus packet. Liveness: a ping every 20 s, with the peer
//! declared dead after three unanswered pings.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use sona_core::TransportError;

use crate::{Transport, TransportMessage, PROTOCOL_VERSION};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_MISSED_PONGS: u32 = 3;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket variant of the transport interface.
pub struct WebSocketTransport {
    url: String,
    device_id: String,
    client_id: String,
    connect_timeout: Duration,
    write: Option<Arc<Mutex<WsSink>>>,
    read: Option<WsSource>,
    ping_timer: Option<tokio::time::Interval>,
    pending_pongs: u32,
    connected: bool,
}

impl WebSocketTransport {
    pub fn new(
        url: impl Into<String>,
        device_id: impl Into<String>,
        client_id: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            device_id: device_id.into(),
            client_id: client_id.into(),
            connect_timeout,
            write: None,
            read: None,
            ping_timer: None,
            pending_pongs: 0,
            connected: false,
        }
    }

    fn sink(&self) -> Result<Arc<Mutex<WsSink>>, TransportError> {
        self.write
            .clone()
            .ok_or_else(|| TransportError::Send("not connected".into()))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, token: &str) -> Result<(), TransportError> {
        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?,
        );
        headers.insert(
            "Protocol-Version",
            HeaderValue::from_str(&PROTOCOL_VERSION.to_string())
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?,
        );
        headers.insert(
            "Device-Id",
            HeaderValue::from_str(&self.device_id)
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?,
        );
        headers.insert(
            "Client-Id",
            HeaderValue::from_str(&self.client_id)
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?,
        );

        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(request))
                .await
                .map_err(|_| TransportError::ConnectTimeout)?
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (write, read) = stream.split();
        self.write = Some(Arc::new(Mutex::new(write)));
        self.read = Some(read);

        let mut timer = tokio::time::interval(PING_INTERVAL);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.reset();
        self.ping_timer = Some(timer);
        self.pending_pongs = 0;
        self.connected = true;

        tracing::info!(url = %self.url, "websocket connected");
        Ok(())
    }

    async fn send_text(&self, json: String) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let mut guard = sink.lock().await;
        guard
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_binary(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let mut guard = sink.lock().await;
        guard
            .send(Message::Binary(packet))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<TransportMessage, TransportError> {
        let write = self.sink()?;
        let read = self
            .read
            .as_mut()
            .ok_or_else(|| TransportError::Closed("not connected".into()))?;
        let timer = self
            .ping_timer
            .as_mut()
            .ok_or_else(|| TransportError::Closed("not connected".into()))?;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if self.pending_pongs >= MAX_MISSED_PONGS {
                        self.connected = false;
                        return Err(TransportError::Closed("dead peer: missed pongs".into()));
                    }
                    write
                        .lock()
                        .await
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string()))?;
                    self.pending_pongs += 1;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        return Ok(TransportMessage::Text(text));
                    }
                    Some(Ok(Message::Binary(packet))) => {
                        return Ok(TransportMessage::Binary { sequence: None, packet });
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.pending_pongs = 0;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.lock().await.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        self.connected = false;
                        return Err(TransportError::Closed(format!("peer closed: {frame:?}")));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.connected = false;
                        return Err(TransportError::Closed(e.to_string()));
                    }
                    None => {
                        self.connected = false;
                        return Err(TransportError::Closed("stream ended".into()));
                    }
                },
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(write) = self.write.take() {
            let mut sink = write.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        self.read = None;
        self.ping_timer = None;
        self.pending_pongs = 0;
        self.connected = false;
        tracing::debug!("websocket closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
