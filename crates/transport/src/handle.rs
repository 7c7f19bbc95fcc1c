//! Transport task handle
//!
//! The session state machine never holds the transport directly; a dedicated
//! task owns it and exchanges messages over channels. Inbound messages are
//! tagged with a session generation so frames from a torn-down connection
//! cannot leak into the next session.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sona_core::TransportError;

use crate::{Transport, TransportMessage};

/// Commands accepted by the transport task.
#[derive(Debug)]
pub enum TransportCmd {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// One inbound item: session generation plus the received message or the
/// error that ended the connection.
pub type InboundItem = (u64, Result<TransportMessage, TransportError>);

/// Handle to a running transport task.
pub struct TransportHandle {
    cmd_tx: mpsc::Sender<TransportCmd>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Take ownership of a connected transport and serve it until close or
    /// connection loss. Exactly one `Err` item is emitted on loss.
    pub fn spawn(
        mut transport: Box<dyn Transport>,
        inbound_tx: mpsc::Sender<InboundItem>,
        generation: u64,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<TransportCmd>(64);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(TransportCmd::Text(json)) => {
                            if let Err(e) = transport.send_text(json).await {
                                tracing::warn!(error = %e, "send_text failed");
                                let _ = inbound_tx.send((generation, Err(e))).await;
                                break;
                            }
                        }
                        Some(TransportCmd::Binary(packet)) => {
                            if let Err(e) = transport.send_binary(packet).await {
                                tracing::warn!(error = %e, "send_binary failed");
                                let _ = inbound_tx.send((generation, Err(e))).await;
                                break;
                            }
                        }
                        Some(TransportCmd::Close) | None => {
                            let _ = transport.close().await;
                            break;
                        }
                    },
                    message = transport.recv() => match message {
                        Ok(message) => {
                            if inbound_tx.send((generation, Ok(message))).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = inbound_tx.send((generation, Err(e))).await;
                            break;
                        }
                    },
                }
            }
            tracing::debug!(generation, "transport task ended");
        });

        Self { cmd_tx, task }
    }

    pub async fn send_text(&self, json: String) -> Result<(), TransportError> {
        self.cmd_tx
            .send(TransportCmd::Text(json))
            .await
            .map_err(|_| TransportError::Send("transport task gone".into()))
    }

    pub async fn send_binary(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.cmd_tx
            .send(TransportCmd::Binary(packet))
            .await
            .map_err(|_| TransportError::Send("transport task gone".into()))
    }

    /// Graceful close; the task exits after flushing the close frame.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(TransportCmd::Close).await;
        let _ = self.task.await;
    }

    /// Hard cancellation for force-teardown paths.
    pub fn abort(&self) {
        self.task.abort();
    }
}
