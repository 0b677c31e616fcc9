//! Duplex transport behind the stream client.
//!
//! A [`Connector`] opens one connection and hands back a pair of text-frame
//! channels. The inbound channel closing is the only close signal the client
//! needs; dropping the outbound sender closes the socket.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::error::TransportError;

/// An open push connection.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection. Each call is one attempt.
    async fn connect(&self) -> Result<Connection, TransportError>;

    fn endpoint(&self) -> &str;
}

/// WebSocket connector over tokio-tungstenite.
pub struct WebSocketConnector {
    url: String,
    /// Upper bound on the TCP, TLS and upgrade handshake.
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let handshake = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
        let (ws, _) = match handshake.await {
            Ok(result) => result.map_err(|e| TransportError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(TransportError::Connect {
                    url: self.url.clone(),
                    reason: format!("handshake timed out after {:?}", self.connect_timeout),
                });
            }
        };

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let url = self.url.clone();

        // Pump task: lives exactly as long as the socket.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                debug!(%url, error = %e, "WebSocket send failed");
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text.to_string()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(%url, ?frame, "WebSocket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {} // Ping/Pong/Binary
                        Some(Err(e)) => {
                            debug!(%url, error = %e, "WebSocket receive error");
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!(%url, "WebSocket pump finished");
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}
