//! WebSocket fan-out of broadcast events.

use axum::extract::ws::{Message, WebSocket};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use alcowatch_ingestor::broadcast::{BroadcastEvent, BroadcastSink};

/// Broadcast channel behind the core's sink. Sending never waits: slow
/// subscribers lag and skip events instead of holding up ingestion.
#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Hub { tx }
    }

    /// Sink to install on the connection manager.
    pub fn sink(&self) -> BroadcastSink {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            // No subscribers is not an error
            let _ = tx.send(event);
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Streams events to one client as JSON text frames until either side
/// closes.
pub async fn serve_socket(mut socket: WebSocket, mut events: broadcast::Receiver<BroadcastEvent>) {
    info!("WebSocket subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive failed");
                    break;
                }
            },
        }
    }

    info!("WebSocket subscriber disconnected");
}
