//! Relay over a WebSocket messaging service
//!
//! One connection per subscribed session at `{base_url}/{session_id}`. Each
//! signal is one JSON text frame. Publishing uses the connection opened by
//! `subscribe`, so a participant must subscribe before it publishes.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{RelayChannel, RelayError, RelaySubscription, SignalMessage};
use crate::session::SessionId;

/// WebSocket-backed [`RelayChannel`]
#[derive(Clone)]
pub struct WebSocketRelay {
    base_url: Url,
    writers: Arc<DashMap<SessionId, mpsc::UnboundedSender<Message>>>,
}

impl WebSocketRelay {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let base_url = Url::parse(base_url).map_err(|e| RelayError::Connection(format!("invalid relay url: {}", e)))?;
        Ok(Self {
            base_url,
            writers: Arc::new(DashMap::new()),
        })
    }

    fn session_url(&self, session_id: &SessionId) -> Result<Url, RelayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RelayError::Connection("relay url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(session_id.as_str());
        Ok(url)
    }
}

#[async_trait]
impl RelayChannel for WebSocketRelay {
    async fn publish(&self, message: SignalMessage) -> Result<(), RelayError> {
        let text = message.to_json()?;
        let writer = self
            .writers
            .get(&message.session_id)
            .map(|w| w.clone())
            .ok_or_else(|| RelayError::NotSubscribed(message.session_id.to_string()))?;
        writer
            .send(Message::Text(text.into()))
            .map_err(|_| RelayError::Publish("relay connection closed".to_string()))
    }

    async fn subscribe(&self, session_id: &SessionId) -> Result<RelaySubscription, RelayError> {
        let url = self.session_url(session_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        info!("Connected to relay {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!("Relay send failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_session = session_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                        Ok(signal) if signal.session_id == reader_session => {
                            if in_tx.send(signal).is_err() {
                                break;
                            }
                        }
                        Ok(signal) => debug!("Ignoring signal for session {}", signal.session_id),
                        Err(e) => warn!("Dropping malformed relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay closed the connection for {}", reader_session);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay receive failed: {}", e);
                        break;
                    }
                }
            }
        });

        self.writers.insert(session_id.clone(), out_tx);

        let writers = self.writers.clone();
        let unsubscribed = session_id.clone();
        Ok(RelaySubscription::new(session_id.clone(), in_rx, move || {
            // dropping the sender ends the writer, which closes the socket
            writers.remove(&unsubscribed);
            reader.abort();
            drop(writer);
            debug!("Unsubscribed from relay channel {}", unsubscribed);
        }))
    }
}
