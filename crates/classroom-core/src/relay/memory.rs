//! Process-local relay backed by tokio broadcast channels

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{RelayChannel, RelayError, RelaySubscription, SignalMessage};
use crate::session::SessionId;

const CHANNEL_CAPACITY: usize = 1024;

/// Relay where every subscriber of a session sees every message, in publish order
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    channels: Arc<DashMap<SessionId, broadcast::Sender<SignalMessage>>>,
    offline: Arc<AtomicBool>,
    published: Arc<Mutex<Vec<SignalMessage>>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, `publish` fails
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every message accepted so far
    pub fn published(&self) -> Vec<SignalMessage> {
        self.published.lock().clone()
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.channels
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, session_id: &SessionId) -> broadcast::Sender<SignalMessage> {
        self.channels
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl RelayChannel for InMemoryRelay {
    async fn publish(&self, message: SignalMessage) -> Result<(), RelayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RelayError::Publish("relay offline".to_string()));
        }
        self.published.lock().push(message.clone());
        // No subscribers is not an error; the message is simply not delivered
        let _ = self.sender(&message.session_id).send(message);
        Ok(())
    }

    async fn subscribe(&self, session_id: &SessionId) -> Result<RelaySubscription, RelayError> {
        let mut source = self.sender(session_id).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        let forward_session = session_id.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Relay subscriber for {} lagged, {} signals dropped", forward_session, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!("Subscribed to relay channel {}", session_id);
        let unsubscribed = session_id.clone();
        Ok(RelaySubscription::new(session_id.clone(), rx, move || {
            forwarder.abort();
            debug!("Unsubscribed from relay channel {}", unsubscribed);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{IceCandidate, SessionDescription};
    use crate::relay::SignalBody;

    fn offer(sender: &str) -> SignalMessage {
        SignalMessage::new("s".into(), sender.into(), &SignalBody::Offer(SessionDescription::offer("v=0"))).unwrap()
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let relay = InMemoryRelay::new();
        let mut sub = relay.subscribe(&"s".into()).await.unwrap();

        relay.publish(offer("t")).await.unwrap();
        for i in 0..5 {
            let body = SignalBody::IceCandidate(IceCandidate::new(format!("candidate:{}", i)));
            relay.publish(SignalMessage::new("s".into(), "t".into(), &body).unwrap()).await.unwrap();
        }

        assert_eq!(sub.recv().await.unwrap().kind, crate::relay::SignalKind::Offer);
        for i in 0..5 {
            match sub.recv().await.unwrap().body().unwrap() {
                SignalBody::IceCandidate(c) => assert_eq!(c.candidate, format!("candidate:{}", i)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let relay = InMemoryRelay::new();
        let mut other = relay.subscribe(&"other".into()).await.unwrap();
        relay.publish(offer("t")).await.unwrap();

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(50), other.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let relay = InMemoryRelay::new();
        let sub = relay.subscribe(&"s".into()).await.unwrap();
        assert_eq!(relay.subscriber_count(&"s".into()), 1);

        drop(sub);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(relay.subscriber_count(&"s".into()), 0);
    }

    #[tokio::test]
    async fn test_offline_publish_fails() {
        let relay = InMemoryRelay::new();
        relay.set_offline(true);
        assert!(matches!(relay.publish(offer("t")).await, Err(RelayError::Publish(_))));
        assert!(relay.published().is_empty());
    }
}
