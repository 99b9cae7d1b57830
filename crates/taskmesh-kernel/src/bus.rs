//! Subject-based message bus.
//!
//! The orchestrator talks to workers over a pub/sub bus with named
//! subjects, acknowledged delivery, and at-least-once semantics.  The
//! bus itself is an external collaborator; this module defines the
//! [`Bus`] trait the rest of taskmesh programs against, plus
//! [`MemoryBus`] -- a fully in-process implementation used by the CLI's
//! self-contained mode and by every test.
//!
//! `MemoryBus` retains messages published to a subject with no
//! subscriber yet and replays them to the first subscriber, mimicking a
//! durable subscription that was created before the publisher came up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A connection to a subject-based pub/sub bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to a subject.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a subject, receiving every subsequent publish.
    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Close the connection; further publishes and subscribes fail with
    /// [`KernelError::BusClosed`].
    async fn close(&self) -> Result<()>;
}

/// A message delivered to a subscriber.
///
/// The consumer must [`BusMessage::ack`] after processing; on an
/// at-least-once bus an unacked message may be redelivered.
#[derive(Debug)]
pub struct BusMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Raw message bytes.
    pub payload: Vec<u8>,
    acked: Arc<AtomicU64>,
}

impl BusMessage {
    /// Acknowledge processing of this message.
    pub fn ack(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }
}

/// Receiving side of a subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Await the next message; `None` once the bus is closed and the
    /// backlog is drained.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// URL scheme accepted by [`MemoryBus::connect`].
pub const MEMORY_SCHEME: &str = "mem://";

#[derive(Debug, Default)]
struct Topic {
    senders: Mutex<Vec<mpsc::UnboundedSender<BusMessage>>>,
    /// Backlog retained while the subject has no subscriber.
    pending: Mutex<VecDeque<Vec<u8>>>,
    published: AtomicU64,
    acked: Arc<AtomicU64>,
}

/// In-process bus backed by per-subject unbounded channels.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

#[derive(Debug, Default)]
struct MemoryBusInner {
    topics: DashMap<String, Arc<Topic>>,
    closed: AtomicBool,
}

impl MemoryBus {
    /// Create a fresh, open bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// "Connect" to an in-memory bus endpoint.
    ///
    /// Accepts only `mem://` URLs; anything else is a connection
    /// failure, mirroring how a remote bus client rejects a bad URL.
    pub fn connect(url: &str) -> Result<Self> {
        if !url.starts_with(MEMORY_SCHEME) {
            return Err(KernelError::InvalidBusUrl {
                url: url.to_string(),
                reason: format!("expected `{MEMORY_SCHEME}` scheme"),
            });
        }
        Ok(Self::new())
    }

    /// Whether [`Bus::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of messages published to a subject so far.
    pub fn published_count(&self, subject: &str) -> u64 {
        self.inner
            .topics
            .get(subject)
            .map(|t| t.published.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of messages acknowledged by subscribers of a subject.
    pub fn acked_count(&self, subject: &str) -> u64 {
        self.inner
            .topics
            .get(subject)
            .map(|t| t.acked.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn topic(&self, subject: &str) -> Arc<Topic> {
        self.inner
            .topics
            .entry(subject.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(KernelError::BusClosed);
        }
        let topic = self.topic(subject);
        topic.published.fetch_add(1, Ordering::Relaxed);

        let mut senders = topic.senders.lock().await;
        if senders.is_empty() {
            topic.pending.lock().await.push_back(payload);
            tracing::trace!(subject, "no subscriber, message retained");
            return Ok(());
        }
        senders.retain(|tx| {
            tx.send(BusMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
                acked: Arc::clone(&topic.acked),
            })
            .is_ok()
        });
        if senders.is_empty() {
            return Err(KernelError::PublishFailed {
                subject: subject.to_string(),
                reason: "all subscribers dropped".into(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        if self.is_closed() {
            return Err(KernelError::BusClosed);
        }
        let topic = self.topic(subject);
        let (tx, rx) = mpsc::unbounded_channel();

        // Same lock order as `publish` (senders, then pending) so no
        // message can land in the backlog between drain and
        // registration.
        let mut senders = topic.senders.lock().await;
        let mut pending = topic.pending.lock().await;
        while let Some(payload) = pending.pop_front() {
            let _ = tx.send(BusMessage {
                subject: subject.to_string(),
                payload,
                acked: Arc::clone(&topic.acked),
            });
        }
        drop(pending);
        senders.push(tx);
        drop(senders);
        tracing::trace!(subject, "subscriber added");
        Ok(Subscription { rx })
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        // Snapshot the topics first so no map guard is held across the
        // awaits below.  Dropping the senders ends every subscription.
        let topics: Vec<Arc<Topic>> = self
            .inner
            .topics
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for topic in topics {
            topic.senders.lock().await.clear();
        }
        tracing::debug!("memory bus closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("greetings").await.unwrap();

        bus.publish("greetings", b"hello".to_vec()).await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.subject, "greetings");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn retains_messages_until_first_subscribe() {
        let bus = MemoryBus::new();
        bus.publish("late", b"one".to_vec()).await.unwrap();
        bus.publish("late", b"two".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("late").await.unwrap();
        assert_eq!(sub.next().await.unwrap().payload, b"one");
        assert_eq!(sub.next().await.unwrap().payload, b"two");
    }

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let bus = MemoryBus::new();
        let mut s1 = bus.subscribe("fan").await.unwrap();
        let mut s2 = bus.subscribe("fan").await.unwrap();

        bus.publish("fan", b"x".to_vec()).await.unwrap();

        assert_eq!(s1.next().await.unwrap().payload, b"x");
        assert_eq!(s2.next().await.unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn ack_is_counted() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("counted").await.unwrap();
        bus.publish("counted", b"m".to_vec()).await.unwrap();

        assert_eq!(bus.acked_count("counted"), 0);
        sub.next().await.unwrap().ack();
        assert_eq!(bus.acked_count("counted"), 1);
        assert_eq!(bus.published_count("counted"), 1);
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish() {
        let bus = MemoryBus::new();
        bus.close().await.unwrap();
        let err = bus.publish("x", Vec::new()).await.unwrap_err();
        assert!(matches!(err, KernelError::BusClosed));
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("ending").await.unwrap();
        bus.publish("ending", b"last".to_vec()).await.unwrap();
        bus.close().await.unwrap();

        assert_eq!(sub.next().await.unwrap().payload, b"last");
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn connect_validates_scheme() {
        assert!(MemoryBus::connect("mem://local").is_ok());
        assert!(matches!(
            MemoryBus::connect("nats://10.0.0.1:4222"),
            Err(KernelError::InvalidBusUrl { .. })
        ));
    }
}
