//! # Publish/Subscribe Routing
//!
//! Local fan-out of store notifications to subscriptions. Both store
//! backends publish through a [`SubscriberRegistry`]; the Postgres backend
//! feeds it from its LISTEN connection.
//!
//! Every subscription owns a bounded buffer. When a subscriber falls behind
//! and its buffer is full, new notifications for it are dropped and counted,
//! the same way an external pub/sub transport sheds slow clients.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::pattern::ChannelPattern;
use crate::error::OrchBusResult;

/// A notification as delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification was published on
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
    pub payload: String,
}

struct SubscriberEntry {
    channels: HashSet<String>,
    patterns: Vec<ChannelPattern>,
    sender: mpsc::Sender<Notification>,
    dropped: Arc<AtomicU64>,
}

impl SubscriberEntry {
    /// Returns the matched pattern (if any) when the channel is of interest
    fn interest(&self, channel: &str) -> Option<Option<&ChannelPattern>> {
        if self.channels.contains(channel) {
            return Some(None);
        }
        self.patterns
            .iter()
            .find(|p| p.matches(channel))
            .map(Some)
    }
}

/// Routes published notifications to matching subscriptions
pub struct SubscriberRegistry {
    subscribers: DashMap<u64, SubscriberEntry>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.subscribers.len())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Register interest in exact channels and glob patterns
    pub fn subscribe(&self, channels: &[String], patterns: &[String]) -> OrchBusResult<Subscription> {
        let compiled = patterns
            .iter()
            .map(ChannelPattern::new)
            .collect::<OrchBusResult<Vec<_>>>()?;

        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers.insert(
            id,
            SubscriberEntry {
                channels: channels.iter().cloned().collect(),
                patterns: compiled,
                sender,
                dropped: Arc::clone(&dropped),
            },
        );

        debug!(
            subscription_id = id,
            channels = ?channels,
            patterns = ?patterns,
            buffer_size = self.buffer_size,
            "Subscription registered"
        );

        Ok(Subscription {
            id,
            receiver,
            dropped,
            capacity: self.buffer_size,
        })
    }

    /// Deliver to every interested subscriber; returns how many received it
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let Some(matched) = entry.interest(channel) else {
                continue;
            };

            let notification = Notification {
                channel: channel.to_string(),
                pattern: matched.map(|p| p.as_str().to_string()),
                payload: payload.to_string(),
            };

            match entry.sender.try_send(notification) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let total = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        subscription_id = *entry.key(),
                        channel = %channel,
                        dropped_total = total,
                        "Subscriber buffer full, notification dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            debug!(subscription_id = id, "Removed closed subscription");
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Notification>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Poll for the next notification, registering the task's waker when empty
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Notification>> {
        self.receiver.poll_recv(cx)
    }

    /// Take the next notification if one is buffered
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the next notification
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Notifications lost to buffer overflow since subscribing
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_and_pattern_routing() {
        let registry = SubscriberRegistry::new(16);
        let mut exact = registry
            .subscribe(&["PORT_TABLE_CHANNEL".to_string()], &[])
            .unwrap();
        let mut pattern = registry
            .subscribe(&[], &["__keyspace__:PORT_TABLE:*".to_string()])
            .unwrap();

        assert_eq!(registry.publish("PORT_TABLE_CHANNEL", "G"), 1);
        assert_eq!(registry.publish("__keyspace__:PORT_TABLE:Eth0", "hset"), 1);
        assert_eq!(registry.publish("unrelated", "x"), 0);

        let n = exact.try_recv().unwrap();
        assert_eq!(n.payload, "G");
        assert!(n.pattern.is_none());
        assert!(exact.try_recv().is_none());

        let n = pattern.try_recv().unwrap();
        assert_eq!(n.channel, "__keyspace__:PORT_TABLE:Eth0");
        assert_eq!(n.pattern.as_deref(), Some("__keyspace__:PORT_TABLE:*"));
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let registry = SubscriberRegistry::new(2);
        let mut sub = registry.subscribe(&["c".to_string()], &[]).unwrap();

        for i in 0..5 {
            registry.publish("c", &i.to_string());
        }

        assert_eq!(sub.dropped(), 3);
        assert_eq!(sub.try_recv().unwrap().payload, "0");
        assert_eq!(sub.try_recv().unwrap().payload, "1");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_subscription_is_pruned() {
        let registry = SubscriberRegistry::new(4);
        let sub = registry.subscribe(&["c".to_string()], &[]).unwrap();
        assert_eq!(registry.subscriber_count(), 1);
        drop(sub);

        assert_eq!(registry.publish("c", "x"), 0);
        assert_eq!(registry.subscriber_count(), 0);
    }
}
