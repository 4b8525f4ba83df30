//! # Self-Contained Message Channel
//!
//! The producer publishes the whole event as the notification payload and the
//! consumer never reads anything back from the store. Every event is seen with
//! the data it had when it was produced, which matters for events raised from
//! hardware callbacks where the state may already have moved on.
//!
//! Delivery is at-least-once only while connected: nothing is persisted, and
//! the transport's bounded buffer drops events when the consumer falls behind.

use async_trait::async_trait;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, instrument, warn};

use super::signal::NotificationBuffer;
use super::{ChannelStats, ConsumerChannel, WorkItem};
use crate::error::{OrchBusError, OrchBusResult};
use crate::select::Selectable;
use crate::store::{FieldValues, SharedStore};

/// Publishes complete events on a channel
#[derive(Debug, Clone)]
pub struct SelfContainedMessageProducer {
    store: Arc<dyn SharedStore>,
    channel: String,
}

impl SelfContainedMessageProducer {
    pub fn new(store: Arc<dyn SharedStore>, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish one event; returns how many subscribers received it
    ///
    /// Fails with [`OrchBusError::PayloadTooLarge`] when the encoded event
    /// exceeds the store's payload limit.
    pub async fn send(&self, item: &WorkItem) -> OrchBusResult<usize> {
        let payload = serde_json::to_string(item)?;
        let limit = self.store.max_payload_size();
        if payload.len() > limit {
            warn!(
                channel = %self.channel,
                key = %item.key,
                size_bytes = payload.len(),
                limit_bytes = limit,
                "Event too large to publish"
            );
            return Err(OrchBusError::PayloadTooLarge {
                size_bytes: payload.len(),
                limit_bytes: limit,
            });
        }
        self.store.publish(&self.channel, &payload).await
    }

    pub async fn set(&self, key: &str, fields: FieldValues) -> OrchBusResult<usize> {
        self.send(&WorkItem::set(key, fields)).await
    }

    pub async fn del(&self, key: &str) -> OrchBusResult<usize> {
        self.send(&WorkItem::del(key)).await
    }
}

/// Buffers and decodes events published on a channel
#[derive(Debug)]
pub struct SelfContainedMessageConsumer {
    channel: String,
    buffer: NotificationBuffer,
    stats: ChannelStats,
}

impl SelfContainedMessageConsumer {
    pub async fn new(store: Arc<dyn SharedStore>, channel: impl Into<String>) -> OrchBusResult<Self> {
        let channel = channel.into();
        let subscription = store.subscribe(&[channel.clone()], &[]).await?;
        let buffer = NotificationBuffer::new(channel.clone(), subscription);
        Ok(Self {
            channel,
            buffer,
            stats: ChannelStats::default(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next decodable event without consuming it
    ///
    /// Undecodable payloads at the front of the buffer are discarded.
    pub fn peek(&mut self) -> Option<WorkItem> {
        while let Some(notification) = self.buffer.front() {
            match serde_json::from_str::<WorkItem>(&notification.payload) {
                Ok(item) => return Some(item),
                Err(e) => {
                    self.discard_malformed(&e);
                }
            }
        }
        None
    }

    /// Pop the next buffered payload and decode it
    fn next_item(&mut self) -> Option<WorkItem> {
        while let Some(notification) = self.buffer.pop_front() {
            match serde_json::from_str::<WorkItem>(&notification.payload) {
                Ok(item) => return Some(item),
                Err(e) => {
                    self.stats.parse_errors += 1;
                    warn!(channel = %self.channel, error = %e, payload = %notification.payload, "Skipping malformed event");
                }
            }
        }
        None
    }

    fn discard_malformed(&mut self, error: &serde_json::Error) {
        if let Some(notification) = self.buffer.pop_front() {
            self.stats.parse_errors += 1;
            warn!(channel = %self.channel, error = %error, payload = %notification.payload, "Skipping malformed event");
        }
    }
}

impl Selectable for SelfContainedMessageConsumer {
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        self.buffer.poll_read(cx)
    }

    fn has_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn has_cached_data(&self) -> bool {
        self.buffer.len() > 1
    }

    fn update_after_read(&mut self) {}

    fn name(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ConsumerChannel for SelfContainedMessageConsumer {
    #[instrument(skip(self), fields(channel = %self.channel))]
    async fn pop(&mut self, max_n: usize) -> OrchBusResult<Vec<WorkItem>> {
        self.stats.pops += 1;
        let mut items = Vec::with_capacity(max_n.min(self.buffer.len()));
        while items.len() < max_n {
            match self.next_item() {
                Some(item) => items.push(item),
                None => break,
            }
        }

        self.stats.items_popped += items.len() as u64;
        debug!(popped = items.len(), remaining = self.buffer.len(), "Popped events");
        Ok(items)
    }

    fn rearm(&mut self) {}

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            notifications_dropped: self.buffer.dropped(),
            ..self.stats.clone()
        }
    }
}
