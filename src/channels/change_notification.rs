//! # Change Notification Channel
//!
//! Follows a table through the store's own keyspace notifications, so any
//! client writing the table is observed without cooperating. A notification
//! names the key and a coarse operation tag but carries no values: deletions
//! are emitted directly, everything else is re-read at pop time.
//!
//! That re-read is a known gap. A write immediately followed by a delete can
//! surface as the write's notification arriving after the record is already
//! gone; the consumer then reports a SET with whatever it reads, which may be
//! nothing. The channel is for sources where that staleness is acceptable.
//!
//! Nothing is persisted for this channel: events published while the
//! consumer is down are lost. On construction the consumer dumps every record
//! already in the table as SET items so it starts from the current state.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, instrument, warn};

use super::signal::NotificationBuffer;
use super::table::{TableName, TableReader};
use super::{ChannelStats, ConsumerChannel, WorkItem};
use crate::constants::keyspace_ops;
use crate::error::OrchBusResult;
use crate::select::Selectable;
use crate::store::{Notification, SharedStore};

/// Operation tags that mean the record is gone
fn is_removal(op: &str) -> bool {
    matches!(
        op,
        keyspace_ops::DEL | keyspace_ops::EXPIRED | keyspace_ops::EVICTED
    )
}

/// Consumes keyspace notifications for one table
#[derive(Debug)]
pub struct ChangeNotificationConsumer {
    store: Arc<dyn SharedStore>,
    table: TableName,
    keyspace_prefix: String,
    buffer: NotificationBuffer,
    initial: VecDeque<WorkItem>,
    stats: ChannelStats,
}

impl ChangeNotificationConsumer {
    /// Subscribe to the table's keyspace and queue the existing records
    #[instrument(skip(store), fields(table = %table))]
    pub async fn new(store: Arc<dyn SharedStore>, table: TableName) -> OrchBusResult<Self> {
        let subscription = store.subscribe(&[], &[table.keyspace_pattern()]).await?;
        let buffer = NotificationBuffer::new(table.as_str(), subscription);

        let reader = TableReader::new(Arc::clone(&store), table.clone());
        let mut initial = VecDeque::new();
        for key in reader.keys().await? {
            if let Some(fields) = reader.get(&key).await? {
                initial.push_back(WorkItem::set(key, fields));
            }
        }
        info!(records = initial.len(), "Queued initial table dump");

        Ok(Self {
            keyspace_prefix: table.keyspace_prefix(),
            store,
            table,
            buffer,
            initial,
            stats: ChannelStats::default(),
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    fn pending(&self) -> usize {
        self.initial.len() + self.buffer.len()
    }

    /// Put a partially collected batch back ahead of everything still pending
    fn requeue(&mut self, items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }
        warn!(requeued = items.len(), "Re-read failed mid-batch, requeued collected items");
        for item in items.into_iter().rev() {
            self.initial.push_front(item);
        }
    }

    async fn resolve(&mut self, notification: Notification) -> OrchBusResult<Option<WorkItem>> {
        let Some(key) = notification.channel.strip_prefix(&self.keyspace_prefix) else {
            self.stats.parse_errors += 1;
            warn!(channel = %notification.channel, "Notification outside the table keyspace");
            return Ok(None);
        };

        if is_removal(&notification.payload) {
            return Ok(Some(WorkItem::del(key)));
        }

        // The record may already have changed again; report what is there now
        let fields = self
            .store
            .hash_get_all(&self.table.record_key(key))
            .await?;
        if fields.is_empty() {
            debug!(
                key = %key,
                op = %notification.payload,
                "Record already gone when re-read"
            );
        }
        Ok(Some(WorkItem::set(key, fields)))
    }
}

impl Selectable for ChangeNotificationConsumer {
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        self.buffer.poll_read(cx)
    }

    fn has_data(&self) -> bool {
        self.pending() > 0
    }

    fn has_cached_data(&self) -> bool {
        self.pending() > 1
    }

    fn update_after_read(&mut self) {}

    fn name(&self) -> &str {
        self.table.as_str()
    }
}

#[async_trait]
impl ConsumerChannel for ChangeNotificationConsumer {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn pop(&mut self, max_n: usize) -> OrchBusResult<Vec<WorkItem>> {
        self.stats.pops += 1;
        let mut items = Vec::with_capacity(max_n.min(self.pending()));

        while items.len() < max_n {
            let Some(item) = self.initial.pop_front() else {
                break;
            };
            items.push(item);
        }

        while items.len() < max_n {
            let Some(notification) = self.buffer.front().cloned() else {
                break;
            };
            // Only consume the notification once its re-read succeeded
            let resolved = match self.resolve(notification).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    self.requeue(items);
                    return Err(e);
                }
            };
            self.buffer.pop_front();
            if let Some(item) = resolved {
                items.push(item);
            }
        }

        self.stats.items_popped += items.len() as u64;
        debug!(popped = items.len(), remaining = self.pending(), "Popped change notifications");
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
