//! # Ordered Queue Channel
//!
//! Every producer operation is appended to one store list and replayed by the
//! consumer in exactly that order. Nothing is coalesced: 100 writes to one key
//! are 100 work items. Use it where each step matters, for example when every
//! programming step must be replayed even if a later one reverses it.
//!
//! List entries are JSON-encoded [`WorkItem`]s; the list entry is the data, so
//! the consumer never reads anything else from the store.

use async_trait::async_trait;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, instrument, warn};

use super::signal::SignalCounter;
use super::table::TableName;
use super::{ChannelStats, ConsumerChannel, WorkItem};
use crate::constants::keys::SIGNAL_TOKEN;
use crate::error::OrchBusResult;
use crate::select::Selectable;
use crate::store::{AtomicScript, FieldValues, SharedStore};

/// Appends operations to the back of a table's queue
#[derive(Debug, Clone)]
pub struct OrderedQueueProducer {
    store: Arc<dyn SharedStore>,
    table: TableName,
}

impl OrderedQueueProducer {
    pub fn new(store: Arc<dyn SharedStore>, table: TableName) -> Self {
        Self { store, table }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub async fn set(&self, key: &str, fields: FieldValues) -> OrchBusResult<usize> {
        self.push(WorkItem::set(key, fields)).await
    }

    pub async fn del(&self, key: &str) -> OrchBusResult<usize> {
        self.push(WorkItem::del(key)).await
    }

    /// Append one operation; returns the queue length afterwards
    pub async fn push(&self, item: WorkItem) -> OrchBusResult<usize> {
        self.push_batch(vec![item]).await
    }

    /// Append several operations atomically behind a single wake-up token
    #[instrument(skip(self, items), fields(table = %self.table, count = items.len()))]
    pub async fn push_batch(&self, items: Vec<WorkItem>) -> OrchBusResult<usize> {
        let entries = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let script = AtomicScript::ListPushAndPublish {
            list: self.table.queue(),
            entries,
            channel: self.table.channel(),
            payload: SIGNAL_TOKEN.to_string(),
        };
        let name = script.name();
        let len = self.store.eval(script).await?.into_count(name)?;
        debug!(queue_len = len, "Queued operations");
        Ok(len)
    }
}

/// Pops operations from the front of a table's queue, oldest first
#[derive(Debug)]
pub struct OrderedQueueConsumer {
    store: Arc<dyn SharedStore>,
    table: TableName,
    signal: SignalCounter,
    stats: ChannelStats,
}

impl OrderedQueueConsumer {
    /// Subscribe to the table's wake-up channel and pick up any queued backlog
    pub async fn new(store: Arc<dyn SharedStore>, table: TableName) -> OrchBusResult<Self> {
        let subscription = store.subscribe(&[table.channel()], &[]).await?;
        let backlog = store.list_len(&table.queue()).await?;
        let signal = SignalCounter::new(table.as_str(), subscription, backlog);

        Ok(Self {
            store,
            table,
            signal,
            stats: ChannelStats::default(),
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }
}

impl Selectable for OrderedQueueConsumer {
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        self.signal.poll_read(cx)
    }

    fn has_data(&self) -> bool {
        self.signal.has_data()
    }

    fn has_cached_data(&self) -> bool {
        self.signal.has_cached_data()
    }

    fn update_after_read(&mut self) {
        self.signal.update_after_read()
    }

    fn name(&self) -> &str {
        self.table.as_str()
    }
}

#[async_trait]
impl ConsumerChannel for OrderedQueueConsumer {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn pop(&mut self, max_n: usize) -> OrchBusResult<Vec<WorkItem>> {
        self.stats.pops += 1;
        if max_n == 0 {
            return Ok(Vec::new());
        }

        let script = AtomicScript::ListPopFront {
            list: self.table.queue(),
            max: max_n,
        };
        let name = script.name();
        let entries = self.store.eval(script).await?.into_entries(name)?;
        self.signal.settle(entries.len(), max_n);

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<WorkItem>(&entry) {
                Ok(item) => items.push(item),
                Err(e) => {
                    self.stats.parse_errors += 1;
                    warn!(error = %e, entry = %entry, "Skipping malformed queue entry");
                }
            }
        }

        self.stats.items_popped += items.len() as u64;
        debug!(popped = items.len(), "Popped ordered operations");
        Ok(items)
    }

    fn rearm(&mut self) {
        self.signal.rearm();
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            notifications_dropped: self.signal.dropped(),
            ..self.stats.clone()
        }
    }
}
