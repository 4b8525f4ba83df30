//! # Coalescing State Channel
//!
//! Producers never touch the visible table. A write merges the new fields into
//! a per-key staging record and marks the key pending; a delete drops the
//! staging record and sets a delete marker. However many times a key changes
//! between two pops, it is pending once and materializes once, with the latest
//! state.
//!
//! The consumer's pop is a single [`AtomicScript::CoalescedPop`]: it pops
//! random pending keys, applies each key's delete marker, moves the staged
//! fields into the visible record and reports what it materialized. Because
//! the delete-marker check and the staging read happen in the same atomic
//! step, a delete can never be overtaken by an older write.
//!
//! Many producers may share a table. There must be exactly one consumer.

use async_trait::async_trait;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, instrument};

use super::signal::SignalCounter;
use super::table::TableName;
use super::{ChannelStats, ConsumerChannel, WorkItem};
use crate::constants::keys::SIGNAL_TOKEN;
use crate::error::OrchBusResult;
use crate::select::Selectable;
use crate::store::{AtomicScript, CoalescingLayout, FieldValues, SharedStore};

/// Writes staged state for a table
#[derive(Debug, Clone)]
pub struct CoalescingStateProducer {
    store: Arc<dyn SharedStore>,
    table: TableName,
    layout: CoalescingLayout,
}

impl CoalescingStateProducer {
    pub fn new(store: Arc<dyn SharedStore>, table: TableName) -> Self {
        let layout = table.coalescing_layout();
        Self {
            store,
            table,
            layout,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Stage fields for `key`; fields not mentioned keep their staged value
    ///
    /// An empty field list stages nothing and is ignored.
    pub async fn set(&self, key: &str, fields: FieldValues) -> OrchBusResult<()> {
        if fields.is_empty() {
            debug!(table = %self.table, key = %key, "Ignoring write without fields");
            return Ok(());
        }
        let newly_pending = self
            .eval_count(AtomicScript::StageWrite {
                layout: self.layout.clone(),
                key: key.to_string(),
                fields,
                token: SIGNAL_TOKEN.to_string(),
            })
            .await?;
        debug!(table = %self.table, key = %key, newly_pending, "Staged write");
        Ok(())
    }

    /// Stage a delete for `key`, discarding any staged fields
    pub async fn del(&self, key: &str) -> OrchBusResult<()> {
        let newly_pending = self
            .eval_count(AtomicScript::StageDelete {
                layout: self.layout.clone(),
                key: key.to_string(),
                token: SIGNAL_TOKEN.to_string(),
            })
            .await?;
        debug!(table = %self.table, key = %key, newly_pending, "Staged delete");
        Ok(())
    }

    pub async fn set_batch(&self, entries: Vec<(String, FieldValues)>) -> OrchBusResult<()> {
        for (key, fields) in entries {
            self.set(&key, fields).await?;
        }
        Ok(())
    }

    pub async fn del_batch(&self, keys: &[String]) -> OrchBusResult<()> {
        for key in keys {
            self.del(key).await?;
        }
        Ok(())
    }

    /// Keys staged but not yet popped by the consumer
    pub async fn pending_count(&self) -> OrchBusResult<usize> {
        self.store.set_card(&self.layout.pending_set).await
    }

    /// Discard all pending work; returns how many keys were dropped
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn clear(&self) -> OrchBusResult<usize> {
        let dropped = self
            .eval_count(AtomicScript::CoalescedClear {
                layout: self.layout.clone(),
            })
            .await?;
        info!(dropped, "Cleared pending state");
        Ok(dropped)
    }

    async fn eval_count(&self, script: AtomicScript) -> OrchBusResult<usize> {
        let name = script.name();
        self.store.eval(script).await?.into_count(name)
    }
}

/// Materializes staged state into the visible table
#[derive(Debug)]
pub struct CoalescingStateConsumer {
    store: Arc<dyn SharedStore>,
    table: TableName,
    layout: CoalescingLayout,
    signal: SignalCounter,
    stats: ChannelStats,
}

impl CoalescingStateConsumer {
    /// Subscribe to the table's wake-up channel and pick up keys left pending
    pub async fn new(store: Arc<dyn SharedStore>, table: TableName) -> OrchBusResult<Self> {
        let layout = table.coalescing_layout();
        let subscription = store.subscribe(&[layout.channel.clone()], &[]).await?;
        let backlog = store.set_card(&layout.pending_set).await?;
        let signal = SignalCounter::new(table.as_str(), subscription, backlog);

        Ok(Self {
            store,
            table,
            layout,
            signal,
            stats: ChannelStats::default(),
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }
}

impl Selectable for CoalescingStateConsumer {
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
impl ConsumerChannel for CoalescingStateConsumer {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn pop(&mut self, max_n: usize) -> OrchBusResult<Vec<WorkItem>> {
        self.stats.pops += 1;
        if max_n == 0 {
            return Ok(Vec::new());
        }

        let script = AtomicScript::CoalescedPop {
            layout: self.layout.clone(),
            max: max_n,
        };
        let name = script.name();
        let records = self.store.eval(script).await?.into_records(name)?;
        self.signal.settle(records.len(), max_n);

        let items: Vec<WorkItem> = records
            .into_iter()
            .map(|(key, fields)| {
                if fields.is_empty() {
                    WorkItem::del(key)
                } else {
                    WorkItem::set(key, fields)
                }
            })
            .collect();

        self.stats.items_popped += items.len() as u64;
        debug!(popped = items.len(), "Materialized pending keys");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::TableReader;
    use crate::store::InMemoryStore;

    fn fv(pairs: &[(&str, &str)]) -> FieldValues {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    async fn pair() -> (
        Arc<dyn SharedStore>,
        CoalescingStateProducer,
        CoalescingStateConsumer,
    ) {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let table = TableName::new("PORT_TABLE");
        let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
        let consumer = CoalescingStateConsumer::new(Arc::clone(&store), table)
            .await
            .unwrap();
        (store, producer, consumer)
    }

    #[tokio::test]
    async fn test_write_then_pop_materializes() {
        let (store, producer, mut consumer) = pair().await;
        producer.set("Eth0", fv(&[("mtu", "9100")])).await.unwrap();

        assert_eq!(consumer.read_data().unwrap(), 1);
        let items = consumer.pop(10).await.unwrap();
        assert_eq!(items, vec![WorkItem::set("Eth0", fv(&[("mtu", "9100")]))]);

        let reader = TableReader::new(store, TableName::new("PORT_TABLE"));
        assert_eq!(
            reader.get("Eth0").await.unwrap(),
            Some(fv(&[("mtu", "9100")]))
        );
    }

    #[tokio::test]
    async fn test_writes_merge_per_field() {
        let (_store, producer, mut consumer) = pair().await;
        producer
            .set("Eth0", fv(&[("mtu", "1500"), ("speed", "1000")]))
            .await
            .unwrap();
        producer.set("Eth0", fv(&[("mtu", "9100")])).await.unwrap();

        let items = consumer.pop(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].field("mtu"), Some("9100"));
        assert_eq!(items[0].field("speed"), Some("1000"));
    }

    #[tokio::test]
    async fn test_one_token_per_pending_key() {
        let (_store, producer, mut consumer) = pair().await;
        for speed in ["1000", "10000", "100000"] {
            producer.set("Eth0", fv(&[("speed", speed)])).await.unwrap();
        }
        assert_eq!(consumer.read_data().unwrap(), 1);
        assert_eq!(producer.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_discards_pending_work() {
        let (_store, producer, mut consumer) = pair().await;
        producer.set("Eth0", fv(&[("mtu", "9100")])).await.unwrap();
        producer.del("Eth1").await.unwrap();

        assert_eq!(producer.clear().await.unwrap(), 2);
        assert_eq!(producer.pending_count().await.unwrap(), 0);
        assert!(consumer.pop(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_write_is_ignored() {
        let (_store, producer, _consumer) = pair().await;
        producer.set("Eth0", Vec::new()).await.unwrap();
        assert_eq!(producer.pending_count().await.unwrap(), 0);
    }
}
