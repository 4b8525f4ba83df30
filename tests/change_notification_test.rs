//! Change notification channel: follows writes made directly to the visible
//! table and resolves values at pop time.

mod common;

use async_trait::async_trait;
use common::fv;
use orchbus_core::store::{ScriptOutput, Subscription};
use orchbus_core::{
    AtomicScript, ChangeNotificationConsumer, ConsumerChannel, FieldValues, InMemoryStore,
    OrchBusError, OrchBusResult, Operation, Selectable, SharedStore, StoreConfig, TableName,
    WorkItem,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Delegates to an in-memory store but fails one chosen `hash_get_all` call
#[derive(Debug)]
struct FlakyReadStore {
    inner: InMemoryStore,
    reads: AtomicUsize,
    fail_on_read: usize,
}

impl FlakyReadStore {
    fn failing_read(fail_on_read: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            reads: AtomicUsize::new(0),
            fail_on_read,
        }
    }
}

#[async_trait]
impl SharedStore for FlakyReadStore {
    async fn list_push(&self, list: &str, entries: Vec<String>) -> OrchBusResult<usize> {
        self.inner.list_push(list, entries).await
    }

    async fn list_len(&self, list: &str) -> OrchBusResult<usize> {
        self.inner.list_len(list).await
    }

    async fn set_add(&self, set: &str, members: Vec<String>) -> OrchBusResult<usize> {
        self.inner.set_add(set, members).await
    }

    async fn set_card(&self, set: &str) -> OrchBusResult<usize> {
        self.inner.set_card(set).await
    }

    async fn hash_get_all(&self, key: &str) -> OrchBusResult<FieldValues> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if read == self.fail_on_read {
            return Err(OrchBusError::store("hash_get_all", "transient"));
        }
        self.inner.hash_get_all(key).await
    }

    async fn hash_set(&self, key: &str, fields: FieldValues) -> OrchBusResult<()> {
        self.inner.hash_set(key, fields).await
    }

    async fn del(&self, key: &str) -> OrchBusResult<bool> {
        self.inner.del(key).await
    }

    async fn keys(&self, pattern: &str) -> OrchBusResult<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> OrchBusResult<usize> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(
        &self,
        channels: &[String],
        patterns: &[String],
    ) -> OrchBusResult<Subscription> {
        self.inner.subscribe(channels, patterns).await
    }

    async fn eval(&self, script: AtomicScript) -> OrchBusResult<ScriptOutput> {
        self.inner.eval(script).await
    }

    fn max_payload_size(&self) -> usize {
        self.inner.max_payload_size()
    }
}

#[tokio::test]
async fn test_write_then_delete_before_pop_reports_stale_set() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let table = TableName::new("NEIGH_TABLE");
    let mut consumer = ChangeNotificationConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    let record = table.record_key("10.0.0.1");
    store.hash_set(&record, fv(&[("mac", "aa:bb")])).await.unwrap();
    store.del(&record).await.unwrap();
    assert_eq!(consumer.read_data().unwrap(), 2);

    // The write is re-read after the delete already happened
    let items = consumer.pop(10).await.unwrap();
    assert_eq!(
        items,
        vec![WorkItem::set("10.0.0.1", Vec::new()), WorkItem::del("10.0.0.1")]
    );
}

#[tokio::test]
async fn test_set_reports_current_value_not_value_at_write() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let table = TableName::new("NEIGH_TABLE");
    let mut consumer = ChangeNotificationConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    let record = table.record_key("10.0.0.2");
    store.hash_set(&record, fv(&[("mac", "aa")])).await.unwrap();
    store.hash_set(&record, fv(&[("mac", "bb")])).await.unwrap();
    consumer.read_data().unwrap();

    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items
        .iter()
        .all(|item| item.operation == Operation::Set && item.field("mac") == Some("bb")));
}

#[tokio::test]
async fn test_other_tables_are_ignored() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let table = TableName::new("NEIGH_TABLE");
    let mut consumer = ChangeNotificationConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    store
        .hash_set("PORT_TABLE:Eth0", fv(&[("mtu", "9100")]))
        .await
        .unwrap();
    store
        .hash_set("NEIGH_TABLE_EXTRA:x", fv(&[("mac", "aa")]))
        .await
        .unwrap();

    assert_eq!(consumer.read_data().unwrap(), 0);
    assert!(!consumer.has_data());
}

#[tokio::test]
async fn test_overflow_drops_notifications_and_counts_them() {
    let config = StoreConfig {
        notification_buffer_size: 4,
        ..StoreConfig::default()
    };
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::from_config(&config));
    let table = TableName::new("NEIGH_TABLE");
    let mut consumer = ChangeNotificationConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    for i in 0..10 {
        store
            .hash_set(&table.record_key(&format!("k{i}")), fv(&[("v", "1")]))
            .await
            .unwrap();
    }

    assert_eq!(consumer.read_data().unwrap(), 4);
    assert_eq!(consumer.stats().notifications_dropped, 6);
    assert_eq!(consumer.pop(100).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_zero_batch_consumes_nothing() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let table = TableName::new("NEIGH_TABLE");
    let mut consumer = ChangeNotificationConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    store
        .hash_set(&table.record_key("10.0.0.3"), fv(&[("mac", "cc")]))
        .await
        .unwrap();
    consumer.read_data().unwrap();

    let items = consumer.pop(0).await.unwrap();
    assert!(items.is_empty());
    assert!(consumer.has_data());

    let items = consumer.pop(1).await.unwrap();
    assert_eq!(items, vec![WorkItem::set("10.0.0.3", fv(&[("mac", "cc")]))]);
    assert!(!consumer.has_data());
}

#[tokio::test]
async fn test_failed_reread_mid_batch_keeps_collected_items() {
    // Construction reads nothing (empty table), so the second re-read is key "b"
    let store: Arc<dyn SharedStore> = Arc::new(FlakyReadStore::failing_read(2));
    let table = TableName::new("NEIGH_TABLE");
    let mut consumer = ChangeNotificationConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    for key in ["a", "b", "c"] {
        store
            .hash_set(&table.record_key(key), fv(&[("mac", key)]))
            .await
            .unwrap();
    }
    assert_eq!(consumer.read_data().unwrap(), 3);

    let err = consumer.pop(10).await.unwrap_err();
    assert!(matches!(err, OrchBusError::Store { .. }));
    assert!(consumer.has_data());

    let items = consumer.pop(10).await.unwrap();
    let keys: Vec<&str> = items.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert_eq!(items[0].field("mac"), Some("a"));
    assert!(!consumer.has_data());
}

#[tokio::test]
async fn test_failed_reread_keeps_initial_dump_items() {
    // Initial dump reads "seed" once; the first live re-read then fails
    let store: Arc<dyn SharedStore> = Arc::new(FlakyReadStore::failing_read(2));
    let table = TableName::new("NEIGH_TABLE");
    store
        .hash_set(&table.record_key("seed"), fv(&[("mac", "00")]))
        .await
        .unwrap();
    let mut consumer = ChangeNotificationConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    store
        .hash_set(&table.record_key("live"), fv(&[("mac", "11")]))
        .await
        .unwrap();
    consumer.read_data().unwrap();

    assert!(consumer.pop(10).await.is_err());

    let items = consumer.pop(10).await.unwrap();
    assert_eq!(
        items,
        vec![
            WorkItem::set("seed", fv(&[("mac", "00")])),
            WorkItem::set("live", fv(&[("mac", "11")])),
        ]
    );
}
