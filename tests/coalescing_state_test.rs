//! Coalescing state channel: writes to one key collapse, deletes win over
//! earlier writes, and the visible table only changes when the consumer pops.

mod common;

use common::{fv, memory_store, sorted};
use orchbus_core::{
    CoalescingStateConsumer, CoalescingStateProducer, ConsumerChannel, Selectable, TableName,
    TableReader, WorkItem,
};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_writes_and_delete_collapse_to_latest_state() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let mut consumer = CoalescingStateConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();
    let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
    let reader = TableReader::new(store, table);

    producer.set("k", fv(&[("a", "1")])).await.unwrap();
    producer.set("k", fv(&[("a", "2")])).await.unwrap();
    producer.del("k").await.unwrap();
    producer.set("k", fv(&[("a", "3")])).await.unwrap();

    // Nothing is visible until the consumer materializes it
    assert_eq!(reader.get("k").await.unwrap(), None);

    consumer.read_data().unwrap();
    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items, vec![WorkItem::set("k", fv(&[("a", "3")]))]);
    assert_eq!(reader.get("k").await.unwrap(), Some(fv(&[("a", "3")])));
}

#[tokio::test]
async fn test_delete_after_write_removes_visible_record() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let mut consumer = CoalescingStateConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();
    let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
    let reader = TableReader::new(store, table);

    producer.set("Eth0", fv(&[("mtu", "9100")])).await.unwrap();
    consumer.read_data().unwrap();
    consumer.pop(10).await.unwrap();
    assert_eq!(reader.get_field("Eth0", "mtu").await.unwrap().as_deref(), Some("9100"));

    producer.set("Eth0", fv(&[("mtu", "1500")])).await.unwrap();
    producer.del("Eth0").await.unwrap();
    consumer.read_data().unwrap();

    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items, vec![WorkItem::del("Eth0")]);
    assert_eq!(reader.get("Eth0").await.unwrap(), None);
}

#[tokio::test]
async fn test_history_lost_but_final_delete_kept() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let mut consumer = CoalescingStateConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();
    let producer = CoalescingStateProducer::new(store, table);

    producer.set("Eth0", fv(&[("speed", "10000")])).await.unwrap();
    producer.set("Eth0", fv(&[("speed", "100000")])).await.unwrap();
    producer.del("Eth0").await.unwrap();

    consumer.read_data().unwrap();
    assert_eq!(consumer.pop(10).await.unwrap(), vec![WorkItem::del("Eth0")]);
}

#[tokio::test]
async fn test_fields_merge_and_keep_earlier_fields() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let mut consumer = CoalescingStateConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();
    let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
    let reader = TableReader::new(store, table);

    producer
        .set("Eth4", fv(&[("mtu", "9100"), ("speed", "100000")]))
        .await
        .unwrap();
    producer.set("Eth4", fv(&[("mtu", "1500")])).await.unwrap();
    consumer.read_data().unwrap();

    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(
        sorted(items[0].fields.clone()),
        fv(&[("mtu", "1500"), ("speed", "100000")])
    );

    // A later partial write only touches the fields it names
    producer.set("Eth4", fv(&[("admin", "up")])).await.unwrap();
    consumer.read_data().unwrap();
    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items, vec![WorkItem::set("Eth4", fv(&[("admin", "up")]))]);
    assert_eq!(
        sorted(reader.get("Eth4").await.unwrap().unwrap()),
        fv(&[("admin", "up"), ("mtu", "1500"), ("speed", "100000")])
    );
}

#[tokio::test]
async fn test_burst_to_one_key_wakes_consumer_once() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let mut consumer = CoalescingStateConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();
    let producer = CoalescingStateProducer::new(store, table);

    for i in 0..100 {
        producer
            .set("Eth8", fv(&[("counter", &i.to_string())]))
            .await
            .unwrap();
    }

    assert_eq!(consumer.read_data().unwrap(), 1);
    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items, vec![WorkItem::set("Eth8", fv(&[("counter", "99")]))]);
    assert!(!consumer.has_data());
    assert!(consumer.pop(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pop_caps_batch_and_materializes_each_key_once() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
    let entries = (0..10)
        .map(|i| (format!("Eth{i}"), fv(&[("index", &i.to_string())])))
        .collect();
    producer.set_batch(entries).await.unwrap();

    let mut consumer = CoalescingStateConsumer::new(store, table).await.unwrap();
    assert!(consumer.has_data());

    let first = consumer.pop(3).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(producer.pending_count().await.unwrap(), 7);
    assert!(consumer.has_data());

    let mut keys: HashSet<String> = first.into_iter().map(|i| i.key).collect();
    while consumer.has_data() {
        for item in consumer.pop(3).await.unwrap() {
            assert!(keys.insert(item.key), "key materialized twice");
        }
    }
    assert_eq!(keys.len(), 10);
    assert_eq!(producer.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_pop_leaves_pending_state_untouched() {
    let (memory, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
    let reader = TableReader::new(Arc::clone(&store), table.clone());
    producer.set("Eth0", fv(&[("mtu", "9100")])).await.unwrap();

    let mut consumer = CoalescingStateConsumer::new(store, table).await.unwrap();
    memory.inject_script_failures(1);
    assert!(consumer.pop(10).await.is_err());
    assert_eq!(producer.pending_count().await.unwrap(), 1);
    assert_eq!(reader.get("Eth0").await.unwrap(), None);

    consumer.rearm();
    assert!(consumer.has_data());
    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items, vec![WorkItem::set("Eth0", fv(&[("mtu", "9100")]))]);
}

#[tokio::test]
async fn test_pending_keys_picked_up_after_restart() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());

    producer.set("Eth0", fv(&[("mtu", "9100")])).await.unwrap();
    producer.del("Eth1").await.unwrap();

    let mut consumer = CoalescingStateConsumer::new(store, table).await.unwrap();
    assert!(consumer.has_data());
    let mut items = consumer.pop(10).await.unwrap();
    items.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(
        items,
        vec![
            WorkItem::set("Eth0", fv(&[("mtu", "9100")])),
            WorkItem::del("Eth1"),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_producers_converge() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let mut consumer = CoalescingStateConsumer::new(Arc::clone(&store), table.clone())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for p in 0..4 {
        let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
        handles.push(tokio::spawn(async move {
            for i in 0..20 {
                producer
                    .set("Eth0", fv(&[(&format!("p{p}"), &i.to_string())]))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    consumer.read_data().unwrap();
    let items = consumer.pop(10).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(
        sorted(items[0].fields.clone()),
        fv(&[("p0", "19"), ("p1", "19"), ("p2", "19"), ("p3", "19")])
    );
}

#[tokio::test]
async fn test_clear_discards_pending_work() {
    let (_, store) = memory_store();
    let table = TableName::new("PORT_TABLE");
    let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
    producer.set("Eth0", fv(&[("mtu", "9100")])).await.unwrap();
    producer
        .del_batch(&["Eth1".to_string(), "Eth2".to_string()])
        .await
        .unwrap();

    assert_eq!(producer.clear().await.unwrap(), 3);
    assert_eq!(producer.pending_count().await.unwrap(), 0);

    let mut consumer = CoalescingStateConsumer::new(store, table).await.unwrap();
    assert!(!consumer.has_data());
    assert!(consumer.pop(10).await.unwrap().is_empty());
}
