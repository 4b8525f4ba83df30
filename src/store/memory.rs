//! # In-Memory Shared Store
//!
//! Single-process [`SharedStore`] used by tests and by deployments where the
//! producers and the consumer share one process. All data lives behind one
//! lock, so every operation and every [`AtomicScript`] is trivially atomic.
//! Notifications (wake-up tokens and keyspace events) are published while the
//! lock is held, which keeps their order identical to the mutation order.
//!
//! Empty lists, sets and hashes are removed, matching the usual key-value
//! store behaviour that an emptied container no longer exists.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use super::pattern::ChannelPattern;
use super::pubsub::{SubscriberRegistry, Subscription};
use super::{
    check_payload_size, AtomicScript, CoalescingLayout, FieldValues, ScriptOutput, SharedStore,
};
use crate::config::StoreConfig;
use crate::constants::{keys::KEYSPACE_PREFIX, keyspace_ops};
use crate::error::{OrchBusError, OrchBusResult};

/// Set with O(1) insert, remove and uniform random pop
#[derive(Debug, Default)]
struct RandomSet {
    members: Vec<String>,
    index: HashMap<String, usize>,
}

impl RandomSet {
    fn insert(&mut self, member: String) -> bool {
        if self.index.contains_key(&member) {
            return false;
        }
        self.index.insert(member.clone(), self.members.len());
        self.members.push(member);
        true
    }

    fn remove(&mut self, member: &str) -> bool {
        let Some(position) = self.index.remove(member) else {
            return false;
        };
        self.members.swap_remove(position);
        if let Some(moved) = self.members.get(position) {
            self.index.insert(moved.clone(), position);
        }
        true
    }

    fn pop_random(&mut self) -> Option<String> {
        if self.members.is_empty() {
            return None;
        }
        let position = rand::thread_rng().gen_range(0..self.members.len());
        let member = self.members.swap_remove(position);
        self.index.remove(&member);
        if let Some(moved) = self.members.get(position) {
            self.index.insert(moved.clone(), position);
        }
        Some(member)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, RandomSet>,
    hashes: HashMap<String, FieldValues>,
    keyspace_events: bool,
    /// Notifications produced by the current operation, flushed before unlock
    outbox: Vec<(String, String)>,
}

impl StoreState {
    fn touch(&mut self, key: &str, op: &str) {
        if self.keyspace_events {
            self.outbox
                .push((format!("{KEYSPACE_PREFIX}{key}"), op.to_string()));
        }
    }

    fn publish(&mut self, channel: &str, payload: &str) {
        self.outbox.push((channel.to_string(), payload.to_string()));
    }

    fn rpush(&mut self, list: &str, entries: Vec<String>) -> usize {
        if entries.is_empty() {
            return self.lists.get(list).map_or(0, VecDeque::len);
        }
        let queue = self.lists.entry(list.to_string()).or_default();
        queue.extend(entries);
        let len = queue.len();
        self.touch(list, keyspace_ops::RPUSH);
        len
    }

    fn lpop(&mut self, list: &str, max: usize) -> Vec<String> {
        let Some(queue) = self.lists.get_mut(list) else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        let popped: Vec<String> = queue.drain(..take).collect();
        if queue.is_empty() {
            self.lists.remove(list);
        }
        if !popped.is_empty() {
            self.touch(list, keyspace_ops::LPOP);
        }
        popped
    }

    fn sadd(&mut self, set: &str, member: &str) -> bool {
        let added = self
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        if added {
            self.touch(set, keyspace_ops::SADD);
        }
        added
    }

    fn srem(&mut self, set: &str, member: &str) -> bool {
        let Some(members) = self.sets.get_mut(set) else {
            return false;
        };
        let removed = members.remove(member);
        if members.is_empty() {
            self.sets.remove(set);
        }
        if removed {
            self.touch(set, keyspace_ops::SREM);
        }
        removed
    }

    fn spop(&mut self, set: &str, max: usize) -> Vec<String> {
        let Some(members) = self.sets.get_mut(set) else {
            return Vec::new();
        };
        let mut popped = Vec::with_capacity(max.min(members.len()));
        while popped.len() < max {
            match members.pop_random() {
                Some(member) => popped.push(member),
                None => break,
            }
        }
        if members.is_empty() {
            self.sets.remove(set);
        }
        if !popped.is_empty() {
            self.touch(set, keyspace_ops::SPOP);
        }
        popped
    }

    fn hset(&mut self, key: &str, fields: FieldValues) {
        if fields.is_empty() {
            return;
        }
        let record = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            match record.iter_mut().find(|(f, _)| *f == field) {
                Some(existing) => existing.1 = value,
                None => record.push((field, value)),
            }
        }
        self.touch(key, keyspace_ops::HSET);
    }

    /// Remove a hash and return its fields
    fn take_hash(&mut self, key: &str) -> Option<FieldValues> {
        let taken = self.hashes.remove(key);
        if taken.is_some() {
            self.touch(key, keyspace_ops::DEL);
        }
        taken
    }

    fn del(&mut self, key: &str) -> bool {
        let existed = self.lists.remove(key).is_some()
            | self.sets.remove(key).is_some()
            | self.hashes.remove(key).is_some();
        if existed {
            self.touch(key, keyspace_ops::DEL);
        }
        existed
    }

    fn run(&mut self, script: AtomicScript) -> ScriptOutput {
        match script {
            AtomicScript::ListPushAndPublish {
                list,
                entries,
                channel,
                payload,
            } => {
                let len = self.rpush(&list, entries);
                self.publish(&channel, &payload);
                ScriptOutput::Count(len)
            }
            AtomicScript::ListPopFront { list, max } => ScriptOutput::Entries(self.lpop(&list, max)),
            AtomicScript::StageWrite {
                layout,
                key,
                fields,
                token,
            } => {
                self.hset(&layout.staging_key(&key), fields);
                let added = self.sadd(&layout.pending_set, &key);
                if added {
                    self.publish(&layout.channel, &token);
                }
                ScriptOutput::Count(usize::from(added))
            }
            AtomicScript::StageDelete { layout, key, token } => {
                self.take_hash(&layout.staging_key(&key));
                self.sadd(&layout.delete_set, &key);
                let added = self.sadd(&layout.pending_set, &key);
                if added {
                    self.publish(&layout.channel, &token);
                }
                ScriptOutput::Count(usize::from(added))
            }
            AtomicScript::CoalescedPop { layout, max } => {
                ScriptOutput::Records(self.coalesced_pop(&layout, max))
            }
            AtomicScript::CoalescedClear { layout } => {
                let pending = self.spop(&layout.pending_set, usize::MAX);
                for key in &pending {
                    self.take_hash(&layout.staging_key(key));
                }
                self.del(&layout.delete_set);
                ScriptOutput::Count(pending.len())
            }
        }
    }

    fn coalesced_pop(&mut self, layout: &CoalescingLayout, max: usize) -> Vec<(String, FieldValues)> {
        let keys = self.spop(&layout.pending_set, max);
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let record_key = layout.record_key(&key);
            if self.srem(&layout.delete_set, &key) {
                self.take_hash(&record_key);
            }

            let staged = self
                .take_hash(&layout.staging_key(&key))
                .unwrap_or_default();
            if !staged.is_empty() {
                self.hset(&record_key, staged.clone());
            }
            records.push((key, staged));
        }

        records
    }
}

/// Shared store held entirely in process memory
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    registry: SubscriberRegistry,
    max_payload_size: usize,
    injected_failures: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            state: Mutex::new(StoreState {
                keyspace_events: config.keyspace_notifications,
                ..StoreState::default()
            }),
            registry: SubscriberRegistry::new(config.notification_buffer_size),
            max_payload_size: config.max_payload_size,
            injected_failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` scripts fail before they touch any data
    pub fn inject_script_failures(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }

    /// Run `op` under the store lock and flush the notifications it produced
    fn with_state<T>(&self, op: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut state = self.state.lock();
        let result = op(&mut state);
        for (channel, payload) in state.outbox.drain(..) {
            self.registry.publish(&channel, &payload);
        }
        result
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn list_push(&self, list: &str, entries: Vec<String>) -> OrchBusResult<usize> {
        Ok(self.with_state(|s| s.rpush(list, entries)))
    }

    async fn list_len(&self, list: &str) -> OrchBusResult<usize> {
        Ok(self.with_state(|s| s.lists.get(list).map_or(0, VecDeque::len)))
    }

    async fn set_add(&self, set: &str, members: Vec<String>) -> OrchBusResult<usize> {
        Ok(self.with_state(|s| members.iter().filter(|m| s.sadd(set, m)).count()))
    }

    async fn set_card(&self, set: &str) -> OrchBusResult<usize> {
        Ok(self.with_state(|s| s.sets.get(set).map_or(0, RandomSet::len)))
    }

    async fn hash_get_all(&self, key: &str) -> OrchBusResult<FieldValues> {
        Ok(self.with_state(|s| s.hashes.get(key).cloned().unwrap_or_default()))
    }

    async fn hash_set(&self, key: &str, fields: FieldValues) -> OrchBusResult<()> {
        self.with_state(|s| s.hset(key, fields));
        Ok(())
    }

    async fn del(&self, key: &str) -> OrchBusResult<bool> {
        Ok(self.with_state(|s| s.del(key)))
    }

    async fn keys(&self, pattern: &str) -> OrchBusResult<Vec<String>> {
        let pattern = ChannelPattern::new(pattern)?;
        let mut keys: Vec<String> = self.with_state(|s| {
            s.lists
                .keys()
                .chain(s.sets.keys())
                .chain(s.hashes.keys())
                .filter(|k| pattern.matches(k))
                .cloned()
                .collect()
        });
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> OrchBusResult<usize> {
        check_payload_size(payload, self.max_payload_size)?;
        Ok(self.registry.publish(channel, payload))
    }

    async fn subscribe(
        &self,
        channels: &[String],
        patterns: &[String],
    ) -> OrchBusResult<Subscription> {
        self.registry.subscribe(channels, patterns)
    }

    async fn eval(&self, script: AtomicScript) -> OrchBusResult<ScriptOutput> {
        let name = script.name();
        if self.take_injected_failure() {
            warn!(script = name, "Injected script failure");
            return Err(OrchBusError::script_failed(name, "injected failure"));
        }

        let output = self.with_state(|s| s.run(script));
        debug!(script = name, "Script applied");
        Ok(output)
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}
