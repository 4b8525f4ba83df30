#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use orchbus_core::{
    Constraint, FieldValues, InMemoryStore, SharedStore, TaskHandler, TaskOutcome, WorkItem,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory store as both its concrete type (for fault injection) and a trait object
pub fn memory_store() -> (Arc<InMemoryStore>, Arc<dyn SharedStore>) {
    let memory = Arc::new(InMemoryStore::new());
    let store: Arc<dyn SharedStore> = memory.clone();
    (memory, store)
}

pub fn fv(pairs: &[(&str, &str)]) -> FieldValues {
    pairs
        .iter()
        .map(|(f, v)| (f.to_string(), v.to_string()))
        .collect()
}

pub fn sorted(mut fields: FieldValues) -> FieldValues {
    fields.sort();
    fields
}

/// Handler that records what it completed and parks keys it was told to block
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<WorkItem>>>,
    blocked: Arc<Mutex<HashMap<String, Constraint>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, key: &str, constraint: Constraint) {
        self.blocked.lock().insert(key.to_string(), constraint);
    }

    pub fn unblock(&self, key: &str) {
        self.blocked.lock().remove(key);
    }

    pub fn seen(&self) -> Vec<WorkItem> {
        self.seen.lock().clone()
    }

    pub fn seen_keys(&self) -> Vec<String> {
        self.seen.lock().iter().map(|i| i.key.clone()).collect()
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&mut self, item: &WorkItem) -> TaskOutcome {
        if let Some(constraint) = self.blocked.lock().get(&item.key).cloned() {
            return TaskOutcome::Retry(constraint);
        }
        self.seen.lock().push(item.clone());
        TaskOutcome::Done
    }
}
