//! # Retry Queue
//!
//! Work items a handler could not complete yet, parked under the
//! [`Constraint`] they wait on. Resolution is reported through a
//! [`RetryNotifier`], which is cheap to clone and may be used from any task or
//! thread. Parked items move to the ready side when their constraint resolves
//! and are handed back to the handler on the next sweep.
//!
//! Items that stay parked past the stuck threshold are reported once at
//! `warn` and counted by [`RetryQueue::stuck_count`]. They are never dropped.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::handler::Constraint;
use crate::channels::WorkItem;
use crate::select::EventTrigger;

#[derive(Debug)]
struct RetryItem {
    item: WorkItem,
    parked_at: Instant,
    reported_stuck: bool,
}

/// Reports constraints as resolved to a [`RetryQueue`]
#[derive(Debug, Clone)]
pub struct RetryNotifier {
    resolved: Arc<Mutex<Vec<Constraint>>>,
    trigger: Option<EventTrigger>,
}

impl RetryNotifier {
    /// Wake this trigger on every resolution so the loop sweeps promptly
    pub fn with_trigger(mut self, trigger: EventTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn resolve(&self, constraint: Constraint) {
        debug!(constraint = %constraint, "Constraint resolved");
        self.resolved.lock().push(constraint);
        if let Some(trigger) = &self.trigger {
            trigger.notify();
        }
    }
}

/// Work items blocked on unmet preconditions
#[derive(Debug)]
pub struct RetryQueue {
    name: String,
    blocked: HashMap<Constraint, VecDeque<RetryItem>>,
    ready: VecDeque<RetryItem>,
    resolved: Arc<Mutex<Vec<Constraint>>>,
    stuck_threshold: Duration,
}

impl RetryQueue {
    pub fn new(name: impl Into<String>, stuck_threshold: Duration) -> Self {
        Self {
            name: name.into(),
            blocked: HashMap::new(),
            ready: VecDeque::new(),
            resolved: Arc::new(Mutex::new(Vec::new())),
            stuck_threshold,
        }
    }

    pub fn notifier(&self) -> RetryNotifier {
        RetryNotifier {
            resolved: Arc::clone(&self.resolved),
            trigger: None,
        }
    }

    pub fn park(&mut self, item: WorkItem, constraint: Constraint) {
        debug!(
            queue = %self.name,
            key = %item.key,
            constraint = %constraint,
            "Parked work item"
        );
        self.blocked.entry(constraint).or_default().push_back(RetryItem {
            item,
            parked_at: Instant::now(),
            reported_stuck: false,
        });
    }

    /// Up to `max` items whose constraint has been resolved, oldest resolution first
    pub fn take_ready(&mut self, max: usize) -> Vec<WorkItem> {
        self.apply_resolutions();
        self.report_stuck();

        let take = max.min(self.ready.len());
        self.ready.drain(..take).map(|r| r.item).collect()
    }

    fn apply_resolutions(&mut self) {
        let resolved = std::mem::take(&mut *self.resolved.lock());
        for constraint in resolved {
            if let Some(items) = self.blocked.remove(&constraint) {
                debug!(
                    queue = %self.name,
                    constraint = %constraint,
                    released = items.len(),
                    "Released parked items"
                );
                self.ready.extend(items);
            }
        }
    }

    fn report_stuck(&mut self) {
        let now = Instant::now();
        for (constraint, items) in self.blocked.iter_mut() {
            for parked in items.iter_mut() {
                let waited = now.duration_since(parked.parked_at);
                if !parked.reported_stuck && waited >= self.stuck_threshold {
                    parked.reported_stuck = true;
                    warn!(
                        queue = %self.name,
                        key = %parked.item.key,
                        constraint = %constraint,
                        waited_secs = waited.as_secs(),
                        "Work item stuck waiting for constraint"
                    );
                }
            }
        }
    }

    /// Parked items that have exceeded the stuck threshold
    pub fn stuck_count(&self) -> usize {
        self.blocked
            .values()
            .flatten()
            .filter(|p| p.reported_stuck)
            .count()
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.values().map(VecDeque::len).sum()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn len(&self) -> usize {
        self.blocked_len() + self.ready_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
