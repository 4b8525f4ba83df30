//! # Channels
//!
//! Producer/consumer pairs built on the [`SharedStore`](crate::store::SharedStore).
//! Each variant makes a different reliability trade-off:
//!
//! | Channel | Ordering | Coalescing | Survives consumer restart |
//! |---|---|---|---|
//! | [`ordered_queue`] | strict FIFO | none | yes |
//! | [`coalescing_state`] | per key, latest wins | yes | yes |
//! | [`change_notification`] | notification order, values re-read | no | no |
//! | [`self_contained`] | notification order, values embedded | no | no |
//!
//! Every consumer implements [`Selectable`] so it can be registered with the
//! multiplexer, and [`ConsumerChannel`] for the pop side.

pub mod change_notification;
pub mod coalescing_state;
pub mod ordered_queue;
pub mod self_contained;
pub mod signal;
pub mod table;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::OrchBusResult;
use crate::select::Selectable;
use crate::store::FieldValues;

pub use change_notification::ChangeNotificationConsumer;
pub use coalescing_state::{CoalescingStateConsumer, CoalescingStateProducer};
pub use ordered_queue::{OrderedQueueConsumer, OrderedQueueProducer};
pub use self_contained::{SelfContainedMessageConsumer, SelfContainedMessageProducer};
pub use table::{TableName, TableReader};

/// Kind of change a work item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Set,
    Del,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Set => write!(f, "SET"),
            Operation::Del => write!(f, "DEL"),
        }
    }
}

/// Normalized unit of work handed from a channel to a downstream handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,
    pub operation: Operation,
    #[serde(default)]
    pub fields: FieldValues,
}

impl WorkItem {
    pub fn set(key: impl Into<String>, fields: FieldValues) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Set,
            fields,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Del,
            fields: Vec::new(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Del
    }

    /// Value of a field, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(f, _)| f == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Per-channel counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Calls to `pop`
    pub pops: u64,
    /// Work items returned by `pop`
    pub items_popped: u64,
    /// Entries or payloads that could not be decoded and were skipped
    pub parse_errors: u64,
    /// Notifications lost to transport buffer overflow
    pub notifications_dropped: u64,
}

/// Consumer side of a channel
#[async_trait]
pub trait ConsumerChannel: Selectable {
    /// Extract at most `max_n` work items
    async fn pop(&mut self, max_n: usize) -> OrchBusResult<Vec<WorkItem>>;

    /// Restore readiness after a failed pop so a later select dispatches again
    fn rearm(&mut self);

    fn stats(&self) -> ChannelStats;
}
