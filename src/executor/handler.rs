//! Downstream task handler contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channels::WorkItem;

/// An unmet precondition a work item is waiting on
///
/// The core never interprets constraints; it only parks items under them and
/// resurfaces the items once the same constraint is reported resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    pub kind: String,
    pub target: String,
}

impl Constraint {
    pub fn new(kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.target)
    }
}

/// What a handler did with a work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Park the item until the constraint is resolved
    Retry(Constraint),
}

/// Consumes work items produced by a channel
#[async_trait]
pub trait TaskHandler: Send {
    async fn handle(&mut self, item: &WorkItem) -> TaskOutcome;
}

#[async_trait]
impl<F> TaskHandler for F
where
    F: FnMut(&WorkItem) -> TaskOutcome + Send,
{
    async fn handle(&mut self, item: &WorkItem) -> TaskOutcome {
        (*self)(item)
    }
}
