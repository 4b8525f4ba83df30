//! # Shared Store
//!
//! The external key-value store the channels are built on: ordered lists,
//! sets with random pop, hashes, publish/subscribe, and atomic scripts.
//!
//! Channels only talk to the store through [`SharedStore`], so the same
//! producer/consumer code runs against the in-process [`InMemoryStore`] and
//! the Postgres-backed `PostgresStore`.
//!
//! ## Atomic scripts
//!
//! Multi-step operations that must not be observed half-done are expressed as
//! [`AtomicScript`] values and run by [`SharedStore::eval`]. A backend either
//! applies every step of a script or none of them; a failed script leaves the
//! store exactly as it was, so callers simply retry on their next dispatch.

pub mod memory;
pub mod pattern;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod pubsub;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{OrchBusError, OrchBusResult};

pub use memory::InMemoryStore;
pub use pattern::ChannelPattern;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use pubsub::{Notification, SubscriberRegistry, Subscription};

/// Field/value pairs of one hash record
pub type FieldValues = Vec<(String, String)>;

/// Store keys a coalescing table is spread across
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescingLayout {
    /// Set of keys awaiting materialization
    pub pending_set: String,
    /// Keys whose latest producer operation was a delete
    pub delete_set: String,
    /// Prefix of staging record keys (`_PORT_TABLE:`)
    pub staging_prefix: String,
    /// Prefix of visible record keys (`PORT_TABLE:`)
    pub record_prefix: String,
    /// Wake-up channel
    pub channel: String,
}

impl CoalescingLayout {
    pub fn staging_key(&self, key: &str) -> String {
        format!("{}{}", self.staging_prefix, key)
    }

    pub fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.record_prefix, key)
    }
}

/// Store-side scripts, each executed as one indivisible unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicScript {
    /// Append entries to the back of a list, then publish `payload` once
    ListPushAndPublish {
        list: String,
        entries: Vec<String>,
        channel: String,
        payload: String,
    },
    /// Remove and return up to `max` entries from the front of a list
    ListPopFront { list: String, max: usize },
    /// Merge fields into the staging record and mark the key pending;
    /// publishes the wake-up token only when the key was not already pending
    StageWrite {
        layout: CoalescingLayout,
        key: String,
        fields: FieldValues,
        token: String,
    },
    /// Drop the staging record, set the delete marker and mark the key pending
    StageDelete {
        layout: CoalescingLayout,
        key: String,
        token: String,
    },
    /// Pop up to `max` random pending keys and materialize each one:
    /// honour its delete marker, move staging fields into the visible record,
    /// and return `(key, staged_fields)`; empty fields mean a delete
    CoalescedPop { layout: CoalescingLayout, max: usize },
    /// Discard all pending work, delete markers and staging records
    CoalescedClear { layout: CoalescingLayout },
}

impl AtomicScript {
    /// Stable name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            AtomicScript::ListPushAndPublish { .. } => "list_push_and_publish",
            AtomicScript::ListPopFront { .. } => "list_pop_front",
            AtomicScript::StageWrite { .. } => "stage_write",
            AtomicScript::StageDelete { .. } => "stage_delete",
            AtomicScript::CoalescedPop { .. } => "coalesced_pop",
            AtomicScript::CoalescedClear { .. } => "coalesced_clear",
        }
    }
}

/// What a script produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutput {
    Count(usize),
    Entries(Vec<String>),
    Records(Vec<(String, FieldValues)>),
}

impl ScriptOutput {
    pub fn into_count(self, script: &str) -> OrchBusResult<usize> {
        match self {
            ScriptOutput::Count(n) => Ok(n),
            other => Err(unexpected_output(script, &other)),
        }
    }

    pub fn into_entries(self, script: &str) -> OrchBusResult<Vec<String>> {
        match self {
            ScriptOutput::Entries(entries) => Ok(entries),
            other => Err(unexpected_output(script, &other)),
        }
    }

    pub fn into_records(self, script: &str) -> OrchBusResult<Vec<(String, FieldValues)>> {
        match self {
            ScriptOutput::Records(records) => Ok(records),
            other => Err(unexpected_output(script, &other)),
        }
    }
}

fn unexpected_output(script: &str, output: &ScriptOutput) -> OrchBusError {
    OrchBusError::script_failed(script, format!("unexpected script output: {output:?}"))
}

/// Operations the bus core consumes from the external store
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Append to the back of a list; returns the new length
    async fn list_push(&self, list: &str, entries: Vec<String>) -> OrchBusResult<usize>;

    async fn list_len(&self, list: &str) -> OrchBusResult<usize>;

    /// Add members; returns how many were not already present
    async fn set_add(&self, set: &str, members: Vec<String>) -> OrchBusResult<usize>;

    async fn set_card(&self, set: &str) -> OrchBusResult<usize>;

    /// All fields of a hash; empty when the key does not exist
    async fn hash_get_all(&self, key: &str) -> OrchBusResult<FieldValues>;

    /// Set fields on a hash, keeping fields not mentioned
    async fn hash_set(&self, key: &str, fields: FieldValues) -> OrchBusResult<()>;

    /// Delete a key of any type; returns whether it existed
    async fn del(&self, key: &str) -> OrchBusResult<bool>;

    /// Keys matching a glob pattern, sorted
    async fn keys(&self, pattern: &str) -> OrchBusResult<Vec<String>>;

    /// Publish a payload; returns how many subscribers received it
    async fn publish(&self, channel: &str, payload: &str) -> OrchBusResult<usize>;

    /// Subscribe to exact channels and glob patterns
    async fn subscribe(&self, channels: &[String], patterns: &[String])
        -> OrchBusResult<Subscription>;

    /// Run a script atomically
    async fn eval(&self, script: AtomicScript) -> OrchBusResult<ScriptOutput>;

    /// Largest payload `publish` accepts
    fn max_payload_size(&self) -> usize;
}

/// Connect the backend selected by configuration
pub async fn connect_store(config: &StoreConfig) -> OrchBusResult<Arc<dyn SharedStore>> {
    info!(backend = ?config.backend, "Connecting shared store");
    match config.backend {
        StoreBackend::InMemory => Ok(Arc::new(InMemoryStore::from_config(config))),
        #[cfg(feature = "postgres")]
        StoreBackend::Postgres => {
            let store = PostgresStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreBackend::Postgres => Err(OrchBusError::configuration(
            "postgres store backend requires the `postgres` feature",
        )),
    }
}

pub(crate) fn check_payload_size(payload: &str, limit: usize) -> OrchBusResult<()> {
    if payload.len() > limit {
        return Err(OrchBusError::PayloadTooLarge {
            size_bytes: payload.len(),
            limit_bytes: limit,
        });
    }
    Ok(())
}
