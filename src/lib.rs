#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # OrchBus Core
//!
//! IPC and scheduling core for a control-plane process that consumes change
//! events from many independent data sources through one event loop.
//!
//! ## Overview
//!
//! Producers in any process write into a shared key-value store through one of
//! four channel types. The consuming process registers each channel's consumer
//! with an [`EventMultiplexer`], which hands back one ready source at a time
//! with priority + round-robin fairness, and a [`BatchedConsumptionLoop`]
//! drains at most one batch per dispatch into a downstream [`TaskHandler`].
//!
//! ## Channels
//!
//! - [`OrderedQueueProducer`] / [`OrderedQueueConsumer`] - strict FIFO, every
//!   operation preserved
//! - [`CoalescingStateProducer`] / [`CoalescingStateConsumer`] - writes to one
//!   key collapse; an atomic store script pops and materializes
//! - [`ChangeNotificationConsumer`] - follows the store's own keyspace
//!   notifications and re-reads values
//! - [`SelfContainedMessageProducer`] / [`SelfContainedMessageConsumer`] -
//!   the full event travels in the notification
//!
//! ## Module Organization
//!
//! - [`select`] - Selectable contract, multiplexer, event and timer sources
//! - [`channels`] - the channel variants and table key naming
//! - [`executor`] - handler contract, retry queue, batched consumption
//! - [`event_loop`] - the process-owned select/execute/sweep loop
//! - [`store`] - shared store contract with in-memory and Postgres backends
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//! - [`logging`] - tracing initialisation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use orchbus_core::{
//!     BatchedConsumptionLoop, CoalescingStateConsumer, CoalescingStateProducer, EventLoop,
//!     InMemoryStore, SharedStore, TableName, TaskOutcome, WorkItem,
//! };
//!
//! # async fn example() -> orchbus_core::OrchBusResult<()> {
//! let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
//! let table = TableName::new("PORT_TABLE");
//!
//! let producer = CoalescingStateProducer::new(Arc::clone(&store), table.clone());
//! producer.set("Ethernet0", vec![("mtu".into(), "9100".into())]).await?;
//!
//! let consumer = CoalescingStateConsumer::new(store, table).await?;
//! let executor = BatchedConsumptionLoop::new(consumer, |item: &WorkItem| {
//!     println!("{} {}", item.operation, item.key);
//!     TaskOutcome::Done
//! });
//!
//! let mut event_loop = EventLoop::default();
//! event_loop.register(Box::new(executor), 10);
//! event_loop.run_once().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit + integration tests against the in-memory store
//! DATABASE_URL=postgresql://localhost/orchbus cargo test -- --ignored
//! ```

pub mod channels;
pub mod config;
pub mod constants;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod logging;
pub mod select;
pub mod store;

pub use channels::{
    ChangeNotificationConsumer, ChannelStats, CoalescingStateConsumer, CoalescingStateProducer,
    ConsumerChannel, Operation, OrderedQueueConsumer, OrderedQueueProducer,
    SelfContainedMessageConsumer, SelfContainedMessageProducer, TableName, TableReader, WorkItem,
};
pub use config::{
    BusConfig, ChannelConfig, ConfigLoader, MultiplexerConfig, StoreBackend, StoreConfig,
};
pub use error::{OrchBusError, OrchBusResult};
pub use event_loop::{EventLoop, LoopIteration, LoopStats};
pub use executor::{
    BatchedConsumptionLoop, Constraint, Executor, ExecutorStats, RetryNotifier, RetryQueue,
    TaskHandler, TaskOutcome,
};
pub use select::{
    EventMultiplexer, EventTrigger, Selectable, SelectableEvent, SelectableId, SelectableTimer,
    SelectOutcome,
};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use store::{connect_store, AtomicScript, FieldValues, InMemoryStore, SharedStore};
