//! # Batched Consumption Loop
//!
//! Bridges a [`ConsumerChannel`] to a [`TaskHandler`]. Each dispatch pops at
//! most `batch_size` items, which is what actually bounds how long one channel
//! can hold the loop. Items the handler cannot finish are parked in the
//! [`RetryQueue`]; because parked work has no event source of its own, the
//! event loop calls [`sweep`](Executor::sweep) on every executor after every
//! select, timeouts included, and the sweep feeds resolved items back in.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use super::handler::{TaskHandler, TaskOutcome};
use super::retry::{RetryNotifier, RetryQueue};
use super::Executor;
use crate::channels::{ConsumerChannel, WorkItem};
use crate::config::{BusConfig, ChannelConfig};
use crate::constants::{DEFAULT_NOTIFICATION_BUFFER_SIZE, DEFAULT_STUCK_THRESHOLD_SECS};
use crate::error::OrchBusResult;
use crate::select::Selectable;

/// Counters describing one executor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub executions: u64,
    pub sweeps: u64,
    /// Items obtained from the channel
    pub popped: u64,
    /// Items the handler completed
    pub handled: u64,
    /// Items the handler parked for retry
    pub retried: u64,
    /// Parked items handed back to the handler
    pub resurfaced: u64,
    pub pop_failures: u64,
}

/// Channel consumer paired with its downstream handler
pub struct BatchedConsumptionLoop<C, H> {
    channel: C,
    handler: H,
    batch_size: usize,
    pending: VecDeque<WorkItem>,
    retry: RetryQueue,
    completed: broadcast::Sender<WorkItem>,
    stats: ExecutorStats,
}

impl<C, H> std::fmt::Debug for BatchedConsumptionLoop<C, H>
where
    C: ConsumerChannel,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedConsumptionLoop")
            .field("channel", &self.channel.name())
            .field("batch_size", &self.batch_size)
            .field("pending", &self.pending.len())
            .field("retry", &self.retry.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<C, H> BatchedConsumptionLoop<C, H>
where
    C: ConsumerChannel,
    H: TaskHandler,
{
    pub fn new(channel: C, handler: H) -> Self {
        Self::with_settings(
            channel,
            handler,
            ChannelConfig::default(),
            Duration::from_secs(DEFAULT_STUCK_THRESHOLD_SECS),
        )
    }

    /// Apply the channel's settings from configuration, falling back to defaults
    pub fn from_config(channel: C, handler: H, config: &BusConfig) -> Self {
        let settings = config.channel(channel.name());
        Self::with_settings(channel, handler, settings, config.retry.stuck_threshold())
    }

    fn with_settings(
        channel: C,
        handler: H,
        settings: ChannelConfig,
        stuck_threshold: Duration,
    ) -> Self {
        let (completed, _) = broadcast::channel(DEFAULT_NOTIFICATION_BUFFER_SIZE);
        let retry = RetryQueue::new(channel.name(), stuck_threshold);
        Self {
            channel,
            handler,
            batch_size: settings.batch_size.max(1),
            pending: VecDeque::new(),
            retry,
            completed,
            stats: ExecutorStats::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    /// Handle for reporting constraints resolved
    pub fn retry_notifier(&self) -> RetryNotifier {
        self.retry.notifier()
    }

    /// Receive every work item the handler completes
    pub fn subscribe_completed(&self) -> broadcast::Receiver<WorkItem> {
        self.completed.subscribe()
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    async fn drain(&mut self) {
        while let Some(item) = self.pending.pop_front() {
            match self.handler.handle(&item).await {
                TaskOutcome::Done => {
                    self.stats.handled += 1;
                    // No receivers is fine
                    let _ = self.completed.send(item);
                }
                TaskOutcome::Retry(constraint) => {
                    self.stats.retried += 1;
                    self.retry.park(item, constraint);
                }
            }
        }
    }
}

impl<C, H> Selectable for BatchedConsumptionLoop<C, H>
where
    C: ConsumerChannel,
    H: TaskHandler,
{
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        self.channel.poll_read_data(cx)
    }

    fn has_data(&self) -> bool {
        self.channel.has_data()
    }

    fn has_cached_data(&self) -> bool {
        self.channel.has_cached_data()
    }

    fn update_after_read(&mut self) {
        self.channel.update_after_read()
    }

    fn name(&self) -> &str {
        self.channel.name()
    }
}

#[async_trait]
impl<C, H> Executor for BatchedConsumptionLoop<C, H>
where
    C: ConsumerChannel,
    H: TaskHandler,
{
    #[instrument(skip(self), fields(channel = %self.channel.name()))]
    async fn execute(&mut self) -> OrchBusResult<()> {
        self.stats.executions += 1;
        let items = match self.channel.pop(self.batch_size).await {
            Ok(items) => items,
            Err(e) => {
                self.stats.pop_failures += 1;
                self.channel.rearm();
                warn!(error = %e, "Pop failed, channel re-armed");
                return Err(e);
            }
        };

        debug!(popped = items.len(), batch_size = self.batch_size, "Executing batch");
        self.stats.popped += items.len() as u64;
        self.pending.extend(items);
        self.drain().await;
        Ok(())
    }

    async fn sweep(&mut self) -> OrchBusResult<()> {
        self.stats.sweeps += 1;
        let resurfaced = self.retry.take_ready(self.batch_size);
        if !resurfaced.is_empty() {
            debug!(
                channel = %self.channel.name(),
                resurfaced = resurfaced.len(),
                "Resurfacing retried items"
            );
            self.stats.resurfaced += resurfaced.len() as u64;
            self.pending.extend(resurfaced);
        }
        self.drain().await;
        Ok(())
    }
}
