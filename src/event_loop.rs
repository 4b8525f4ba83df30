//! # Event Loop
//!
//! The single cooperative loop a consumer process runs: select one ready
//! executor, execute it, then sweep every executor. The loop owns its
//! multiplexer; there is no process-wide scheduler to register with.
//!
//! Nothing an executor returns is fatal. Failures are logged and counted and
//! the loop carries on; a channel whose pop failed has already re-armed
//! itself and will be dispatched again.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MultiplexerConfig;
use crate::constants::DEFAULT_WAIT_TIMEOUT_MS;
use crate::executor::Executor;
use crate::select::{EventMultiplexer, MultiplexerStats, SelectOutcome, SelectableId};

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopIteration {
    /// The executor was selected and executed (successfully or not)
    Dispatched(SelectableId),
    /// No executor became ready within the wait timeout
    Timeout,
    /// The executor's event source failed and was taken out of rotation
    SourceFailed(SelectableId),
}

/// Counters describing loop activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub executions: u64,
    pub timeouts: u64,
    pub execute_errors: u64,
    pub sweep_errors: u64,
    pub source_failures: u64,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Process-owned scheduler over registered executors
pub struct EventLoop {
    instance_id: Uuid,
    multiplexer: EventMultiplexer<dyn Executor>,
    wait_timeout: Duration,
    stats: LoopStats,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("instance_id", &self.instance_id)
            .field("multiplexer", &self.multiplexer)
            .field("wait_timeout", &self.wait_timeout)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS))
    }
}

impl EventLoop {
    pub fn new(wait_timeout: Duration) -> Self {
        let instance_id = Uuid::new_v4();
        info!(
            instance_id = %instance_id,
            wait_timeout_ms = wait_timeout.as_millis() as u64,
            "Event loop created"
        );
        Self {
            instance_id,
            multiplexer: EventMultiplexer::new(),
            wait_timeout,
            stats: LoopStats::default(),
            started_at: Utc::now(),
        }
    }

    pub fn from_config(config: &MultiplexerConfig) -> Self {
        Self::new(config.wait_timeout())
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Register an executor; higher priorities are dispatched preferentially
    pub fn register(&mut self, executor: Box<dyn Executor>, priority: i32) -> SelectableId {
        self.multiplexer.add_selectable(executor, priority)
    }

    pub fn executor(&self, id: SelectableId) -> Option<&dyn Executor> {
        self.multiplexer.get(id)
    }

    pub fn executor_mut(&mut self, id: SelectableId) -> Option<&mut (dyn Executor + 'static)> {
        self.multiplexer.get_mut(id)
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn multiplexer_stats(&self) -> &MultiplexerStats {
        self.multiplexer.stats()
    }

    /// How many times an executor has been dispatched
    pub fn dispatch_count(&self, id: SelectableId) -> u64 {
        self.multiplexer.dispatch_count(id)
    }

    /// Select, execute the selected executor, then sweep every executor
    pub async fn run_once(&mut self) -> LoopIteration {
        self.stats.iterations += 1;

        let iteration = match self.multiplexer.select(self.wait_timeout).await {
            SelectOutcome::Ready(id) => {
                self.execute(id).await;
                LoopIteration::Dispatched(id)
            }
            SelectOutcome::Timeout => {
                self.stats.timeouts += 1;
                LoopIteration::Timeout
            }
            SelectOutcome::Error { id, error } => {
                self.stats.source_failures += 1;
                self.stats.last_error_at = Some(Utc::now());
                error!(executor = %id, error = %error, "Executor event source failed");
                LoopIteration::SourceFailed(id)
            }
        };

        self.sweep_all().await;
        iteration
    }

    /// Run until the process ends
    pub async fn run(&mut self) {
        info!(instance_id = %self.instance_id, executors = self.multiplexer.len(), "Event loop running");
        loop {
            self.run_once().await;
        }
    }

    /// Run until `shutdown` completes; checked between iterations so no
    /// dispatch is interrupted half way
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(instance_id = %self.instance_id, executors = self.multiplexer.len(), "Event loop running");
        tokio::pin!(shutdown);
        loop {
            self.run_once().await;
            if (&mut shutdown).now_or_never().is_some() {
                info!(
                    instance_id = %self.instance_id,
                    iterations = self.stats.iterations,
                    "Event loop stopped"
                );
                return;
            }
        }
    }

    async fn execute(&mut self, id: SelectableId) {
        let Some(executor) = self.multiplexer.get_mut(id) else {
            return;
        };
        let result = executor.execute().await;
        self.stats.executions += 1;

        if let Err(e) = result {
            self.stats.execute_errors += 1;
            self.stats.last_error_at = Some(Utc::now());
            warn!(executor = %id, error = %e, "Executor failed, continuing");
        }
    }

    async fn sweep_all(&mut self) {
        let mut failures = 0u64;
        for (id, executor) in self.multiplexer.iter_mut() {
            if let Err(e) = executor.sweep().await {
                failures += 1;
                warn!(executor = %id, name = %executor.name(), error = %e, "Sweep failed, continuing");
            }
        }
        if failures > 0 {
            self.stats.sweep_errors += failures;
            self.stats.last_error_at = Some(Utc::now());
        }
        debug!(iteration = self.stats.iterations, "Sweep complete");
    }
}
