//! Selectables that are not backed by a channel: a user-signalled event and a
//! periodic timer. Both can be registered in the event loop to force a sweep
//! of every executor when they fire.

use async_trait::async_trait;
use futures::task::AtomicWaker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::selectable::Selectable;
use crate::error::OrchBusResult;
use crate::executor::Executor;

#[derive(Debug, Default)]
struct TriggerShared {
    signals: AtomicU64,
    waker: AtomicWaker,
}

/// Cloneable handle that wakes a [`SelectableEvent`] from any thread or task
#[derive(Debug, Clone)]
pub struct EventTrigger {
    shared: Arc<TriggerShared>,
}

impl EventTrigger {
    /// Add one unit to the event and wake the task waiting on it
    pub fn notify(&self) {
        self.shared.signals.fetch_add(1, Ordering::AcqRel);
        self.shared.waker.wake();
    }
}

/// Event source readable whenever its trigger has been notified
///
/// Notifications accumulate until the multiplexer reads them; one dispatch
/// consumes everything accumulated so far.
#[derive(Debug)]
pub struct SelectableEvent {
    name: String,
    shared: Arc<TriggerShared>,
    buffered: u64,
}

impl SelectableEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(TriggerShared::default()),
            buffered: 0,
        }
    }

    pub fn trigger(&self) -> EventTrigger {
        EventTrigger {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Units read but not yet dispatched
    pub fn buffered(&self) -> u64 {
        self.buffered
    }
}

impl Selectable for SelectableEvent {
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        self.shared.waker.register(cx.waker());
        let signals = self.shared.signals.swap(0, Ordering::AcqRel);
        if signals == 0 {
            return Poll::Pending;
        }
        self.buffered += signals;
        Poll::Ready(Ok(signals as usize))
    }

    fn has_data(&self) -> bool {
        self.buffered > 0
    }

    fn has_cached_data(&self) -> bool {
        false
    }

    fn update_after_read(&mut self) {
        self.buffered = 0;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Executor for SelectableEvent {
    async fn execute(&mut self) -> OrchBusResult<()> {
        Ok(())
    }

    async fn sweep(&mut self) -> OrchBusResult<()> {
        Ok(())
    }
}

/// Event source that becomes readable once per period
///
/// Must be created inside a Tokio runtime. Missed ticks are skipped rather
/// than replayed in a burst.
#[derive(Debug)]
pub struct SelectableTimer {
    name: String,
    interval: Interval,
    expirations: u64,
}

impl SelectableTimer {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            name: name.into(),
            interval,
            expirations: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Restart the period from now, discarding pending expirations
    pub fn reset(&mut self) {
        self.interval.reset();
        self.expirations = 0;
    }
}

impl Selectable for SelectableTimer {
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        let mut ticks = 0;
        while self.interval.poll_tick(cx).is_ready() {
            ticks += 1;
        }
        if ticks == 0 {
            return Poll::Pending;
        }
        self.expirations += ticks as u64;
        Poll::Ready(Ok(ticks))
    }

    fn has_data(&self) -> bool {
        self.expirations > 0
    }

    fn has_cached_data(&self) -> bool {
        false
    }

    fn update_after_read(&mut self) {
        self.expirations = 0;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Executor for SelectableTimer {
    async fn execute(&mut self) -> OrchBusResult<()> {
        Ok(())
    }

    async fn sweep(&mut self) -> OrchBusResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::{EventMultiplexer, SelectOutcome};
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_event_accumulates_until_read() {
        let mut event = SelectableEvent::new("wake");
        let trigger = event.trigger();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert_pending!(event.poll_read_data(&mut cx));
        trigger.notify();
        trigger.notify();
        let read = assert_ready!(event.poll_read_data(&mut cx)).unwrap();
        assert_eq!(read, 2);
        assert!(event.has_data());
        assert!(!event.has_cached_data());

        event.update_after_read();
        assert!(!event.has_data());
        assert_pending!(event.poll_read_data(&mut cx));
    }

    #[tokio::test]
    async fn test_trigger_wakes_blocked_select() {
        let mut mux: EventMultiplexer = EventMultiplexer::new();
        let event = SelectableEvent::new("wake");
        let trigger = event.trigger();
        let id = mux.add_selectable(Box::new(event), 0);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.notify();
        });

        match mux.select(Duration::from_secs(5)).await {
            SelectOutcome::Ready(ready) => assert_eq!(ready, id),
            other => panic!("expected event dispatch, got {other:?}"),
        }
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_per_period() {
        let mut mux: EventMultiplexer = EventMultiplexer::new();
        let id = mux.add_selectable(
            Box::new(SelectableTimer::new("tick", Duration::from_millis(100))),
            0,
        );

        assert!(matches!(
            mux.select(Duration::from_millis(50)).await,
            SelectOutcome::Timeout
        ));
        match mux.select(Duration::from_millis(100)).await {
            SelectOutcome::Ready(ready) => assert_eq!(ready, id),
            other => panic!("expected timer dispatch, got {other:?}"),
        }
    }
}
