//! The contract every event source registered with the multiplexer implements.

use futures::task::noop_waker_ref;
use std::task::{Context, Poll};

use crate::error::OrchBusResult;

/// An event source pollable by [`EventMultiplexer`](super::EventMultiplexer)
///
/// Readiness is discovered by [`poll_read_data`](Selectable::poll_read_data):
/// it drains everything the underlying transport currently holds into an
/// internal buffer or counter and reports how many units it took. It must
/// stay cheap (no parsing, no store round trips) and must register the task's
/// waker when nothing is pending, like any `poll_*` method.
///
/// The remaining methods are the bookkeeping the multiplexer uses for
/// fairness. `has_cached_data` is a hint ("more than one unit remains"), not a
/// precise count; the batch size a consumer pops with is what actually bounds
/// each dispatch.
pub trait Selectable: Send {
    /// Drain the transport without blocking
    ///
    /// `Ready(Ok(n))` with `n > 0` when new units were buffered,
    /// `Ready(Err(_))` when the transport is gone, `Pending` otherwise.
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>>;

    /// At least one unit of buffered work is available
    fn has_data(&self) -> bool;

    /// More than one unit remains after the current dispatch
    fn has_cached_data(&self) -> bool;

    /// Account for one dispatch; called once per dispatch regardless of how
    /// much the consumer later pops
    fn update_after_read(&mut self);

    /// Name used in logs
    fn name(&self) -> &str;

    /// Non-blocking drain that never registers a waker
    fn read_data(&mut self) -> OrchBusResult<usize> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.poll_read_data(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Ok(0),
        }
    }
}

impl<S: Selectable + ?Sized> Selectable for Box<S> {
    fn poll_read_data(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        (**self).poll_read_data(cx)
    }

    fn has_data(&self) -> bool {
        (**self).has_data()
    }

    fn has_cached_data(&self) -> bool {
        (**self).has_cached_data()
    }

    fn update_after_read(&mut self) {
        (**self).update_after_read()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
