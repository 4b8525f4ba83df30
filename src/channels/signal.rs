//! Readiness plumbing shared by the channel consumers.
//!
//! Two shapes exist. Token-signalled channels ([`SignalCounter`]) only count
//! content-free wake-ups; the real work sits in the store and is fetched by
//! `pop`. Payload-carrying channels ([`NotificationBuffer`]) keep the
//! notifications themselves and `pop` drains that buffer.

use std::collections::VecDeque;
use std::task::{Context, Poll};
use tracing::{debug, warn};

use crate::error::{OrchBusError, OrchBusResult};
use crate::store::{Notification, Subscription};

/// Drain every buffered notification from `subscription`, passing each to `sink`
///
/// At most one buffer's worth is taken per call so a producer that keeps
/// publishing cannot pin the poll loop.
fn drain_subscription(
    name: &str,
    subscription: &mut Subscription,
    cx: &mut Context<'_>,
    mut sink: impl FnMut(Notification),
) -> Poll<OrchBusResult<usize>> {
    let mut read = 0;
    while read < subscription.capacity() {
        match subscription.poll_recv(cx) {
            Poll::Ready(Some(notification)) => {
                sink(notification);
                read += 1;
            }
            Poll::Ready(None) if read == 0 => {
                return Poll::Ready(Err(OrchBusError::transport_closed(name)));
            }
            Poll::Ready(None) | Poll::Pending => break,
        }
    }
    if read == 0 {
        Poll::Pending
    } else {
        Poll::Ready(Ok(read))
    }
}

/// Counter of wake-up tokens for channels whose data lives in the store
///
/// The count approximates outstanding work. After each pop it is settled
/// against what the pop actually returned: a short batch proves the store
/// side was drained, a full batch means more may remain.
#[derive(Debug)]
pub struct SignalCounter {
    name: String,
    subscription: Subscription,
    pending: u64,
}

impl SignalCounter {
    /// `seeded` is work already persisted before the subscription existed
    pub fn new(name: impl Into<String>, subscription: Subscription, seeded: usize) -> Self {
        let name = name.into();
        if seeded > 0 {
            debug!(channel = %name, seeded, "Seeded readiness from persisted work");
        }
        Self {
            name,
            subscription,
            pending: seeded as u64,
        }
    }

    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        let mut tokens = 0u64;
        let polled = drain_subscription(&self.name, &mut self.subscription, cx, |_| tokens += 1);
        self.pending += tokens;
        polled
    }

    pub fn has_data(&self) -> bool {
        self.pending > 0
    }

    pub fn has_cached_data(&self) -> bool {
        self.pending > 1
    }

    pub fn update_after_read(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    pub fn rearm(&mut self) {
        self.pending += 1;
    }

    /// Reconcile the counter with the outcome of `pop(max_n)`
    pub fn settle(&mut self, popped: usize, max_n: usize) {
        if popped >= max_n {
            self.pending = self.pending.max(1);
        } else {
            self.pending = 0;
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn dropped(&self) -> u64 {
        self.subscription.dropped()
    }
}

/// Notifications received but not yet popped
#[derive(Debug)]
pub struct NotificationBuffer {
    name: String,
    subscription: Subscription,
    buffered: VecDeque<Notification>,
    reported_dropped: u64,
}

impl NotificationBuffer {
    pub fn new(name: impl Into<String>, subscription: Subscription) -> Self {
        Self {
            name: name.into(),
            subscription,
            buffered: VecDeque::new(),
            reported_dropped: 0,
        }
    }

    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        let buffered = &mut self.buffered;
        let polled = drain_subscription(&self.name, &mut self.subscription, cx, |n| {
            buffered.push_back(n)
        });
        let dropped = self.subscription.dropped();
        if dropped > self.reported_dropped {
            warn!(
                channel = %self.name,
                lost = dropped - self.reported_dropped,
                dropped_total = dropped,
                "Notifications were lost to buffer overflow"
            );
            self.reported_dropped = dropped;
        }
        polled
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn pop_front(&mut self) -> Option<Notification> {
        self.buffered.pop_front()
    }

    pub fn front(&self) -> Option<&Notification> {
        self.buffered.front()
    }

    pub fn dropped(&self) -> u64 {
        self.subscription.dropped()
    }
}
