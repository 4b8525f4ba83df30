//! # Event Multiplexer
//!
//! Waits on every registered [`Selectable`] at once and hands back exactly one
//! ready source per [`select`](EventMultiplexer::select) call.
//!
//! ## Fairness
//!
//! Ready sources sit in an ordered working set keyed by
//! `(priority desc, last_dispatched_at asc, id asc)`. Each dispatch stamps the
//! chosen source with a fresh logical timestamp before it is (possibly)
//! reinserted, so among equal priorities the source dispatched longest ago,
//! or never, always goes next. Priority is only a preference: a source is in
//! the working set only while it has data, so an idle high-priority source
//! never holds back a busy low-priority one.
//!
//! Every call starts with a non-blocking readiness pass over all sources, even
//! when the working set is non-empty, so newly ready sources join the
//! rotation before the next dispatch instead of waiting behind a source that
//! keeps reinserting itself.

use futures::future::poll_fn;
use futures::task::noop_waker_ref;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::selectable::Selectable;
use crate::error::OrchBusError;

/// Handle returned by [`EventMultiplexer::add_selectable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectableId(usize);

impl SelectableId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SelectableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "selectable-{}", self.0)
    }
}

/// Result of one [`EventMultiplexer::select`] call
#[derive(Debug)]
pub enum SelectOutcome {
    /// This source has data and has been accounted as dispatched
    Ready(SelectableId),
    /// Nothing became ready before the timeout
    Timeout,
    /// The source's transport failed; it is excluded from further selects
    Error {
        id: SelectableId,
        error: OrchBusError,
    },
}

/// Counters describing multiplexer activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub selects: u64,
    pub dispatches: u64,
    pub timeouts: u64,
    /// Working-set entries discarded because they had no data left
    pub empty_skips: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Reverse<i32>,
    last_dispatched_at: u64,
    id: usize,
}

struct Registration<S: ?Sized> {
    source: Box<S>,
    priority: i32,
    last_dispatched_at: u64,
    dispatch_count: u64,
    in_ready: bool,
    closed: bool,
}

impl<S: ?Sized> Registration<S> {
    fn key(&self, id: usize) -> ReadyKey {
        ReadyKey {
            priority: Reverse(self.priority),
            last_dispatched_at: self.last_dispatched_at,
            id,
        }
    }
}

/// Priority + round-robin scheduler over a set of event sources
pub struct EventMultiplexer<S: Selectable + ?Sized = dyn Selectable> {
    registrations: Vec<Registration<S>>,
    ready: BTreeSet<ReadyKey>,
    clock: u64,
    stats: MultiplexerStats,
}

impl<S: Selectable + ?Sized> Default for EventMultiplexer<S> {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            ready: BTreeSet::new(),
            clock: 0,
            stats: MultiplexerStats::default(),
        }
    }
}

impl<S: Selectable + ?Sized> fmt::Debug for EventMultiplexer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMultiplexer")
            .field("registered", &self.registrations.len())
            .field("ready", &self.ready.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<S: Selectable + ?Sized> EventMultiplexer<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source; priority is fixed for the lifetime of the registration
    pub fn add_selectable(&mut self, source: Box<S>, priority: i32) -> SelectableId {
        let id = self.registrations.len();
        debug!(
            selectable = %source.name(),
            id,
            priority,
            "Registered selectable"
        );
        self.registrations.push(Registration {
            source,
            priority,
            last_dispatched_at: 0,
            dispatch_count: 0,
            in_ready: false,
            closed: false,
        });
        SelectableId(id)
    }

    pub fn get(&self, id: SelectableId) -> Option<&S> {
        self.registrations.get(id.0).map(|r| &*r.source)
    }

    pub fn get_mut(&mut self, id: SelectableId) -> Option<&mut S> {
        self.registrations.get_mut(id.0).map(|r| &mut *r.source)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SelectableId, &mut S)> {
        self.registrations
            .iter_mut()
            .enumerate()
            .map(|(i, r)| (SelectableId(i), &mut *r.source))
    }

    pub fn priority(&self, id: SelectableId) -> Option<i32> {
        self.registrations.get(id.0).map(|r| r.priority)
    }

    /// How many times the source has been dispatched
    pub fn dispatch_count(&self, id: SelectableId) -> u64 {
        self.registrations
            .get(id.0)
            .map_or(0, |r| r.dispatch_count)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Entries currently in the ready working set
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn stats(&self) -> &MultiplexerStats {
        &self.stats
    }

    /// Return one ready source, waiting up to `timeout` for readiness
    pub async fn select(&mut self, timeout: Duration) -> SelectOutcome {
        self.stats.selects += 1;
        let deadline = Instant::now() + timeout;

        let immediate = {
            let mut cx = Context::from_waker(noop_waker_ref());
            self.poll_sources(&mut cx)
        };
        if let Poll::Ready(Some((id, error))) = immediate {
            return self.report_error(id, error);
        }

        loop {
            if let Some(id) = self.dispatch_next() {
                return SelectOutcome::Ready(id);
            }

            let waited =
                tokio::time::timeout_at(deadline, poll_fn(|cx| self.poll_sources(cx))).await;
            match waited {
                Err(_) => {
                    self.stats.timeouts += 1;
                    trace!(timeout_ms = timeout.as_millis() as u64, "Select timed out");
                    return SelectOutcome::Timeout;
                }
                Ok(Some((id, error))) => return self.report_error(id, error),
                Ok(None) => continue,
            }
        }
    }

    /// Poll every open source once, moving those with data into the working set
    ///
    /// Ready(None) once the working set is non-empty, Ready(Some) on the first
    /// transport failure, Pending otherwise with wakers registered.
    fn poll_sources(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<(SelectableId, OrchBusError)>> {
        for (index, registration) in self.registrations.iter_mut().enumerate() {
            if registration.closed {
                continue;
            }

            match registration.source.poll_read_data(cx) {
                Poll::Ready(Err(error)) => {
                    registration.closed = true;
                    if registration.in_ready {
                        self.ready.remove(&registration.key(index));
                        registration.in_ready = false;
                    }
                    return Poll::Ready(Some((SelectableId(index), error)));
                }
                Poll::Ready(Ok(read)) => {
                    trace!(selectable = %registration.source.name(), read, "Read data");
                }
                Poll::Pending => {}
            }

            if !registration.in_ready && registration.source.has_data() {
                registration.in_ready = true;
                self.ready.insert(registration.key(index));
            }
        }

        if self.ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(None)
        }
    }

    /// Pop the best working-set entry that still has data and account its dispatch
    fn dispatch_next(&mut self) -> Option<SelectableId> {
        while let Some(key) = self.ready.pop_first() {
            let registration = &mut self.registrations[key.id];
            registration.in_ready = false;

            if !registration.source.has_data() {
                self.stats.empty_skips += 1;
                trace!(selectable = %registration.source.name(), "Skipped entry without data");
                continue;
            }

            self.clock += 1;
            registration.last_dispatched_at = self.clock;
            registration.dispatch_count += 1;

            if registration.source.has_cached_data() {
                registration.in_ready = true;
                self.ready.insert(registration.key(key.id));
            }
            registration.source.update_after_read();

            self.stats.dispatches += 1;
            trace!(
                selectable = %registration.source.name(),
                priority = registration.priority,
                dispatch = registration.dispatch_count,
                reinserted = registration.in_ready,
                "Dispatching selectable"
            );
            return Some(SelectableId(key.id));
        }
        None
    }

    fn report_error(&mut self, id: SelectableId, error: OrchBusError) -> SelectOutcome {
        self.stats.errors += 1;
        let name = self
            .registrations
            .get(id.0)
            .map(|r| r.source.name().to_string())
            .unwrap_or_default();
        warn!(selectable = %name, error = %error, "Selectable transport failed, removing from rotation");
        SelectOutcome::Error { id, error }
    }
}
