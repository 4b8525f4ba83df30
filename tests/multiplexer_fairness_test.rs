//! Scheduling guarantees of the multiplexer with synthetic sources.

use orchbus_core::{EventMultiplexer, OrchBusResult, SelectOutcome, Selectable, SelectableId};
use proptest::prelude::*;
use std::task::{Context, Poll};
use std::time::Duration;

const WAIT: Duration = Duration::from_millis(5);

/// Source holding a fixed amount of work, one unit consumed per dispatch
struct Backlog {
    name: String,
    pending: usize,
}

impl Backlog {
    fn boxed(name: impl Into<String>, pending: usize) -> Box<dyn Selectable> {
        Box::new(Self {
            name: name.into(),
            pending,
        })
    }
}

impl Selectable for Backlog {
    fn poll_read_data(&mut self, _cx: &mut Context<'_>) -> Poll<OrchBusResult<usize>> {
        Poll::Pending
    }

    fn has_data(&self) -> bool {
        self.pending > 0
    }

    fn has_cached_data(&self) -> bool {
        self.pending > 1
    }

    fn update_after_read(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn dispatch(mux: &mut EventMultiplexer) -> SelectableId {
    match mux.select(WAIT).await {
        SelectOutcome::Ready(id) => id,
        other => panic!("expected a ready source, got {other:?}"),
    }
}

#[tokio::test]
async fn test_large_backlog_does_not_delay_small_one() {
    let mut mux: EventMultiplexer = EventMultiplexer::new();
    let a = mux.add_selectable(Backlog::boxed("A", 1000), 10);
    let b = mux.add_selectable(Backlog::boxed("B", 1), 10);

    let first_two = [dispatch(&mut mux).await, dispatch(&mut mux).await];
    assert!(first_two.contains(&a));
    assert!(first_two.contains(&b));
}

#[tokio::test]
async fn test_priority_preferred_when_both_ready() {
    let mut mux: EventMultiplexer = EventMultiplexer::new();
    let low = mux.add_selectable(Backlog::boxed("low", 3), 0);
    let high = mux.add_selectable(Backlog::boxed("high", 3), 100);

    for _ in 0..3 {
        assert_eq!(dispatch(&mut mux).await, high);
    }
    for _ in 0..3 {
        assert_eq!(dispatch(&mut mux).await, low);
    }
    assert!(matches!(mux.select(WAIT).await, SelectOutcome::Timeout));
}

#[tokio::test]
async fn test_empty_sources_are_never_dispatched() {
    let mut mux: EventMultiplexer = EventMultiplexer::new();
    let idle = mux.add_selectable(Backlog::boxed("idle", 0), 100);
    let busy = mux.add_selectable(Backlog::boxed("busy", 2), 0);

    assert_eq!(dispatch(&mut mux).await, busy);
    assert_eq!(dispatch(&mut mux).await, busy);
    assert!(matches!(mux.select(WAIT).await, SelectOutcome::Timeout));
    assert_eq!(mux.dispatch_count(idle), 0);
}

fn run_dispatches(backlogs: &[usize], dispatches: usize) -> (Vec<SelectableId>, Vec<SelectableId>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut mux: EventMultiplexer = EventMultiplexer::new();
        let ids: Vec<SelectableId> = backlogs
            .iter()
            .enumerate()
            .map(|(i, pending)| mux.add_selectable(Backlog::boxed(format!("s{i}"), *pending), 7))
            .collect();
        let mut order = Vec::with_capacity(dispatches);
        for _ in 0..dispatches {
            order.push(dispatch(&mut mux).await);
        }
        (ids, order)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// With N equal-priority sources that all stay ready, every window of
    /// 2N consecutive dispatches includes each of them
    #[test]
    fn prop_equal_priority_window_fairness(
        n in 2usize..6,
        extra in prop::collection::vec(0usize..500, 6),
    ) {
        let rounds = 5;
        let backlogs: Vec<usize> = (0..n).map(|i| rounds * n * 2 + extra[i]).collect();
        let (ids, order) = run_dispatches(&backlogs, rounds * n);

        for window in order.windows(2 * n) {
            for id in &ids {
                prop_assert!(window.contains(id), "{id} missing from window {window:?}");
            }
        }
    }
}
