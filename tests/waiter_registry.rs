#![cfg(feature = "streaming")]

use std::time::Duration;

use fx_conductor::ens::{EnsEvent, EnsEventKind};
use fx_conductor::waiters::WaiterRegistry;
use rust_decimal_macros::dec;

fn fill_event(order_id: &str, uic: u64) -> EnsEvent {
    EnsEvent {
        kind: EnsEventKind::OrderFill,
        order_id: Some(order_id.to_owned()),
        uic,
        position_id: Some("P1".to_owned()),
        status: "finalfill".to_owned(),
        execution_price: Some(dec!(1.10000)),
        execution_time: None,
        filled_amount: Some(dec!(1000)),
        amount: Some(dec!(1000)),
    }
}

fn position_closed_event(uic: u64) -> EnsEvent {
    EnsEvent {
        kind: EnsEventKind::PositionClosed,
        order_id: None,
        uic,
        position_id: Some("P1".to_owned()),
        status: "deleted".to_owned(),
        execution_price: None,
        execution_time: None,
        filled_amount: None,
        amount: Some(dec!(0)),
    }
}

#[tokio::test]
async fn a_registered_waiter_receives_its_event() {
    let registry = WaiterRegistry::new();

    let waiting = registry.wait_for(
        Some("O1".to_owned()),
        21,
        vec![EnsEventKind::OrderFill],
        Duration::from_secs(1),
    );
    let dispatching = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.dispatch(fill_event("O1", 21)).await;
    };

    let (event, ()) = tokio::join!(waiting, dispatching);
    let event = event.expect("fill delivered");
    assert_eq!(event.execution_price, Some(dec!(1.10000)));
}

#[tokio::test]
async fn a_late_waiter_drains_the_backlog() {
    let registry = WaiterRegistry::new();

    registry.dispatch(fill_event("O1", 21)).await;
    assert_eq!(registry.backlog_len().await, 1);

    let event = registry
        .wait_for(
            Some("O1".to_owned()),
            21,
            vec![EnsEventKind::OrderFill],
            Duration::from_millis(50),
        )
        .await
        .expect("resolved from the backlog");
    assert_eq!(event.order_id.as_deref(), Some("O1"));
    assert_eq!(registry.backlog_len().await, 0);
}

#[tokio::test]
async fn the_backlog_is_bounded_and_evicts_oldest_first() {
    let registry = WaiterRegistry::new();

    for n in 0..105u64 {
        registry.dispatch(fill_event(&format!("O{n}"), 21)).await;
    }
    assert_eq!(registry.backlog_len().await, 100);

    // The five oldest are gone.
    let evicted = registry
        .wait_for(
            Some("O0".to_owned()),
            21,
            vec![EnsEventKind::OrderFill],
            Duration::from_millis(50),
        )
        .await;
    assert!(evicted.is_none());

    let survivor = registry
        .wait_for(
            Some("O5".to_owned()),
            21,
            vec![EnsEventKind::OrderFill],
            Duration::from_millis(50),
        )
        .await;
    assert!(survivor.is_some());
}

#[tokio::test]
async fn a_timed_out_waiter_is_unregistered() {
    let registry = WaiterRegistry::new();

    let event = registry
        .wait_for(
            Some("O1".to_owned()),
            21,
            vec![EnsEventKind::OrderFill],
            Duration::from_millis(20),
        )
        .await;
    assert!(event.is_none());

    // The event arriving later finds no waiter and lands in the backlog.
    registry.dispatch(fill_event("O1", 21)).await;
    assert_eq!(registry.backlog_len().await, 1);
}

#[tokio::test]
async fn every_matching_waiter_resolves_exactly_once() {
    let registry = WaiterRegistry::new();

    let first = registry.wait_for(
        None,
        21,
        vec![EnsEventKind::PositionClosed],
        Duration::from_secs(1),
    );
    let second = registry.wait_for(
        None,
        21,
        vec![EnsEventKind::PositionClosed],
        Duration::from_secs(1),
    );
    let dispatching = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.dispatch(position_closed_event(21)).await;
    };

    let (first, second, ()) = tokio::join!(first, second, dispatching);
    assert!(first.is_some());
    assert!(second.is_some());
}

#[tokio::test]
async fn order_scoped_kinds_require_the_matching_order_id() {
    let registry = WaiterRegistry::new();

    registry.dispatch(fill_event("OTHER", 21)).await;

    let event = registry
        .wait_for(
            Some("O1".to_owned()),
            21,
            vec![EnsEventKind::OrderFill],
            Duration::from_millis(50),
        )
        .await;
    assert!(event.is_none());
}

#[tokio::test]
async fn a_fill_waiter_ignores_non_fill_statuses() {
    let registry = WaiterRegistry::new();

    let mut event = fill_event("O1", 21);
    event.status = "working".to_owned();
    registry.dispatch(event).await;

    let resolved = registry
        .wait_for(
            Some("O1".to_owned()),
            21,
            vec![EnsEventKind::OrderFill],
            Duration::from_millis(50),
        )
        .await;
    assert!(resolved.is_none());
}

#[tokio::test]
async fn uic_mismatch_never_matches() {
    let registry = WaiterRegistry::new();

    registry.dispatch(fill_event("O1", 99)).await;

    let event = registry
        .wait_for(
            Some("O1".to_owned()),
            21,
            vec![EnsEventKind::OrderFill],
            Duration::from_millis(50),
        )
        .await;
    assert!(event.is_none());
}
