#![cfg(feature = "streaming")]

use fx_conductor::ens::data::{ActivityEnvelope, ActivityItem};
use fx_conductor::ens::{classify_payload, EnsEventKind, PayloadClass};
use rust_decimal_macros::dec;

fn item(json: serde_json::Value) -> ActivityItem {
    serde_json::from_value(json).expect("valid activity item")
}

#[test]
fn a_confirmed_final_fill_becomes_an_order_fill() {
    let event = item(serde_json::json!({
        "ActivityType": "Orders",
        "OrderId": "O1",
        "Uic": 21,
        "Status": "FinalFill",
        "SubStatus": "Confirmed",
        "ExecutionPrice": 1.10000,
        "FilledAmount": 1000,
        "Amount": 1000,
        "PositionId": "P1"
    }))
    .to_event()
    .expect("a fill event");

    assert_eq!(event.kind, EnsEventKind::OrderFill);
    assert_eq!(event.order_id.as_deref(), Some("O1"));
    assert_eq!(event.uic, 21);
    assert_eq!(event.status, "finalfill");
    assert_eq!(event.execution_price, Some(dec!(1.10000)));
    assert_eq!(event.position_id.as_deref(), Some("P1"));
}

#[test]
fn a_partial_fill_is_not_an_event_yet() {
    let event = item(serde_json::json!({
        "ActivityType": "Orders",
        "OrderId": "O1",
        "Uic": 21,
        "Status": "Fill",
        "SubStatus": "Confirmed",
        "FilledAmount": 400,
        "Amount": 1000
    }))
    .to_event();

    assert!(event.is_none());
}

#[test]
fn a_full_fill_counts_even_without_final_status() {
    let event = item(serde_json::json!({
        "ActivityType": "Orders",
        "OrderId": "O1",
        "Uic": 21,
        "Status": "Fill",
        "SubStatus": "Confirmed",
        "FilledAmount": 1000,
        "Amount": 1000
    }))
    .to_event()
    .expect("a fill event");

    assert_eq!(event.kind, EnsEventKind::OrderFill);
}

#[test]
fn an_unconfirmed_fill_is_ignored() {
    let event = item(serde_json::json!({
        "ActivityType": "Orders",
        "OrderId": "O1",
        "Uic": 21,
        "Status": "FinalFill",
        "SubStatus": "Pending"
    }))
    .to_event();

    assert!(event.is_none());
}

#[test]
fn cancellations_in_both_spellings_become_status_changes() {
    for status in ["Canceled", "Cancelled", "Rejected", "Expired"] {
        let event = item(serde_json::json!({
            "ActivityType": "Orders",
            "OrderId": "T1",
            "Uic": 21,
            "Status": status
        }))
        .to_event()
        .expect("a status change");

        assert_eq!(event.kind, EnsEventKind::OrderStatusChange);
        assert_eq!(event.status, status.to_lowercase());
    }
}

#[test]
fn a_deleted_position_becomes_position_closed() {
    let event = item(serde_json::json!({
        "ActivityType": "Positions",
        "Uic": 21,
        "PositionId": "P1",
        "PositionEvent": "Deleted"
    }))
    .to_event()
    .expect("a position event");

    assert_eq!(event.kind, EnsEventKind::PositionClosed);
}

#[test]
fn a_zero_amount_position_becomes_position_closed() {
    let event = item(serde_json::json!({
        "ActivityType": "Positions",
        "Uic": 21,
        "PositionId": "P1",
        "Amount": 0
    }))
    .to_event()
    .expect("a position event");

    assert_eq!(event.kind, EnsEventKind::PositionClosed);
}

#[test]
fn an_open_position_update_is_ignored() {
    let event = item(serde_json::json!({
        "ActivityType": "Positions",
        "Uic": 21,
        "PositionId": "P1",
        "Amount": 1000
    }))
    .to_event();

    assert!(event.is_none());
}

#[test]
fn an_item_without_a_uic_cannot_be_matched() {
    let event = item(serde_json::json!({
        "ActivityType": "Orders",
        "OrderId": "O1",
        "Status": "FinalFill",
        "SubStatus": "Confirmed"
    }))
    .to_event();

    assert!(event.is_none());
}

#[test]
fn an_envelope_parses_its_data_list() {
    let envelope: ActivityEnvelope = serde_json::from_value(serde_json::json!({
        "Data": [
            {"ActivityType": "Orders", "OrderId": "O1", "Uic": 21, "Status": "Expired"},
            {"ActivityType": "Positions", "Uic": 21, "Amount": 0}
        ]
    }))
    .expect("valid envelope");

    let events: Vec<_> = envelope
        .data
        .iter()
        .filter_map(ActivityItem::to_event)
        .collect();
    assert_eq!(events.len(), 2);
}

#[test]
fn control_reasons_and_message_types_classify_as_control() {
    for reason in [
        "SubscriptionPermanentlyDisabled",
        "SessionLimitExceeded",
        "SubscriptionDisabled",
    ] {
        let payload = serde_json::json!({ "Reason": reason });
        assert_eq!(
            classify_payload(&payload),
            PayloadClass::Control(reason.to_owned())
        );
    }

    for kind in ["disconnect", "reset", "reset-subscriptions"] {
        let payload = serde_json::json!({ "MessageType": kind });
        assert_eq!(
            classify_payload(&payload),
            PayloadClass::Control(kind.to_owned())
        );
    }
}

#[test]
fn activity_payloads_are_not_control() {
    let payload = serde_json::json!({
        "Data": [{"ActivityType": "Orders", "OrderId": "O1", "Uic": 21, "Status": "Working"}]
    });
    assert_eq!(classify_payload(&payload), PayloadClass::Activity);

    // An unknown reason is activity too; only the known set reconnects.
    let payload = serde_json::json!({ "Reason": "SomethingElse" });
    assert_eq!(classify_payload(&payload), PayloadClass::Activity);
}
