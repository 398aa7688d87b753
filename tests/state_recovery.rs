use chrono::{NaiveDate, NaiveTime};
use fx_conductor::state::{merge_records, StateStore};
use fx_conductor::trade::{Side, Trade, TradeStatus};
use rust_decimal_macros::dec;

fn plan_entry(id: u32) -> Trade {
    Trade::new(
        id,
        "EUR/USD",
        Side::Buy,
        dec!(0.1),
        NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
        NaiveTime::from_hms_opt(9, 5, 0).expect("valid time"),
    )
}

fn day(year: i32, month: u32, date: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, date).expect("valid date")
}

#[tokio::test]
async fn a_saved_plan_reloads_with_prices_intact() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = StateStore::new(dir.path().join("trade_status.json"));
    let today = day(2025, 1, 1);

    let mut entered = plan_entry(1);
    entered.uic = Some(21);
    entered.status = TradeStatus::Entered;
    entered.entry_order_id = Some("O1".to_owned());
    entered.position_id = Some("P1".to_owned());
    entered.entry_fill_price = Some(dec!(1.10000));
    entered.entry_filled_amount = Some(dec!(1000));

    store.save(today, &[entered.clone()]).await.expect("saved");

    let records = store
        .load(today)
        .await
        .expect("readable")
        .expect("same-day records");

    let mut plan = vec![plan_entry(1)];
    merge_records(&mut plan, &records);

    assert_eq!(plan[0].status, TradeStatus::Entered);
    assert_eq!(plan[0].entry_order_id.as_deref(), Some("O1"));
    assert_eq!(plan[0].position_id.as_deref(), Some("P1"));
    // The decimal survives the string round trip exactly, scale included.
    assert_eq!(plan[0].entry_fill_price, Some(dec!(1.10000)));
    assert_eq!(
        plan[0].entry_fill_price.map(|p| p.to_string()),
        Some("1.10000".to_owned())
    );
}

#[tokio::test]
async fn a_stale_file_is_discarded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = StateStore::new(dir.path().join("trade_status.json"));

    store
        .save(day(2025, 1, 1), &[plan_entry(1)])
        .await
        .expect("saved");

    let records = store.load(day(2025, 1, 2)).await.expect("readable");
    assert!(records.is_none());

    // And it is gone for the next load too.
    let records = store.load(day(2025, 1, 2)).await.expect("readable");
    assert!(records.is_none());
}

#[tokio::test]
async fn a_missing_file_loads_as_nothing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = StateStore::new(dir.path().join("trade_status.json"));

    let records = store.load(day(2025, 1, 1)).await.expect("readable");
    assert!(records.is_none());
}

#[tokio::test]
async fn merge_leaves_unrelated_plan_entries_alone() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = StateStore::new(dir.path().join("trade_status.json"));
    let today = day(2025, 1, 1);

    let mut first = plan_entry(1);
    first.status = TradeStatus::Closed;
    first.exit_fill_price = Some(dec!(1.10120));
    store.save(today, &[first]).await.expect("saved");

    let records = store
        .load(today)
        .await
        .expect("readable")
        .expect("records");

    let mut plan = vec![plan_entry(1), plan_entry(2)];
    merge_records(&mut plan, &records);

    assert_eq!(plan[0].status, TradeStatus::Closed);
    assert_eq!(plan[1].status, TradeStatus::Pending);
}

#[tokio::test]
async fn clear_removes_the_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("trade_status.json");
    let store = StateStore::new(path.clone());
    let today = day(2025, 1, 1);

    store.save(today, &[plan_entry(1)]).await.expect("saved");
    assert!(path.exists());

    store.clear().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn save_overwrites_atomically_per_transition() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("trade_status.json");
    let store = StateStore::new(path.clone());
    let today = day(2025, 1, 1);

    let mut trade = plan_entry(1);
    store.save(today, &[trade.clone()]).await.expect("saved");

    trade.status = TradeStatus::EntrySubmitted;
    trade.entry_order_id = Some("O1".to_owned());
    store.save(today, &[trade]).await.expect("saved again");

    // No temp file left behind, and the latest transition is on disk.
    assert!(!path.with_extension("json.tmp").exists());
    let records = store
        .load(today)
        .await
        .expect("readable")
        .expect("records");
    assert_eq!(records[&1].status, TradeStatus::EntrySubmitted);
}
