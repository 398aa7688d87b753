use chrono::{NaiveDate, NaiveTime};
use fx_conductor::trade::{
    pip_value_for_pair, pips_profit, round_price, OrderLeg, Side, Trade,
};
use rust_decimal_macros::dec;

fn trade(pair: &str) -> Trade {
    Trade::new(
        1,
        pair,
        Side::Buy,
        dec!(0.1),
        NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
        NaiveTime::from_hms_opt(9, 5, 0).expect("valid time"),
    )
}

#[test]
fn jpy_quoted_pairs_use_the_larger_pip() {
    assert_eq!(pip_value_for_pair("USD/JPY"), dec!(0.01));
    assert_eq!(pip_value_for_pair("EUR/JPY"), dec!(0.01));
    assert_eq!(pip_value_for_pair("EUR/USD"), dec!(0.0001));
    assert_eq!(pip_value_for_pair("GBP/CHF"), dec!(0.0001));
}

#[test]
fn pips_profit_is_antisymmetric_and_zero_on_equal_prices() {
    let pip = dec!(0.0001);

    let forward = pips_profit(dec!(1.10000), dec!(1.10120), Side::Buy, pip);
    let backward = pips_profit(dec!(1.10120), dec!(1.10000), Side::Buy, pip);
    assert_eq!(forward, dec!(12.0));
    assert_eq!(forward, -backward);

    assert_eq!(
        pips_profit(dec!(1.10000), dec!(1.10000), Side::Sell, pip),
        dec!(0.0)
    );
}

#[test]
fn a_sell_gains_when_the_price_falls() {
    let pip = dec!(0.01);
    let profit = pips_profit(dec!(145.50), dec!(145.38), Side::Sell, pip);
    assert_eq!(profit, dec!(12.0));
}

#[test]
fn pips_round_half_up_to_a_tenth() {
    let pip = dec!(0.0001);
    // 1.25 pips exactly, the midpoint rounds away from zero.
    let profit = pips_profit(dec!(1.10000), dec!(1.100125), Side::Buy, pip);
    assert_eq!(profit, dec!(1.3));
}

#[test]
fn bracket_prices_round_half_up_to_instrument_decimals() {
    assert_eq!(round_price(dec!(1.234565), 5), dec!(1.23457));
    assert_eq!(round_price(dec!(1.234564), 5), dec!(1.23456));
    assert_eq!(round_price(dec!(145.505), 2), dec!(145.51));
}

#[test]
fn amount_is_lot_size_times_ten_thousand() {
    assert_eq!(trade("EUR/USD").amount(), dec!(1000));

    let mut big = trade("EUR/USD");
    big.lot_size = dec!(2.5);
    assert_eq!(big.amount(), dec!(25000));
}

#[test]
fn external_reference_carries_day_trade_and_leg() {
    let date = NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date");
    let trade = trade("EUR/USD");

    assert_eq!(
        trade.external_reference(date, OrderLeg::Entry),
        "20250101_trade_1_entry_v1"
    );
    assert_eq!(
        trade.external_reference(date, OrderLeg::Exit),
        "20250101_trade_1_exit_v1"
    );
}

#[test]
fn settle_pips_needs_both_fills() {
    let mut open = trade("EUR/USD");
    open.entry_fill_price = Some(dec!(1.10000));
    open.settle_pips();
    assert!(open.pips_profit.is_none());

    open.exit_fill_price = Some(dec!(1.10120));
    open.settle_pips();
    assert_eq!(open.pips_profit, Some(dec!(12.0)));
}
