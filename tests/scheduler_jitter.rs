use chrono::{NaiveTime, TimeZone};
use chrono_tz::Asia::Tokyo;
use fx_conductor::scheduler::{jittered_moment, target_today};

#[test]
fn the_final_moment_lands_between_now_and_the_target() {
    let now = Tokyo.with_ymd_and_hms(2025, 1, 1, 8, 59, 30).unwrap();
    let target = Tokyo.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

    for _ in 0..200 {
        let moment = jittered_moment(now, target, 3).expect("target is ahead");
        assert!(moment >= now && moment <= target);
        // The advance is bounded by the configured delay.
        assert!((target - moment).num_milliseconds() <= 3_000);
    }
}

#[test]
fn a_delay_larger_than_the_remaining_time_is_clamped() {
    let now = Tokyo.with_ymd_and_hms(2025, 1, 1, 8, 59, 58).unwrap();
    let target = Tokyo.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

    for _ in 0..200 {
        let moment = jittered_moment(now, target, 3_600).expect("target is ahead");
        assert!(moment >= now && moment <= target);
    }
}

#[test]
fn a_past_target_yields_no_moment() {
    let now = Tokyo.with_ymd_and_hms(2025, 1, 1, 9, 0, 1).unwrap();
    let target = Tokyo.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

    assert!(jittered_moment(now, target, 3).is_none());
}

#[test]
fn zero_delay_means_no_advance() {
    let now = Tokyo.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
    let target = Tokyo.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

    let moment = jittered_moment(now, target, 0).expect("target is ahead");
    assert_eq!(moment, target);
}

#[test]
fn target_today_combines_date_and_wall_clock() {
    let now = Tokyo.with_ymd_and_hms(2025, 1, 1, 7, 30, 0).unwrap();
    let time = NaiveTime::from_hms_opt(9, 0, 0).expect("valid time");

    let target = target_today(now, time).expect("unambiguous time");
    assert_eq!(target, Tokyo.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap());
}
