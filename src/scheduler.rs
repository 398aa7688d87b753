//! Timed waits: a scheduled moment minus a bounded random advance, with
//! token-validating pings shortly before execution.

use std::future::Future;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;

/// Seconds before the final moment at which the pre-execution pings run.
const PING_LEADS: [i64; 2] = [60, 30];

/// How a scheduled wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The final moment arrived.
    Completed,
    /// The target was already past when the wait began.
    AlreadyPast,
    /// A pre-execution ping failed; the waited action must not run.
    PreCheckFailed,
}

/// Today's occurrence of a wall-clock time in the trading timezone.
///
/// Returns `None` for times skipped by a DST transition.
#[must_use]
pub fn target_today(now: DateTime<Tz>, time: NaiveTime) -> Option<DateTime<Tz>> {
    now.timezone()
        .from_local_datetime(&now.date_naive().and_time(time))
        .earliest()
}

/// The jittered final moment `F = T − Uniform(0, min(random_delay,
/// remaining))`. `None` when the target is already past. `F` always lands in
/// `[now, target]`.
#[must_use]
pub fn jittered_moment(
    now: DateTime<Tz>,
    target: DateTime<Tz>,
    random_delay_sec: u64,
) -> Option<DateTime<Tz>> {
    let remaining_ms = (target - now).num_milliseconds();
    if remaining_ms < 0 {
        return None;
    }

    let bound_ms = remaining_ms.min(
        i64::try_from(random_delay_sec)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000),
    );
    let advance_ms = if bound_ms > 0 {
        rand::thread_rng().gen_range(0..=bound_ms)
    } else {
        0
    };

    Some(target - ChronoDuration::milliseconds(advance_ms))
}

/// Wait until the jittered moment before `target`, running a liveness ping
/// 60 and 30 seconds ahead of it (when those marks are still in the future).
/// The ping returning `false` aborts the wait.
pub async fn wait_until_with_pings<F, Fut>(
    target: DateTime<Tz>,
    random_delay_sec: u64,
    ping: F,
) -> WaitOutcome
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let tz = target.timezone();
    let now = Utc::now().with_timezone(&tz);

    let Some(moment) = jittered_moment(now, target, random_delay_sec) else {
        return WaitOutcome::AlreadyPast;
    };

    log::debug!("waiting until {moment} (target {target})");

    for lead in PING_LEADS {
        let ping_at = moment - ChronoDuration::seconds(lead);
        if ping_at > Utc::now().with_timezone(&tz) {
            sleep_until(ping_at).await;
            if !ping().await {
                log::warn!("pre-execution ping at T-{lead}s failed");
                return WaitOutcome::PreCheckFailed;
            }
        }
    }

    sleep_until(moment).await;

    WaitOutcome::Completed
}

/// Sleep until a wall-clock moment; past moments return immediately.
async fn sleep_until(at: DateTime<Tz>) {
    let delta = at.with_timezone(&Utc) - Utc::now();
    if let Ok(duration) = delta.to_std() {
        tokio::time::sleep(duration).await;
    }
}
