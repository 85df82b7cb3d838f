// libs/appointment-cell/src/services/window.rs
use chrono::{DateTime, Duration, Utc};

/// Join-window bounds relative to the scheduled slot. The values mirror
/// the constants the NutriSensia frontend displays to patients; change
/// them only with product sign-off.
#[derive(Debug, Clone)]
pub struct JoinWindowConfig {
    pub opens_minutes_before: i64,
    pub closes_minutes_after_end: i64,
}

impl Default for JoinWindowConfig {
    fn default() -> Self {
        Self {
            opens_minutes_before: 15,
            closes_minutes_after_end: 30,
        }
    }
}

impl JoinWindowConfig {
    pub fn opens_at(&self, scheduled_at: DateTime<Utc>) -> DateTime<Utc> {
        scheduled_at - Duration::minutes(self.opens_minutes_before)
    }

    pub fn closes_at(&self, scheduled_end_at: DateTime<Utc>) -> DateTime<Utc> {
        scheduled_end_at + Duration::minutes(self.closes_minutes_after_end)
    }
}

/// Whether `now` falls inside the join window. Both boundaries are
/// inclusive: joining exactly at open or close is allowed.
pub fn can_join(
    config: &JoinWindowConfig,
    now: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    scheduled_end_at: DateTime<Utc>,
) -> bool {
    now >= config.opens_at(scheduled_at) && now <= config.closes_at(scheduled_end_at)
}

/// Whole minutes until the window opens, rounded up so a caller one
/// second early still reads "opens in 1m". Zero once the window is open.
pub fn minutes_until_window_opens(
    config: &JoinWindowConfig,
    now: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
) -> i64 {
    let opens_at = config.opens_at(scheduled_at);
    if now >= opens_at {
        return 0;
    }
    let seconds = (opens_at - now).num_seconds();
    (seconds + 59) / 60
}

pub fn has_window_closed(
    config: &JoinWindowConfig,
    now: DateTime<Utc>,
    scheduled_end_at: DateTime<Utc>,
) -> bool {
    now > config.closes_at(scheduled_end_at)
}
