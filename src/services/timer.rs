//! Stateless timer math. Displays are recomputed from timestamps on every
//! refresh tick instead of being driven by per-timer intervals.

use time::OffsetDateTime;

use crate::state::game::Timer;

/// Rendered in place of a duration that is missing or not a number.
pub const UNKNOWN_DURATION: &str = "--:--";

/// Seconds between two timestamps, if both exist and are ordered.
pub fn duration_between(start: Option<OffsetDateTime>, end: Option<OffsetDateTime>) -> Option<f64> {
    let (start, end) = (start?, end?);
    let seconds = (end - start).as_seconds_f64();
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

/// Seconds elapsed from `start` until `now`.
pub fn elapsed_since(start: Option<OffsetDateTime>, now: OffsetDateTime) -> Option<f64> {
    duration_between(start, Some(now))
}

/// Format seconds as `M:SS`, truncating fractions.
pub fn format_duration(seconds: Option<f64>) -> String {
    match seconds {
        Some(value) if value.is_finite() && value >= 0.0 => {
            let total = value.floor() as u64;
            format!("{}:{:02}", total / 60, total % 60)
        }
        _ => UNKNOWN_DURATION.to_string(),
    }
}

/// What a timer should display at `now`: the final duration once stopped,
/// the live elapsed time while running.
pub fn timer_display(timer: &Timer, now: OffsetDateTime) -> String {
    if timer.is_running() {
        return format_duration(elapsed_since(timer.started_at, now));
    }
    format_duration(timer.resolved_duration())
}

/// Round to two decimals, matching how the server reports metrics.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
