//! Upload deadline selection.

use chrono::{DateTime, Duration, Utc};

/// Instant by which pending uploads should be done: the earliest of the
/// configured horizon, the next snapshot, and the verification deadline of
/// the last verified backup. Candidates already in the past are ignored.
pub fn upload_target(
    now: DateTime<Utc>,
    target_minutes: u64,
    next_snapshot: Option<DateTime<Utc>>,
    last_verified_start: Option<DateTime<Utc>>,
    slo_hours: i64,
) -> Option<DateTime<Utc>> {
    let horizon = (target_minutes > 0).then(|| now + Duration::minutes(target_minutes as i64));
    let slo_deadline = last_verified_start.map(|start| start + Duration::hours(slo_hours));

    [horizon, next_snapshot, slo_deadline]
        .into_iter()
        .flatten()
        .filter(|candidate| *candidate > now)
        .min()
}
