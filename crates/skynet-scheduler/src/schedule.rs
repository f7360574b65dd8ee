use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::ScheduleType;

/// Accept both standard 5-field Unix cron (`m h dom mon dow`) and 6/7-field
/// quartz-style expressions (`sec m h dom mon dow [year]`) that the `cron`
/// crate parses natively. A 5-field expression is normalized by prepending
/// a `0` seconds field so it runs on the minute boundary a Unix user expects.
fn normalize_cron(expression: &str) -> String {
    let field_count = expression.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Validate a cron expression without computing a run time. Used to reject
/// bad schedules at task-creation time rather than silently parking the task.
pub fn validate_cron(expression: &str) -> Result<(), String> {
    cron::Schedule::from_str(&normalize_cron(expression))
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Validate any schedule up front so `add_task` rejects it before it ever
/// sits with a missing `next_run`.
pub fn validate_schedule(schedule_type: ScheduleType, value: &str) -> Result<(), String> {
    match schedule_type {
        ScheduleType::Cron => validate_cron(value),
        ScheduleType::Interval => value
            .parse::<u64>()
            .map(|_| ())
            .map_err(|_| format!("interval schedule_value must be a whole number of ms: {value:?}")),
        ScheduleType::Once => DateTime::parse_from_rfc3339(value)
            .map(|_| ())
            .map_err(|e| format!("once schedule_value must be RFC3339: {e}")),
    }
}

/// Resolve a task's timezone name, falling back to the host's local offset
/// when unset or unrecognised.
fn resolve_timezone(timezone: Option<&str>) -> Tz {
    timezone
        .and_then(|tz| Tz::from_str(tz).ok())
        .unwrap_or(chrono_tz::UTC)
}

/// Compute the next UTC execution time for a task's schedule, starting
/// *after* `from`.
///
/// Returns `Ok(None)` when the schedule is exhausted (a `once` task whose
/// instant has passed). Returns `Err` for a schedule that fails to parse —
/// the caller pauses the task with the message as `last_error`.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    value: &str,
    timezone: Option<&str>,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    match schedule_type {
        ScheduleType::Once => {
            let at = DateTime::parse_from_rfc3339(value)
                .map_err(|e| format!("invalid once instant {value:?}: {e}"))?
                .with_timezone(&Utc);
            Ok(if at > from { Some(at) } else { None })
        }

        ScheduleType::Interval => {
            let every_ms: i64 = value
                .parse()
                .map_err(|_| format!("invalid interval schedule_value: {value:?}"))?;
            Ok(Some(from + chrono::Duration::milliseconds(every_ms)))
        }

        ScheduleType::Cron => {
            let normalized = normalize_cron(value);
            let sched = cron::Schedule::from_str(&normalized)
                .map_err(|e| format!("invalid cron expression {value:?}: {e}"))?;
            let tz = resolve_timezone(timezone);
            let from_in_tz = from.with_timezone(&tz);
            match sched.after(&from_in_tz).next() {
                Some(next) => Ok(Some(next.with_timezone(&Utc))),
                None => {
                    warn!(expression = value, "cron schedule produced no further occurrences");
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_unix_cron_is_normalized() {
        assert!(validate_cron("*/5 * * * *").is_ok());
    }

    #[test]
    fn six_field_quartz_cron_is_accepted_unmodified() {
        assert!(validate_cron("0 */5 * * * *").is_ok());
    }

    #[test]
    fn garbage_cron_is_rejected() {
        assert!(validate_cron("not a schedule").is_err());
    }

    #[test]
    fn five_field_cron_fires_every_five_minutes() {
        let from = DateTime::parse_from_rfc3339("2026-01-01T00:00:30Z").unwrap().with_timezone(&Utc);
        let next = compute_next_run(ScheduleType::Cron, "*/5 * * * *", None, from)
            .unwrap()
            .unwrap();
        assert_eq!(next.to_rfc3339(), "2026-01-01T00:05:00+00:00");
    }

    #[test]
    fn interval_adds_milliseconds() {
        let from = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let next = compute_next_run(ScheduleType::Interval, "60000", None, from).unwrap().unwrap();
        assert_eq!(next, from + chrono::Duration::seconds(60));
    }

    #[test]
    fn once_in_the_past_has_no_next_run() {
        let from = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let next = compute_next_run(ScheduleType::Once, "2020-01-01T00:00:00Z", None, from).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn cron_honours_named_timezone() {
        // 09:00 in America/New_York is 14:00 UTC (winter, no DST).
        let from = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let next = compute_next_run(ScheduleType::Cron, "0 9 * * *", Some("America/New_York"), from)
            .unwrap()
            .unwrap();
        assert_eq!(next.to_rfc3339(), "2026-01-01T14:00:00+00:00");
    }

    #[test]
    fn invalid_interval_value_is_rejected() {
        assert!(validate_schedule(ScheduleType::Interval, "soon").is_err());
    }
}
