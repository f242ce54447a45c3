//! 5-field cron expression handling.
//!
//! Schedules and cron triggers carry classic 5-field crontab expressions;
//! the parser's grammar wants a seconds field, so one is prepended.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use smelter_core::SmelterError;

/// Parse a 5-field crontab expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, SmelterError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(SmelterError::InvalidArgument(format!(
            "cron expression must have 5 fields, got {fields}: {expr:?}"
        )));
    }
    Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| SmelterError::InvalidArgument(format!("invalid cron expression {expr:?}: {e}")))
}

/// Next fire time strictly after `now`.
pub fn next_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_five_field_expressions() {
        assert!(parse_cron("0 * * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("30 4 * * 1").is_ok());
    }

    #[test]
    fn rejects_wrong_arity_and_garbage() {
        assert!(parse_cron("* * * *").is_err());
        assert!(parse_cron("0 0 * * * *").is_err());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn next_after_advances_to_the_next_hour() {
        let schedule = parse_cron("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 0).unwrap();
        let next = next_after(&schedule, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap());
    }
}
