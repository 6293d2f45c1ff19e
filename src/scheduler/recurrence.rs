//! Cron expressions

use crate::{WatchError, WatchResult};
use chrono::{DateTime, Local};
use cron::Schedule;
use std::str::FromStr;

/// A validated cron expression evaluated in local time.
///
/// Classic five-field crontab lines are accepted and run at second zero;
/// six and seven field expressions are passed through as written.
#[derive(Debug, Clone)]
pub struct Recurrence {
    expr: String,
    schedule: Schedule,
}

impl Recurrence {
    pub fn parse(expr: &str) -> WatchResult<Self> {
        let trimmed = expr.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {}", trimmed),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(WatchError::InvalidCron {
                    expr: expr.to_string(),
                    reason: format!("expected 5 to 7 fields, found {}", n),
                })
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| WatchError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(after).next()
    }

    pub fn upcoming(&self, count: usize) -> Vec<DateTime<Local>> {
        self.schedule.upcoming(Local).take(count).collect()
    }
}

/// Reject expressions the scheduler could not run
pub fn validate_cron(expr: &str) -> WatchResult<()> {
    Recurrence::parse(expr).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_five_field_expression() {
        let every_five = Recurrence::parse("*/5 * * * *").unwrap();
        let start = Local.with_ymd_and_hms(2024, 5, 1, 10, 2, 30).unwrap();
        let next = every_five.next_after(&start).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 5, 0));
        assert_eq!(every_five.expr(), "*/5 * * * *");
    }

    #[test]
    fn test_six_field_expression() {
        let nightly = Recurrence::parse("0 0 3 * * *").unwrap();
        let start = Local.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let next = nightly.next_after(&start).unwrap();
        assert_eq!((next.hour(), next.minute()), (3, 0));
        assert!(next > start);
        assert_eq!(nightly.upcoming(3).len(), 3);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(validate_cron("every day"), Err(WatchError::InvalidCron { .. })));
        assert!(matches!(validate_cron("* * *"), Err(WatchError::InvalidCron { .. })));
        assert!(matches!(validate_cron("61 * * * *"), Err(WatchError::InvalidCron { .. })));
        assert!(validate_cron("30 2 * * *").is_ok());
    }
}
