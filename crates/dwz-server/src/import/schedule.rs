//! Cron schedule for automatic imports

use chrono::{DateTime, Utc};
use std::str::FromStr;

use super::error::{ImportError, ImportResult};

/// Parsed cron expression
///
/// Accepts classic 5-field expressions (`min hour dom month dow`) by prepending a
/// zero seconds field, as well as the 6/7-field form understood by the `cron` crate.
/// Note that numeric day-of-week values follow the `cron` crate (1 = Sunday); prefer
/// names such as `Mon-Fri`.
#[derive(Debug, Clone)]
pub struct ImportSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl ImportSchedule {
    pub fn parse(expression: &str) -> ImportResult<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {}", trimmed),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(ImportError::Config(format!(
                    "schedule {:?} has {} fields, expected 5, 6 or 7",
                    expression, n
                )))
            },
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            ImportError::Config(format!("invalid schedule {:?}: {}", expression, e))
        })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_daily_expression() {
        let schedule = ImportSchedule::parse("0 3 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 8, 6, 10, 15, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 7, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_next_is_strictly_after_now() {
        let schedule = ImportSchedule::parse("0 3 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 8, 6, 3, 0, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 7, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_six_field_expression_passes_through() {
        let schedule = ImportSchedule::parse("30 0 */6 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 8, 6, 1, 0, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 6, 6, 0, 30).unwrap());
        assert_eq!(schedule.expression(), "30 0 */6 * * *");
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(ImportSchedule::parse("").is_err());
        assert!(ImportSchedule::parse("nightly").is_err());
        assert!(ImportSchedule::parse("61 3 * * *").is_err());
    }
}
