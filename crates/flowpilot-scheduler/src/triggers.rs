// Cron and interval trigger parsing
//
// Cron expressions come in as 5 fields (minute-first) or 6 fields
// (seconds-first). The cron crate wants a seconds field, so 5-field
// expressions get a literal `0` prefixed. Timezone "local" means the
// process's local zone; anything else must be an IANA name.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

use flowpilot_core::trigger::parse_interval_seconds;
use flowpilot_core::Trigger;

#[derive(Debug, Error)]
pub enum TriggerParseError {
    #[error("invalid cron expression '{expression}': {reason}")]
    Cron { expression: String, reason: String },

    #[error("invalid interval '{0}': use a format like '30s', '5m', '2h', '1d'")]
    Interval(String),

    #[error("unknown timezone '{0}'")]
    Timezone(String),

    #[error("trigger type '{0}' is not schedulable")]
    NotSchedulable(&'static str),
}

/// A parsed, schedulable trigger.
#[derive(Debug, Clone)]
pub enum TriggerSchedule {
    Cron {
        schedule: Box<Schedule>,
        timezone: Option<Tz>,
    },
    Interval(Duration),
}

impl TriggerSchedule {
    /// Parse a workflow trigger into a schedulable form.
    pub fn parse(trigger: &Trigger) -> Result<Self, TriggerParseError> {
        match trigger {
            Trigger::Cron { schedule, timezone } => {
                let fields = schedule.split_whitespace().count();
                let expression = match fields {
                    5 => format!("0 {schedule}"),
                    6 => schedule.clone(),
                    n => {
                        return Err(TriggerParseError::Cron {
                            expression: schedule.clone(),
                            reason: format!("expected 5 or 6 fields, got {n}"),
                        })
                    }
                };

                let parsed =
                    Schedule::from_str(&expression).map_err(|e| TriggerParseError::Cron {
                        expression: schedule.clone(),
                        reason: e.to_string(),
                    })?;

                let timezone = if timezone == "local" {
                    None
                } else {
                    Some(
                        timezone
                            .parse::<Tz>()
                            .map_err(|_| TriggerParseError::Timezone(timezone.clone()))?,
                    )
                };

                Ok(Self::Cron {
                    schedule: Box::new(parsed),
                    timezone,
                })
            }
            Trigger::Interval { every } => {
                let seconds = parse_interval_seconds(every)
                    .ok_or_else(|| TriggerParseError::Interval(every.clone()))?;
                Ok(Self::Interval(Duration::seconds(seconds as i64)))
            }
            other => Err(TriggerParseError::NotSchedulable(other.kind())),
        }
    }

    /// Next firing time strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { schedule, timezone } => match timezone {
                Some(tz) => schedule
                    .after(&after.with_timezone(tz))
                    .next()
                    .map(|t| t.with_timezone(&Utc)),
                None => schedule
                    .after(&after.with_timezone(&chrono::Local))
                    .next()
                    .map(|t| t.with_timezone(&Utc)),
            },
            Self::Interval(interval) => Some(after + *interval),
        }
    }

    /// Human-readable description used in status listings.
    pub fn describe(&self) -> String {
        match self {
            Self::Cron { schedule, timezone } => match timezone {
                Some(tz) => format!("cron[{schedule}, {tz}]"),
                None => format!("cron[{schedule}]"),
            },
            Self::Interval(interval) => format!("interval[{}s]", interval.num_seconds()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trigger(value: serde_json::Value) -> Trigger {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_five_field_cron_gains_seconds() {
        let schedule = TriggerSchedule::parse(&trigger(json!({
            "type": "cron", "schedule": "*/5 * * * *",
        })))
        .unwrap();

        let now = Utc::now();
        let next = schedule.next_fire(now).unwrap();
        assert!(next > now);
        // fires land on minute boundaries divisible by five
        assert!(next.timestamp() % 60 == 0);
        assert!((next - now) <= Duration::minutes(5));
    }

    #[test]
    fn test_six_field_cron_with_seconds() {
        let schedule = TriggerSchedule::parse(&trigger(json!({
            "type": "cron", "schedule": "30 * * * * *",
        })))
        .unwrap();

        let now = Utc::now();
        let next = schedule.next_fire(now).unwrap();
        assert_eq!(next.timestamp() % 60, 30);
    }

    #[test]
    fn test_every_minute_fires_within_sixty_seconds() {
        let schedule = TriggerSchedule::parse(&trigger(json!({
            "type": "cron", "schedule": "*/1 * * * *",
        })))
        .unwrap();
        let now = Utc::now();
        let next = schedule.next_fire(now).unwrap();
        assert!((next - now) <= Duration::seconds(60));
    }

    #[test]
    fn test_named_timezone() {
        let schedule = TriggerSchedule::parse(&trigger(json!({
            "type": "cron", "schedule": "0 9 * * *", "timezone": "Europe/Paris",
        })))
        .unwrap();
        assert!(schedule.describe().contains("Europe/Paris"));

        let err = TriggerSchedule::parse(&trigger(json!({
            "type": "cron", "schedule": "0 9 * * *", "timezone": "Mars/Olympus",
        })))
        .unwrap_err();
        assert!(matches!(err, TriggerParseError::Timezone(_)));
    }

    #[test]
    fn test_interval_parsing() {
        let schedule = TriggerSchedule::parse(&trigger(json!({
            "type": "interval", "every": "90s",
        })))
        .unwrap();
        let now = Utc::now();
        assert_eq!(schedule.next_fire(now).unwrap(), now + Duration::seconds(90));

        let err = TriggerSchedule::parse(&trigger(json!({
            "type": "interval", "every": "soon",
        })))
        .unwrap_err();
        assert!(matches!(err, TriggerParseError::Interval(_)));
    }

    #[test]
    fn test_non_schedulable_trigger() {
        let err = TriggerSchedule::parse(&trigger(json!({"type": "manual"}))).unwrap_err();
        assert!(matches!(err, TriggerParseError::NotSchedulable("manual")));
    }
}
