//! Time-based trigger arguments and instant resolution.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Offset from the owning plan execution's start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeltaArgs {
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub minutes: u32,
    #[serde(default)]
    pub seconds: u32,
}

impl DeltaArgs {
    pub fn offset(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hours))
            + chrono::Duration::minutes(i64::from(self.minutes))
            + chrono::Duration::seconds(i64::from(self.seconds))
    }

    /// Wall-clock instant: plan start + offset + time already spent paused.
    pub fn resolve(&self, plan_start: DateTime<Utc>, paused_total: chrono::Duration) -> DateTime<Utc> {
        plan_start + self.offset() + paused_total
    }
}

/// Fixed instant. `datetime` is RFC 3339, or a naive local time interpreted
/// in `timezone` (UTC when absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatetimeArgs {
    pub datetime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl DatetimeArgs {
    pub fn resolve(&self) -> Result<DateTime<Utc>> {
        if let Ok(instant) = DateTime::parse_from_rfc3339(&self.datetime) {
            return Ok(instant.with_timezone(&Utc));
        }

        let naive = NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(&self.datetime, format).ok())
            .ok_or_else(|| Error::validation(format!("invalid datetime '{}'", self.datetime)))?;

        let zone: Tz = match &self.timezone {
            Some(name) => name
                .parse()
                .map_err(|_| Error::validation(format!("unknown timezone '{}'", name)))?,
            None => Tz::UTC,
        };

        zone.from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| {
                Error::validation(format!(
                    "datetime '{}' does not exist in {}",
                    self.datetime, zone
                ))
            })
    }
}
