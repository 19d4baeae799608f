//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, with `*`, numbers,
//! `a-b` ranges, `*/n` and `a-b/n` steps, comma lists and three-letter
//! month/day names. Day-of-week accepts 0-7 where both 0 and 7 are Sunday.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// One parsed cron field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronField {
    /// `*`
    Any,
    /// `*/n`
    Every(u8),
    /// Explicit set of values.
    Values(BTreeSet<u8>),
}

struct FieldKind {
    name: &'static str,
    min: u8,
    max: u8,
    names: &'static [&'static str],
}

const MINUTE: FieldKind = FieldKind {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldKind = FieldKind {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldKind = FieldKind {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldKind = FieldKind {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};
const DAY_OF_WEEK: FieldKind = FieldKind {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

impl FieldKind {
    fn parse(&self, raw: &str) -> Result<CronField, ScheduleError> {
        if raw == "*" {
            return Ok(CronField::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            return Ok(CronField::Every(self.parse_step(step)?));
        }

        let mut values = BTreeSet::new();
        for part in raw.split(',') {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => (base, self.parse_step(step)?),
                None => (part, 1),
            };
            let (start, end) = if base == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = base.split_once('-') {
                (self.parse_value(a)?, self.parse_value(b)?)
            } else {
                let value = self.parse_value(base)?;
                // `a/n` runs from a to the end of the field
                if part.contains('/') {
                    (value, self.max)
                } else {
                    (value, value)
                }
            };
            if start > end {
                return Err(ScheduleError::EmptyRange {
                    field: self.name,
                    start,
                    end,
                });
            }
            let mut v = start;
            while v <= end {
                values.insert(self.normalize(v));
                match v.checked_add(step) {
                    Some(next) => v = next,
                    None => break,
                }
            }
        }
        Ok(CronField::Values(values))
    }

    fn parse_step(&self, raw: &str) -> Result<u8, ScheduleError> {
        match raw.parse::<u8>() {
            Ok(step) if step > 0 && step <= self.max => Ok(step),
            _ => Err(ScheduleError::InvalidStep {
                field: self.name,
                step: raw.to_string(),
            }),
        }
    }

    fn parse_value(&self, raw: &str) -> Result<u8, ScheduleError> {
        let lower = raw.to_ascii_lowercase();
        if let Some(pos) = self.names.iter().position(|n| *n == lower) {
            // month names are 1-based, weekday names 0-based
            return Ok(pos as u8 + self.min);
        }
        let value: u32 = raw.parse().map_err(|_| ScheduleError::InvalidValue {
            field: self.name,
            value: raw.to_string(),
        })?;
        if value < self.min as u32 || value > self.max as u32 {
            return Err(ScheduleError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value as u8)
    }

    fn normalize(&self, value: u8) -> u8 {
        if self.name == DAY_OF_WEEK.name && value == 7 {
            0
        } else {
            value
        }
    }
}

/// A validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
    source: String,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }
        Ok(Self {
            minute: MINUTE.parse(fields[0])?,
            hour: HOUR.parse(fields[1])?,
            day_of_month: DAY_OF_MONTH.parse(fields[2])?,
            month: MONTH.parse(fields[3])?,
            day_of_week: DAY_OF_WEEK.parse(fields[4])?,
            source: fields.join(" "),
        })
    }

    /// The expression as written, with whitespace normalized.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
