//! Five-field cron schedules.
//!
//! The `cron` crate expects a leading seconds field and numbers weekdays
//! from 1 (Sunday). Expressions are accepted in standard five-field form
//! (`minute hour day month weekday`, weekday 0-7 with 0 and 7 = Sunday)
//! and translated before parsing. When both the day-of-month and the
//! day-of-week fields are restricted, a time matching either one fires, as
//! in standard cron; the `cron` crate alone would require both.

use crate::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const WEEKDAYS: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    /// One schedule, or a day-of-month and a day-of-week schedule whose
    /// union is the expression
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let weekday = translate_weekdays(fields[4]).map_err(invalid)?;
        let build = |day: &str, weekday: &str| {
            let translated = format!("0 {} {} {} {} {}", fields[0], fields[1], day, fields[3], weekday);
            cron::Schedule::from_str(&translated).map_err(|e| invalid(e.to_string()))
        };

        let schedules = if is_restricted(fields[2]) && is_restricted(fields[4]) {
            vec![build(fields[2], "*")?, build("*", &weekday)?]
        } else {
            vec![build(fields[2], &weekday)?]
        };

        Ok(Self {
            expression: fields.join(" "),
            schedules,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }

    /// Whether an occurrence falls in `(since, now]`.
    pub fn fires_between(&self, since: &DateTime<Utc>, now: &DateTime<Utc>) -> bool {
        self.next_after(since).map(|next| next <= *now).unwrap_or(false)
    }

    pub fn upcoming(&self, from: &DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = *from;
        while times.len() < count {
            let Some(next) = self.next_after(&cursor) else {
                break;
            };
            times.push(next);
            cursor = next;
        }
        times
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Serialize for CronSchedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for CronSchedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        CronSchedule::parse(&expression).map_err(serde::de::Error::custom)
    }
}

/// Rewrite numeric weekdays as names so they mean the same thing to the
/// `cron` crate as to standard cron.
fn translate_weekdays(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let base = match base.split_once('-') {
            Some((start, end)) => {
                let start = weekday_name(start)?;
                let end_name = weekday_name(end)?;
                // Sunday sorts first for the cron crate, so ranges ending on 7 are split
                if end.trim() == "7" && start == "Sun" {
                    "*".to_string()
                } else if let (true, Some(step)) = (end.trim() == "7", step) {
                    let step = parse_step(step)?;
                    let first = weekday_index(start)?;
                    items.extend((first..=7).step_by(step).map(|day| WEEKDAYS[day].to_string()));
                    continue;
                } else if end.trim() == "7" {
                    items.push(format!("{}-Sat", start));
                    items.push("Sun".to_string());
                    continue;
                } else {
                    format!("{}-{}", start, end_name)
                }
            }
            None if base == "*" || base == "?" => base.to_string(),
            None => weekday_name(base)?.to_string(),
        };

        items.push(match step {
            Some(step) => format!("{}/{}", base, step),
            None => base,
        });
    }
    Ok(items.join(","))
}

/// A field that does not start with `*` (or is `?`) limits which days match.
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*') && field != "?"
}

fn weekday_index(name: &str) -> Result<usize, String> {
    WEEKDAYS
        .iter()
        .position(|day| day.eq_ignore_ascii_case(name))
        .ok_or_else(|| format!("invalid weekday '{}'", name))
}

fn parse_step(step: &str) -> Result<usize, String> {
    match step.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("invalid step '{}'", step)),
    }
}

fn weekday_name(token: &str) -> Result<&str, String> {
    let token = token.trim();
    match token.parse::<usize>() {
        Ok(n) if n < WEEKDAYS.len() => Ok(WEEKDAYS[n]),
        Ok(n) => Err(format!("weekday {} out of range 0-7", n)),
        Err(_) if token.chars().all(|c| c.is_ascii_alphabetic()) && !token.is_empty() => Ok(token),
        Err(_) => Err(format!("invalid weekday '{}'", token)),
    }
}
