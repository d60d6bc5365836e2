use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SchedulerError};

/// Computes when a task is due next.
///
/// Implementations are owned by exactly one task and only ever called under
/// that task's lock, so `&mut self` is fine for keeping internal anchors.
pub trait Trigger: Send {
    /// Next fire instant strictly after `after`, or `None` once exhausted.
    fn next_after(&mut self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Re-anchor any "last fired" reference to the present.
    ///
    /// Called when a task is (re-)enabled and when the scheduler starts or
    /// resumes, so interval schedules never replay fires missed meanwhile.
    fn reset_clock(&mut self) {}
}

/// Build a trigger from an expression.
///
/// `@every <duration>` yields an [`IntervalTrigger`]; anything else is
/// handed to [`CronTrigger`].
pub fn parse_expression(expression: &str) -> Result<Box<dyn Trigger>> {
    let expr = expression.trim();
    if let Some(rest) = expr.strip_prefix("@every") {
        let period = parse_duration(rest.trim()).ok_or_else(|| invalid(expression, "bad duration"))?;
        return Ok(Box::new(IntervalTrigger::new(period)?));
    }
    Ok(Box::new(CronTrigger::new(expr)?))
}

/// Recurring trigger backed by a cron expression (seconds field first).
///
/// Classic five-field expressions (`min hour dom mon dow`) are accepted and
/// treated as firing at second zero.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: cron::Schedule,
}

impl CronTrigger {
    pub fn new(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        let normalized = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| invalid(expression, &e.to_string()))?;
        Ok(Self {
            expression: expr.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Trigger for CronTrigger {
    fn next_after(&mut self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).find(|t| *t > after)
    }
}

/// Fixed-period trigger.
///
/// Fires stay phase-aligned to the last computed fire time; when the
/// schedule has fallen behind it skips straight to the first slot after
/// `after` instead of producing a backlog.
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    period: Duration,
    anchor: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    pub fn new(period: std::time::Duration) -> Result<Self> {
        let period = Duration::from_std(period)
            .ok()
            .filter(|p| p.num_milliseconds() > 0)
            .ok_or_else(|| invalid(&format!("{period:?}"), "interval must be at least 1ms"))?;
        Ok(Self {
            period,
            anchor: None,
        })
    }

    pub fn period(&self) -> std::time::Duration {
        self.period.to_std().unwrap_or_default()
    }
}

impl Trigger for IntervalTrigger {
    /// `None` when the next slot lies beyond the representable calendar.
    fn next_after(&mut self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match self.anchor {
            None => after.checked_add_signed(self.period)?,
            Some(anchor) => {
                let step = self.period.num_milliseconds();
                let behind = (after - anchor).num_milliseconds();
                // Smallest k >= 1 with anchor + k*period > after.
                let k = if behind < 0 { 1 } else { behind / step + 1 };
                let offset = step.checked_mul(k).and_then(Duration::try_milliseconds)?;
                anchor.checked_add_signed(offset)?
            }
        };
        self.anchor = Some(next);
        Some(next)
    }

    fn reset_clock(&mut self) {
        self.anchor = None;
    }
}

/// Fires exactly once, at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct OnceTrigger {
    at: DateTime<Utc>,
}

impl OnceTrigger {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

impl Trigger for OnceTrigger {
    fn next_after(&mut self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.at > after).then_some(self.at)
    }
}

/// Parse `1h30m`, `10s`, `500ms` style durations.
fn parse_duration(input: &str) -> Option<std::time::Duration> {
    if input.is_empty() {
        return None;
    }
    let mut total_ms: u64 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(unit_ms)?)?;
        rest = &rest[unit_len..];
    }
    Some(std::time::Duration::from_millis(total_ms))
}

fn invalid(expression: &str, reason: &str) -> SchedulerError {
    SchedulerError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}
