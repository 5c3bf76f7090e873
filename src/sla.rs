// SLA calculator - deadlines and elapsed time counted in work hours only

//! # SLA Calculator
//!
//! Deadlines are projected by walking forward through work time: a moment is
//! work time when its weekday is not a day off, the calendar does not mark
//! the date as a `holiday`, and the hour lies in `[start_hour, end_hour)`.
//! A `preHoliday` date ends one hour early.
//!
//! All arithmetic is in UTC. Calendar data comes from the calendar service
//! through [`SlaService::sla_info`]; the pure functions below take an
//! already-resolved [`SlaInfo`].
//!
//! ## Rust Learning Notes:
//!
//! ### Pure core, async shell
//! Only fetching the calendar needs I/O. Keeping the arithmetic in plain
//! functions over `chrono` values makes it testable without a runtime.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::integrations::calendar::CalendarService;
use crate::integrations::http::CallContext;
use crate::models::{CalendarDayType, CalendarDays, TaskCompletionInterval, WorkHours};
use crate::{PipelinerError, Result};

const DATE_FORMAT: &str = "%d.%m.%Y";

/// Upper bound on consecutive non-working days skipped while projecting
const MAX_SKIPPED_DAYS: u32 = 3660;

/// Named work schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkSchedule {
    #[serde(rename = "8/5")]
    EightFive,
    #[serde(rename = "12/5")]
    TwelveFive,
    #[serde(rename = "24/7")]
    AroundTheClock,
}

impl WorkSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkSchedule::EightFive => "8/5",
            WorkSchedule::TwelveFive => "12/5",
            WorkSchedule::AroundTheClock => "24/7",
        }
    }

    pub fn hours(&self) -> WorkHours {
        let weekdays_only = vec![Weekday::Sat, Weekday::Sun];
        match self {
            WorkSchedule::EightFive => WorkHours {
                start_hour: 6,
                end_hour: 14,
                weekends: weekdays_only,
                use_calendar: true,
            },
            WorkSchedule::TwelveFive => WorkHours {
                start_hour: 6,
                end_hour: 18,
                weekends: weekdays_only,
                use_calendar: true,
            },
            WorkSchedule::AroundTheClock => WorkHours {
                start_hour: 0,
                end_hour: 24,
                weekends: Vec::new(),
                use_calendar: false,
            },
        }
    }

    pub fn hours_per_day(&self) -> u32 {
        let hours = self.hours();
        hours.end_hour - hours.start_hour
    }
}

impl fmt::Display for WorkSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkSchedule {
    type Err = PipelinerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "8/5" => Ok(WorkSchedule::EightFive),
            "12/5" => Ok(WorkSchedule::TwelveFive),
            "24/7" => Ok(WorkSchedule::AroundTheClock),
            other => Err(PipelinerError::InvalidInput(format!("unknown work hour type: {}", other))),
        }
    }
}

/// Everything the calculator needs: a schedule and the calendar days it applies to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlaInfo {
    pub calendar_days: CalendarDays,
    pub hours: WorkHours,
}

impl SlaInfo {
    pub fn new(hours: WorkHours, calendar_days: CalendarDays) -> Self {
        Self { calendar_days, hours }
    }

    fn day_type(&self, t: DateTime<Utc>) -> Option<CalendarDayType> {
        if !self.hours.use_calendar {
            return None;
        }
        self.calendar_days.day_type(t)
    }

    fn end_hour(&self, t: DateTime<Utc>) -> u32 {
        match self.day_type(t) {
            Some(CalendarDayType::PreHoliday) => self.hours.end_hour.saturating_sub(1),
            _ => self.hours.end_hour,
        }
    }

    pub fn is_work_time(&self, t: DateTime<Utc>) -> bool {
        if self.hours.weekends.contains(&t.weekday()) {
            return false;
        }
        if self.day_type(t) == Some(CalendarDayType::Holiday) {
            return false;
        }
        t.hour() >= self.hours.start_hour && t.hour() < self.end_hour(t)
    }
}

fn at_hour(day: NaiveDate, hour: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)) + Duration::hours(i64::from(hour))
}

/// Deadline after `sla_hours` of work time starting at `start`
pub fn max_date(start: DateTime<Utc>, sla_hours: f64, info: &SlaInfo) -> DateTime<Utc> {
    let mut deadline = start;
    let mut remaining = Duration::minutes((sla_hours * 60.0).round() as i64);
    let mut skipped = 0;

    while remaining > Duration::zero() {
        if !info.is_work_time(deadline) {
            skipped += 1;
            if skipped > MAX_SKIPPED_DAYS {
                warn!(%start, sla_hours, "schedule has no work time, deadline not reachable");
                return deadline;
            }
            // Early morning moves to today's opening, anything else to tomorrow's
            let day = if deadline.hour() < info.hours.start_hour {
                deadline.date_naive()
            } else {
                deadline.date_naive() + Duration::days(1)
            };
            deadline = at_hour(day, info.hours.start_hour);
            continue;
        }
        skipped = 0;

        let closing = at_hour(deadline.date_naive(), info.end_hour(deadline));
        let available = closing - deadline;
        if available < remaining {
            deadline = closing;
            remaining = remaining - available;
        } else {
            deadline = deadline + remaining;
            remaining = Duration::zero();
        }
    }

    debug!(%start, %deadline, sla_hours, "deadline computed");
    deadline
}

/// Deadline date as `DD.MM.YYYY`
pub fn max_date_formatted(start: DateTime<Utc>, sla_hours: u32, info: &SlaInfo) -> String {
    max_date(start, f64::from(sla_hours), info)
        .format(DATE_FORMAT)
        .to_string()
}

pub fn breach(start: DateTime<Utc>, current: DateTime<Utc>, sla_hours: u32, info: &SlaInfo) -> bool {
    current > max_date(start, f64::from(sla_hours), info)
}

/// Whole work hours between two moments, sampled hour by hour from `from`
pub fn work_hours_between(from: DateTime<Utc>, to: DateTime<Utc>, info: &SlaInfo) -> u32 {
    if to - from < Duration::hours(1) {
        return 0;
    }

    let mut hours = 0;
    let mut cursor = from;
    while cursor < to {
        if info.is_work_time(cursor) {
            hours += 1;
        }
        cursor = cursor + Duration::hours(1);
    }
    hours
}

/// Mean work hours per completed task, rounded up
pub fn mean_task_solve_time(intervals: &[TaskCompletionInterval], calendar_days: &CalendarDays) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }

    let info = SlaInfo::new(WorkHours::default(), calendar_days.clone());
    let total: u32 = intervals
        .iter()
        .map(|i| work_hours_between(i.started_at, i.finished_at, &info))
        .sum();
    (f64::from(total) / intervals.len() as f64).ceil()
}

/// Resolves schedules into [`SlaInfo`], fetching calendar days when needed
#[derive(Clone, Default)]
pub struct SlaService {
    calendar: Option<Arc<dyn CalendarService>>,
    /// Replaces start/end of the 8/5 schedule
    work_hours_override: Option<(u32, u32)>,
}

impl SlaService {
    pub fn new(calendar: Option<Arc<dyn CalendarService>>) -> Self {
        Self {
            calendar,
            work_hours_override: None,
        }
    }

    pub fn with_work_hours_override(mut self, start_hour: u32, end_hour: u32) -> Result<Self> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(PipelinerError::Config(format!(
                "invalid work hours override {}..{}",
                start_hour, end_hour
            )));
        }
        self.work_hours_override = Some((start_hour, end_hour));
        Ok(self)
    }

    pub fn hours_for(&self, schedule: WorkSchedule) -> WorkHours {
        let mut hours = schedule.hours();
        if let (WorkSchedule::EightFive, Some((start, end))) = (schedule, self.work_hours_override) {
            hours.start_hour = start;
            hours.end_hour = end;
        }
        hours
    }

    /// Without a calendar service every weekday counts as a workday
    pub async fn sla_info(
        &self,
        schedule: WorkSchedule,
        intervals: &[TaskCompletionInterval],
        ctx: &CallContext,
    ) -> Result<SlaInfo> {
        let hours = self.hours_for(schedule);
        let calendar_days = match &self.calendar {
            Some(calendar) if hours.use_calendar && !intervals.is_empty() => {
                calendar.calendar_days_for_intervals(intervals, ctx).await?
            }
            _ => CalendarDays::new(),
        };
        Ok(SlaInfo::new(hours, calendar_days))
    }
}
