// Work-calendar data shared by the calendar service and the SLA calculator

use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Day classification returned by the calendar service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarDayType {
    #[serde(rename = "workday")]
    Workday,
    #[serde(rename = "weekend")]
    Weekend,
    /// Working day shortened by one hour
    #[serde(rename = "preHoliday")]
    PreHoliday,
    #[serde(rename = "holiday")]
    Holiday,
}

/// Calendar days keyed by the unix seconds of the date's UTC midnight
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarDays {
    #[serde(default)]
    pub calendar_map: BTreeMap<i64, CalendarDayType>,
}

impl CalendarDays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unix seconds of the UTC midnight of `t`
    pub fn day_key(t: DateTime<Utc>) -> i64 {
        let midnight = t.date_naive().and_time(NaiveTime::MIN);
        Utc.from_utc_datetime(&midnight).timestamp()
    }

    pub fn insert(&mut self, day: DateTime<Utc>, day_type: CalendarDayType) {
        self.calendar_map.insert(Self::day_key(day), day_type);
    }

    pub fn day_type(&self, t: DateTime<Utc>) -> Option<CalendarDayType> {
        self.calendar_map.get(&Self::day_key(t)).copied()
    }
}

/// Start and finish of one completed task, used for mean solve time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletionInterval {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Daily work window and weekly days off of a schedule
///
/// `end_hour` is exclusive and may be 24; `use_calendar` is false for
/// schedules that ignore holidays (24/7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkHours {
    pub start_hour: u32,
    pub end_hour: u32,
    #[serde(default)]
    pub weekends: Vec<Weekday>,
    #[serde(default = "default_use_calendar")]
    pub use_calendar: bool,
}

fn default_use_calendar() -> bool {
    true
}

impl Default for WorkHours {
    /// Mon-Fri, 06:00 to 14:00 UTC
    fn default() -> Self {
        Self {
            start_hour: 6,
            end_hour: 14,
            weekends: vec![Weekday::Sat, Weekday::Sun],
            use_calendar: true,
        }
    }
}

/// A calendar as the calendar service describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calendar {
    pub id: Uuid,
    #[serde(default)]
    pub holiday_calendar: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(rename = "unitID")]
    pub unit_id: Uuid,
    #[serde(default)]
    pub week_type: String,
}

/// One day record on the wire; a missing type means a working day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarDay {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub calendar_id: Option<Uuid>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub day_type: Option<CalendarDayType>,
}
