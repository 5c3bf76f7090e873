// Work-calendar service - calendars and day types consumed by the SLA calculator

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use super::cache::ReadThroughCache;
use super::http::{join_url, CallContext, HttpClient};
use crate::models::{Calendar, CalendarDay, CalendarDayType, CalendarDays, TaskCompletionInterval};
use crate::{PipelinerError, Result};

const SYSTEM: &str = "calendar";

const CALENDARS_PREFIX: &str = "calendar";
const CALENDAR_DAYS_PREFIX: &str = "calendarDays";

/// Holiday calendar preferred when several calendars are returned
pub const PRIMARY_HOLIDAY_CALENDAR: &str = "RU";

/// Padding applied on both sides of a requested interval
const INTERVAL_PADDING_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarsQuery {
    pub unit_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarDaysQuery {
    pub calendar_ids: Vec<String>,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn get_calendars(&self, query: &CalendarsQuery, ctx: &CallContext) -> Result<Vec<Calendar>>;

    async fn get_calendar_days(&self, query: &CalendarDaysQuery, ctx: &CallContext) -> Result<CalendarDays>;

    /// Unit whose calendar applies when a caller names none
    fn default_unit_id(&self) -> Option<String>;

    async fn ping(&self, ctx: &CallContext) -> Result<()>;

    /// The primary calendar of the preferred holiday calendar, else the first one
    async fn primary_calendar_or_first(&self, query: &CalendarsQuery, ctx: &CallContext) -> Result<Calendar> {
        let calendars = self.get_calendars(query, ctx).await?;
        pick_primary(calendars)
    }

    /// Day types covering every interval, widened by a week on each side
    async fn calendar_days_for_intervals(
        &self,
        intervals: &[TaskCompletionInterval],
        ctx: &CallContext,
    ) -> Result<CalendarDays> {
        let Some((from, to)) = padded_range(intervals) else {
            return Err(PipelinerError::InvalidInput("no task intervals given".to_string()));
        };

        let unit_id = self
            .default_unit_id()
            .ok_or_else(|| PipelinerError::Config("calendar.default_unit_id is not set".to_string()))?;
        let calendar = self
            .primary_calendar_or_first(&CalendarsQuery { unit_ids: vec![unit_id] }, ctx)
            .await?;

        self.get_calendar_days(
            &CalendarDaysQuery {
                calendar_ids: vec![calendar.id.to_string()],
                date_from: from,
                date_to: to,
            },
            ctx,
        )
        .await
    }
}

fn pick_primary(calendars: Vec<Calendar>) -> Result<Calendar> {
    let primary = calendars
        .iter()
        .position(|c| c.primary && c.holiday_calendar == PRIMARY_HOLIDAY_CALENDAR);
    let idx = primary.unwrap_or(0);
    calendars
        .into_iter()
        .nth(idx)
        .ok_or_else(|| PipelinerError::NotFound("no calendars for the given units".to_string()))
}

fn padded_range(intervals: &[TaskCompletionInterval]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let from = intervals.iter().map(|i| i.started_at).min()?;
    let to = intervals.iter().map(|i| i.finished_at).max()?;
    let padding = Duration::days(INTERVAL_PADDING_DAYS);
    Some((from - padding, to + padding))
}

/// Upstream calendar service over HTTP
pub struct HttpCalendarService {
    http: HttpClient,
    base_url: String,
    default_unit_id: Option<String>,
}

impl HttpCalendarService {
    pub fn new(http: HttpClient, base_url: impl Into<String>, default_unit_id: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            default_unit_id,
        }
    }
}

#[async_trait]
impl CalendarService for HttpCalendarService {
    #[instrument(skip(self, ctx))]
    async fn get_calendars(&self, query: &CalendarsQuery, ctx: &CallContext) -> Result<Vec<Calendar>> {
        let url = format!(
            "{}?unitIDs={}",
            join_url(&self.base_url, "calendars"),
            urlencoding::encode(&query.unit_ids.join(","))
        );
        let calendars: Vec<Calendar> = self.http.get_json(SYSTEM, &url, ctx).await?;
        if calendars.is_empty() {
            return Err(PipelinerError::NotFound("no calendars for the given units".to_string()));
        }
        Ok(calendars)
    }

    #[instrument(skip(self, ctx))]
    async fn get_calendar_days(&self, query: &CalendarDaysQuery, ctx: &CallContext) -> Result<CalendarDays> {
        let limit = (query.date_to - query.date_from).num_days().max(0) + 1;
        let url = format!(
            "{}?calendar={}&dateFrom={}&dateTo={}&limit={}&withDeleted=false",
            join_url(&self.base_url, "calendar-days"),
            urlencoding::encode(&query.calendar_ids.join(",")),
            query.date_from.format("%Y-%m-%d"),
            query.date_to.format("%Y-%m-%d"),
            limit
        );
        let days: Vec<CalendarDay> = self.http.get_json(SYSTEM, &url, ctx).await?;

        let mut result = CalendarDays::new();
        for day in days {
            result.insert(day.date, day.day_type.unwrap_or(CalendarDayType::Workday));
        }
        Ok(result)
    }

    fn default_unit_id(&self) -> Option<String> {
        self.default_unit_id.clone()
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.http.ping(SYSTEM, &self.base_url, ctx).await
    }
}

/// Read-through cache in front of another calendar implementation
pub struct CachedCalendarService {
    inner: Arc<dyn CalendarService>,
    cache: ReadThroughCache,
}

impl CachedCalendarService {
    pub fn new(inner: Arc<dyn CalendarService>, cache: ReadThroughCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl CalendarService for CachedCalendarService {
    async fn get_calendars(&self, query: &CalendarsQuery, ctx: &CallContext) -> Result<Vec<Calendar>> {
        self.cache
            .get_or_fetch(CALENDARS_PREFIX, query, || self.inner.get_calendars(query, ctx))
            .await
    }

    async fn get_calendar_days(&self, query: &CalendarDaysQuery, ctx: &CallContext) -> Result<CalendarDays> {
        let days = self
            .cache
            .get_or_fetch(CALENDAR_DAYS_PREFIX, query, || self.inner.get_calendar_days(query, ctx))
            .await?;
        info!(days = days.calendar_map.len(), "calendar days resolved");
        Ok(days)
    }

    fn default_unit_id(&self) -> Option<String> {
        self.inner.default_unit_id()
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.inner.ping(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::http::RetryPolicy;
    use crate::integrations::metrics::InMemoryMetrics;
    use crate::integrations::test_support::spawn_server;
    use axum::{routing::get, Json, Router};
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    fn create_test_calendar(primary: bool, holiday_calendar: &str) -> Calendar {
        Calendar {
            id: Uuid::new_v4(),
            holiday_calendar: holiday_calendar.to_string(),
            primary,
            unit_id: Uuid::new_v4(),
            week_type: "5/2".to_string(),
        }
    }

    #[test]
    fn test_primary_calendar_is_preferred() {
        let first = create_test_calendar(false, "RU");
        let primary = create_test_calendar(true, "RU");
        let picked = pick_primary(vec![first, primary.clone()]).unwrap();
        assert_eq!(picked.id, primary.id);
    }

    #[test]
    fn test_first_calendar_is_the_fallback() {
        let first = create_test_calendar(false, "BY");
        let second = create_test_calendar(true, "BY");
        let picked = pick_primary(vec![first.clone(), second]).unwrap();
        assert_eq!(picked.id, first.id);
        assert!(pick_primary(Vec::new()).is_err());
    }

    #[test]
    fn test_range_is_widened_by_a_week() {
        let start = Utc.with_ymd_and_hms(2022, 7, 10, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2022, 7, 20, 0, 0, 0).unwrap();
        let intervals = vec![
            TaskCompletionInterval { started_at: start, finished_at: start + Duration::days(1) },
            TaskCompletionInterval { started_at: start + Duration::days(2), finished_at: end },
        ];

        let (from, to) = padded_range(&intervals).unwrap();
        assert_eq!(from, start - Duration::days(7));
        assert_eq!(to, end + Duration::days(7));
        assert!(padded_range(&[]).is_none());
    }

    #[tokio::test]
    async fn test_untyped_days_count_as_workdays() {
        let app = Router::new().route(
            "/calendar-days",
            get(|| async {
                Json(json!([
                    { "date": "2022-07-18T00:00:00Z", "dayType": "holiday" },
                    { "date": "2022-07-19T00:00:00Z" }
                ]))
            }),
        );
        let base = spawn_server(app).await;
        let http = HttpClient::new(RetryPolicy::default(), Arc::new(InMemoryMetrics::new())).unwrap();
        let service = HttpCalendarService::new(http, base, None);

        let query = CalendarDaysQuery {
            calendar_ids: vec!["c1".to_string()],
            date_from: Utc.with_ymd_and_hms(2022, 7, 18, 0, 0, 0).unwrap(),
            date_to: Utc.with_ymd_and_hms(2022, 7, 19, 0, 0, 0).unwrap(),
        };
        let days = service.get_calendar_days(&query, &CallContext::background()).await.unwrap();

        assert_eq!(days.day_type(query.date_from), Some(CalendarDayType::Holiday));
        assert_eq!(days.day_type(query.date_to), Some(CalendarDayType::Workday));
    }
}
