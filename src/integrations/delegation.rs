// Delegation service - who acts on behalf of whom

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use super::cache::ReadThroughCache;
use super::http::{join_url, CallContext, HttpClient};
use crate::{PipelinerError, Result};

const SYSTEM: &str = "delegation";
const DELEGATIONS_PREFIX: &str = "delegations";
const DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationType {
    Approvement,
    Execution,
}

/// An active delegation from one login to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub from_date: NaiveDate,
    /// `None` for open-ended delegations
    pub to_date: Option<NaiveDate>,
    pub from_login: String,
    pub to_login: String,
    pub delegation_types: Vec<DelegationType>,
}

impl Delegation {
    pub fn is_active_on(&self, day: NaiveDate) -> bool {
        day >= self.from_date && self.to_date.map_or(true, |to| day <= to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegations(pub Vec<Delegation>);

impl Delegations {
    /// Logins `login` delegated `kind` to, with the latest end date per delegate
    pub fn delegates_for(&self, login: &str, kind: DelegationType) -> BTreeMap<String, Option<NaiveDate>> {
        let mut delegates: BTreeMap<String, Option<NaiveDate>> = BTreeMap::new();
        for d in self.0.iter().filter(|d| d.from_login == login && d.delegation_types.contains(&kind)) {
            delegates
                .entry(d.to_login.clone())
                .and_modify(|current| {
                    // Open-ended wins over any date
                    *current = match (*current, d.to_date) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        _ => None,
                    };
                })
                .or_insert(d.to_date);
        }
        delegates
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Filter sent upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "filterBy", content = "logins")]
pub enum DelegationFilter {
    FromLogin(String),
    ToLogin(String),
    FromLogins(Vec<String>),
    ToLogins(Vec<String>),
}

impl DelegationFilter {
    fn query(&self) -> String {
        let (name, logins) = match self {
            DelegationFilter::FromLogin(l) => ("fromLogin", l.clone()),
            DelegationFilter::ToLogin(l) => ("toLogin", l.clone()),
            DelegationFilter::FromLogins(ls) => ("fromLogins", ls.join(",")),
            DelegationFilter::ToLogins(ls) => ("toLogins", ls.join(",")),
        };
        format!("filterBy={}&{}={}", name, name, urlencoding::encode(&logins))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUser {
    username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDelegation {
    from_date: String,
    #[serde(default)]
    to_date: String,
    from_user: RawUser,
    to_user: RawUser,
    #[serde(default)]
    delegation_types: Vec<DelegationType>,
}

#[derive(Debug, Deserialize)]
struct RawDelegations {
    #[serde(default)]
    delegations: Vec<RawDelegation>,
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| PipelinerError::Integration {
            system: SYSTEM.to_string(),
            message: format!("bad date {}: {}", value, e),
        })
}

/// Keep delegations active on `today`
fn active_delegations(raw: Vec<RawDelegation>, today: NaiveDate) -> Result<Delegations> {
    let mut active = Vec::new();
    for r in raw {
        let to_date = if r.to_date.is_empty() {
            None
        } else {
            Some(parse_date(&r.to_date)?)
        };
        let delegation = Delegation {
            from_date: parse_date(&r.from_date)?,
            to_date,
            from_login: r.from_user.username,
            to_login: r.to_user.username,
            delegation_types: r.delegation_types,
        };
        if delegation.is_active_on(today) {
            active.push(delegation);
        }
    }
    Ok(Delegations(active))
}

#[async_trait]
pub trait DelegationService: Send + Sync {
    async fn get_delegations(&self, filter: &DelegationFilter, ctx: &CallContext) -> Result<Delegations>;

    async fn ping(&self, ctx: &CallContext) -> Result<()>;

    async fn get_delegations_from_login(&self, login: &str, ctx: &CallContext) -> Result<Delegations> {
        self.get_delegations(&DelegationFilter::FromLogin(login.to_string()), ctx).await
    }

    async fn get_delegations_to_login(&self, login: &str, ctx: &CallContext) -> Result<Delegations> {
        self.get_delegations(&DelegationFilter::ToLogin(login.to_string()), ctx).await
    }

    async fn get_delegations_by_logins(&self, logins: &[String], ctx: &CallContext) -> Result<Delegations> {
        self.get_delegations(&DelegationFilter::FromLogins(logins.to_vec()), ctx).await
    }

    async fn get_delegations_to_logins(&self, logins: &[String], ctx: &CallContext) -> Result<Delegations> {
        self.get_delegations(&DelegationFilter::ToLogins(logins.to_vec()), ctx).await
    }
}

pub struct HttpDelegationService {
    http: HttpClient,
    base_url: String,
}

impl HttpDelegationService {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DelegationService for HttpDelegationService {
    #[instrument(skip(self, ctx))]
    async fn get_delegations(&self, filter: &DelegationFilter, ctx: &CallContext) -> Result<Delegations> {
        let url = format!("{}?{}", join_url(&self.base_url, "delegations"), filter.query());
        let raw: RawDelegations = self.http.get_json(SYSTEM, &url, ctx).await?;
        active_delegations(raw.delegations, Utc::now().date_naive())
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.http.ping(SYSTEM, &self.base_url, ctx).await
    }
}

pub struct CachedDelegationService {
    inner: Arc<dyn DelegationService>,
    cache: ReadThroughCache,
}

impl CachedDelegationService {
    pub fn new(inner: Arc<dyn DelegationService>, cache: ReadThroughCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl DelegationService for CachedDelegationService {
    async fn get_delegations(&self, filter: &DelegationFilter, ctx: &CallContext) -> Result<Delegations> {
        self.cache
            .get_or_fetch(DELEGATIONS_PREFIX, filter, || self.inner.get_delegations(filter, ctx))
            .await
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.inner.ping(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_raw(from: &str, to: &str, from_login: &str, to_login: &str) -> RawDelegation {
        RawDelegation {
            from_date: from.to_string(),
            to_date: to.to_string(),
            from_user: RawUser { username: from_login.to_string() },
            to_user: RawUser { username: to_login.to_string() },
            delegation_types: vec![DelegationType::Approvement],
        }
    }

    #[test]
    fn test_only_active_delegations_are_kept() {
        let today = NaiveDate::from_ymd_opt(2022, 7, 18).unwrap();
        let raw = vec![
            create_test_raw("01/07/2022", "31/07/2022", "alice", "bob"),
            create_test_raw("01/06/2022", "30/06/2022", "alice", "carol"),
            create_test_raw("01/08/2022", "", "alice", "dave"),
            create_test_raw("01/07/2022", "", "alice", "erin"),
        ];

        let active = active_delegations(raw, today).unwrap();
        let to: Vec<_> = active.0.iter().map(|d| d.to_login.as_str()).collect();
        assert_eq!(to, vec!["bob", "erin"]);
    }

    #[test]
    fn test_bad_dates_are_integration_errors() {
        let today = NaiveDate::from_ymd_opt(2022, 7, 18).unwrap();
        let raw = vec![create_test_raw("2022-07-01", "", "alice", "bob")];
        assert!(matches!(
            active_delegations(raw, today),
            Err(PipelinerError::Integration { .. })
        ));
    }

    #[test]
    fn test_delegates_for_keeps_latest_end() {
        let d = |to: Option<NaiveDate>, to_login: &str| Delegation {
            from_date: NaiveDate::from_ymd_opt(2022, 7, 1).unwrap(),
            to_date: to,
            from_login: "alice".to_string(),
            to_login: to_login.to_string(),
            delegation_types: vec![DelegationType::Execution],
        };
        let early = NaiveDate::from_ymd_opt(2022, 7, 10);
        let late = NaiveDate::from_ymd_opt(2022, 7, 20);
        let delegations = Delegations(vec![d(early, "bob"), d(late, "bob"), d(None, "carol"), d(early, "carol")]);

        let delegates = delegations.delegates_for("alice", DelegationType::Execution);
        assert_eq!(delegates["bob"], late);
        assert_eq!(delegates["carol"], None);
        assert!(delegations.delegates_for("alice", DelegationType::Approvement).is_empty());
    }
}
