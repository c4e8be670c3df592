//! Cross-aggregate event filters.

use chrono::{DateTime, Utc};

use crate::{AggregateId, EventEnvelope, Version, VersionRange};

/// Offset/limit window applied after filtering and ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    /// `None` returns everything after `offset`.
    pub limit: Option<usize>,
}

impl Page {
    pub fn is_unbounded(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }
}

/// Filter over stored events, evaluated by every backend the same way.
///
/// Results are ordered by timestamp, then version. An empty `event_types`
/// list matches any type; the time window is inclusive at both ends.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub aggregate_id: Option<AggregateId>,
    pub aggregate_type: Option<String>,
    pub event_types: Vec<String>,
    pub versions: VersionRange,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: Page,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_aggregate(aggregate_id: AggregateId) -> Self {
        Self::new().aggregate_id(aggregate_id)
    }

    pub fn for_event_type(event_type: impl Into<String>) -> Self {
        Self::new().event_type(event_type)
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Adds `event_type` to the accepted types.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn versions(mut self, range: VersionRange) -> Self {
        self.versions = range;
        self
    }

    pub fn from_version(mut self, version: Version) -> Self {
        self.versions.from = Some(version);
        self
    }

    pub fn to_version(mut self, version: Version) -> Self {
        self.versions.to = Some(version);
        self
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.page.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.page.limit = Some(limit);
        self
    }

    /// The same filters with no pagination, for merging results from
    /// several sources before paging once.
    pub fn unpaged(&self) -> Self {
        Self {
            page: Page::default(),
            ..self.clone()
        }
    }

    /// Whether an event passes every filter. Pagination is not considered.
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        self.aggregate_id.is_none_or(|id| event.aggregate_id == id)
            && self
                .aggregate_type
                .as_deref()
                .is_none_or(|t| event.aggregate_type == t)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.versions.contains(event.version)
            && self.since.is_none_or(|at| event.timestamp >= at)
            && self.until.is_none_or(|at| event.timestamp <= at)
    }

    /// Applies the page to an already ordered result set.
    pub fn paginate(&self, events: Vec<EventEnvelope>) -> Vec<EventEnvelope> {
        if self.page.is_unbounded() {
            return events;
        }
        let rest = events.into_iter().skip(self.page.offset);
        match self.page.limit {
            Some(limit) => rest.take(limit).collect(),
            None => rest.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn event(aggregate_id: AggregateId, version: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("Account")
            .event_type(event_type)
            .version(Version::new(version))
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap()
    }

    #[test]
    fn event_types_accumulate() {
        let query = EventQuery::for_event_type("AccountOpened").event_type("FundsDeposited");

        assert_eq!(query.event_types, vec!["AccountOpened", "FundsDeposited"]);
        assert!(query.aggregate_id.is_none());
    }

    #[test]
    fn matches_applies_every_filter() {
        let id = AggregateId::new();
        let query = EventQuery::for_aggregate(id)
            .event_type("FundsDeposited")
            .versions(VersionRange::between(Some(Version::new(2)), Some(Version::new(4))));

        assert!(query.matches(&event(id, 3, "FundsDeposited")));
        assert!(!query.matches(&event(id, 5, "FundsDeposited")));
        assert!(!query.matches(&event(id, 3, "AccountOpened")));
        assert!(!query.matches(&event(AggregateId::new(), 3, "FundsDeposited")));
    }

    #[test]
    fn time_window_is_inclusive() {
        let id = AggregateId::new();
        let noon = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let at = |hour| {
            let mut e = event(id, 1, "FundsDeposited");
            e.timestamp = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
            e
        };
        let query = EventQuery::new().since(noon).until(noon + chrono::Duration::hours(1));

        assert!(query.matches(&at(12)));
        assert!(query.matches(&at(13)));
        assert!(!query.matches(&at(11)));
        assert!(!query.matches(&at(14)));
    }

    #[test]
    fn paginate_skips_then_limits() {
        let id = AggregateId::new();
        let events: Vec<_> = (1..=5).map(|v| event(id, v, "FundsDeposited")).collect();

        let query = EventQuery::new().offset(1).limit(2);
        let versions: Vec<_> = query
            .paginate(events)
            .iter()
            .map(|e| e.version.as_i64())
            .collect();

        assert_eq!(versions, vec![2, 3]);
        assert!(query.unpaged().page.is_unbounded());
    }
}
