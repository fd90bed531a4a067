//! Canonical event model and run bookkeeping shared by every stage.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "funev-core";

/// Canonical timestamp layout for normalized event dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The four open-data providers feeding the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceProvider {
    Culture,
    Taipei,
    NewTaipei,
    Tfam,
}

impl SourceProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceProvider::Culture => "culture",
            SourceProvider::Taipei => "taipei",
            SourceProvider::NewTaipei => "new_taipei",
            SourceProvider::Tfam => "tfam",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "culture" => Some(SourceProvider::Culture),
            "taipei" => Some(SourceProvider::Taipei),
            "new_taipei" => Some(SourceProvider::NewTaipei),
            "tfam" => Some(SourceProvider::Tfam),
            _ => None,
        }
    }

    /// Provider-qualified uid. Raw provider ids are only unique within one
    /// provider; the qualified form is the sole identity key store-wide.
    pub fn qualify(&self, raw_id: &str) -> String {
        format!("{}:{}", self.as_str(), raw_id.trim())
    }
}

impl std::fmt::Display for SourceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized event as produced by an adapter, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub uid: String,
    pub title: String,
    pub description: String,
    pub organizer: String,
    pub address: String,
    pub location: String,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub ticket_price: String,
    pub related_link: String,
    pub image_url: String,
    pub source: SourceProvider,
}

/// Persisted canonical event, keyed by `uid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub uid: String,
    pub title: String,
    pub description: String,
    pub organizer: String,
    pub address: String,
    pub location: String,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub ticket_price: String,
    pub related_link: String,
    pub image_url: String,
    pub source: SourceProvider,
}

impl From<EventDraft> for CanonicalEvent {
    fn from(draft: EventDraft) -> Self {
        Self {
            uid: draft.uid,
            title: draft.title,
            description: draft.description,
            organizer: draft.organizer,
            address: draft.address,
            location: draft.location,
            start_date: draft.start_date,
            end_date: draft.end_date,
            latitude: draft.latitude,
            longitude: draft.longitude,
            ticket_price: draft.ticket_price,
            related_link: draft.related_link,
            image_url: draft.image_url,
            source: draft.source,
        }
    }
}

/// One adapter's normalized fetch result, in the provider's reported order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub query_time: NaiveDateTime,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub sort_order: String,
    pub events: Vec<EventDraft>,
    /// Records dropped individually during normalization (unreadable row,
    /// missing raw id). Never fatal to the batch.
    pub skipped: usize,
}

/// Run bookkeeping row. Immutable once created, except for its set of
/// event associations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    /// `None` allocates a new run row on commit; `Some` re-commits against
    /// an existing run (associations converge to the new order).
    pub id: Option<i64>,
    pub query_time: NaiveDateTime,
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
    pub sort_order: String,
}

impl IngestionRun {
    pub fn from_batch(batch: &EventBatch) -> Self {
        Self {
            id: None,
            query_time: batch.query_time,
            limit: batch.limit,
            offset: batch.offset,
            total: batch.total,
            sort_order: batch.sort_order.clone(),
        }
    }
}

/// Outcome of committing one run's drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: i64,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// `(run, event)` association with the event's rank in that run's result
/// list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAssociation {
    pub run_id: i64,
    pub event_uid: String,
    pub display_order: i64,
}

/// Per-pass context created once by the orchestrator and passed into every
/// stage. All timestamps within a pass derive from `started_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub timezone_offset_minutes: i32,
    pub timezone_name: String,
}

impl RunContext {
    pub fn begin() -> Self {
        Self::begin_at(Utc::now())
    }

    pub fn begin_at(started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            started_at,
            timezone_offset_minutes: 8 * 60,
            timezone_name: "Asia/Taipei".to_string(),
        }
    }

    /// Wall-clock time in the provider timezone, used as the run's
    /// `query_timestamp`.
    pub fn local_query_time(&self) -> NaiveDateTime {
        (self.started_at + Duration::minutes(i64::from(self.timezone_offset_minutes))).naive_utc()
    }
}
