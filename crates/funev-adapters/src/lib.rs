//! Provider adapters: pure fetch (I/O) + pure normalize (transform) into
//! canonical event drafts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use funev_core::{EventBatch, EventDraft, RunContext, SourceProvider};
use funev_storage::{FetchError, FetchedResponse, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "funev-adapters";

// ---------------------------------------------------------------------------
// Date normalization
// ---------------------------------------------------------------------------

/// Datetime patterns tried first, in fixed precedence. Day-first beats
/// month-first on ambiguous numeric dates.
const DATETIME_PATTERNS: [&str; 5] = [
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%b %d, %Y %I:%M:%S %p",
];

/// Date-only patterns, normalized to midnight.
const DATE_PATTERNS: [&str; 5] = ["%Y/%m/%d", "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%b %d, %Y"];

/// First matching pattern wins; no match is `None` with the raw value kept
/// in the log for diagnostics.
pub fn normalize_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for pattern in DATETIME_PATTERNS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(parsed);
        }
    }
    for pattern in DATE_PATTERNS {
        if let Ok(parsed) = NaiveDate::parse_from_str(raw, pattern) {
            return Some(parsed.and_time(NaiveTime::MIN));
        }
    }
    warn!(raw, "unparseable date value");
    None
}

pub fn normalize_date_text(raw: &str) -> Option<String> {
    normalize_date(raw).map(|parsed| parsed.format(funev_core::DATE_FORMAT).to_string())
}

// ---------------------------------------------------------------------------
// Coordinate validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Latitude,
    Longitude,
}

/// Range-checked and rounded to exactly 8 decimal places; the precision is
/// a contract, round-trip tests depend on it.
pub fn validate_coordinate(value: f64, axis: Axis) -> Option<f64> {
    let in_range = match axis {
        Axis::Latitude => (-90.0..=90.0).contains(&value),
        Axis::Longitude => (-180.0..=180.0).contains(&value),
    };
    in_range.then(|| (value * 1e8).round() / 1e8)
}

pub fn validate_coordinate_text(raw: &str, axis: Axis) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    validate_coordinate(value, axis)
}

fn coordinate_from_json(value: Option<&JsonValue>, axis: Axis) -> Option<f64> {
    match value? {
        JsonValue::Number(number) => number.as_f64().and_then(|v| validate_coordinate(v, axis)),
        JsonValue::String(text) => validate_coordinate_text(text, axis),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Field-mapping tables
// ---------------------------------------------------------------------------

/// The canonical fields every adapter must account for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    Uid,
    Title,
    Description,
    Organizer,
    Address,
    Location,
    StartDate,
    EndDate,
    Latitude,
    Longitude,
    TicketPrice,
    RelatedLink,
    ImageUrl,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 13] = [
        CanonicalField::Uid,
        CanonicalField::Title,
        CanonicalField::Description,
        CanonicalField::Organizer,
        CanonicalField::Address,
        CanonicalField::Location,
        CanonicalField::StartDate,
        CanonicalField::EndDate,
        CanonicalField::Latitude,
        CanonicalField::Longitude,
        CanonicalField::TicketPrice,
        CanonicalField::RelatedLink,
        CanonicalField::ImageUrl,
    ];
}

/// Where one canonical field comes from in a provider record.
#[derive(Debug, Clone, Copy)]
pub enum FieldSource {
    /// Key on the record object itself.
    Key(&'static str),
    /// Key on the record's first show instance (Culture).
    FirstShow(&'static str),
    /// Key on the first show instance's `time` block (Culture).
    FirstShowTime(&'static str),
    /// `url` of the first element in a nested image array (Taipei).
    FirstImageUrl(&'static str),
    /// Provider-constant value (TFAM venue data).
    Fixed(&'static str),
    /// The provider never supplies this field.
    Absent,
}

/// Enumerated source-field → canonical-field table, one per adapter,
/// verified complete at pipeline construction.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    label: &'static str,
    entries: &'static [(CanonicalField, FieldSource)],
}

impl FieldMap {
    pub const fn new(
        label: &'static str,
        entries: &'static [(CanonicalField, FieldSource)],
    ) -> Self {
        Self { label, entries }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn source(&self, field: CanonicalField) -> Option<FieldSource> {
        self.entries
            .iter()
            .find(|(mapped, _)| *mapped == field)
            .map(|(_, source)| *source)
    }

    /// Every canonical field must be mapped exactly once.
    pub fn verify(&self) -> Result<(), AdapterError> {
        for field in CanonicalField::ALL {
            let hits = self
                .entries
                .iter()
                .filter(|(mapped, _)| *mapped == field)
                .count();
            if hits != 1 {
                return Err(AdapterError::FieldMap {
                    label: self.label,
                    message: format!("{field:?} mapped {hits} times"),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("payload error for {source_id}: {message}")]
    Payload {
        source_id: &'static str,
        message: String,
    },
    #[error("bad field map {label}: {message}")]
    FieldMap {
        label: &'static str,
        message: String,
    },
}

/// Raw body as fetched from one provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub source_id: &'static str,
    pub url: String,
    pub content_type: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawPayload {
    fn from_response(source_id: &'static str, response: FetchedResponse, ctx: &RunContext) -> Self {
        Self {
            source_id,
            url: response.final_url,
            content_type: response.content_type,
            body: response.body,
            fetched_at: ctx.started_at,
        }
    }
}

/// One provider endpoint. `fetch` does I/O only; `normalize` is a pure
/// transform over the payload and never reaches the network.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn provider(&self) -> SourceProvider;
    fn field_map(&self) -> &'static FieldMap;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &RunContext,
    ) -> Result<RawPayload, AdapterError>;

    fn normalize(&self, payload: &RawPayload, ctx: &RunContext)
        -> Result<EventBatch, AdapterError>;
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

fn batch_of(ctx: &RunContext, events: Vec<EventDraft>, skipped: usize) -> EventBatch {
    let count = events.len() as i64;
    EventBatch {
        query_time: ctx.local_query_time(),
        total: count,
        limit: count,
        offset: 0,
        sort_order: String::new(),
        events,
        skipped,
    }
}

// ---------------------------------------------------------------------------
// Record resolution
// ---------------------------------------------------------------------------

/// One provider record plus the nested views some field sources reach into.
struct RecordView<'a> {
    record: &'a JsonValue,
    first_show: Option<&'a JsonValue>,
    first_show_time: Option<&'a JsonValue>,
}

impl<'a> RecordView<'a> {
    fn flat(record: &'a JsonValue) -> Self {
        Self {
            record,
            first_show: None,
            first_show_time: None,
        }
    }

    /// Selects the FIRST show instance as the record's date/venue source.
    /// Deterministic tie-break: providers list the principal performance
    /// first.
    fn with_first_show(record: &'a JsonValue, show_list_key: &str) -> Self {
        let first_show = record
            .get(show_list_key)
            .and_then(JsonValue::as_array)
            .and_then(|shows| shows.first());
        let first_show_time = first_show
            .and_then(|show| show.get("time"))
            .filter(|time| time.is_object());
        Self {
            record,
            first_show,
            first_show_time,
        }
    }

    fn raw(&self, source: FieldSource) -> Option<&'a JsonValue> {
        match source {
            FieldSource::Key(key) => self.record.get(key),
            FieldSource::FirstShow(key) => self.first_show?.get(key),
            FieldSource::FirstShowTime(key) => self.first_show_time?.get(key),
            FieldSource::FirstImageUrl(key) => {
                self.record.get(key)?.as_array()?.first()?.get("url")
            }
            FieldSource::Fixed(_) | FieldSource::Absent => None,
        }
    }

    fn text(&self, map: &FieldMap, field: CanonicalField) -> String {
        let Some(source) = map.source(field) else {
            return String::new();
        };
        if let FieldSource::Fixed(value) = source {
            return value.to_string();
        }
        match self.raw(source) {
            Some(JsonValue::String(text)) => text.trim().to_string(),
            Some(JsonValue::Number(number)) => number.to_string(),
            _ => String::new(),
        }
    }

    fn date(&self, map: &FieldMap, field: CanonicalField) -> Option<NaiveDateTime> {
        let source = map.source(field)?;
        if let FieldSource::Fixed(value) = source {
            return normalize_date(value);
        }
        match self.raw(source)? {
            JsonValue::String(text) => normalize_date(text),
            _ => None,
        }
    }

    fn coordinate(&self, map: &FieldMap, field: CanonicalField, axis: Axis) -> Option<f64> {
        let source = map.source(field)?;
        if let FieldSource::Fixed(value) = source {
            return validate_coordinate_text(value, axis);
        }
        coordinate_from_json(self.raw(source), axis)
    }

    /// `None` when the record carries no usable raw id; callers count the
    /// skip instead of manufacturing a colliding uid.
    fn to_draft(&self, map: &FieldMap, provider: SourceProvider) -> Option<EventDraft> {
        let raw_uid = self.text(map, CanonicalField::Uid);
        if raw_uid.is_empty() {
            return None;
        }
        Some(EventDraft {
            uid: provider.qualify(&raw_uid),
            title: self.text(map, CanonicalField::Title),
            description: self.text(map, CanonicalField::Description),
            organizer: self.text(map, CanonicalField::Organizer),
            address: self.text(map, CanonicalField::Address),
            location: self.text(map, CanonicalField::Location),
            start_date: self.date(map, CanonicalField::StartDate),
            end_date: self.date(map, CanonicalField::EndDate),
            latitude: self.coordinate(map, CanonicalField::Latitude, Axis::Latitude),
            longitude: self.coordinate(map, CanonicalField::Longitude, Axis::Longitude),
            ticket_price: self.text(map, CanonicalField::TicketPrice),
            related_link: self.text(map, CanonicalField::RelatedLink),
            image_url: self.text(map, CanonicalField::ImageUrl),
            source: provider,
        })
    }
}

fn parse_record_array(
    source_id: &'static str,
    body: &str,
) -> Result<Vec<JsonValue>, AdapterError> {
    serde_json::from_str(strip_bom(body)).map_err(|err| AdapterError::Payload {
        source_id,
        message: format!("expected a JSON record array: {err}"),
    })
}

// ---------------------------------------------------------------------------
// Culture (Ministry of Culture show/festival listings)
// ---------------------------------------------------------------------------

const CULTURE_BASE_URL: &str = "https://cloud.culture.tw/frontsite/trans/SearchShowAction.do";
const CULTURE_IMAGE_BASE: &str = "https://cloud.culture.tw";

static CULTURE_EVENTS_MAP: FieldMap = FieldMap::new(
    "culture-events",
    &[
        (CanonicalField::Uid, FieldSource::Key("UID")),
        (CanonicalField::Title, FieldSource::Key("title")),
        (
            CanonicalField::Description,
            FieldSource::Key("descriptionFilterHtml"),
        ),
        (CanonicalField::Organizer, FieldSource::Key("masterUnit")),
        (CanonicalField::Address, FieldSource::FirstShow("location")),
        (
            CanonicalField::Location,
            FieldSource::FirstShow("locationName"),
        ),
        (
            CanonicalField::StartDate,
            FieldSource::FirstShowTime("startDate"),
        ),
        (
            CanonicalField::EndDate,
            FieldSource::FirstShowTime("endDate"),
        ),
        (CanonicalField::Latitude, FieldSource::FirstShow("latitude")),
        (
            CanonicalField::Longitude,
            FieldSource::FirstShow("longitude"),
        ),
        (CanonicalField::TicketPrice, FieldSource::FirstShow("price")),
        (CanonicalField::RelatedLink, FieldSource::Absent),
        (CanonicalField::ImageUrl, FieldSource::Key("imageURL")),
    ],
);

static CULTURE_FESTIVAL_MAP: FieldMap = FieldMap::new(
    "culture-festival",
    &[
        (CanonicalField::Uid, FieldSource::Key("actId")),
        (CanonicalField::Title, FieldSource::Key("actName")),
        (CanonicalField::Description, FieldSource::Key("description")),
        (CanonicalField::Organizer, FieldSource::Key("org")),
        (CanonicalField::Address, FieldSource::Key("address")),
        (CanonicalField::Location, FieldSource::Key("address")),
        (CanonicalField::StartDate, FieldSource::Key("startTime")),
        (CanonicalField::EndDate, FieldSource::Key("endTime")),
        (CanonicalField::Latitude, FieldSource::Key("latitude")),
        (CanonicalField::Longitude, FieldSource::Key("longitude")),
        (CanonicalField::TicketPrice, FieldSource::Key("charge")),
        (CanonicalField::RelatedLink, FieldSource::Key("website")),
        (CanonicalField::ImageUrl, FieldSource::Key("imageUrl")),
    ],
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CultureMode {
    Events { category: &'static str },
    Festival,
}

#[derive(Debug, Clone, Copy)]
pub struct CultureAdapter {
    source_id: &'static str,
    mode: CultureMode,
}

fn absolutize_culture_image(image_url: String) -> String {
    if image_url.is_empty() || image_url.starts_with("http") {
        image_url
    } else {
        format!("{CULTURE_IMAGE_BASE}{image_url}")
    }
}

#[async_trait]
impl SourceAdapter for CultureAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn provider(&self) -> SourceProvider {
        SourceProvider::Culture
    }

    fn field_map(&self) -> &'static FieldMap {
        match self.mode {
            CultureMode::Events { .. } => &CULTURE_EVENTS_MAP,
            CultureMode::Festival => &CULTURE_FESTIVAL_MAP,
        }
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &RunContext,
    ) -> Result<RawPayload, AdapterError> {
        let url = match self.mode {
            CultureMode::Events { category } => {
                format!("{CULTURE_BASE_URL}?method=doFindTypeJ&category={category}")
            }
            CultureMode::Festival => format!("{CULTURE_BASE_URL}?method=doFindFestivalTypeJ"),
        };
        let response = http
            .fetch_text(ctx.pass_id, self.source_id, &url, Some("application/json"))
            .await?;
        Ok(RawPayload::from_response(self.source_id, response, ctx))
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        ctx: &RunContext,
    ) -> Result<EventBatch, AdapterError> {
        let records = parse_record_array(self.source_id, &payload.body)?;
        let map = self.field_map();

        let mut events = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in &records {
            let view = match self.mode {
                CultureMode::Events { .. } => RecordView::with_first_show(record, "showInfo"),
                CultureMode::Festival => RecordView::flat(record),
            };
            match view.to_draft(map, self.provider()) {
                Some(mut draft) => {
                    draft.image_url = absolutize_culture_image(draft.image_url);
                    events.push(draft);
                }
                None => skipped += 1,
            }
        }
        Ok(batch_of(ctx, events, skipped))
    }
}

// ---------------------------------------------------------------------------
// Taipei city featured activities
// ---------------------------------------------------------------------------

const TAIPEI_URL: &str = "https://www.gov.taipei/OpenData.aspx?SN=DD102593FDB1A032";

static TAIPEI_MAP: FieldMap = FieldMap::new(
    "taipei-featured",
    &[
        (CanonicalField::Uid, FieldSource::Key("DataSN")),
        (CanonicalField::Title, FieldSource::Key("title")),
        (CanonicalField::Description, FieldSource::Key("內容")),
        (CanonicalField::Organizer, FieldSource::Key("主辦單位")),
        (CanonicalField::Address, FieldSource::Key("活動地址")),
        (CanonicalField::Location, FieldSource::Key("地點")),
        (CanonicalField::StartDate, FieldSource::Key("活動開始時間")),
        (CanonicalField::EndDate, FieldSource::Key("活動結束時間")),
        (CanonicalField::Latitude, FieldSource::Absent),
        (CanonicalField::Longitude, FieldSource::Absent),
        (CanonicalField::TicketPrice, FieldSource::Key("費用")),
        (CanonicalField::RelatedLink, FieldSource::Key("Source")),
        (
            CanonicalField::ImageUrl,
            FieldSource::FirstImageUrl("相關圖片"),
        ),
    ],
);

#[derive(Debug, Clone, Copy)]
pub struct TaipeiAdapter;

#[async_trait]
impl SourceAdapter for TaipeiAdapter {
    fn source_id(&self) -> &'static str {
        "taipei:featured"
    }

    fn provider(&self) -> SourceProvider {
        SourceProvider::Taipei
    }

    fn field_map(&self) -> &'static FieldMap {
        &TAIPEI_MAP
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &RunContext,
    ) -> Result<RawPayload, AdapterError> {
        let response = http
            .fetch_text(ctx.pass_id, self.source_id(), TAIPEI_URL, Some("application/json"))
            .await?;
        Ok(RawPayload::from_response(self.source_id(), response, ctx))
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        ctx: &RunContext,
    ) -> Result<EventBatch, AdapterError> {
        // The endpoint intermittently serves a UTF-8 BOM before the JSON
        // body; parse_record_array strips it.
        let records = parse_record_array(self.source_id(), &payload.body)?;

        let mut events = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in &records {
            match RecordView::flat(record).to_draft(self.field_map(), self.provider()) {
                Some(draft) => events.push(draft),
                None => {
                    warn!(source_id = self.source_id(), "skipping record without DataSN");
                    skipped += 1;
                }
            }
        }
        Ok(batch_of(ctx, events, skipped))
    }
}

// ---------------------------------------------------------------------------
// New Taipei city activities (CSV or JSON on the same endpoint)
// ---------------------------------------------------------------------------

const NEWTAIPEI_URL: &str =
    "https://data.ntpc.gov.tw/api/datasets/029e3fc2-1927-4534-8702-da7323be969b/csv/file";

static NEWTAIPEI_MAP: FieldMap = FieldMap::new(
    "newtaipei-activities",
    &[
        (CanonicalField::Uid, FieldSource::Key("id")),
        (CanonicalField::Title, FieldSource::Key("title")),
        (CanonicalField::Description, FieldSource::Key("description")),
        (CanonicalField::Organizer, FieldSource::Key("author")),
        (CanonicalField::Address, FieldSource::Key("address")),
        (CanonicalField::Location, FieldSource::Key("place")),
        (CanonicalField::StartDate, FieldSource::Key("activeDate")),
        (CanonicalField::EndDate, FieldSource::Key("activeEndDate")),
        (CanonicalField::Latitude, FieldSource::Absent),
        (CanonicalField::Longitude, FieldSource::Absent),
        (CanonicalField::TicketPrice, FieldSource::Absent),
        (CanonicalField::RelatedLink, FieldSource::Key("aboutUrl")),
        (CanonicalField::ImageUrl, FieldSource::Key("picUrl")),
    ],
);

#[derive(Debug, Clone, Copy)]
pub struct NewTaipeiAdapter;

impl NewTaipeiAdapter {
    /// The endpoint answers CSV by default but has served JSON; sniff the
    /// body rather than trusting the content type.
    fn looks_like_json(body: &str) -> bool {
        matches!(body.trim_start().chars().next(), Some('[') | Some('{'))
    }

    fn rows_from_csv(&self, body: &str) -> (Vec<JsonValue>, usize) {
        let mut reader = csv::ReaderBuilder::new().from_reader(body.as_bytes());
        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for row in reader.deserialize::<HashMap<String, String>>() {
            match row {
                Ok(fields) => {
                    rows.push(JsonValue::Object(
                        fields
                            .into_iter()
                            .map(|(key, value)| (key, JsonValue::String(value)))
                            .collect(),
                    ));
                }
                Err(err) => {
                    warn!(source_id = self.source_id(), error = %err, "skipping unreadable csv row");
                    skipped += 1;
                }
            }
        }
        (rows, skipped)
    }
}

#[async_trait]
impl SourceAdapter for NewTaipeiAdapter {
    fn source_id(&self) -> &'static str {
        "newtaipei:activities"
    }

    fn provider(&self) -> SourceProvider {
        SourceProvider::NewTaipei
    }

    fn field_map(&self) -> &'static FieldMap {
        &NEWTAIPEI_MAP
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &RunContext,
    ) -> Result<RawPayload, AdapterError> {
        let response = http
            .fetch_text(ctx.pass_id, self.source_id(), NEWTAIPEI_URL, None)
            .await?;
        Ok(RawPayload::from_response(self.source_id(), response, ctx))
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        ctx: &RunContext,
    ) -> Result<EventBatch, AdapterError> {
        // The exported file starts with a BOM artifact glued onto the first
        // column name; strip it before the header row is read.
        let body = strip_bom(&payload.body);

        let (records, mut skipped) = if Self::looks_like_json(body) {
            (parse_record_array(self.source_id(), body)?, 0)
        } else {
            self.rows_from_csv(body)
        };

        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            match RecordView::flat(record).to_draft(self.field_map(), self.provider()) {
                Some(draft) => events.push(draft),
                None => skipped += 1,
            }
        }
        Ok(batch_of(ctx, events, skipped))
    }
}

// ---------------------------------------------------------------------------
// TFAM (Taipei Fine Arts Museum datasets on data.taipei)
// ---------------------------------------------------------------------------

const TFAM_PRIMARY_BASE: &str = "https://data.taipei/api/v1/dataset";
const TFAM_BACKUP_BASE: &str = "https://data.taipei/opendata/datalist/apiAccess";
const TFAM_EXHIBITIONS_DATASET: &str = "fef040da-75d3-42bc-98dd-a292919a251a";
const TFAM_ACTIVITIES_DATASET: &str = "1700a7e6-3d27-47f9-89d9-1811c9f7489c";
const TFAM_PAGE_LIMIT_CAP: i64 = 1000;

// The museum's datasets carry no per-item venue data; both result shapes
// share these constants and one field map.
static TFAM_MAP: FieldMap = FieldMap::new(
    "tfam",
    &[
        (CanonicalField::Uid, FieldSource::Key("_id")),
        (CanonicalField::Title, FieldSource::Key("title")),
        (CanonicalField::Description, FieldSource::Key("內容")),
        (CanonicalField::Organizer, FieldSource::Fixed("臺北市立美術館")),
        (
            CanonicalField::Address,
            FieldSource::Fixed("臺北市中山區中山北路三段181號"),
        ),
        (CanonicalField::Location, FieldSource::Fixed("臺北市立美術館")),
        (CanonicalField::StartDate, FieldSource::Key("startDate")),
        (CanonicalField::EndDate, FieldSource::Key("endDate")),
        (CanonicalField::Latitude, FieldSource::Fixed("25.072943")),
        (CanonicalField::Longitude, FieldSource::Fixed("121.524536")),
        (CanonicalField::TicketPrice, FieldSource::Key("price")),
        (CanonicalField::RelatedLink, FieldSource::Key("url")),
        (CanonicalField::ImageUrl, FieldSource::Key("imageUrl")),
    ],
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfamDataset {
    Exhibitions,
    Activities,
}

impl TfamDataset {
    fn dataset_id(&self) -> &'static str {
        match self {
            TfamDataset::Exhibitions => TFAM_EXHIBITIONS_DATASET,
            TfamDataset::Activities => TFAM_ACTIVITIES_DATASET,
        }
    }

    fn source_id(&self) -> &'static str {
        match self {
            TfamDataset::Exhibitions => "tfam:exhibitions",
            TfamDataset::Activities => "tfam:activities",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TfamAdapter {
    dataset: TfamDataset,
    limit: i64,
    offset: i64,
}

impl TfamAdapter {
    pub fn new(dataset: TfamDataset) -> Self {
        Self {
            dataset,
            limit: 10,
            offset: 0,
        }
    }

    pub fn with_page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit.clamp(1, TFAM_PAGE_LIMIT_CAP);
        self.offset = offset.max(0);
        self
    }

    fn primary_url(&self) -> String {
        format!(
            "{TFAM_PRIMARY_BASE}/{}?scope=resourceAquire&limit={}&offset={}",
            self.dataset.dataset_id(),
            self.limit,
            self.offset
        )
    }

    fn backup_url(&self) -> String {
        format!(
            "{TFAM_BACKUP_BASE}?scope=resourceAquire&rid={}&limit={}&offset={}",
            self.dataset.dataset_id(),
            self.limit,
            self.offset
        )
    }
}

#[async_trait]
impl SourceAdapter for TfamAdapter {
    fn source_id(&self) -> &'static str {
        self.dataset.source_id()
    }

    fn provider(&self) -> SourceProvider {
        SourceProvider::Tfam
    }

    fn field_map(&self) -> &'static FieldMap {
        &TFAM_MAP
    }

    /// Primary endpoint first, backup second; both share ONE retry deadline
    /// so failover cannot double the attempt budget.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &RunContext,
    ) -> Result<RawPayload, AdapterError> {
        let give_up_at = http.deadline();
        let primary = self.primary_url();
        match http
            .fetch_text_until(
                ctx.pass_id,
                self.source_id(),
                &primary,
                Some("application/json"),
                give_up_at,
            )
            .await
        {
            Ok(response) => Ok(RawPayload::from_response(self.source_id(), response, ctx)),
            Err(primary_err) => {
                warn!(
                    source_id = self.source_id(),
                    error = %primary_err,
                    "primary endpoint failed, trying backup"
                );
                let backup = self.backup_url();
                let response = http
                    .fetch_text_until(
                        ctx.pass_id,
                        self.source_id(),
                        &backup,
                        Some("application/json"),
                        give_up_at,
                    )
                    .await?;
                Ok(RawPayload::from_response(self.source_id(), response, ctx))
            }
        }
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        ctx: &RunContext,
    ) -> Result<EventBatch, AdapterError> {
        let root: JsonValue =
            serde_json::from_str(strip_bom(&payload.body)).map_err(|err| AdapterError::Payload {
                source_id: self.source_id(),
                message: format!("invalid JSON body: {err}"),
            })?;
        let envelope = root
            .get("result")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| AdapterError::Payload {
                source_id: self.source_id(),
                message: "missing result envelope".to_string(),
            })?;
        let results = envelope
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Payload {
                source_id: self.source_id(),
                message: "missing results list".to_string(),
            })?;

        let mut events = Vec::with_capacity(results.len());
        let mut skipped = 0usize;
        for record in results {
            match RecordView::flat(record).to_draft(self.field_map(), self.provider()) {
                Some(draft) => events.push(draft),
                None => skipped += 1,
            }
        }

        let mut batch = batch_of(ctx, events, skipped);
        batch.total = envelope
            .get("total")
            .and_then(JsonValue::as_i64)
            .unwrap_or(batch.total);
        batch.limit = self.limit;
        batch.offset = self.offset;
        batch.sort_order = envelope
            .get("sort")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(batch)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub fn culture_all_adapter() -> CultureAdapter {
    CultureAdapter {
        source_id: "culture:all",
        mode: CultureMode::Events { category: "all" },
    }
}

pub fn culture_integrated_adapter() -> CultureAdapter {
    CultureAdapter {
        source_id: "culture:integrated",
        mode: CultureMode::Events { category: "11" },
    }
}

pub fn culture_festival_adapter() -> CultureAdapter {
    CultureAdapter {
        source_id: "culture:festival",
        mode: CultureMode::Festival,
    }
}

pub fn taipei_adapter() -> TaipeiAdapter {
    TaipeiAdapter
}

pub fn newtaipei_adapter() -> NewTaipeiAdapter {
    NewTaipeiAdapter
}

pub fn tfam_exhibitions_adapter() -> TfamAdapter {
    TfamAdapter::new(TfamDataset::Exhibitions)
}

pub fn tfam_activities_adapter() -> TfamAdapter {
    TfamAdapter::new(TfamDataset::Activities)
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "culture:all" => Some(Box::new(culture_all_adapter())),
        "culture:integrated" => Some(Box::new(culture_integrated_adapter())),
        "culture:festival" => Some(Box::new(culture_festival_adapter())),
        "tfam:exhibitions" => Some(Box::new(tfam_exhibitions_adapter())),
        "tfam:activities" => Some(Box::new(tfam_activities_adapter())),
        "taipei:featured" => Some(Box::new(taipei_adapter())),
        "newtaipei:activities" => Some(Box::new(newtaipei_adapter())),
        _ => None,
    }
}

/// The original scheduled pass order: culture pulls, museum datasets, city
/// platforms.
pub fn default_adapter_sequence() -> Vec<Box<dyn SourceAdapter>> {
    vec![
        Box::new(culture_all_adapter()),
        Box::new(culture_integrated_adapter()),
        Box::new(culture_festival_adapter()),
        Box::new(tfam_exhibitions_adapter()),
        Box::new(tfam_activities_adapter()),
        Box::new(taipei_adapter()),
        Box::new(newtaipei_adapter()),
    ]
}

/// Start-time check that every adapter accounts for every canonical field.
pub fn verify_field_maps() -> Result<(), AdapterError> {
    for adapter in default_adapter_sequence() {
        adapter.field_map().verify()?;
    }
    Ok(())
}
