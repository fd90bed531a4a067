//! HTTP fetch with bounded retry, raw payload archive, and the event store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use funev_core::{
    CanonicalEvent, EventDraft, IngestionRun, RunAssociation, RunContext, RunReport,
    SourceProvider,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "funev-storage";

// ---------------------------------------------------------------------------
// Retry policy + HTTP fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry for one outbound call: attempt count, exponential backoff
/// and a deadline spanning ALL attempts (and, for sources with a backup
/// URL, both URLs; see [`HttpFetcher::deadline`]).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.backoff_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch deadline exhausted for {url}")]
    DeadlineExhausted { url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fresh give-up instant for one logical fetch. Callers with a backup
    /// URL obtain this once and pass it to both [`Self::fetch_text_until`]
    /// calls so primary and backup share a single attempt budget.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.retry.deadline
    }

    pub async fn fetch_text(
        &self,
        pass_id: Uuid,
        source_id: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_text_until(pass_id, source_id, url, accept, self.deadline())
            .await
    }

    /// Transport failures and non-2xx statuses are retried until the
    /// attempt count or `give_up_at` runs out; body-decode errors are not
    /// transient and fail immediately. Exhaustion returns the last
    /// observed error.
    pub async fn fetch_text_until(
        &self,
        pass_id: Uuid,
        source_id: &str,
        url: &str,
        accept: Option<&str>,
        give_up_at: Instant,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %pass_id, source_id, url);
        let _guard = span.enter();

        let mut last_error: Option<FetchError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt - 1);
                if Instant::now() + delay >= give_up_at {
                    break;
                }
                tokio::time::sleep(delay).await;
            } else if Instant::now() >= give_up_at {
                break;
            }

            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let body = resp.bytes().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body: String::from_utf8_lossy(&body).into_owned(),
                        });
                    }

                    warn!(status = status.as_u16(), url = %final_url, "non-success response");
                    last_error = Some(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    last_error = Some(FetchError::Request(err));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::DeadlineExhausted {
            url: url.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Raw payload archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw provider payloads, one directory per pass
/// stamp and source.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn payload_relative_path(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_id.replace(':', "_"))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store a payload immutably via a temp file and atomic rename. A body
    /// already present under the same hash path is reported as
    /// deduplicated, not rewritten.
    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::payload_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let write_result = write_new_file(&temp_path, bytes).await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming archive temp file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp archive file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp archive file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp archive file {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Merge rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// The fixed set of fields a later sighting may revise. Everything else is
/// written once at creation and never touched again.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MutableFields {
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub ticket_price: String,
    pub related_link: String,
    pub image_url: String,
    pub address: String,
}

impl MutableFields {
    pub fn of_event(event: &CanonicalEvent) -> Self {
        Self {
            start_date: event.start_date,
            end_date: event.end_date,
            ticket_price: event.ticket_price.clone(),
            related_link: event.related_link.clone(),
            image_url: event.image_url.clone(),
            address: event.address.clone(),
        }
    }

    pub fn of_draft(draft: &EventDraft) -> Self {
        Self {
            start_date: draft.start_date,
            end_date: draft.end_date,
            ticket_price: draft.ticket_price.clone(),
            related_link: draft.related_link.clone(),
            image_url: draft.image_url.clone(),
            address: draft.address.clone(),
        }
    }

    pub fn apply_to(&self, event: &mut CanonicalEvent) {
        event.start_date = self.start_date;
        event.end_date = self.end_date;
        event.ticket_price = self.ticket_price.clone();
        event.related_link = self.related_link.clone();
        event.image_url = self.image_url.clone();
        event.address = self.address.clone();
    }
}

fn merge_date(slot: &mut Option<NaiveDateTime>, incoming: Option<NaiveDateTime>) -> bool {
    match incoming {
        Some(value) if *slot != Some(value) => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}

fn merge_text(slot: &mut String, incoming: &str) -> bool {
    if !incoming.is_empty() && slot != incoming {
        *slot = incoming.to_string();
        true
    } else {
        false
    }
}

/// Non-destructive merge: an incoming value overwrites only when non-empty
/// AND different; an empty incoming value never erases a stored one.
/// Returns true when anything changed.
pub fn merge_fields(existing: &mut MutableFields, incoming: &MutableFields) -> bool {
    let mut changed = false;
    changed |= merge_date(&mut existing.start_date, incoming.start_date);
    changed |= merge_date(&mut existing.end_date, incoming.end_date);
    changed |= merge_text(&mut existing.ticket_price, &incoming.ticket_price);
    changed |= merge_text(&mut existing.related_link, &incoming.related_link);
    changed |= merge_text(&mut existing.image_url, &incoming.image_url);
    changed |= merge_text(&mut existing.address, &incoming.address);
    changed
}

pub fn merge_event(existing: &mut CanonicalEvent, draft: &EventDraft) -> UpsertOutcome {
    let mut fields = MutableFields::of_event(existing);
    if merge_fields(&mut fields, &MutableFields::of_draft(draft)) {
        fields.apply_to(existing);
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Unchanged
    }
}

// ---------------------------------------------------------------------------
// Event store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unknown run id {0}")]
    UnknownRun(i64),
    #[error("corrupt events row for uid {uid}: {message}")]
    CorruptRow { uid: String, message: String },
    #[error("injected failure for uid {0}")]
    FaultInjected(String),
}

/// Sole owner of writes to events, runs and associations. Adapters and the
/// orchestrator only produce drafts.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// One `import_dates` row per orchestrated pass.
    async fn record_import(&self, ctx: &RunContext) -> Result<i64, StoreError>;

    /// Commit one run's drafts as a single atomic unit: run row, event
    /// upserts keyed by uid, and `(run, event)` associations with 1-based
    /// display order. Any failure rolls the whole batch back.
    async fn commit_run(
        &self,
        run: &IngestionRun,
        drafts: &[EventDraft],
    ) -> Result<RunReport, StoreError>;

    async fn event_by_uid(&self, uid: &str) -> Result<Option<CanonicalEvent>, StoreError>;

    async fn event_count(&self) -> Result<i64, StoreError>;

    async fn associations_for_run(&self, run_id: i64) -> Result<Vec<RunAssociation>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<CanonicalEvent, StoreError> {
    let uid: String = row.try_get("uid")?;
    let provider: String = row.try_get("source_provider")?;
    let source = SourceProvider::parse(&provider).ok_or_else(|| StoreError::CorruptRow {
        uid: uid.clone(),
        message: format!("unknown source provider {provider:?}"),
    })?;
    Ok(CanonicalEvent {
        uid,
        title: row.try_get("activity_name")?,
        description: row.try_get("description")?,
        organizer: row.try_get("organizer")?,
        address: row.try_get("address")?,
        location: row.try_get("location")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        ticket_price: row.try_get("ticket_price")?,
        related_link: row.try_get("related_link")?,
        image_url: row.try_get("image_url")?,
        source,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn record_import(&self, ctx: &RunContext) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO import_dates (import_date, timezone_offset, timezone_name) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(ctx.started_at)
        .bind(ctx.timezone_offset_minutes)
        .bind(&ctx.timezone_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn commit_run(
        &self,
        run: &IngestionRun,
        drafts: &[EventDraft],
    ) -> Result<RunReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let run_id = match run.id {
            Some(id) => {
                let known: Option<i64> = sqlx::query_scalar("SELECT id FROM query_results WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
                known.ok_or(StoreError::UnknownRun(id))?
            }
            None => {
                sqlx::query_scalar(
                    "INSERT INTO query_results \
                     (query_timestamp, limit_count, offset_count, total_count, sort_order) \
                     VALUES ($1, $2, $3, $4, $5) RETURNING id",
                )
                .bind(run.query_time)
                .bind(run.limit)
                .bind(run.offset)
                .bind(run.total)
                .bind(&run.sort_order)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        let mut report = RunReport {
            run_id,
            created: 0,
            updated: 0,
            unchanged: 0,
        };

        for (index, draft) in drafts.iter().enumerate() {
            let existing: Option<MutableFields> = sqlx::query_as(
                "SELECT start_date, end_date, ticket_price, related_link, image_url, address \
                 FROM events WHERE uid = $1",
            )
            .bind(&draft.uid)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        "INSERT INTO events \
                         (uid, activity_name, description, organizer, address, location, \
                          start_date, end_date, latitude, longitude, ticket_price, \
                          related_link, image_url, source_provider) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                    )
                    .bind(&draft.uid)
                    .bind(&draft.title)
                    .bind(&draft.description)
                    .bind(&draft.organizer)
                    .bind(&draft.address)
                    .bind(&draft.location)
                    .bind(draft.start_date)
                    .bind(draft.end_date)
                    .bind(draft.latitude)
                    .bind(draft.longitude)
                    .bind(&draft.ticket_price)
                    .bind(&draft.related_link)
                    .bind(&draft.image_url)
                    .bind(draft.source.as_str())
                    .execute(&mut *tx)
                    .await?;
                    report.created += 1;
                }
                Some(mut fields) => {
                    if merge_fields(&mut fields, &MutableFields::of_draft(draft)) {
                        sqlx::query(
                            "UPDATE events SET start_date = $1, end_date = $2, \
                             ticket_price = $3, related_link = $4, image_url = $5, \
                             address = $6 WHERE uid = $7",
                        )
                        .bind(fields.start_date)
                        .bind(fields.end_date)
                        .bind(&fields.ticket_price)
                        .bind(&fields.related_link)
                        .bind(&fields.image_url)
                        .bind(&fields.address)
                        .bind(&draft.uid)
                        .execute(&mut *tx)
                        .await?;
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
            }

            sqlx::query(
                "INSERT INTO query_event_relations (query_id, event_uid, display_order) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (query_id, event_uid) \
                 DO UPDATE SET display_order = EXCLUDED.display_order",
            )
            .bind(run_id)
            .bind(&draft.uid)
            .bind(index as i64 + 1)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn event_by_uid(&self, uid: &str) -> Result<Option<CanonicalEvent>, StoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn event_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn associations_for_run(&self, run_id: i64) -> Result<Vec<RunAssociation>, StoreError> {
        let rows = sqlx::query(
            "SELECT query_id, event_uid, display_order FROM query_event_relations \
             WHERE query_id = $1 ORDER BY display_order",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RunAssociation {
                    run_id: row.try_get("query_id")?,
                    event_uid: row.try_get("event_uid")?,
                    display_order: row.try_get("display_order")?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_import_id: i64,
    next_run_id: i64,
    imports: Vec<(i64, DateTime<Utc>, i32, String)>,
    events: BTreeMap<String, CanonicalEvent>,
    runs: BTreeMap<i64, IngestionRun>,
    relations: BTreeMap<(i64, String), i64>,
}

/// Trait-complete in-memory store. Commits are copy-on-write: a run's
/// writes land on a clone of the state, which replaces the shared state
/// only when the whole batch succeeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
    fail_on_uid: std::sync::Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: the next commits fail (and roll back) when they
    /// reach a draft with this uid.
    pub fn fail_on_uid(&self, uid: impl Into<String>) {
        let mut slot = self
            .fail_on_uid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(uid.into());
    }

    fn poisoned_uid(&self) -> Option<String> {
        self.fail_on_uid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of recorded import stamps, one per orchestrated pass.
    pub async fn import_count(&self) -> usize {
        self.inner.lock().await.imports.len()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn record_import(&self, ctx: &RunContext) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_import_id += 1;
        let id = inner.next_import_id;
        inner.imports.push((
            id,
            ctx.started_at,
            ctx.timezone_offset_minutes,
            ctx.timezone_name.clone(),
        ));
        Ok(id)
    }

    async fn commit_run(
        &self,
        run: &IngestionRun,
        drafts: &[EventDraft],
    ) -> Result<RunReport, StoreError> {
        let poisoned = self.poisoned_uid();
        let mut inner = self.inner.lock().await;
        let mut staged = inner.clone();

        let run_id = match run.id {
            Some(id) => {
                if !staged.runs.contains_key(&id) {
                    return Err(StoreError::UnknownRun(id));
                }
                id
            }
            None => {
                staged.next_run_id += 1;
                let id = staged.next_run_id;
                let mut stored = run.clone();
                stored.id = Some(id);
                staged.runs.insert(id, stored);
                id
            }
        };

        let mut report = RunReport {
            run_id,
            created: 0,
            updated: 0,
            unchanged: 0,
        };

        for (index, draft) in drafts.iter().enumerate() {
            if poisoned.as_deref() == Some(draft.uid.as_str()) {
                return Err(StoreError::FaultInjected(draft.uid.clone()));
            }

            match staged.events.get_mut(&draft.uid) {
                None => {
                    staged
                        .events
                        .insert(draft.uid.clone(), CanonicalEvent::from(draft.clone()));
                    report.created += 1;
                }
                Some(existing) => match merge_event(existing, draft) {
                    UpsertOutcome::Updated => report.updated += 1,
                    _ => report.unchanged += 1,
                },
            }

            staged
                .relations
                .insert((run_id, draft.uid.clone()), index as i64 + 1);
        }

        *inner = staged;
        Ok(report)
    }

    async fn event_by_uid(&self, uid: &str) -> Result<Option<CanonicalEvent>, StoreError> {
        Ok(self.inner.lock().await.events.get(uid).cloned())
    }

    async fn event_count(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.events.len() as i64)
    }

    async fn associations_for_run(&self, run_id: i64) -> Result<Vec<RunAssociation>, StoreError> {
        let inner = self.inner.lock().await;
        let mut associations: Vec<RunAssociation> = inner
            .relations
            .iter()
            .filter(|((id, _), _)| *id == run_id)
            .map(|((id, uid), order)| RunAssociation {
                run_id: *id,
                event_uid: uid.clone(),
                display_order: *order,
            })
            .collect();
        associations.sort_by_key(|a| a.display_order);
        Ok(associations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn canonical_date(y: i32, m: u32, d: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d).map(|date| date.and_time(chrono::NaiveTime::MIN))
    }

    fn draft(uid: &str) -> EventDraft {
        EventDraft {
            uid: uid.to_string(),
            title: "夜光森林市集".to_string(),
            description: "結合光影裝置與手作攤位的夜間市集。".to_string(),
            organizer: "文化部".to_string(),
            address: "臺北市信義區市府路1號".to_string(),
            location: "市民廣場".to_string(),
            start_date: canonical_date(2025, 3, 1),
            end_date: canonical_date(2025, 3, 9),
            latitude: Some(25.0375),
            longitude: Some(121.5637),
            ticket_price: "免費".to_string(),
            related_link: String::new(),
            image_url: "https://cloud.culture.tw/activity/a.jpg".to_string(),
            source: SourceProvider::Culture,
        }
    }

    fn run_for(drafts: &[EventDraft]) -> IngestionRun {
        IngestionRun {
            id: None,
            query_time: canonical_date(2025, 3, 1).unwrap(),
            limit: drafts.len() as i64,
            offset: 0,
            total: drafts.len() as i64,
            sort_order: String::new(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            deadline: Duration::from_secs(30),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn empty_incoming_value_never_erases_stored_value() {
        let mut existing: CanonicalEvent = draft("culture:a1").into();
        let mut incoming = draft("culture:a1");
        incoming.image_url = String::new();
        incoming.ticket_price = String::new();

        assert_eq!(merge_event(&mut existing, &incoming), UpsertOutcome::Unchanged);
        assert_eq!(existing.image_url, "https://cloud.culture.tw/activity/a.jpg");
        assert_eq!(existing.ticket_price, "免費");
    }

    #[test]
    fn differing_non_empty_value_updates_field() {
        let mut existing: CanonicalEvent = draft("culture:a1").into();
        let mut incoming = draft("culture:a1");
        incoming.ticket_price = "100".to_string();
        incoming.end_date = canonical_date(2025, 3, 16);

        assert_eq!(merge_event(&mut existing, &incoming), UpsertOutcome::Updated);
        assert_eq!(existing.ticket_price, "100");
        assert_eq!(existing.end_date, canonical_date(2025, 3, 16));
        // Immutable fields stay put even on an update.
        assert_eq!(existing.title, "夜光森林市集");
    }

    #[test]
    fn identical_draft_is_unchanged() {
        let mut existing: CanonicalEvent = draft("culture:a1").into();
        let incoming = draft("culture:a1");
        assert_eq!(merge_event(&mut existing, &incoming), UpsertOutcome::Unchanged);
    }

    #[tokio::test]
    async fn replaying_identical_batch_converges_to_unchanged() {
        let store = MemoryStore::new();
        let drafts = vec![draft("culture:a1"), draft("culture:b2")];

        let first = store.commit_run(&run_for(&drafts), &drafts).await.unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(store.event_count().await.unwrap(), 2);

        let second = store.commit_run(&run_for(&drafts), &drafts).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(store.event_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reingesting_run_converges_association_order() {
        let store = MemoryStore::new();
        let forward = vec![draft("culture:a"), draft("culture:b"), draft("culture:c")];
        let report = store.commit_run(&run_for(&forward), &forward).await.unwrap();

        let mut reversed = forward.clone();
        reversed.reverse();
        let mut rerun = run_for(&reversed);
        rerun.id = Some(report.run_id);
        store.commit_run(&rerun, &reversed).await.unwrap();

        let associations = store.associations_for_run(report.run_id).await.unwrap();
        assert_eq!(associations.len(), 3);
        let order_of = |uid: &str| {
            associations
                .iter()
                .find(|a| a.event_uid == uid)
                .map(|a| a.display_order)
        };
        assert_eq!(order_of("culture:a"), Some(3));
        assert_eq!(order_of("culture:b"), Some(2));
        assert_eq!(order_of("culture:c"), Some(1));
    }

    #[tokio::test]
    async fn committing_against_unknown_run_id_fails() {
        let store = MemoryStore::new();
        let drafts = vec![draft("culture:a")];
        let mut run = run_for(&drafts);
        run.id = Some(99);

        let err = store.commit_run(&run, &drafts).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownRun(99)));
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_the_entire_batch() {
        let store = MemoryStore::new();
        let seeded = vec![draft("culture:a")];
        store.commit_run(&run_for(&seeded), &seeded).await.unwrap();

        store.fail_on_uid("culture:c");
        let batch = vec![draft("culture:b"), draft("culture:c")];
        let err = store.commit_run(&run_for(&batch), &batch).await.unwrap_err();
        assert!(matches!(err, StoreError::FaultInjected(_)));

        // Nothing from the failed batch persisted, prior commits intact.
        assert_eq!(store.event_count().await.unwrap(), 1);
        assert!(store.event_by_uid("culture:b").await.unwrap().is_none());
        assert!(store.event_by_uid("culture:a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_payloads_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-03-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_payload(fetched_at, "culture:all", "json", b"[{\"UID\":\"a\"}]")
            .await
            .expect("first store");
        let second = archive
            .store_payload(fetched_at, "culture:all", "json", b"[{\"UID\":\"a\"}]")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        // Source ids are path-safe in the archive layout.
        assert!(!first.relative_path.to_string_lossy().contains(':'));
    }
}
