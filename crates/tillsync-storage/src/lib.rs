//! Postgres-backed stores + HTTP fetch utilities for tillsync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

use tillsync_core::{LedgerRecord, RawPayload, RunStatus, SaleRecord, SourceType, SyncRun};

pub const CRATE_NAME: &str = "tillsync-storage";

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPool::connect(database_url)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("../../migrations")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Courtesy rate limiter for the upstream API. Constructed once per process
/// and injected into the fetcher; pacing is cooperative, not a correctness
/// mechanism.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {message}")]
    Decode { url: String, message: String },
}

/// JSON GET client for the external feed APIs with bearer auth, bounded
/// concurrency, retry with exponential backoff, and optional token-bucket
/// pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    bearer_token: Option<String>,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get_json(
        &self,
        run_id: Uuid,
        source: SourceType,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source.as_str()).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("feed_fetch", %run_id, source = source.as_str(), url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url).query(query);
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
                            url: final_url,
                            message: err.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Append-only capture store for raw feed payloads. `store` never mutates
/// existing rows; `mark_processed` touches only the processed flag.
#[async_trait]
pub trait RawPayloadStore: Send + Sync {
    async fn store(
        &self,
        source_type: SourceType,
        owner_scope: &str,
        body: serde_json::Value,
        record_count_hint: i32,
    ) -> anyhow::Result<RawPayload>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<RawPayload>>;

    async fn list_unprocessed(
        &self,
        source_type: Option<SourceType>,
        owner_scope: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<RawPayload>>;

    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgRawStore {
    pool: PgPool,
}

impl PgRawStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_raw_payload(row: &sqlx::postgres::PgRow) -> anyhow::Result<RawPayload> {
    let source_type: String = row.try_get("source_type")?;
    let source_type = SourceType::parse(&source_type)
        .with_context(|| format!("unknown source_type {source_type} in raw_payloads"))?;
    Ok(RawPayload {
        id: row.try_get("id")?,
        source_type,
        owner_scope: row.try_get("owner_scope")?,
        body: row.try_get("body")?,
        record_count_hint: row.try_get("record_count_hint")?,
        processed: row.try_get("processed")?,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl RawPayloadStore for PgRawStore {
    async fn store(
        &self,
        source_type: SourceType,
        owner_scope: &str,
        body: serde_json::Value,
        record_count_hint: i32,
    ) -> anyhow::Result<RawPayload> {
        let payload = RawPayload {
            id: Uuid::new_v4(),
            source_type,
            owner_scope: owner_scope.to_string(),
            body,
            record_count_hint,
            processed: false,
            processed_at: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO raw_payloads
                (id, source_type, owner_scope, body, record_count_hint, processed, processed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(payload.id)
        .bind(payload.source_type.as_str())
        .bind(&payload.owner_scope)
        .bind(&payload.body)
        .bind(payload.record_count_hint)
        .bind(payload.processed)
        .bind(payload.processed_at)
        .bind(payload.created_at)
        .execute(&self.pool)
        .await
        .context("inserting raw payload")?;

        Ok(payload)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<RawPayload>> {
        let row = sqlx::query(
            r#"
            SELECT id, source_type, owner_scope, body, record_count_hint, processed, processed_at, created_at
              FROM raw_payloads
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading raw payload {id}"))?;

        row.as_ref().map(row_to_raw_payload).transpose()
    }

    async fn list_unprocessed(
        &self,
        source_type: Option<SourceType>,
        owner_scope: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<RawPayload>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, source_type, owner_scope, body, record_count_hint, processed, processed_at, created_at \
             FROM raw_payloads WHERE processed = FALSE AND owner_scope = ",
        );
        qb.push_bind(owner_scope);
        if let Some(source_type) = source_type {
            qb.push(" AND source_type = ").push_bind(source_type.as_str());
        }
        qb.push(" ORDER BY created_at ASC LIMIT ").push_bind(limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("listing unprocessed raw payloads")?;

        rows.iter().map(row_to_raw_payload).collect()
    }

    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE raw_payloads
               SET processed = TRUE,
                   processed_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking raw payload {id} processed"))?;
        Ok(())
    }
}

/// Destination-table sink for one normalized record type. Upserts key on
/// `idempotency_key`, so replaying a chunk converges on the same rows.
#[async_trait]
pub trait RecordSink<R>: Send + Sync {
    async fn upsert_chunk(&self, records: &[R]) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone)]
pub struct PgSaleSink {
    pool: PgPool,
}

impl PgSaleSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn sale_upsert_builder(records: &[SaleRecord]) -> QueryBuilder<'_, Postgres> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO sale_records \
         (owner_scope, idempotency_key, transaction_id, line_item_id, business_date, \
          item_name, category, quantity, unit_price, gross_amount, discount_amount, tax_amount) ",
    );
    qb.push_values(records, |mut b, r| {
        b.push_bind(&r.owner_scope)
            .push_bind(&r.idempotency_key)
            .push_bind(&r.transaction_id)
            .push_bind(&r.line_item_id)
            .push_bind(&r.business_date)
            .push_bind(&r.item_name)
            .push_bind(&r.category)
            .push_bind(r.quantity)
            .push_bind(r.unit_price)
            .push_bind(r.gross_amount)
            .push_bind(r.discount_amount)
            .push_bind(r.tax_amount);
    });
    qb.push(
        " ON CONFLICT (idempotency_key) DO UPDATE SET \
          item_name = EXCLUDED.item_name, \
          category = EXCLUDED.category, \
          quantity = EXCLUDED.quantity, \
          unit_price = EXCLUDED.unit_price, \
          gross_amount = EXCLUDED.gross_amount, \
          discount_amount = EXCLUDED.discount_amount, \
          tax_amount = EXCLUDED.tax_amount",
    );
    qb
}

#[async_trait]
impl RecordSink<SaleRecord> for PgSaleSink {
    async fn upsert_chunk(&self, records: &[SaleRecord]) -> anyhow::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut qb = sale_upsert_builder(records);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("upserting sale record chunk")?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgLedgerSink {
    pool: PgPool,
}

impl PgLedgerSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ledger_upsert_builder(records: &[LedgerRecord]) -> QueryBuilder<'_, Postgres> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO ledger_records \
         (owner_scope, idempotency_key, entry_id, account_code, entry_date, \
          fiscal_year, fiscal_month, amount, side, memo, counterparty) ",
    );
    qb.push_values(records, |mut b, r| {
        b.push_bind(&r.owner_scope)
            .push_bind(&r.idempotency_key)
            .push_bind(&r.entry_id)
            .push_bind(&r.account_code)
            .push_bind(&r.entry_date)
            .push_bind(r.fiscal_year)
            .push_bind(r.fiscal_month)
            .push_bind(r.amount)
            .push_bind(&r.side)
            .push_bind(&r.memo)
            .push_bind(&r.counterparty);
    });
    qb.push(
        " ON CONFLICT (idempotency_key) DO UPDATE SET \
          fiscal_year = EXCLUDED.fiscal_year, \
          fiscal_month = EXCLUDED.fiscal_month, \
          amount = EXCLUDED.amount, \
          side = EXCLUDED.side, \
          memo = EXCLUDED.memo, \
          counterparty = EXCLUDED.counterparty",
    );
    qb
}

#[async_trait]
impl RecordSink<LedgerRecord> for PgLedgerSink {
    async fn upsert_chunk(&self, records: &[LedgerRecord]) -> anyhow::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut qb = ledger_upsert_builder(records);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("upserting ledger record chunk")?;
        Ok(result.rows_affected())
    }
}

/// Append-only audit log of capture and sweep runs. `record` upserts by
/// run id so a run can be written at start and finalized at the end.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn record(&self, run: &SyncRun) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgRunLog {
    pool: PgPool,
}

impl PgRunLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLogStore for PgRunLog {
    async fn record(&self, run: &SyncRun) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (run_id, source_type, started_at, finished_at, pages_fetched, records_fetched, inserted, errors, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id) DO UPDATE SET
                finished_at = EXCLUDED.finished_at,
                pages_fetched = EXCLUDED.pages_fetched,
                records_fetched = EXCLUDED.records_fetched,
                inserted = EXCLUDED.inserted,
                errors = EXCLUDED.errors,
                status = EXCLUDED.status
            "#,
        )
        .bind(run.run_id)
        .bind(run.source_type.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.pages_fetched)
        .bind(run.records_fetched)
        .bind(run.inserted)
        .bind(run.errors)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording sync run {}", run.run_id))?;
        Ok(())
    }
}

/// No-op run log for callers that do not persist run history.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunLog;

#[async_trait]
impl RunLogStore for NoopRunLog {
    async fn record(&self, _run: &SyncRun) -> anyhow::Result<()> {
        Ok(())
    }
}

pub async fn load_recent_runs(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<SyncRun>> {
    let rows = sqlx::query(
        r#"
        SELECT run_id, source_type, started_at, finished_at, pages_fetched, records_fetched, inserted, errors, status
          FROM sync_runs
         ORDER BY started_at DESC
         LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("listing recent sync runs")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let source_type: String = row.try_get("source_type")?;
        let source_type = SourceType::parse(&source_type)
            .with_context(|| format!("unknown source_type {source_type} in sync_runs"))?;
        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "running" => RunStatus::Running,
            "success" => RunStatus::Success,
            "partial" => RunStatus::Partial,
            _ => RunStatus::Failed,
        };
        out.push(SyncRun {
            run_id: row.try_get("run_id")?,
            source_type,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            pages_fetched: row.try_get("pages_fetched")?,
            records_fetched: row.try_get("records_fetched")?,
            inserted: row.try_get("inserted")?,
            errors: row.try_get("errors")?,
            status,
        });
    }
    Ok(out)
}
