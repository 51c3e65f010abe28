//! Feed adapters for the external point-of-sale / accounting APIs: the
//! paginated fetch loop, envelope parsing, and per-field coercion into
//! normalized records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use tillsync_core::{LedgerRecord, RawPayload, RecordBatch, SaleRecord, SourceType};
use tillsync_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "tillsync-feeds";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Inclusive date-range filter forwarded to the external API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub from: String,
    pub to: String,
}

/// One fetched page, kept verbatim for raw capture.
#[derive(Debug, Clone)]
pub struct PageCapture {
    pub body: JsonValue,
    pub item_count: usize,
}

/// Seam between the pagination loop and the transport. Production uses
/// [`HttpPageSource`]; tests use in-memory pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, skip: usize, top: usize) -> Result<JsonValue, FeedError>;
}

/// Result of walking a paginated feed to end-of-stream. `error` is set when
/// a transport failure aborted the walk; pages fetched before the failure
/// are preserved so the caller can still capture them.
#[derive(Debug)]
pub struct PagedFetch {
    pub pages: Vec<PageCapture>,
    pub error: Option<FeedError>,
}

impl PagedFetch {
    pub fn item_count(&self) -> usize {
        self.pages.iter().map(|p| p.item_count).sum()
    }
}

/// Pull pages with `skip`/`top` cursors until a short or empty page signals
/// end-of-stream. Non-empty pages are returned in fetch order; the loop
/// sleeps `inter_page_delay` between requests as a courtesy to the upstream.
pub async fn fetch_all_pages(
    source: &dyn PageSource,
    page_size: usize,
    inter_page_delay: Duration,
) -> PagedFetch {
    let page_size = page_size.max(1);
    let mut pages = Vec::new();
    let mut skip = 0usize;

    loop {
        let body = match source.fetch_page(skip, page_size).await {
            Ok(body) => body,
            Err(err) => {
                return PagedFetch {
                    pages,
                    error: Some(err),
                }
            }
        };
        let item_count = envelope_items(&body).map(|items| items.len()).unwrap_or(0);
        if item_count == 0 {
            break;
        }
        let short_page = item_count < page_size;
        pages.push(PageCapture { body, item_count });
        if short_page {
            break;
        }
        skip += page_size;
        if !inter_page_delay.is_zero() {
            tokio::time::sleep(inter_page_delay).await;
        }
    }

    PagedFetch { pages, error: None }
}

/// [`PageSource`] over the authenticated JSON API.
pub struct HttpPageSource {
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    source_type: SourceType,
    url: String,
    filter: DateRange,
}

impl HttpPageSource {
    pub fn new(
        http: Arc<HttpFetcher>,
        run_id: Uuid,
        source_type: SourceType,
        url: String,
        filter: DateRange,
    ) -> Self {
        Self {
            http,
            run_id,
            source_type,
            url,
            filter,
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, skip: usize, top: usize) -> Result<JsonValue, FeedError> {
        let query = [
            ("skip", skip.to_string()),
            ("top", top.to_string()),
            ("from", self.filter.from.clone()),
            ("to", self.filter.to.clone()),
        ];
        Ok(self
            .http
            .get_json(self.run_id, self.source_type, &self.url, &query)
            .await?)
    }
}

/// Locate the record list inside a page envelope. The POS feed wraps records
/// in `items`, the ledger feed in `list`; both keys are tolerated on both
/// feeds so a vendor-side rename does not zero out a sweep.
pub fn envelope_items(body: &JsonValue) -> Option<&Vec<JsonValue>> {
    body.get("items")
        .or_else(|| body.get("list"))
        .and_then(JsonValue::as_array)
}

// ---------------------------------------------------------------------------
// Field coercion. Every function is total: malformed input resolves to a
// documented default, never an error, so parsed count always equals envelope
// item count.
// ---------------------------------------------------------------------------

pub fn coerce_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Parse a monetary/quantity value. Accepts JSON numbers and numeric strings
/// in either decimal convention (`1,234.56` / `1.234,56`), with currency
/// symbols and whitespace stripped. Defaults to `0.0`.
pub fn coerce_decimal(value: Option<&JsonValue>) -> f64 {
    let Some(value) = value else { return 0.0 };
    if let Some(n) = value.as_f64() {
        return n;
    }
    value
        .as_str()
        .and_then(parse_decimal_str)
        .unwrap_or(0.0)
}

fn parse_decimal_str(input: &str) -> Option<f64> {
    let cleaned: String = input
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => {
            // comma is the decimal separator, dots group thousands
            cleaned.replace('.', "").replace(',', ".")
        }
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) => {
            let tail = cleaned.len() - comma - 1;
            if tail == 3 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse().ok()
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];

/// Normalize a date value to canonical `YYYY-MM-DD`. Accepts RFC 3339
/// timestamps and the formats the feeds are known to emit. Defaults to `""`.
pub fn coerce_date(value: Option<&JsonValue>) -> String {
    let Some(text) = value.and_then(JsonValue::as_str) else {
        return String::new();
    };
    let text = text.trim();

    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(text) {
        return ts.date_naive().format("%Y-%m-%d").to_string();
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.format("%Y-%m-%d").to_string();
        }
    }
    String::new()
}

/// Split a composite `"YYYY-MM"` period into a validated (year, month)
/// pair. Defaults to `(0, 0)`.
pub fn split_period(value: Option<&JsonValue>) -> (i32, i32) {
    value
        .and_then(JsonValue::as_str)
        .map(split_period_str)
        .unwrap_or((0, 0))
}

pub fn split_period_str(text: &str) -> (i32, i32) {
    let mut parts = text.trim().splitn(2, ['-', '/']);
    let year = parts.next().and_then(|p| p.parse::<i32>().ok());
    let month = parts.next().and_then(|p| p.parse::<i32>().ok());
    match (year, month) {
        (Some(y), Some(m)) if (1..=12).contains(&m) && y > 0 => (y, m),
        _ => (0, 0),
    }
}

fn digest_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for a POS sale line. Derived from the source system's own identifier
/// fields, never record content: near-duplicate events with the same
/// transaction + line identifiers collapse to one key on purpose.
pub fn sale_idempotency_key(
    owner_scope: &str,
    transaction_id: &str,
    line_item_id: &str,
    business_date: &str,
) -> String {
    digest_key(&[owner_scope, transaction_id, line_item_id, business_date])
}

pub fn ledger_idempotency_key(
    owner_scope: &str,
    entry_id: &str,
    account_code: &str,
    entry_date: &str,
) -> String {
    digest_key(&[owner_scope, entry_id, account_code, entry_date])
}

// ---------------------------------------------------------------------------
// Feed adapters
// ---------------------------------------------------------------------------

pub trait FeedAdapter: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Path of the paginated listing endpoint, joined onto the API base URL.
    fn endpoint_path(&self) -> &'static str;

    /// Parse one captured page body into normalized records. Pure; an
    /// envelope without the expected list field yields an empty batch.
    fn parse(&self, owner_scope: &str, body: &JsonValue) -> RecordBatch;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PosSalesFeed;

impl FeedAdapter for PosSalesFeed {
    fn source_type(&self) -> SourceType {
        SourceType::PosSales
    }

    fn endpoint_path(&self) -> &'static str {
        "/api/v1/sales/lines"
    }

    fn parse(&self, owner_scope: &str, body: &JsonValue) -> RecordBatch {
        let Some(items) = envelope_items(body) else {
            return RecordBatch::Sales(Vec::new());
        };
        let records = items
            .iter()
            .map(|item| sale_from_item(owner_scope, item))
            .collect();
        RecordBatch::Sales(records)
    }
}

fn field<'a>(item: &'a JsonValue, primary: &str, fallback: &str) -> Option<&'a JsonValue> {
    item.get(primary).or_else(|| item.get(fallback))
}

fn sale_from_item(owner_scope: &str, item: &JsonValue) -> SaleRecord {
    let transaction_id = coerce_text(field(item, "transactionId", "transaction_id"));
    let line_item_id = coerce_text(field(item, "lineItemId", "line_item_id"));
    let business_date = coerce_date(field(item, "businessDate", "date"));
    let idempotency_key =
        sale_idempotency_key(owner_scope, &transaction_id, &line_item_id, &business_date);

    SaleRecord {
        owner_scope: owner_scope.to_string(),
        idempotency_key,
        transaction_id,
        line_item_id,
        business_date,
        item_name: coerce_text(field(item, "itemName", "name")),
        category: coerce_text(field(item, "category", "group")),
        quantity: coerce_decimal(field(item, "quantity", "qty")),
        unit_price: coerce_decimal(field(item, "unitPrice", "price")),
        gross_amount: coerce_decimal(field(item, "grossAmount", "amount")),
        discount_amount: coerce_decimal(field(item, "discountAmount", "discount")),
        tax_amount: coerce_decimal(field(item, "taxAmount", "tax")),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerEntriesFeed;

impl FeedAdapter for LedgerEntriesFeed {
    fn source_type(&self) -> SourceType {
        SourceType::LedgerEntries
    }

    fn endpoint_path(&self) -> &'static str {
        "/api/v1/ledger/entries"
    }

    fn parse(&self, owner_scope: &str, body: &JsonValue) -> RecordBatch {
        let Some(items) = envelope_items(body) else {
            return RecordBatch::Ledger(Vec::new());
        };
        let records = items
            .iter()
            .map(|item| ledger_from_item(owner_scope, item))
            .collect();
        RecordBatch::Ledger(records)
    }
}

fn ledger_from_item(owner_scope: &str, item: &JsonValue) -> LedgerRecord {
    let entry_id = coerce_text(field(item, "entryId", "id"));
    let account_code = coerce_text(field(item, "accountCode", "account"));
    let entry_date = coerce_date(field(item, "entryDate", "date"));
    let idempotency_key =
        ledger_idempotency_key(owner_scope, &entry_id, &account_code, &entry_date);

    // Period may arrive as a composite "YYYY-MM" field; otherwise the
    // entry date's year-month prefix stands in.
    let (fiscal_year, fiscal_month) = match field(item, "period", "fiscalPeriod") {
        Some(period) => split_period(Some(period)),
        None => split_period_str(entry_date.get(..7).unwrap_or_default()),
    };

    let side = match coerce_text(field(item, "side", "direction")).to_ascii_lowercase().as_str() {
        "credit" | "cr" => "credit".to_string(),
        _ => "debit".to_string(),
    };

    LedgerRecord {
        owner_scope: owner_scope.to_string(),
        idempotency_key,
        entry_id,
        account_code,
        entry_date,
        fiscal_year,
        fiscal_month,
        amount: coerce_decimal(field(item, "amount", "value")),
        side,
        memo: coerce_text(field(item, "memo", "description")),
        counterparty: coerce_text(field(item, "counterparty", "vendor")),
    }
}

pub fn adapter_for_source(source_type: SourceType) -> Box<dyn FeedAdapter> {
    match source_type {
        SourceType::PosSales => Box::new(PosSalesFeed),
        SourceType::LedgerEntries => Box::new(LedgerEntriesFeed),
    }
}

/// Transform one raw payload into normalized records. Pure, deterministic,
/// and total: malformed fields are defaulted, a bad envelope yields an empty
/// batch, and re-parsing the same body produces identical idempotency keys.
pub fn parse_payload(raw: &RawPayload) -> RecordBatch {
    adapter_for_source(raw.source_type).parse(&raw.owner_scope, &raw.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    struct FixedPages {
        pages: Vec<JsonValue>,
    }

    #[async_trait]
    impl PageSource for FixedPages {
        async fn fetch_page(&self, skip: usize, top: usize) -> Result<JsonValue, FeedError> {
            let index = skip / top;
            Ok(self
                .pages
                .get(index)
                .cloned()
                .unwrap_or_else(|| json!({ "items": [] })))
        }
    }

    fn page_of(count: usize) -> JsonValue {
        let items: Vec<JsonValue> = (0..count).map(|i| json!({ "n": i })).collect();
        json!({ "items": items })
    }

    #[tokio::test]
    async fn pagination_terminates_on_short_page() {
        let source = FixedPages {
            pages: vec![page_of(100), page_of(100), page_of(100), page_of(37)],
        };
        let fetched = fetch_all_pages(&source, 100, Duration::ZERO).await;
        assert!(fetched.error.is_none());
        assert_eq!(fetched.pages.len(), 4);
        assert_eq!(fetched.item_count(), 337);
    }

    #[tokio::test]
    async fn pagination_handles_empty_first_page() {
        let source = FixedPages { pages: vec![] };
        let fetched = fetch_all_pages(&source, 100, Duration::ZERO).await;
        assert!(fetched.error.is_none());
        assert!(fetched.pages.is_empty());
    }

    #[tokio::test]
    async fn pagination_stops_at_exact_boundary_with_one_extra_request() {
        let source = FixedPages {
            pages: vec![page_of(50), page_of(50)],
        };
        let fetched = fetch_all_pages(&source, 50, Duration::ZERO).await;
        assert_eq!(fetched.pages.len(), 2);
        assert_eq!(fetched.item_count(), 100);
    }

    struct FailAfter {
        good_pages: usize,
    }

    #[async_trait]
    impl PageSource for FailAfter {
        async fn fetch_page(&self, skip: usize, top: usize) -> Result<JsonValue, FeedError> {
            if skip / top < self.good_pages {
                Ok(page_of(top))
            } else {
                Err(FeedError::Message("boom".into()))
            }
        }
    }

    #[tokio::test]
    async fn transport_failure_preserves_already_fetched_pages() {
        let source = FailAfter { good_pages: 2 };
        let fetched = fetch_all_pages(&source, 10, Duration::ZERO).await;
        assert!(fetched.error.is_some());
        assert_eq!(fetched.pages.len(), 2);
        assert_eq!(fetched.item_count(), 20);
    }

    #[test]
    fn decimal_coercion_handles_both_locales_and_defaults() {
        assert_eq!(coerce_decimal(Some(&json!(12.5))), 12.5);
        assert_eq!(coerce_decimal(Some(&json!("1234.56"))), 1234.56);
        assert_eq!(coerce_decimal(Some(&json!("1,234.56"))), 1234.56);
        assert_eq!(coerce_decimal(Some(&json!("1.234,56"))), 1234.56);
        assert_eq!(coerce_decimal(Some(&json!("$ 99,90"))), 99.90);
        assert_eq!(coerce_decimal(Some(&json!("1.234.567"))), 1_234_567.0);
        assert_eq!(coerce_decimal(Some(&json!("not a number"))), 0.0);
        assert_eq!(coerce_decimal(Some(&json!(null))), 0.0);
        assert_eq!(coerce_decimal(None), 0.0);
    }

    #[test]
    fn date_coercion_normalizes_known_formats() {
        assert_eq!(coerce_date(Some(&json!("2026-03-05"))), "2026-03-05");
        assert_eq!(coerce_date(Some(&json!("2026/03/05"))), "2026-03-05");
        assert_eq!(coerce_date(Some(&json!("05.03.2026"))), "2026-03-05");
        assert_eq!(
            coerce_date(Some(&json!("2026-03-05T14:30:00Z"))),
            "2026-03-05"
        );
        assert_eq!(coerce_date(Some(&json!("garbage"))), "");
        assert_eq!(coerce_date(None), "");
    }

    #[test]
    fn period_split_validates_month() {
        assert_eq!(split_period(Some(&json!("2025-08"))), (2025, 8));
        assert_eq!(split_period(Some(&json!("2025/12"))), (2025, 12));
        assert_eq!(split_period(Some(&json!("2025-13"))), (0, 0));
        assert_eq!(split_period(Some(&json!("08-2025"))), (0, 0));
        assert_eq!(split_period(None), (0, 0));
    }

    fn raw(source_type: SourceType, body: JsonValue) -> RawPayload {
        RawPayload {
            id: Uuid::new_v4(),
            source_type,
            owner_scope: "org-7".into(),
            body,
            record_count_hint: 0,
            processed: false,
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn missing_envelope_list_parses_to_empty_batch() {
        let payload = raw(SourceType::PosSales, json!({ "unexpected": true }));
        let batch = parse_payload(&payload);
        assert!(batch.is_empty());

        let payload = raw(SourceType::LedgerEntries, json!("not even an object"));
        assert!(parse_payload(&payload).is_empty());
    }

    #[test]
    fn malformed_fields_are_defaulted_not_dropped() {
        let payload = raw(
            SourceType::PosSales,
            json!({
                "items": [
                    { "transactionId": "t1", "lineItemId": "1", "businessDate": "2026-03-01",
                      "itemName": "Espresso", "quantity": 2, "unitPrice": "3.50", "grossAmount": "7.00" },
                    { "transactionId": "t1", "lineItemId": "2", "businessDate": "2026-03-01",
                      "itemName": "Croissant", "quantity": 1, "unitPrice": "2,80", "grossAmount": "2,80" },
                    { "transactionId": "t2", "lineItemId": "1", "businessDate": "2026-03-01",
                      "itemName": "Latte", "quantity": "broken" }
                ]
            }),
        );
        let RecordBatch::Sales(records) = parse_payload(&payload) else {
            panic!("expected a sales batch");
        };
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].unit_price, 2.80);
        assert_eq!(records[2].quantity, 0.0);
        assert_eq!(records[2].gross_amount, 0.0);
        assert_eq!(records[2].item_name, "Latte");
    }

    #[test]
    fn parse_is_deterministic_across_reparses() {
        let payload = raw(
            SourceType::LedgerEntries,
            json!({
                "list": [
                    { "entryId": "e1", "accountCode": "4000", "entryDate": "2026-02-28",
                      "period": "2026-02", "amount": "150,00", "side": "CR", "memo": "rent" }
                ]
            }),
        );
        let first = parse_payload(&payload);
        let second = parse_payload(&payload);
        assert_eq!(first, second);

        let RecordBatch::Ledger(records) = first else {
            panic!("expected a ledger batch");
        };
        assert_eq!(records[0].side, "credit");
        assert_eq!(records[0].fiscal_year, 2026);
        assert_eq!(records[0].fiscal_month, 2);
        assert_eq!(records[0].amount, 150.0);
    }

    #[test]
    fn near_duplicates_with_same_identifiers_share_a_key() {
        let a = sale_from_item(
            "org-7",
            &json!({ "transactionId": "t9", "lineItemId": "3", "businessDate": "2026-01-15",
                     "itemName": "Tea", "grossAmount": 2.0 }),
        );
        let b = sale_from_item(
            "org-7",
            &json!({ "transactionId": "t9", "lineItemId": "3", "businessDate": "2026-01-15",
                     "itemName": "Tea (edited comment)", "grossAmount": 2.0 }),
        );
        assert_eq!(a.idempotency_key, b.idempotency_key);

        let other_owner = sale_from_item(
            "org-8",
            &json!({ "transactionId": "t9", "lineItemId": "3", "businessDate": "2026-01-15" }),
        );
        assert_ne!(a.idempotency_key, other_owner.idempotency_key);
    }

    #[test]
    fn both_envelope_keys_are_tolerated() {
        let with_items = raw(
            SourceType::LedgerEntries,
            json!({ "items": [ { "entryId": "e1", "accountCode": "1", "entryDate": "2026-01-01" } ] }),
        );
        let with_list = raw(
            SourceType::PosSales,
            json!({ "list": [ { "transactionId": "t1", "lineItemId": "1", "businessDate": "2026-01-01" } ] }),
        );
        assert_eq!(parse_payload(&with_items).len(), 1);
        assert_eq!(parse_payload(&with_list).len(), 1);
    }
}
