//! Core domain model for tillsync: raw capture payloads, normalized
//! records, and sync-run audit types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tillsync-core";

/// External feed that produced a raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    PosSales,
    LedgerEntries,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::PosSales => "pos_sales",
            SourceType::LedgerEntries => "ledger_entries",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pos_sales" | "pos-sales" => Some(SourceType::PosSales),
            "ledger_entries" | "ledger-entries" => Some(SourceType::LedgerEntries),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbatim capture of one page (or one manual submission) from an external
/// feed. `body` is immutable once written; only the processed flag and its
/// timestamp ever change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub id: Uuid,
    pub source_type: SourceType,
    pub owner_scope: String,
    pub body: serde_json::Value,
    pub record_count_hint: i32,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One normalized point-of-sale line item.
///
/// `idempotency_key` is derived from the identifier fields (owner scope,
/// transaction id, line item id, business date), never from record content,
/// and is the upsert conflict target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub owner_scope: String,
    pub idempotency_key: String,
    pub transaction_id: String,
    pub line_item_id: String,
    pub business_date: String,
    pub item_name: String,
    pub category: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub gross_amount: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
}

/// One normalized accounting-ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub owner_scope: String,
    pub idempotency_key: String,
    pub entry_id: String,
    pub account_code: String,
    pub entry_date: String,
    pub fiscal_year: i32,
    pub fiscal_month: i32,
    pub amount: f64,
    pub side: String,
    pub memo: String,
    pub counterparty: String,
}

/// Homogeneous output of parsing one raw payload. A payload always yields
/// records of a single type because a payload comes from a single feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordBatch {
    Sales(Vec<SaleRecord>),
    Ledger(Vec<LedgerRecord>),
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Sales(records) => records.len(),
            RecordBatch::Ledger(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            RecordBatch::Sales(_) => SourceType::PosSales,
            RecordBatch::Ledger(_) => SourceType::LedgerEntries,
        }
    }
}

/// Terminal disposition of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// Append-only audit row for one capture or sweep run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub source_type: SourceType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages_fetched: i32,
    pub records_fetched: i32,
    pub inserted: i32,
    pub errors: i32,
    pub status: RunStatus,
}

impl SyncRun {
    pub fn begin(source_type: SourceType) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_type,
            started_at: Utc::now(),
            finished_at: None,
            pages_fetched: 0,
            records_fetched: 0,
            inserted: 0,
            errors: 0,
            status: RunStatus::Running,
        }
    }

    /// Close the run; status reflects whether anything failed along the way.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.status = if self.errors == 0 {
            RunStatus::Success
        } else if self.inserted > 0 || self.records_fetched > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips_through_str() {
        for st in [SourceType::PosSales, SourceType::LedgerEntries] {
            assert_eq!(SourceType::parse(st.as_str()), Some(st));
        }
        assert_eq!(SourceType::parse("pos-sales"), Some(SourceType::PosSales));
        assert_eq!(SourceType::parse("unknown"), None);
    }

    #[test]
    fn run_finish_maps_error_counts_to_status() {
        let mut clean = SyncRun::begin(SourceType::PosSales);
        clean.records_fetched = 10;
        clean.inserted = 10;
        clean.finish();
        assert_eq!(clean.status, RunStatus::Success);

        let mut partial = SyncRun::begin(SourceType::PosSales);
        partial.records_fetched = 10;
        partial.inserted = 7;
        partial.errors = 1;
        partial.finish();
        assert_eq!(partial.status, RunStatus::Partial);

        let mut failed = SyncRun::begin(SourceType::LedgerEntries);
        failed.errors = 3;
        failed.finish();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.finished_at.is_some());
    }
}
