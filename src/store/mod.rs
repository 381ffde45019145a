//! Persistence seam for the closing engine.
//!
//! The engine talks to two stores: a [`PersistentStore`] holding closings,
//! readings, sessions, receipts and the read-only catalogs, and a
//! [`ScratchStore`] (plain key → blob) for drafts. Adapters:
//!
//! - [`crate::db::DbState`]: local SQLite, supports atomic units
//! - [`remote::RemoteStore`]: PostgREST over HTTP, no units
//! - [`memory::MemoryStore`] / [`memory::MemoryScratch`]: in-process

pub mod memory;
pub mod remote;
pub mod sqlite;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Closing records
// ---------------------------------------------------------------------------

/// Natural key of a closing; also its idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingKey {
    pub date: NaiveDate,
    pub shift_id: i64,
    pub location_id: i64,
}

impl ClosingKey {
    pub fn new(date: NaiveDate, shift_id: i64, location_id: i64) -> Self {
        Self {
            date,
            shift_id,
            location_id,
        }
    }

    pub fn idempotency_key(&self) -> String {
        format!(
            "closing:{}:{}:{}",
            self.date.format("%Y-%m-%d"),
            self.shift_id,
            self.location_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosingStatus {
    #[serde(rename = "RASCUNHO")]
    Draft,
    #[serde(rename = "FECHADO")]
    Closed,
}

impl ClosingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosingStatus::Draft => "RASCUNHO",
            ClosingStatus::Closed => "FECHADO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RASCUNHO" => Some(ClosingStatus::Draft),
            "FECHADO" => Some(ClosingStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingRecord {
    pub id: i64,
    pub date: NaiveDate,
    pub shift_id: i64,
    pub location_id: i64,
    pub status: ClosingStatus,
    pub total_sales: Decimal,
    pub total_collected: Decimal,
    pub difference: Decimal,
    pub observations: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Bumped on every update; used for optimistic concurrency.
    pub version: i64,
}

impl ClosingRecord {
    pub fn key(&self) -> ClosingKey {
        ClosingKey::new(self.date, self.shift_id, self.location_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClosing {
    pub key: ClosingKey,
    pub status: ClosingStatus,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingUpdate {
    pub status: ClosingStatus,
    pub total_sales: Decimal,
    pub total_collected: Decimal,
    pub difference: Decimal,
    pub observations: Option<String>,
    /// When set, the update only applies if the stored version matches.
    pub expected_version: Option<i64>,
}

// ---------------------------------------------------------------------------
// Child rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReading {
    pub nozzle_id: i64,
    pub date: NaiveDate,
    pub shift_id: i64,
    pub location_id: i64,
    pub initial_reading: Decimal,
    pub final_reading: Decimal,
    pub fuel_id: i64,
    pub unit_price: Decimal,
    pub actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingRecord {
    pub id: i64,
    pub nozzle_id: i64,
    pub date: NaiveDate,
    pub shift_id: Option<i64>,
    pub location_id: i64,
    pub initial_reading: Decimal,
    pub final_reading: Decimal,
    pub fuel_id: i64,
    pub unit_price: Decimal,
    pub actor_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAttendantSession {
    pub closing_id: i64,
    pub location_id: i64,
    pub attendant_id: i64,
    pub cash: Decimal,
    pub instant_transfer: Decimal,
    pub debit_card: Decimal,
    pub credit_card: Decimal,
    pub credit_note: Decimal,
    pub voucher: Decimal,
    pub card_total: Decimal,
    pub metered_amount: Decimal,
    pub difference: Decimal,
    pub verified_amount: Decimal,
    pub products_amount: Decimal,
    pub observations: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: i64,
    #[serde(flatten)]
    pub row: NewAttendantSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReceipt {
    pub closing_id: i64,
    pub payment_method_id: i64,
    pub amount: Decimal,
    pub observations: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    pub id: i64,
    pub closing_id: i64,
    pub payment_method_id: i64,
    pub amount: Decimal,
    pub observations: Option<String>,
}

// ---------------------------------------------------------------------------
// Catalogs (read-only here)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethod {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub fee_percent: Decimal,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendant {
    pub id: i64,
    pub name: String,
    pub active: bool,
}

/// A nozzle joined with its fuel and current price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NozzleDetail {
    pub id: i64,
    pub number: i64,
    pub location_id: i64,
    pub fuel_id: i64,
    pub fuel_name: String,
    pub fuel_code: String,
    pub unit_price: Decimal,
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// Durable storage for closings and their child rows.
///
/// Stores that can group several calls into one atomic unit return `true`
/// from [`PersistentStore::begin_unit`]; the default is no unit support, in
/// which case every call commits on its own.
#[allow(async_fn_in_trait)]
pub trait PersistentStore {
    async fn find_closing(&self, key: &ClosingKey) -> StoreResult<Option<ClosingRecord>>;
    async fn create_closing(&self, fields: &NewClosing) -> StoreResult<ClosingRecord>;
    async fn update_closing(&self, id: i64, fields: &ClosingUpdate) -> StoreResult<ClosingRecord>;

    async fn delete_readings(&self, key: &ClosingKey) -> StoreResult<u64>;
    async fn bulk_create_readings(&self, rows: &[NewReading]) -> StoreResult<u64>;
    async fn find_last_reading(
        &self,
        nozzle_id: i64,
        location_id: i64,
    ) -> StoreResult<Option<ReadingRecord>>;
    async fn find_readings(
        &self,
        date: NaiveDate,
        shift_id: Option<i64>,
        location_id: i64,
    ) -> StoreResult<Vec<ReadingRecord>>;

    async fn find_attendant_sessions(&self, closing_id: i64) -> StoreResult<Vec<SessionRecord>>;
    async fn delete_attendant_sessions(&self, closing_id: i64) -> StoreResult<u64>;
    async fn bulk_create_attendant_sessions(
        &self,
        rows: &[NewAttendantSession],
    ) -> StoreResult<u64>;

    async fn find_receipts(&self, closing_id: i64) -> StoreResult<Vec<ReceiptRecord>>;
    async fn delete_receipts(&self, closing_id: i64) -> StoreResult<u64>;
    async fn bulk_create_receipts(&self, rows: &[NewReceipt]) -> StoreResult<u64>;

    async fn list_active_payment_methods(&self, location_id: i64) -> StoreResult<Vec<PaymentMethod>>;
    async fn list_active_attendants(&self, location_id: i64) -> StoreResult<Vec<Attendant>>;
    async fn list_nozzles_with_fuel_and_price(
        &self,
        location_id: i64,
    ) -> StoreResult<Vec<NozzleDetail>>;

    async fn begin_unit(&self) -> StoreResult<bool> {
        Ok(false)
    }

    async fn commit_unit(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn rollback_unit(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Key → blob storage for drafts. Single writer per key.
pub trait ScratchStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
}

impl<T: ScratchStore + ?Sized> ScratchStore for &T {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        (**self).remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_format() {
        let key = ClosingKey::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(), 2, 7);
        assert_eq!(key.idempotency_key(), "closing:2025-01-10:2:7");
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(ClosingStatus::Closed).unwrap(), "FECHADO");
        assert_eq!(ClosingStatus::parse("RASCUNHO"), Some(ClosingStatus::Draft));
        assert_eq!(ClosingStatus::parse("OPEN"), None);
    }
}
