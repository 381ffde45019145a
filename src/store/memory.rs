//! In-process stores.
//!
//! `MemoryStore` records every call by operation name and can be told to
//! fail a given operation, which makes it the harness for orchestrator
//! tests. It has no unit support, so failures surface as partial writes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::store::{
    Attendant, ClosingKey, ClosingRecord, ClosingUpdate, NewAttendantSession, NewClosing,
    NewReading, NewReceipt, NozzleDetail, PaymentMethod, PersistentStore, ReadingRecord,
    ReceiptRecord, ScratchStore, SessionRecord, StoreError, StoreResult,
};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    closings: Vec<ClosingRecord>,
    readings: Vec<ReadingRecord>,
    sessions: Vec<SessionRecord>,
    receipts: Vec<ReceiptRecord>,
    payment_methods: Vec<(i64, PaymentMethod)>,
    attendants: Vec<(i64, Attendant)>,
    nozzles: Vec<NozzleDetail>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call to `operation` fail with `StoreError::Unavailable`.
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut f) = self.fail_on.lock() {
            *f = Some(operation.to_string());
        }
    }

    pub fn clear_failure(&self) {
        if let Ok(mut f) = self.fail_on.lock() {
            *f = None;
        }
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn reset_calls(&self) {
        if let Ok(mut c) = self.calls.lock() {
            c.clear();
        }
    }

    pub fn seed_payment_method(&self, location_id: i64, method: PaymentMethod) {
        if let Ok(mut s) = self.state.lock() {
            s.payment_methods.push((location_id, method));
        }
    }

    pub fn seed_attendant(&self, location_id: i64, attendant: Attendant) {
        if let Ok(mut s) = self.state.lock() {
            s.attendants.push((location_id, attendant));
        }
    }

    pub fn seed_nozzle(&self, nozzle: NozzleDetail) {
        if let Ok(mut s) = self.state.lock() {
            s.nozzles.push(nozzle);
        }
    }

    /// Insert a reading as if it had been written by an earlier closing.
    pub fn seed_reading(&self, reading: NewReading) {
        if let Ok(mut s) = self.state.lock() {
            let id = s.next_id();
            s.readings.push(reading_record(id, &reading));
        }
    }

    pub fn closings(&self) -> Vec<ClosingRecord> {
        self.state.lock().map(|s| s.closings.clone()).unwrap_or_default()
    }

    pub fn readings(&self) -> Vec<ReadingRecord> {
        self.state.lock().map(|s| s.readings.clone()).unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().map(|s| s.sessions.clone()).unwrap_or_default()
    }

    pub fn receipts(&self) -> Vec<ReceiptRecord> {
        self.state.lock().map(|s| s.receipts.clone()).unwrap_or_default()
    }

    fn enter(&self, operation: &str) -> StoreResult<MutexGuard<'_, MemoryState>> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(operation.to_string());
        }
        let failing = self
            .fail_on
            .lock()
            .map(|f| f.as_deref() == Some(operation))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Unavailable(format!("{operation} failed")));
        }
        self.state
            .lock()
            .map_err(|e| StoreError::Database(format!("memory store poisoned: {e}")))
    }
}

fn reading_record(id: i64, r: &NewReading) -> ReadingRecord {
    ReadingRecord {
        id,
        nozzle_id: r.nozzle_id,
        date: r.date,
        shift_id: Some(r.shift_id),
        location_id: r.location_id,
        initial_reading: r.initial_reading,
        final_reading: r.final_reading,
        fuel_id: r.fuel_id,
        unit_price: r.unit_price,
        actor_id: Some(r.actor_id.clone()),
    }
}

impl PersistentStore for MemoryStore {
    async fn find_closing(&self, key: &ClosingKey) -> StoreResult<Option<ClosingRecord>> {
        let s = self.enter("find_closing")?;
        Ok(s.closings.iter().rev().find(|c| c.key() == *key).cloned())
    }

    async fn create_closing(&self, fields: &NewClosing) -> StoreResult<ClosingRecord> {
        let mut s = self.enter("create_closing")?;
        if s.closings.iter().any(|c| c.key() == fields.key) {
            return Err(StoreError::Database(format!(
                "duplicate closing {}",
                fields.key.idempotency_key()
            )));
        }
        let now = Utc::now().to_rfc3339();
        let record = ClosingRecord {
            id: s.next_id(),
            date: fields.key.date,
            shift_id: fields.key.shift_id,
            location_id: fields.key.location_id,
            status: fields.status,
            total_sales: Decimal::ZERO,
            total_collected: Decimal::ZERO,
            difference: Decimal::ZERO,
            observations: None,
            created_by: Some(fields.created_by.clone()),
            created_at: now.clone(),
            updated_at: now,
            version: 1,
        };
        s.closings.push(record.clone());
        Ok(record)
    }

    async fn update_closing(&self, id: i64, fields: &ClosingUpdate) -> StoreResult<ClosingRecord> {
        let mut s = self.enter("update_closing")?;
        let record = s
            .closings
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound {
                entity: "closing",
                id: id.to_string(),
            })?;
        if let Some(expected) = fields.expected_version {
            if record.version != expected {
                return Err(StoreError::VersionConflict {
                    closing_id: id,
                    expected,
                    found: Some(record.version),
                });
            }
        }
        record.status = fields.status;
        record.total_sales = fields.total_sales;
        record.total_collected = fields.total_collected;
        record.difference = fields.difference;
        record.observations = fields.observations.clone();
        record.updated_at = Utc::now().to_rfc3339();
        record.version += 1;
        Ok(record.clone())
    }

    async fn delete_readings(&self, key: &ClosingKey) -> StoreResult<u64> {
        let mut s = self.enter("delete_readings")?;
        let before = s.readings.len();
        s.readings.retain(|r| {
            !(r.date == key.date && r.shift_id == Some(key.shift_id) && r.location_id == key.location_id)
        });
        Ok((before - s.readings.len()) as u64)
    }

    async fn bulk_create_readings(&self, rows: &[NewReading]) -> StoreResult<u64> {
        let mut s = self.enter("bulk_create_readings")?;
        for r in rows {
            let id = s.next_id();
            s.readings.push(reading_record(id, r));
        }
        Ok(rows.len() as u64)
    }

    async fn find_last_reading(
        &self,
        nozzle_id: i64,
        location_id: i64,
    ) -> StoreResult<Option<ReadingRecord>> {
        let s = self.enter("find_last_reading")?;
        let mut candidates: Vec<&ReadingRecord> = s
            .readings
            .iter()
            .filter(|r| r.nozzle_id == nozzle_id && r.location_id == location_id)
            .filter(|r| r.final_reading > r.initial_reading && !r.final_reading.is_zero())
            .collect();
        candidates.sort_by_key(|r| (r.date, r.id));
        Ok(candidates.last().map(|r| (*r).clone()))
    }

    async fn find_readings(
        &self,
        date: NaiveDate,
        shift_id: Option<i64>,
        location_id: i64,
    ) -> StoreResult<Vec<ReadingRecord>> {
        let s = self.enter("find_readings")?;
        let mut found: Vec<ReadingRecord> = s
            .readings
            .iter()
            .filter(|r| r.date == date && r.location_id == location_id)
            .filter(|r| shift_id.is_none() || r.shift_id == shift_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.nozzle_id, r.id));
        Ok(found)
    }

    async fn find_attendant_sessions(&self, closing_id: i64) -> StoreResult<Vec<SessionRecord>> {
        let s = self.enter("find_attendant_sessions")?;
        Ok(s.sessions
            .iter()
            .filter(|r| r.row.closing_id == closing_id)
            .cloned()
            .collect())
    }

    async fn delete_attendant_sessions(&self, closing_id: i64) -> StoreResult<u64> {
        let mut s = self.enter("delete_attendant_sessions")?;
        let before = s.sessions.len();
        s.sessions.retain(|r| r.row.closing_id != closing_id);
        Ok((before - s.sessions.len()) as u64)
    }

    async fn bulk_create_attendant_sessions(
        &self,
        rows: &[NewAttendantSession],
    ) -> StoreResult<u64> {
        let mut s = self.enter("bulk_create_attendant_sessions")?;
        for row in rows {
            let id = s.next_id();
            s.sessions.push(SessionRecord {
                id,
                row: row.clone(),
            });
        }
        Ok(rows.len() as u64)
    }

    async fn find_receipts(&self, closing_id: i64) -> StoreResult<Vec<ReceiptRecord>> {
        let s = self.enter("find_receipts")?;
        Ok(s.receipts
            .iter()
            .filter(|r| r.closing_id == closing_id)
            .cloned()
            .collect())
    }

    async fn delete_receipts(&self, closing_id: i64) -> StoreResult<u64> {
        let mut s = self.enter("delete_receipts")?;
        let before = s.receipts.len();
        s.receipts.retain(|r| r.closing_id != closing_id);
        Ok((before - s.receipts.len()) as u64)
    }

    async fn bulk_create_receipts(&self, rows: &[NewReceipt]) -> StoreResult<u64> {
        let mut s = self.enter("bulk_create_receipts")?;
        for row in rows {
            let id = s.next_id();
            s.receipts.push(ReceiptRecord {
                id,
                closing_id: row.closing_id,
                payment_method_id: row.payment_method_id,
                amount: row.amount,
                observations: row.observations.clone(),
            });
        }
        Ok(rows.len() as u64)
    }

    async fn list_active_payment_methods(&self, location_id: i64) -> StoreResult<Vec<PaymentMethod>> {
        let s = self.enter("list_active_payment_methods")?;
        Ok(s.payment_methods
            .iter()
            .filter(|(loc, m)| *loc == location_id && m.active)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn list_active_attendants(&self, location_id: i64) -> StoreResult<Vec<Attendant>> {
        let s = self.enter("list_active_attendants")?;
        Ok(s.attendants
            .iter()
            .filter(|(loc, a)| *loc == location_id && a.active)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn list_nozzles_with_fuel_and_price(
        &self,
        location_id: i64,
    ) -> StoreResult<Vec<NozzleDetail>> {
        let s = self.enter("list_nozzles_with_fuel_and_price")?;
        let mut nozzles: Vec<NozzleDetail> = s
            .nozzles
            .iter()
            .filter(|n| n.location_id == location_id)
            .cloned()
            .collect();
        nozzles.sort_by_key(|n| n.number);
        Ok(nozzles)
    }
}

// ---------------------------------------------------------------------------
// Scratch
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryScratch {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryScratch {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> StoreResult<MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Database(format!("scratch poisoned: {e}")))
    }
}

impl ScratchStore for MemoryScratch {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}
