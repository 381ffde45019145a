//! SQLite-backed store over [`DbState`].
//!
//! Calls are synchronous under the hood; the async signatures only satisfy
//! the [`PersistentStore`] seam. Each bulk insert runs inside a savepoint so
//! a batch lands entirely or not at all, and the whole submission can be
//! wrapped in one `BEGIN IMMEDIATE` unit.

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::prelude::*;
use tracing::debug;

use crate::db::{self, DbState};
use crate::store::{
    Attendant, ClosingKey, ClosingRecord, ClosingStatus, ClosingUpdate, NewAttendantSession,
    NewClosing, NewReading, NewReceipt, NozzleDetail, PaymentMethod, PersistentStore,
    ReadingRecord, ReceiptRecord, ScratchStore, SessionRecord, StoreError, StoreResult,
};

/// `local_settings` category holding drafts.
const DRAFT_CATEGORY: &str = "draft";

const CLOSING_COLUMNS: &str = "id, date, shift_id, location_id, status, total_sales, \
     total_collected, difference, observations, created_by, created_at, updated_at, version";

const READING_COLUMNS: &str = "id, nozzle_id, date, shift_id, location_id, initial_reading, \
     final_reading, fuel_id, unit_price, actor_id";

const SESSION_COLUMNS: &str = "id, closing_id, location_id, attendant_id, cash, instant_transfer, \
     debit_card, credit_card, credit_note, voucher, card_total, metered_amount, difference, \
     verified_amount, products_amount, observations";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(text.trim())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_closing(row: &Row<'_>) -> rusqlite::Result<ClosingRecord> {
    let status: String = row.get(4)?;
    let status = ClosingStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown closing status {status}").into(),
        )
    })?;
    Ok(ClosingRecord {
        id: row.get(0)?,
        date: date_col(row, 1)?,
        shift_id: row.get(2)?,
        location_id: row.get(3)?,
        status,
        total_sales: dec_col(row, 5)?,
        total_collected: dec_col(row, 6)?,
        difference: dec_col(row, 7)?,
        observations: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        version: row.get(12)?,
    })
}

fn map_reading(row: &Row<'_>) -> rusqlite::Result<ReadingRecord> {
    Ok(ReadingRecord {
        id: row.get(0)?,
        nozzle_id: row.get(1)?,
        date: date_col(row, 2)?,
        shift_id: row.get(3)?,
        location_id: row.get(4)?,
        initial_reading: dec_col(row, 5)?,
        final_reading: dec_col(row, 6)?,
        fuel_id: row.get(7)?,
        unit_price: dec_col(row, 8)?,
        actor_id: row.get(9)?,
    })
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        row: NewAttendantSession {
            closing_id: row.get(1)?,
            location_id: row.get(2)?,
            attendant_id: row.get(3)?,
            cash: dec_col(row, 4)?,
            instant_transfer: dec_col(row, 5)?,
            debit_card: dec_col(row, 6)?,
            credit_card: dec_col(row, 7)?,
            credit_note: dec_col(row, 8)?,
            voucher: dec_col(row, 9)?,
            card_total: dec_col(row, 10)?,
            metered_amount: dec_col(row, 11)?,
            difference: dec_col(row, 12)?,
            verified_amount: dec_col(row, 13)?,
            products_amount: dec_col(row, 14)?,
            observations: row.get(15)?,
        },
    })
}

fn map_receipt(row: &Row<'_>) -> rusqlite::Result<ReceiptRecord> {
    Ok(ReceiptRecord {
        id: row.get(0)?,
        closing_id: row.get(1)?,
        payment_method_id: row.get(2)?,
        amount: dec_col(row, 3)?,
        observations: row.get(4)?,
    })
}

impl DbState {
    fn store_conn(&self) -> StoreResult<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.lock().map_err(StoreError::Database)
    }

    fn closing_by_id(conn: &rusqlite::Connection, id: i64) -> StoreResult<Option<ClosingRecord>> {
        Ok(conn
            .query_row(
                &format!("SELECT {CLOSING_COLUMNS} FROM closings WHERE id = ?1"),
                params![id],
                map_closing,
            )
            .optional()?)
    }
}

// ---------------------------------------------------------------------------
// PersistentStore
// ---------------------------------------------------------------------------

impl PersistentStore for DbState {
    async fn find_closing(&self, key: &ClosingKey) -> StoreResult<Option<ClosingRecord>> {
        let conn = self.store_conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {CLOSING_COLUMNS} FROM closings
                     WHERE date = ?1 AND shift_id = ?2 AND location_id = ?3
                     ORDER BY id DESC LIMIT 1"
                ),
                params![fmt_date(key.date), key.shift_id, key.location_id],
                map_closing,
            )
            .optional()?)
    }

    async fn create_closing(&self, fields: &NewClosing) -> StoreResult<ClosingRecord> {
        let conn = self.store_conn()?;
        conn.execute(
            "INSERT INTO closings (date, shift_id, location_id, status, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fmt_date(fields.key.date),
                fields.key.shift_id,
                fields.key.location_id,
                fields.status.as_str(),
                fields.created_by,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(closing_id = id, "closing created");
        Self::closing_by_id(&conn, id)?.ok_or(StoreError::NotFound {
            entity: "closing",
            id: id.to_string(),
        })
    }

    async fn update_closing(&self, id: i64, fields: &ClosingUpdate) -> StoreResult<ClosingRecord> {
        let conn = self.store_conn()?;
        let changed = conn.execute(
            "UPDATE closings SET
                status = ?1,
                total_sales = ?2,
                total_collected = ?3,
                difference = ?4,
                observations = ?5,
                updated_at = datetime('now'),
                version = version + 1
             WHERE id = ?6 AND (?7 IS NULL OR version = ?7)",
            params![
                fields.status.as_str(),
                fields.total_sales.to_string(),
                fields.total_collected.to_string(),
                fields.difference.to_string(),
                fields.observations,
                id,
                fields.expected_version,
            ],
        )?;

        if changed == 0 {
            let current: Option<i64> = conn
                .query_row(
                    "SELECT version FROM closings WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match (current, fields.expected_version) {
                (Some(found), Some(expected)) => StoreError::VersionConflict {
                    closing_id: id,
                    expected,
                    found: Some(found),
                },
                _ => StoreError::NotFound {
                    entity: "closing",
                    id: id.to_string(),
                },
            });
        }

        Self::closing_by_id(&conn, id)?.ok_or(StoreError::NotFound {
            entity: "closing",
            id: id.to_string(),
        })
    }

    async fn delete_readings(&self, key: &ClosingKey) -> StoreResult<u64> {
        let conn = self.store_conn()?;
        let n = conn.execute(
            "DELETE FROM nozzle_readings WHERE date = ?1 AND shift_id = ?2 AND location_id = ?3",
            params![fmt_date(key.date), key.shift_id, key.location_id],
        )?;
        Ok(n as u64)
    }

    async fn bulk_create_readings(&self, rows: &[NewReading]) -> StoreResult<u64> {
        let mut conn = self.store_conn()?;
        let sp = conn.savepoint()?;
        {
            let mut stmt = sp.prepare(
                "INSERT INTO nozzle_readings
                    (nozzle_id, date, shift_id, location_id, initial_reading, final_reading,
                     fuel_id, unit_price, actor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.nozzle_id,
                    fmt_date(r.date),
                    r.shift_id,
                    r.location_id,
                    r.initial_reading.to_string(),
                    r.final_reading.to_string(),
                    r.fuel_id,
                    r.unit_price.to_string(),
                    r.actor_id,
                ])?;
            }
        }
        sp.commit()?;
        Ok(rows.len() as u64)
    }

    async fn find_last_reading(
        &self,
        nozzle_id: i64,
        location_id: i64,
    ) -> StoreResult<Option<ReadingRecord>> {
        let conn = self.store_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {READING_COLUMNS} FROM nozzle_readings
             WHERE nozzle_id = ?1 AND location_id = ?2
             ORDER BY date DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![nozzle_id, location_id], map_reading)?;
        for row in rows {
            let reading = row?;
            // Only a valid reading can seed the next opening value.
            if reading.final_reading > reading.initial_reading && !reading.final_reading.is_zero() {
                return Ok(Some(reading));
            }
        }
        Ok(None)
    }

    async fn find_readings(
        &self,
        date: NaiveDate,
        shift_id: Option<i64>,
        location_id: i64,
    ) -> StoreResult<Vec<ReadingRecord>> {
        let conn = self.store_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {READING_COLUMNS} FROM nozzle_readings
             WHERE date = ?1 AND location_id = ?2 AND (?3 IS NULL OR shift_id = ?3)
             ORDER BY nozzle_id, id"
        ))?;
        let rows = stmt
            .query_map(params![fmt_date(date), location_id, shift_id], map_reading)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn find_attendant_sessions(&self, closing_id: i64) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.store_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM attendant_sessions WHERE closing_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![closing_id], map_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn delete_attendant_sessions(&self, closing_id: i64) -> StoreResult<u64> {
        let conn = self.store_conn()?;
        let n = conn.execute(
            "DELETE FROM attendant_sessions WHERE closing_id = ?1",
            params![closing_id],
        )?;
        Ok(n as u64)
    }

    async fn bulk_create_attendant_sessions(
        &self,
        rows: &[NewAttendantSession],
    ) -> StoreResult<u64> {
        let mut conn = self.store_conn()?;
        let sp = conn.savepoint()?;
        {
            let mut stmt = sp.prepare(
                "INSERT INTO attendant_sessions
                    (closing_id, location_id, attendant_id, cash, instant_transfer, debit_card,
                     credit_card, credit_note, voucher, card_total, metered_amount, difference,
                     verified_amount, products_amount, observations)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            for s in rows {
                stmt.execute(params![
                    s.closing_id,
                    s.location_id,
                    s.attendant_id,
                    s.cash.to_string(),
                    s.instant_transfer.to_string(),
                    s.debit_card.to_string(),
                    s.credit_card.to_string(),
                    s.credit_note.to_string(),
                    s.voucher.to_string(),
                    s.card_total.to_string(),
                    s.metered_amount.to_string(),
                    s.difference.to_string(),
                    s.verified_amount.to_string(),
                    s.products_amount.to_string(),
                    s.observations,
                ])?;
            }
        }
        sp.commit()?;
        Ok(rows.len() as u64)
    }

    async fn find_receipts(&self, closing_id: i64) -> StoreResult<Vec<ReceiptRecord>> {
        let conn = self.store_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, closing_id, payment_method_id, amount, observations
             FROM receipts WHERE closing_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![closing_id], map_receipt)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn delete_receipts(&self, closing_id: i64) -> StoreResult<u64> {
        let conn = self.store_conn()?;
        let n = conn.execute(
            "DELETE FROM receipts WHERE closing_id = ?1",
            params![closing_id],
        )?;
        Ok(n as u64)
    }

    async fn bulk_create_receipts(&self, rows: &[NewReceipt]) -> StoreResult<u64> {
        let mut conn = self.store_conn()?;
        let sp = conn.savepoint()?;
        {
            let mut stmt = sp.prepare(
                "INSERT INTO receipts (closing_id, payment_method_id, amount, observations)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.closing_id,
                    r.payment_method_id,
                    r.amount.to_string(),
                    r.observations,
                ])?;
            }
        }
        sp.commit()?;
        Ok(rows.len() as u64)
    }

    async fn list_active_payment_methods(&self, location_id: i64) -> StoreResult<Vec<PaymentMethod>> {
        let conn = self.store_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, fee_percent, active FROM payment_methods
             WHERE location_id = ?1 AND active = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![location_id], |row| {
                Ok(PaymentMethod {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    kind: row.get(2)?,
                    fee_percent: dec_col(row, 3)?,
                    active: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn list_active_attendants(&self, location_id: i64) -> StoreResult<Vec<Attendant>> {
        let conn = self.store_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, active FROM attendants
             WHERE location_id = ?1 AND active = 1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![location_id], |row| {
                Ok(Attendant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    active: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn list_nozzles_with_fuel_and_price(
        &self,
        location_id: i64,
    ) -> StoreResult<Vec<NozzleDetail>> {
        let conn = self.store_conn()?;
        let mut stmt = conn.prepare(
            "SELECT n.id, n.number, n.location_id, f.id, f.name, f.code, f.unit_price
             FROM nozzles n
             JOIN fuels f ON f.id = n.fuel_id
             WHERE n.location_id = ?1 AND n.active = 1
             ORDER BY n.number",
        )?;
        let rows = stmt
            .query_map(params![location_id], |row| {
                Ok(NozzleDetail {
                    id: row.get(0)?,
                    number: row.get(1)?,
                    location_id: row.get(2)?,
                    fuel_id: row.get(3)?,
                    fuel_name: row.get(4)?,
                    fuel_code: row.get(5)?,
                    unit_price: dec_col(row, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn begin_unit(&self) -> StoreResult<bool> {
        let conn = self.store_conn()?;
        if !conn.is_autocommit() {
            return Err(StoreError::Database(
                "a unit of work is already open on this connection".into(),
            ));
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(true)
    }

    async fn commit_unit(&self) -> StoreResult<()> {
        let conn = self.store_conn()?;
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback_unit(&self) -> StoreResult<()> {
        let conn = self.store_conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScratchStore
// ---------------------------------------------------------------------------

impl ScratchStore for DbState {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.store_conn()?;
        db::get_setting(&conn, DRAFT_CATEGORY, key).map_err(StoreError::Database)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.store_conn()?;
        db::set_setting(&conn, DRAFT_CATEGORY, key, value).map_err(StoreError::Database)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let conn = self.store_conn()?;
        db::delete_setting(&conn, DRAFT_CATEGORY, key).map_err(StoreError::Database)
    }
}
