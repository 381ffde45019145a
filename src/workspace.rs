//! Working state of the closing screen.
//!
//! Holds the cells exactly as the operator typed them and exposes the
//! change/blur handlers that keep them formatted. Typed views (readings,
//! totals, submission request) are derived on demand.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::attendants::{AttendantSession, SessionCategory, SessionField, SessionOrigin, SessionStatus};
use crate::closing::SubmissionRequest;
use crate::draft::{DraftSnapshot, ReadingCells};
use crate::meter::{HighVolumePolicy, NozzleReading, ReadingFlags};
use crate::payments::{self, PaymentMethodEntry};
use crate::quantity;
use crate::reconciliation::{self, ReconciliationTotals};
use crate::store::{
    Attendant, ClosingKey, NozzleDetail, PersistentStore, SessionRecord, StoreResult,
};

/// Initial reading shown for a nozzle that was never read.
const FIRST_READING: &str = "0,000";

fn money_cell(value: Decimal) -> String {
    if value.is_zero() {
        String::new()
    } else {
        quantity::format_currency(value)
    }
}

fn stored_session(record: SessionRecord) -> AttendantSession {
    let row = record.row;
    let mut session = AttendantSession::with_origin(
        format!("stored-{}", record.id),
        SessionOrigin::Stored {
            session_id: record.id,
        },
    );
    session.attendant_id = Some(row.attendant_id);
    session.cash = money_cell(row.cash);
    session.instant_transfer = money_cell(row.instant_transfer);
    session.debit_card = money_cell(row.debit_card);
    session.credit_card = money_cell(row.credit_card);
    session.credit_note = money_cell(row.credit_note);
    session.voucher = money_cell(row.voucher);
    session.metered_amount = money_cell(row.metered_amount);
    session.products_amount = money_cell(row.products_amount);
    session.observations = row.observations.unwrap_or_default();
    session.status = SessionStatus::Verified;
    session
}

#[derive(Debug, Clone)]
pub struct ClosingWorkspace {
    pub location_id: i64,
    pub date: NaiveDate,
    pub shift_id: Option<i64>,
    pub observations: String,
    nozzles: Vec<NozzleDetail>,
    cells: BTreeMap<i64, ReadingCells>,
    sessions: Vec<AttendantSession>,
    payments: Vec<PaymentMethodEntry>,
    attendants: Vec<Attendant>,
    loaded_version: Option<i64>,
    editing: bool,
    policy: HighVolumePolicy,
}

impl ClosingWorkspace {
    /// Load everything the closing screen needs for one location, date and
    /// shift.
    ///
    /// When readings were already saved for that key the workspace opens in
    /// edit mode with the saved values. Otherwise each nozzle starts from its
    /// last valid final reading and one empty session is added.
    pub async fn load<S: PersistentStore>(
        store: &S,
        location_id: i64,
        date: NaiveDate,
        shift_id: Option<i64>,
        policy: HighVolumePolicy,
    ) -> StoreResult<Self> {
        let mut nozzles = store.list_nozzles_with_fuel_and_price(location_id).await?;
        let methods = store.list_active_payment_methods(location_id).await?;
        let attendants = store.list_active_attendants(location_id).await?;
        let saved = store.find_readings(date, shift_id, location_id).await?;

        let mut workspace = Self {
            location_id,
            date,
            shift_id,
            observations: String::new(),
            nozzles: Vec::new(),
            cells: BTreeMap::new(),
            sessions: Vec::new(),
            payments: payments::entries_from_catalog(&methods),
            attendants,
            loaded_version: None,
            editing: !saved.is_empty(),
            policy,
        };

        for reading in &saved {
            match nozzles.iter_mut().find(|n| n.id == reading.nozzle_id) {
                Some(nozzle) => {
                    nozzle.fuel_id = reading.fuel_id;
                    nozzle.unit_price = reading.unit_price;
                }
                None => nozzles.push(NozzleDetail {
                    id: reading.nozzle_id,
                    number: 0,
                    location_id,
                    fuel_id: reading.fuel_id,
                    fuel_name: String::new(),
                    fuel_code: String::new(),
                    unit_price: reading.unit_price,
                }),
            }
            workspace.cells.insert(
                reading.nozzle_id,
                ReadingCells {
                    initial: quantity::format_liters(reading.initial_reading),
                    final_reading: quantity::format_liters(reading.final_reading),
                },
            );
        }

        for nozzle in &nozzles {
            if workspace.cells.contains_key(&nozzle.id) {
                continue;
            }
            let initial = store
                .find_last_reading(nozzle.id, location_id)
                .await?
                .map(|r| quantity::format_liters(r.final_reading))
                .unwrap_or_else(|| FIRST_READING.to_string());
            workspace.cells.insert(
                nozzle.id,
                ReadingCells {
                    initial,
                    final_reading: String::new(),
                },
            );
        }
        workspace.nozzles = nozzles;

        if workspace.editing {
            if let Some(shift) = shift_id {
                let key = ClosingKey::new(date, shift, location_id);
                if let Some(record) = store.find_closing(&key).await? {
                    workspace.loaded_version = Some(record.version);
                    workspace.observations = record.observations.clone().unwrap_or_default();
                    workspace.sessions = store
                        .find_attendant_sessions(record.id)
                        .await?
                        .into_iter()
                        .map(stored_session)
                        .collect();
                    let receipts = store.find_receipts(record.id).await?;
                    payments::apply_saved_receipts(&mut workspace.payments, &receipts);
                }
            }
            info!(
                location_id,
                date = %date,
                readings = saved.len(),
                version = ?workspace.loaded_version,
                "Loaded saved closing for edit"
            );
        }

        if workspace.sessions.is_empty() {
            workspace.sessions.push(AttendantSession::new_local());
        }
        Ok(workspace)
    }

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    pub fn loaded_version(&self) -> Option<i64> {
        self.loaded_version
    }

    pub fn nozzles(&self) -> &[NozzleDetail] {
        &self.nozzles
    }

    pub fn cells(&self, nozzle_id: i64) -> Option<&ReadingCells> {
        self.cells.get(&nozzle_id)
    }

    pub fn sessions(&self) -> &[AttendantSession] {
        &self.sessions
    }

    pub fn payments(&self) -> &[PaymentMethodEntry] {
        &self.payments
    }

    pub fn attendants(&self) -> &[Attendant] {
        &self.attendants
    }

    // -- readings ----------------------------------------------------------

    fn cell_mut(&mut self, nozzle_id: i64) -> &mut ReadingCells {
        self.cells.entry(nozzle_id).or_default()
    }

    pub fn change_initial(&mut self, nozzle_id: i64, raw: &str) {
        self.cell_mut(nozzle_id).initial = quantity::format_live(raw);
    }

    pub fn blur_initial(&mut self, nozzle_id: i64) {
        let cell = self.cell_mut(nozzle_id);
        cell.initial = quantity::format_canonical(&cell.initial);
    }

    pub fn change_final(&mut self, nozzle_id: i64, raw: &str) {
        self.cell_mut(nozzle_id).final_reading = quantity::format_live(raw);
    }

    pub fn blur_final(&mut self, nozzle_id: i64) {
        let cell = self.cell_mut(nozzle_id);
        cell.final_reading = quantity::format_canonical(&cell.final_reading);
    }

    /// Typed readings, one per nozzle, in nozzle order.
    pub fn readings(&self) -> Vec<NozzleReading> {
        self.nozzles
            .iter()
            .map(|n| {
                let cells = self.cells.get(&n.id).cloned().unwrap_or_default();
                NozzleReading {
                    nozzle_id: n.id,
                    date: self.date,
                    shift_id: self.shift_id,
                    initial_reading: cells.initial,
                    final_reading: cells.final_reading,
                    fuel_id: n.fuel_id,
                    unit_price: n.unit_price,
                }
            })
            .collect()
    }

    pub fn reading_flags(&self, nozzle_id: i64) -> Option<ReadingFlags> {
        self.readings()
            .into_iter()
            .find(|r| r.nozzle_id == nozzle_id)
            .map(|r| r.flags(&self.policy))
    }

    // -- payments ----------------------------------------------------------

    /// Returns `false` when the keystroke was rejected.
    pub fn change_payment(&mut self, payment_method_id: i64, raw: &str) -> bool {
        let Some(clean) = quantity::sanitize_money_keystroke(raw) else {
            return false;
        };
        match self
            .payments
            .iter_mut()
            .find(|e| e.payment_method_id == payment_method_id)
        {
            Some(entry) => {
                entry.amount = quantity::format_currency_live(&clean);
                true
            }
            None => false,
        }
    }

    pub fn blur_payment(&mut self, payment_method_id: i64) {
        if let Some(entry) = self
            .payments
            .iter_mut()
            .find(|e| e.payment_method_id == payment_method_id)
        {
            entry.amount = quantity::format_currency_blur(&entry.amount);
        }
    }

    // -- sessions ----------------------------------------------------------

    fn session_mut(&mut self, temp_id: &str) -> Option<&mut AttendantSession> {
        self.sessions.iter_mut().find(|s| s.temp_id == temp_id)
    }

    /// Returns `false` when the keystroke was rejected or the session is
    /// unknown.
    pub fn change_session_field(&mut self, temp_id: &str, field: SessionField, raw: &str) -> bool {
        let Some(clean) = quantity::sanitize_money_keystroke(raw) else {
            debug!(temp_id, "Rejected money keystroke");
            return false;
        };
        match self.session_mut(temp_id) {
            Some(session) => {
                *session.field_mut(field) = quantity::format_currency_live(&clean);
                true
            }
            None => false,
        }
    }

    pub fn blur_session_field(&mut self, temp_id: &str, field: SessionField) {
        if let Some(session) = self.session_mut(temp_id) {
            let cell = session.field_mut(field);
            *cell = quantity::format_currency_blur(cell);
        }
    }

    pub fn assign_attendant(&mut self, temp_id: &str, attendant_id: Option<i64>) -> bool {
        match self.session_mut(temp_id) {
            Some(session) => {
                session.attendant_id = attendant_id;
                true
            }
            None => false,
        }
    }

    pub fn set_session_observations(&mut self, temp_id: &str, text: &str) {
        if let Some(session) = self.session_mut(temp_id) {
            session.observations = text.to_string();
        }
    }

    /// Append an empty local session and return its key.
    pub fn add_session(&mut self) -> String {
        let session = AttendantSession::new_local();
        let temp_id = session.temp_id.clone();
        self.sessions.push(session);
        temp_id
    }

    pub fn remove_session(&mut self, temp_id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.temp_id != temp_id);
        self.sessions.len() != before
    }

    pub fn merge_external_sessions(&mut self, incoming: Vec<AttendantSession>) {
        crate::attendants::merge_external(&mut self.sessions, incoming);
    }

    pub fn set_observations(&mut self, text: &str) {
        self.observations = text.to_string();
    }

    // -- derived -----------------------------------------------------------

    pub fn totals(&self) -> ReconciliationTotals {
        reconciliation::compute(&self.readings(), &self.sessions, &self.payments, &self.policy)
    }

    pub fn snapshot(&self) -> DraftSnapshot {
        DraftSnapshot {
            readings_map: self.cells.clone(),
            selected_date: self.date,
            selected_shift_id: self.shift_id,
            attendant_sessions: self.sessions.clone(),
        }
    }

    /// Restore typed cells from a draft. Cells of nozzles no longer in the
    /// catalog are dropped.
    ///
    /// A draft saved for another shift reloads that shift first, so the
    /// edit state and expected version belong to the draft's closing.
    pub async fn apply_draft<S: PersistentStore>(
        &mut self,
        store: &S,
        snapshot: DraftSnapshot,
    ) -> StoreResult<()> {
        if let Some(shift) = snapshot.selected_shift_id {
            if self.shift_id != Some(shift) {
                debug!(
                    location_id = self.location_id,
                    loaded_shift = ?self.shift_id,
                    draft_shift = shift,
                    "Reloading workspace for the draft's shift"
                );
                *self = Self::load(
                    store,
                    self.location_id,
                    self.date,
                    Some(shift),
                    self.policy.clone(),
                )
                .await?;
            }
        }

        for (nozzle_id, cells) in snapshot.readings_map {
            if self.nozzles.iter().any(|n| n.id == nozzle_id) {
                self.cells.insert(nozzle_id, cells);
            }
        }
        if !snapshot.attendant_sessions.is_empty() {
            self.sessions = snapshot.attendant_sessions;
        }
        Ok(())
    }

    pub fn to_request(&self, actor_id: Option<&str>) -> SubmissionRequest {
        SubmissionRequest {
            actor_id: actor_id.map(str::to_string),
            location_id: Some(self.location_id),
            date: self.date,
            shift_id: self.shift_id,
            readings: self.readings(),
            sessions: self.sessions.clone(),
            payments: self.payments.clone(),
            observations: Some(self.observations.clone()),
            expected_version: self.loaded_version,
        }
    }

    /// Declared amount of one category across assigned sessions.
    pub fn category_total(&self, category: SessionCategory) -> Decimal {
        self.sessions
            .iter()
            .filter(|s| s.has_attendant())
            .map(|s| s.declared(category))
            .fold(Decimal::ZERO, Decimal::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closing::ClosingSubmitter;
    use crate::store::memory::{MemoryScratch, MemoryStore};
    use crate::store::{NewReading, PaymentMethod};
    use rust_decimal::prelude::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        for (id, number) in [(1, 1), (2, 2)] {
            store.seed_nozzle(NozzleDetail {
                id,
                number,
                location_id: 7,
                fuel_id: 1,
                fuel_name: "Gasolina Comum".into(),
                fuel_code: "GC".into(),
                unit_price: dec("5.89"),
            });
        }
        store.seed_payment_method(
            7,
            PaymentMethod {
                id: 1,
                name: "Crédito".into(),
                kind: "card".into(),
                fee_percent: dec("3.5"),
                active: true,
            },
        );
        store.seed_attendant(
            7,
            Attendant {
                id: 3,
                name: "Ana".into(),
                active: true,
            },
        );
        store.seed_reading(NewReading {
            nozzle_id: 1,
            date: day(9),
            shift_id: 1,
            location_id: 7,
            initial_reading: dec("900"),
            final_reading: dec("1000"),
            fuel_id: 1,
            unit_price: dec("5.79"),
            actor_id: "user-1".into(),
        });
        store
    }

    async fn fresh(store: &MemoryStore) -> ClosingWorkspace {
        ClosingWorkspace::load(store, 7, day(10), Some(1), HighVolumePolicy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_workspace_starts_from_last_reading() {
        let store = seeded_store();
        let ws = fresh(&store).await;

        assert!(!ws.is_editing());
        assert_eq!(ws.cells(1).unwrap().initial, "1.000,000");
        assert_eq!(ws.cells(2).unwrap().initial, FIRST_READING);
        assert_eq!(ws.cells(1).unwrap().final_reading, "");
        assert_eq!(ws.sessions().len(), 1);
        assert_eq!(ws.payments().len(), 1);
        assert_eq!(ws.attendants().len(), 1);
        assert!(!ws.totals().can_close);
    }

    #[tokio::test]
    async fn test_reading_handlers_format_cells() {
        let store = seeded_store();
        let mut ws = fresh(&store).await;

        ws.change_final(1, "1050500");
        assert_eq!(ws.cells(1).unwrap().final_reading, "1.050.500");
        ws.blur_final(1);
        assert_eq!(ws.cells(1).unwrap().final_reading, "1.050,500");

        let flags = ws.reading_flags(1).unwrap();
        assert!(!flags.is_invalid);
        assert!(!flags.is_high_volume);
        assert_eq!(ws.totals().total_liters, dec("50.5"));
    }

    #[tokio::test]
    async fn test_money_handlers_reject_second_comma() {
        let store = seeded_store();
        let mut ws = fresh(&store).await;
        let temp_id = ws.sessions()[0].temp_id.clone();
        let cash = SessionField::Declared(SessionCategory::Cash);

        assert!(ws.change_session_field(&temp_id, cash, "150"));
        assert_eq!(ws.sessions()[0].cash, "R$ 150");
        assert!(!ws.change_session_field(&temp_id, cash, "1,5,0"));
        assert_eq!(ws.sessions()[0].cash, "R$ 150");
        ws.blur_session_field(&temp_id, cash);
        assert_eq!(ws.sessions()[0].cash, "R$ 150,00");

        assert!(ws.change_payment(1, "200,5"));
        ws.blur_payment(1);
        assert_eq!(ws.payments()[0].amount, "R$ 200,50");
        assert!(!ws.change_payment(99, "1"));
    }

    #[tokio::test]
    async fn test_session_list_management() {
        let store = seeded_store();
        let mut ws = fresh(&store).await;
        let first = ws.sessions()[0].temp_id.clone();
        let second = ws.add_session();

        assert!(ws.assign_attendant(&second, Some(3)));
        assert!(ws.remove_session(&first));
        assert!(!ws.remove_session(&first));
        assert_eq!(ws.sessions().len(), 1);
        assert_eq!(ws.sessions()[0].attendant_id, Some(3));
    }

    #[tokio::test]
    async fn test_snapshot_and_apply_draft() {
        let store = seeded_store();
        let mut ws = fresh(&store).await;
        ws.change_final(1, "1.020,000");
        let temp_id = ws.sessions()[0].temp_id.clone();
        ws.assign_attendant(&temp_id, Some(3));

        let snapshot = ws.snapshot();
        let mut reloaded = fresh(&store).await;
        reloaded.apply_draft(&store, snapshot).await.unwrap();

        assert_eq!(reloaded.cells(1).unwrap().final_reading, "1.020,000");
        assert_eq!(reloaded.sessions()[0].temp_id, temp_id);
        assert_eq!(reloaded.sessions()[0].attendant_id, Some(3));
    }

    #[tokio::test]
    async fn test_draft_for_other_shift_reloads_that_shift() {
        let store = seeded_store();
        let scratch = MemoryScratch::new();
        let mut ws = fresh(&store).await;
        ws.change_final(1, "1.050,500");
        let temp_id = ws.sessions()[0].temp_id.clone();
        ws.assign_attendant(&temp_id, Some(3));
        ws.set_observations("turno 1");
        ClosingSubmitter::new(&store, &scratch)
            .submit(&ws.to_request(Some("user-1")))
            .await
            .unwrap();

        let mut reopened = fresh(&store).await;
        assert!(reopened.loaded_version().is_some());

        let mut draft = reopened.snapshot();
        draft.selected_shift_id = Some(2);
        draft.readings_map.clear();
        draft.readings_map.insert(
            2,
            ReadingCells {
                initial: "500,000".into(),
                final_reading: "510,000".into(),
            },
        );
        reopened.apply_draft(&store, draft).await.unwrap();

        assert_eq!(reopened.shift_id, Some(2));
        assert!(!reopened.is_editing());
        assert_eq!(reopened.loaded_version(), None);
        assert_eq!(reopened.observations, "");
        assert_eq!(reopened.cells(1).unwrap().final_reading, "");
        assert_eq!(reopened.cells(2).unwrap().final_reading, "510,000");

        let request = reopened.to_request(Some("user-1"));
        assert_eq!(request.shift_id, Some(2));
        assert_eq!(request.expected_version, None);
    }

    #[tokio::test]
    async fn test_submitted_closing_reopens_for_edit() {
        let store = seeded_store();
        let scratch = MemoryScratch::new();
        let mut ws = fresh(&store).await;
        ws.change_final(1, "1.050,500");
        let temp_id = ws.sessions()[0].temp_id.clone();
        ws.assign_attendant(&temp_id, Some(3));
        ws.change_session_field(&temp_id, SessionField::Declared(SessionCategory::Cash), "297,45");
        ws.change_payment(1, "100");
        ws.set_observations("ok");

        let receipt = ClosingSubmitter::new(&store, &scratch)
            .submit(&ws.to_request(Some("user-1")))
            .await
            .unwrap();

        let reopened = fresh(&store).await;
        assert!(reopened.is_editing());
        assert_eq!(reopened.loaded_version(), Some(receipt.version));
        assert_eq!(reopened.cells(1).unwrap().final_reading, "1.050,500");
        assert_eq!(reopened.cells(2).unwrap().final_reading, "");
        assert_eq!(reopened.observations, "ok");
        assert_eq!(reopened.payments()[0].amount, "R$ 100,00");
        assert_eq!(reopened.sessions().len(), 1);
        assert_eq!(reopened.sessions()[0].cash, "R$ 297,45");
        assert!(matches!(
            reopened.sessions()[0].origin,
            SessionOrigin::Stored { .. }
        ));
        assert_eq!(reopened.category_total(SessionCategory::Cash), dec("297.45"));
        assert_eq!(
            reopened.to_request(Some("user-1")).expected_version,
            Some(receipt.version)
        );
    }
}
