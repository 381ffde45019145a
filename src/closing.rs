//! Closing submission.
//!
//! Turns the working state of a shift into durable rows: the closing record,
//! its nozzle readings, attendant sessions and payment receipts, then marks
//! the record closed. Steps run strictly in order because later rows refer to
//! the record id resolved first.
//!
//! When the store supports units the whole sequence is one unit and a failure
//! rolls everything back. Otherwise a failure leaves earlier steps persisted
//! and the error says which ones.

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::attendants::{self, AttendantSession, SessionCategory};
use crate::draft::DraftManager;
use crate::error::{SubmissionError, ValidationError};
use crate::meter::{HighVolumePolicy, NozzleReading};
use crate::payments::PaymentMethodEntry;
use crate::quantity;
use crate::reconciliation::{self, CloseGate, ReconciliationTotals};
use crate::store::{
    ClosingKey, ClosingStatus, ClosingUpdate, NewAttendantSession, NewClosing, NewReading,
    NewReceipt, PersistentStore, ScratchStore, StoreError,
};

/// Observation attached to every receipt written by a closing.
pub const GENERAL_RECEIPT_NOTE: &str = "Fechamento Geral";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStep {
    Idle,
    Validating,
    ResolvingRecord,
    PurgingChildren,
    WritingReadings,
    WritingSessions,
    WritingReceipts,
    Finalizing,
    Success,
    Failed,
}

impl fmt::Display for SubmissionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionStep::Idle => "idle",
            SubmissionStep::Validating => "validating",
            SubmissionStep::ResolvingRecord => "resolving record",
            SubmissionStep::PurgingChildren => "purging children",
            SubmissionStep::WritingReadings => "writing readings",
            SubmissionStep::WritingSessions => "writing sessions",
            SubmissionStep::WritingReceipts => "writing receipts",
            SubmissionStep::Finalizing => "finalizing",
            SubmissionStep::Success => "success",
            SubmissionStep::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything needed to close one shift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    pub date: NaiveDate,
    #[serde(default)]
    pub shift_id: Option<i64>,
    #[serde(default)]
    pub readings: Vec<NozzleReading>,
    #[serde(default)]
    pub sessions: Vec<AttendantSession>,
    #[serde(default)]
    pub payments: Vec<PaymentMethodEntry>,
    #[serde(default)]
    pub observations: Option<String>,
    /// Version of the closing the operator was editing, if any.
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// Caller-facing progress flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionStatus {
    pub saving: bool,
    pub error: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub closing_id: i64,
    pub idempotency_key: String,
    pub version: i64,
    /// False when an existing record was replaced.
    pub created: bool,
    pub readings_written: u64,
    pub sessions_written: u64,
    pub receipts_written: u64,
    pub totals: ReconciliationTotals,
}

// ---------------------------------------------------------------------------
// Row builders
// ---------------------------------------------------------------------------

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Readings with a final value typed in; initial and final parsed to liters.
pub fn reading_rows(readings: &[NozzleReading], key: &ClosingKey, actor_id: &str) -> Vec<NewReading> {
    readings
        .iter()
        .filter(|r| r.has_final())
        .map(|r| NewReading {
            nozzle_id: r.nozzle_id,
            date: key.date,
            shift_id: key.shift_id,
            location_id: key.location_id,
            initial_reading: quantity::parse_decimal(&r.initial_reading),
            final_reading: quantity::parse_decimal(&r.final_reading),
            fuel_id: r.fuel_id,
            unit_price: r.unit_price,
            actor_id: actor_id.to_string(),
        })
        .collect()
}

/// Sessions with an attendant, with verified amount and difference fixed at
/// write time.
pub fn session_rows(
    sessions: &[AttendantSession],
    closing_id: i64,
    location_id: i64,
) -> Vec<NewAttendantSession> {
    sessions
        .iter()
        .filter_map(|s| {
            let attendant_id = s.attendant_id?;
            Some(NewAttendantSession {
                closing_id,
                location_id,
                attendant_id,
                cash: s.declared(SessionCategory::Cash),
                instant_transfer: s.declared(SessionCategory::InstantTransfer),
                debit_card: s.declared(SessionCategory::DebitCard),
                credit_card: s.declared(SessionCategory::CreditCard),
                credit_note: s.declared(SessionCategory::CreditNote),
                voucher: s.declared(SessionCategory::Voucher),
                card_total: s.card_total(),
                metered_amount: s.metered(),
                difference: attendants::difference(s),
                verified_amount: attendants::verified_amount(s),
                products_amount: s.products(),
                observations: non_empty(Some(&s.observations)),
            })
        })
        .collect()
}

pub fn receipt_rows(entries: &[PaymentMethodEntry], closing_id: i64) -> Vec<NewReceipt> {
    entries
        .iter()
        .filter_map(|e| {
            let amount = e.amount_value();
            (amount > Decimal::ZERO).then(|| NewReceipt {
                closing_id,
                payment_method_id: e.payment_method_id,
                amount,
                observations: Some(GENERAL_RECEIPT_NOTE.to_string()),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Bookkeeping for one submission attempt.
struct Attempt<'s, S> {
    store: &'s S,
    idempotency_key: String,
    current: SubmissionStep,
    completed: Vec<SubmissionStep>,
    in_unit: bool,
}

impl<'s, S: PersistentStore> Attempt<'s, S> {
    fn enter(&mut self, step: SubmissionStep) {
        debug!(idempotency_key = %self.idempotency_key, step = %step, "Closing submission step");
        self.current = step;
    }

    /// Some of the current step's writes have landed. Recorded once per step.
    fn landed(&mut self) {
        if self.completed.last() != Some(&self.current) {
            self.completed.push(self.current);
        }
    }

    async fn release(&mut self) -> bool {
        if !self.in_unit {
            return false;
        }
        self.in_unit = false;
        match self.store.rollback_unit().await {
            Ok(()) => true,
            Err(e) => {
                error!(idempotency_key = %self.idempotency_key, error = %e, "Rollback failed");
                false
            }
        }
    }

    async fn fail(&mut self, source: StoreError) -> SubmissionError {
        let step = self.current;
        error!(
            idempotency_key = %self.idempotency_key,
            step = %step,
            error = %source,
            "Closing submission step failed"
        );
        let rolled_back = self.release().await;
        SubmissionError::StepFailed {
            step,
            completed: self.completed.clone(),
            rolled_back,
            source,
        }
    }
}

macro_rules! step {
    ($attempt:ident, $call:expr) => {
        match $call.await {
            Ok(v) => v,
            Err(e) => return Err($attempt.fail(e).await),
        }
    };
}

fn validate(request: &SubmissionRequest) -> Result<(String, ClosingKey), ValidationError> {
    let actor = non_empty(request.actor_id.as_deref()).ok_or(ValidationError::MissingActor)?;
    let location_id = request.location_id.ok_or(ValidationError::MissingLocation)?;
    let shift_id = request.shift_id.ok_or(ValidationError::MissingShift)?;
    check_ranges(request)?;
    Ok((actor, ClosingKey::new(request.date, shift_id, location_id)))
}

fn check_ranges(request: &SubmissionRequest) -> Result<(), ValidationError> {
    let out_of_range = |field: String| Err(ValidationError::AmountOutOfRange { field });

    for r in &request.readings {
        if quantity::reading_exceeds_range(&r.initial_reading)
            || quantity::reading_exceeds_range(&r.final_reading)
        {
            return out_of_range(format!("reading of nozzle {}", r.nozzle_id));
        }
        if quantity::value_exceeds_range(r.unit_price) {
            return out_of_range(format!("unit price of nozzle {}", r.nozzle_id));
        }
    }
    for (index, s) in request.sessions.iter().enumerate() {
        if s.exceeds_range() {
            return out_of_range(format!("amounts of session {}", index + 1));
        }
    }
    for e in &request.payments {
        if quantity::money_exceeds_range(&e.amount) || quantity::value_exceeds_range(e.fee_percent)
        {
            return out_of_range(format!("payment method {}", e.payment_method_id));
        }
    }
    Ok(())
}

/// Runs closing submissions against a persistent store and clears the
/// location's draft on success.
pub struct ClosingSubmitter<'a, S: PersistentStore, D: ScratchStore> {
    store: &'a S,
    scratch: &'a D,
    policy: HighVolumePolicy,
    state: SubmissionStep,
    status: SubmissionStatus,
}

impl<'a, S: PersistentStore, D: ScratchStore> ClosingSubmitter<'a, S, D> {
    pub fn new(store: &'a S, scratch: &'a D) -> Self {
        Self {
            store,
            scratch,
            policy: HighVolumePolicy::default(),
            state: SubmissionStep::Idle,
            status: SubmissionStatus::default(),
        }
    }

    pub fn with_policy(mut self, policy: HighVolumePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> SubmissionStep {
        self.state
    }

    pub fn status(&self) -> &SubmissionStatus {
        &self.status
    }

    pub async fn submit(
        &mut self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.status = SubmissionStatus {
            saving: true,
            error: None,
            success: false,
        };

        let result = self.run(request).await;

        match &result {
            Ok(receipt) => {
                self.state = SubmissionStep::Success;
                self.status = SubmissionStatus {
                    saving: false,
                    error: None,
                    success: true,
                };
                info!(
                    closing_id = receipt.closing_id,
                    idempotency_key = %receipt.idempotency_key,
                    version = receipt.version,
                    "Closing submitted"
                );
            }
            Err(e) => {
                self.state = SubmissionStep::Failed;
                self.status = SubmissionStatus {
                    saving: false,
                    error: Some(e.to_string()),
                    success: false,
                };
                if let SubmissionError::Validation(v) = e {
                    warn!(error = %v, "Closing submission refused");
                }
            }
        }
        result
    }

    async fn run(
        &mut self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.state = SubmissionStep::Validating;
        let (actor, key) = validate(request)?;
        let totals = reconciliation::compute(
            &request.readings,
            &request.sessions,
            &request.payments,
            &self.policy,
        );
        if let CloseGate::Blocked { reasons } = &totals.gate {
            return Err(ValidationError::CannotClose {
                reasons: reasons.clone(),
            }
            .into());
        }

        let store = self.store;
        let mut attempt = Attempt {
            store,
            idempotency_key: key.idempotency_key(),
            current: SubmissionStep::Validating,
            completed: Vec::new(),
            in_unit: false,
        };
        info!(
            idempotency_key = %attempt.idempotency_key,
            location_id = key.location_id,
            "Submitting closing"
        );

        attempt.enter(SubmissionStep::ResolvingRecord);
        self.state = SubmissionStep::ResolvingRecord;
        attempt.in_unit = step!(attempt, store.begin_unit());

        let existing = step!(attempt, store.find_closing(&key));
        let found_version = existing.as_ref().map(|r| r.version);
        if let Some(expected) = request.expected_version {
            if found_version != Some(expected) {
                let rolled_back = attempt.release().await;
                warn!(
                    idempotency_key = %attempt.idempotency_key,
                    expected,
                    found = ?found_version,
                    rolled_back,
                    "Closing changed since it was loaded"
                );
                return Err(ValidationError::StaleClosing {
                    expected,
                    found: found_version.unwrap_or(0),
                }
                .into());
            }
        }

        let pre_existed = existing.is_some();
        let record = match existing {
            Some(record) => record,
            None => {
                let record = step!(
                    attempt,
                    store.create_closing(&NewClosing {
                        key,
                        status: ClosingStatus::Draft,
                        created_by: actor.clone(),
                    })
                );
                attempt.landed();
                record
            }
        };

        if pre_existed {
            attempt.enter(SubmissionStep::PurgingChildren);
            self.state = SubmissionStep::PurgingChildren;
            step!(attempt, store.delete_readings(&key));
            attempt.landed();
            step!(attempt, store.delete_attendant_sessions(record.id));
            step!(attempt, store.delete_receipts(record.id));
        }

        attempt.enter(SubmissionStep::WritingReadings);
        self.state = SubmissionStep::WritingReadings;
        let readings = reading_rows(&request.readings, &key, &actor);
        let mut readings_written = 0;
        if !readings.is_empty() {
            readings_written = step!(attempt, store.bulk_create_readings(&readings));
            attempt.landed();
        }

        attempt.enter(SubmissionStep::WritingSessions);
        self.state = SubmissionStep::WritingSessions;
        let sessions = session_rows(&request.sessions, record.id, key.location_id);
        let mut sessions_written = 0;
        if !sessions.is_empty() {
            sessions_written = step!(attempt, store.bulk_create_attendant_sessions(&sessions));
            attempt.landed();
        }

        attempt.enter(SubmissionStep::WritingReceipts);
        self.state = SubmissionStep::WritingReceipts;
        let receipts = receipt_rows(&request.payments, record.id);
        let mut receipts_written = 0;
        if !receipts.is_empty() {
            receipts_written = step!(attempt, store.bulk_create_receipts(&receipts));
            attempt.landed();
        }

        attempt.enter(SubmissionStep::Finalizing);
        self.state = SubmissionStep::Finalizing;
        let updated = step!(
            attempt,
            store.update_closing(
                record.id,
                &ClosingUpdate {
                    status: ClosingStatus::Closed,
                    total_sales: totals.total_expected_revenue,
                    total_collected: totals.total_collected,
                    difference: totals.difference,
                    observations: non_empty(request.observations.as_deref()),
                    expected_version: Some(record.version),
                },
            )
        );
        if attempt.in_unit {
            step!(attempt, store.commit_unit());
            attempt.in_unit = false;
        }
        attempt.landed();

        if let Err(e) = DraftManager::new(self.scratch, key.location_id).clear() {
            warn!(location_id = key.location_id, error = %e, "Failed to clear closing draft");
        }

        Ok(SubmissionReceipt {
            closing_id: updated.id,
            idempotency_key: attempt.idempotency_key,
            version: updated.version,
            created: !pre_existed,
            readings_written,
            sessions_written,
            receipts_written,
            totals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::draft::{draft_key, DraftSnapshot};
    use crate::reconciliation::BlockReason;
    use crate::store::memory::{MemoryScratch, MemoryStore};
    use rust_decimal::prelude::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    fn reading(nozzle_id: i64, initial: &str, final_reading: &str) -> NozzleReading {
        NozzleReading {
            nozzle_id,
            date: day(),
            shift_id: Some(1),
            initial_reading: initial.into(),
            final_reading: final_reading.into(),
            fuel_id: 1,
            unit_price: dec("5.89"),
        }
    }

    fn session(attendant_id: Option<i64>, cash: &str) -> AttendantSession {
        let mut s = AttendantSession::new_local();
        s.attendant_id = attendant_id;
        s.cash = cash.into();
        s
    }

    fn entry(id: i64, amount: &str) -> PaymentMethodEntry {
        PaymentMethodEntry {
            payment_method_id: id,
            name: format!("method {id}"),
            kind: "card".into(),
            fee_percent: Decimal::ZERO,
            amount: amount.into(),
        }
    }

    fn request() -> SubmissionRequest {
        SubmissionRequest {
            actor_id: Some("user-1".into()),
            location_id: Some(7),
            date: day(),
            shift_id: Some(1),
            readings: vec![
                reading(1, "1.000,000", "1.050,500"),
                reading(2, "500,000", ""),
            ],
            sessions: vec![session(Some(3), "R$ 297,45"), session(None, "10,00")],
            payments: vec![entry(1, "R$ 200,00"), entry(2, "")],
            observations: Some("  sem ocorrências ".into()),
            expected_version: None,
        }
    }

    #[tokio::test]
    async fn test_new_closing_writes_in_order() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let mut submitter = ClosingSubmitter::new(&store, &scratch);

        let receipt = submitter.submit(&request()).await.unwrap();

        assert_eq!(
            store.calls(),
            vec![
                "find_closing",
                "create_closing",
                "bulk_create_readings",
                "bulk_create_attendant_sessions",
                "bulk_create_receipts",
                "update_closing",
            ]
        );
        assert!(receipt.created);
        assert_eq!(receipt.idempotency_key, "closing:2025-01-10:1:7");
        assert_eq!(receipt.readings_written, 1);
        assert_eq!(receipt.sessions_written, 1);
        assert_eq!(receipt.receipts_written, 1);

        let closing = &store.closings()[0];
        assert_eq!(closing.status, ClosingStatus::Closed);
        assert_eq!(closing.total_sales, dec("297.445"));
        assert_eq!(closing.total_collected, dec("297.45"));
        assert_eq!(closing.difference, dec("0.005"));
        assert_eq!(closing.observations.as_deref(), Some("sem ocorrências"));

        let readings = store.readings();
        assert_eq!(readings[0].final_reading, dec("1050.5"));
        assert_eq!(readings[0].actor_id.as_deref(), Some("user-1"));
        assert_eq!(store.receipts()[0].observations.as_deref(), Some(GENERAL_RECEIPT_NOTE));
        assert_eq!(store.sessions()[0].row.verified_amount, dec("297.45"));

        assert_eq!(submitter.state(), SubmissionStep::Success);
        assert_eq!(
            submitter.status(),
            &SubmissionStatus {
                saving: false,
                error: None,
                success: true
            }
        );
    }

    #[tokio::test]
    async fn test_blocked_closing_makes_no_store_calls() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let mut submitter = ClosingSubmitter::new(&store, &scratch);

        let mut req = request();
        req.readings = vec![reading(1, "1.000,000", "900,000")];
        req.sessions = vec![session(None, "10,00")];

        let err = submitter.submit(&req).await.unwrap_err();
        assert_eq!(
            err,
            SubmissionError::Validation(ValidationError::CannotClose {
                reasons: vec![BlockReason::NoValidReading, BlockReason::NoAssignedSession],
            })
        );
        assert!(store.calls().is_empty());
        assert_eq!(submitter.state(), SubmissionStep::Failed);
        assert!(submitter.status().error.is_some());
    }

    #[tokio::test]
    async fn test_missing_context_is_rejected() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let mut submitter = ClosingSubmitter::new(&store, &scratch);

        let mut req = request();
        req.actor_id = Some("  ".into());
        assert_eq!(
            submitter.submit(&req).await.unwrap_err(),
            SubmissionError::Validation(ValidationError::MissingActor)
        );

        let mut req = request();
        req.location_id = None;
        assert_eq!(
            submitter.submit(&req).await.unwrap_err(),
            SubmissionError::Validation(ValidationError::MissingLocation)
        );

        let mut req = request();
        req.shift_id = None;
        assert_eq!(
            submitter.submit(&req).await.unwrap_err(),
            SubmissionError::Validation(ValidationError::MissingShift)
        );
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_amount_is_rejected_before_any_call() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let mut req = request();
        req.sessions[0].cash = "70000000000000000000000000000".into();
        req.sessions[0].instant_transfer = req.sessions[0].cash.clone();

        let err = ClosingSubmitter::new(&store, &scratch)
            .submit(&req)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SubmissionError::Validation(ValidationError::AmountOutOfRange {
                field: "amounts of session 1".into(),
            })
        );
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_closing_is_purged_and_replaced() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let first = ClosingSubmitter::new(&store, &scratch)
            .submit(&request())
            .await
            .unwrap();
        store.reset_calls();

        let mut req = request();
        req.readings = vec![reading(1, "1.000,000", "1.020,000")];
        req.expected_version = Some(first.version);
        let second = ClosingSubmitter::new(&store, &scratch)
            .submit(&req)
            .await
            .unwrap();

        assert_eq!(
            store.calls(),
            vec![
                "find_closing",
                "delete_readings",
                "delete_attendant_sessions",
                "delete_receipts",
                "bulk_create_readings",
                "bulk_create_attendant_sessions",
                "bulk_create_receipts",
                "update_closing",
            ]
        );
        assert!(!second.created);
        assert_eq!(second.closing_id, first.closing_id);
        assert_eq!(second.version, first.version + 1);
        assert_eq!(store.closings().len(), 1);
        assert_eq!(store.readings().len(), 1);
        assert_eq!(store.readings()[0].final_reading, dec("1020"));
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(store.receipts().len(), 1);
    }

    #[tokio::test]
    async fn test_resubmission_replaces_readings() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();

        let mut req = request();
        req.readings = (1..=5).map(|n| reading(n, "1.000,000", "1.010,000")).collect();
        ClosingSubmitter::new(&store, &scratch)
            .submit(&req)
            .await
            .unwrap();
        assert_eq!(store.readings().len(), 5);

        req.readings.truncate(3);
        ClosingSubmitter::new(&store, &scratch)
            .submit(&req)
            .await
            .unwrap();
        assert_eq!(store.readings().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_version_fails_before_any_write() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let first = ClosingSubmitter::new(&store, &scratch)
            .submit(&request())
            .await
            .unwrap();
        store.reset_calls();

        let mut req = request();
        req.expected_version = Some(first.version - 1);
        let err = ClosingSubmitter::new(&store, &scratch)
            .submit(&req)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SubmissionError::Validation(ValidationError::StaleClosing {
                expected: first.version - 1,
                found: first.version,
            })
        );
        assert_eq!(store.calls(), vec!["find_closing"]);
    }

    #[tokio::test]
    async fn test_failure_without_units_reports_partial_write() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        store.fail_on("bulk_create_attendant_sessions");
        let mut submitter = ClosingSubmitter::new(&store, &scratch);

        let err = submitter.submit(&request()).await.unwrap_err();
        match &err {
            SubmissionError::StepFailed {
                step,
                completed,
                rolled_back,
                source,
            } => {
                assert_eq!(*step, SubmissionStep::WritingSessions);
                assert_eq!(
                    completed,
                    &vec![SubmissionStep::ResolvingRecord, SubmissionStep::WritingReadings]
                );
                assert!(!rolled_back);
                assert!(matches!(source, StoreError::Unavailable(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_partial());
        assert_eq!(store.closings()[0].status, ClosingStatus::Draft);
        assert_eq!(store.readings().len(), 1);
        assert!(store.receipts().is_empty());
    }

    #[tokio::test]
    async fn test_failure_mid_purge_reports_deleted_readings() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let first = ClosingSubmitter::new(&store, &scratch)
            .submit(&request())
            .await
            .unwrap();
        store.fail_on("delete_attendant_sessions");

        let mut req = request();
        req.expected_version = Some(first.version);
        let err = ClosingSubmitter::new(&store, &scratch)
            .submit(&req)
            .await
            .unwrap_err();

        match &err {
            SubmissionError::StepFailed {
                step,
                completed,
                rolled_back,
                ..
            } => {
                assert_eq!(*step, SubmissionStep::PurgingChildren);
                assert_eq!(completed, &vec![SubmissionStep::PurgingChildren]);
                assert!(!rolled_back);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_partial());
        assert!(store.readings().is_empty());
        assert_eq!(store.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_success_clears_draft() {
        let store = MemoryStore::new();
        let scratch = MemoryScratch::new();
        let snapshot = DraftSnapshot {
            readings_map: Default::default(),
            selected_date: day(),
            selected_shift_id: Some(1),
            attendant_sessions: Vec::new(),
        };
        scratch
            .set(&draft_key(7), &serde_json::to_string(&snapshot).unwrap())
            .unwrap();

        store.fail_on("update_closing");
        assert!(ClosingSubmitter::new(&store, &scratch)
            .submit(&request())
            .await
            .is_err());
        assert!(scratch.get(&draft_key(7)).unwrap().is_some());

        store.clear_failure();
        ClosingSubmitter::new(&store, &scratch)
            .submit(&request())
            .await
            .unwrap();
        assert_eq!(scratch.get(&draft_key(7)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_failure_rolls_back_whole_unit() {
        let db = db::open_in_memory().unwrap();
        db.lock().unwrap().execute_batch("DROP TABLE receipts").unwrap();
        let scratch = MemoryScratch::new();

        let err = ClosingSubmitter::new(&db, &scratch)
            .submit(&request())
            .await
            .unwrap_err();

        match &err {
            SubmissionError::StepFailed {
                step, rolled_back, ..
            } => {
                assert_eq!(*step, SubmissionStep::WritingReceipts);
                assert!(rolled_back);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_partial());

        let key = ClosingKey::new(day(), 1, 7);
        assert_eq!(db.find_closing(&key).await.unwrap(), None);
        assert!(db.find_readings(day(), Some(1), 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_submission_commits() {
        let db = db::open_in_memory().unwrap();
        let receipt = ClosingSubmitter::new(&db, &db)
            .submit(&request())
            .await
            .unwrap();

        let stored = db
            .find_closing(&ClosingKey::new(day(), 1, 7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, receipt.closing_id);
        assert_eq!(stored.status, ClosingStatus::Closed);
        assert_eq!(stored.version, receipt.version);
        assert_eq!(db.find_receipts(stored.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_stale_version_releases_unit() {
        let db = db::open_in_memory().unwrap();
        let first = ClosingSubmitter::new(&db, &db)
            .submit(&request())
            .await
            .unwrap();

        let mut req = request();
        req.expected_version = Some(first.version + 1);
        let err = ClosingSubmitter::new(&db, &db).submit(&req).await.unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::Validation(ValidationError::StaleClosing { .. })
        ));
        assert!(db.lock().unwrap().is_autocommit());

        req.expected_version = Some(first.version);
        let second = ClosingSubmitter::new(&db, &db).submit(&req).await.unwrap();
        assert_eq!(second.version, first.version + 1);
    }
}
