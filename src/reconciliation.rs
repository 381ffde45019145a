//! Shift-level reconciliation totals and the close gate.
//!
//! Pump truth (liters × price over valid readings) is compared with cashier
//! truth (verified amounts of sessions that have an attendant). The
//! difference is always `collected − expected`: positive is a surplus in the
//! drawer, negative is a shortage.

use std::collections::BTreeMap;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::attendants::{self, AttendantSession};
use crate::meter::{HighVolumePolicy, NozzleReading, ReadingStatus};
use crate::payments::{self, PaymentMethodEntry, PaymentTotals};

// ---------------------------------------------------------------------------
// Close gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    NoValidReading,
    NoAssignedSession,
}

/// Whether a closing may be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseGate {
    Permitted,
    /// Submission must be refused before any write.
    Blocked { reasons: Vec<BlockReason> },
}

impl CloseGate {
    pub fn is_permitted(&self) -> bool {
        matches!(self, CloseGate::Permitted)
    }
}

pub fn close_gate(readings: &[NozzleReading], sessions: &[AttendantSession]) -> CloseGate {
    let mut reasons = Vec::new();
    if !readings.iter().any(|r| r.status() == ReadingStatus::Valid) {
        reasons.push(BlockReason::NoValidReading);
    }
    if !sessions.iter().any(AttendantSession::has_attendant) {
        reasons.push(BlockReason::NoAssignedSession);
    }
    if reasons.is_empty() {
        CloseGate::Permitted
    } else {
        CloseGate::Blocked { reasons }
    }
}

pub fn can_close(readings: &[NozzleReading], sessions: &[AttendantSession]) -> bool {
    close_gate(readings, sessions).is_permitted()
}

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

pub fn total_liters(readings: &[NozzleReading]) -> Decimal {
    readings
        .iter()
        .map(NozzleReading::liters_sold)
        .filter(|l| l.valid)
        .map(|l| l.value)
        .fold(Decimal::ZERO, Decimal::saturating_add)
}

pub fn total_expected_revenue(readings: &[NozzleReading]) -> Decimal {
    readings
        .iter()
        .map(NozzleReading::total_value)
        .fold(Decimal::ZERO, Decimal::saturating_add)
}

/// Sum of verified amounts over sessions with an assigned attendant.
pub fn total_collected(sessions: &[AttendantSession]) -> Decimal {
    sessions
        .iter()
        .filter(|s| s.has_attendant())
        .map(attendants::verified_amount)
        .fold(Decimal::ZERO, Decimal::saturating_add)
}

/// Signed variance: `collected − expected`.
pub fn difference(total_collected: Decimal, total_expected: Decimal) -> Decimal {
    total_collected.saturating_sub(total_expected)
}

/// Variance as a percentage of expected revenue; zero when nothing was
/// expected or the ratio does not fit.
pub fn difference_percent(difference: Decimal, total_expected: Decimal) -> Decimal {
    difference
        .checked_div(total_expected)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .map_or(Decimal::ZERO, |pct| pct.round_dp(4))
}

/// Liters and revenue for one fuel across its nozzles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuelSummary {
    pub fuel_id: i64,
    pub liters: Decimal,
    pub revenue: Decimal,
    pub unit_price: Decimal,
}

/// Per-fuel totals over valid readings, ordered by fuel id.
pub fn summarize_by_fuel(readings: &[NozzleReading]) -> Vec<FuelSummary> {
    let mut by_fuel: BTreeMap<i64, FuelSummary> = BTreeMap::new();
    for reading in readings {
        let liters = reading.liters_sold();
        if !liters.valid {
            continue;
        }
        let summary = by_fuel.entry(reading.fuel_id).or_insert_with(|| FuelSummary {
            fuel_id: reading.fuel_id,
            liters: Decimal::ZERO,
            revenue: Decimal::ZERO,
            unit_price: reading.unit_price,
        });
        summary.liters = summary.liters.saturating_add(liters.value);
        summary.revenue = summary.revenue.saturating_add(reading.total_value());
        summary.unit_price = reading.unit_price;
    }
    by_fuel.into_values().collect()
}

/// Everything the operator sees before deciding to close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationTotals {
    pub total_liters: Decimal,
    pub total_expected_revenue: Decimal,
    pub total_collected: Decimal,
    pub difference: Decimal,
    pub difference_percent: Decimal,
    pub total_declared: Decimal,
    pub total_products: Decimal,
    pub register: PaymentTotals,
    pub net_collected: Decimal,
    pub valid_readings: usize,
    pub invalid_readings: usize,
    pub high_volume_nozzles: Vec<i64>,
    pub assigned_sessions: usize,
    pub has_incomplete_sessions: bool,
    pub fuel_summary: Vec<FuelSummary>,
    pub gate: CloseGate,
    pub can_close: bool,
}

pub fn compute(
    readings: &[NozzleReading],
    sessions: &[AttendantSession],
    entries: &[PaymentMethodEntry],
    policy: &HighVolumePolicy,
) -> ReconciliationTotals {
    let total_liters = total_liters(readings);
    let total_expected_revenue = total_expected_revenue(readings);
    let total_collected = total_collected(sessions);
    let difference = difference(total_collected, total_expected_revenue);
    let register = payments::totals(entries);

    let assigned: Vec<&AttendantSession> = sessions.iter().filter(|s| s.has_attendant()).collect();
    let has_incomplete_sessions = assigned.iter().any(|s| {
        attendants::total_declared(s).is_zero() && s.metered() <= Decimal::ZERO
    });

    let gate = close_gate(readings, sessions);

    ReconciliationTotals {
        total_liters,
        total_expected_revenue,
        total_collected,
        difference,
        difference_percent: difference_percent(difference, total_expected_revenue),
        total_declared: assigned
            .iter()
            .map(|s| attendants::total_declared(s))
            .fold(Decimal::ZERO, Decimal::saturating_add),
        total_products: assigned
            .iter()
            .map(|s| s.products())
            .fold(Decimal::ZERO, Decimal::saturating_add),
        net_collected: total_collected.saturating_sub(register.fees),
        register,
        valid_readings: readings
            .iter()
            .filter(|r| r.status() == ReadingStatus::Valid)
            .count(),
        invalid_readings: readings
            .iter()
            .filter(|r| r.status() == ReadingStatus::Invalid)
            .count(),
        high_volume_nozzles: readings
            .iter()
            .filter(|r| r.flags(policy).is_high_volume)
            .map(|r| r.nozzle_id)
            .collect(),
        assigned_sessions: assigned.len(),
        has_incomplete_sessions,
        fuel_summary: summarize_by_fuel(readings),
        can_close: gate.is_permitted(),
        gate,
    }
}
