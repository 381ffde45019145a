//! Meter-delta calculation for one nozzle.
//!
//! A nozzle's counter is cumulative, so liters sold are the difference
//! between the closing and opening readings. Readings that go backwards or
//! stay at zero are not sales; they are flagged and left out of totals.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::quantity;

/// Default delta above which a reading is surfaced as unusually large.
pub const DEFAULT_HIGH_VOLUME_LITERS: i64 = 3000;

// ---------------------------------------------------------------------------
// Liters and revenue
// ---------------------------------------------------------------------------

/// Liters sold between two readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liters {
    pub value: Decimal,
    pub valid: bool,
}

impl Liters {
    pub const INVALID: Liters = Liters {
        value: Decimal::ZERO,
        valid: false,
    };
}

/// Compute the liters sold between two numeric readings.
pub fn compute_liters_values(initial: Decimal, final_reading: Decimal) -> Liters {
    if final_reading > initial && !final_reading.is_zero() {
        Liters {
            value: final_reading.saturating_sub(initial),
            valid: true,
        }
    } else {
        Liters::INVALID
    }
}

/// Compute the liters sold between two formatted readings. Unparsable input
/// reads as zero and therefore yields an invalid result.
pub fn compute_liters(initial: &str, final_reading: &str) -> Liters {
    compute_liters_values(
        quantity::parse_decimal(initial),
        quantity::parse_decimal(final_reading),
    )
}

/// Revenue for `liters` at `unit_price`; zero when the liters are invalid.
pub fn compute_revenue(liters: &Liters, unit_price: Decimal) -> Decimal {
    if liters.valid {
        liters.value.saturating_mul(unit_price)
    } else {
        Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// High-volume policy
// ---------------------------------------------------------------------------

/// Threshold above which a delta is flagged as high volume. The flag is a
/// warning only; the reading still counts toward totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighVolumePolicy {
    pub default_threshold_liters: Decimal,
    #[serde(default)]
    pub per_fuel: BTreeMap<i64, Decimal>,
}

impl Default for HighVolumePolicy {
    fn default() -> Self {
        Self {
            default_threshold_liters: Decimal::from(DEFAULT_HIGH_VOLUME_LITERS),
            per_fuel: BTreeMap::new(),
        }
    }
}

impl HighVolumePolicy {
    pub fn threshold_for(&self, fuel_id: i64) -> Decimal {
        self.per_fuel
            .get(&fuel_id)
            .copied()
            .unwrap_or(self.default_threshold_liters)
    }

    pub fn is_high_volume(&self, liters: &Liters, fuel_id: i64) -> bool {
        liters.valid && liters.value > self.threshold_for(fuel_id)
    }
}

// ---------------------------------------------------------------------------
// Nozzle reading
// ---------------------------------------------------------------------------

/// One nozzle's readings for a date and shift. Readings are kept as the text
/// the operator sees; numeric values are derived on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NozzleReading {
    pub nozzle_id: i64,
    pub date: NaiveDate,
    pub shift_id: Option<i64>,
    pub initial_reading: String,
    pub final_reading: String,
    pub fuel_id: i64,
    pub unit_price: Decimal,
}

/// Where a reading stands before submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadingStatus {
    /// No final reading typed yet.
    Pending,
    Valid,
    Invalid,
}

/// Informational flags shown next to a reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingFlags {
    pub is_invalid: bool,
    pub is_high_volume: bool,
}

impl NozzleReading {
    pub fn has_final(&self) -> bool {
        !self.final_reading.trim().is_empty()
    }

    pub fn liters_sold(&self) -> Liters {
        compute_liters(&self.initial_reading, &self.final_reading)
    }

    pub fn total_value(&self) -> Decimal {
        compute_revenue(&self.liters_sold(), self.unit_price)
    }

    pub fn status(&self) -> ReadingStatus {
        if !self.has_final() {
            ReadingStatus::Pending
        } else if self.liters_sold().valid {
            ReadingStatus::Valid
        } else {
            ReadingStatus::Invalid
        }
    }

    pub fn flags(&self, policy: &HighVolumePolicy) -> ReadingFlags {
        ReadingFlags {
            is_invalid: self.status() == ReadingStatus::Invalid,
            is_high_volume: policy.is_high_volume(&self.liters_sold(), self.fuel_id),
        }
    }
}
