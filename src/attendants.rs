//! Attendant cash-drawer sessions.
//!
//! Each attendant declares what they collected during the shift, broken down
//! by payment category. Declared amounts are held as the money text typed by
//! the operator and parsed on demand, so a session survives a draft
//! round-trip exactly as it was left.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::quantity;

/// Where a session came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionOrigin {
    /// Typed in on the closing screen.
    LocalEntry,
    /// Received from the attendant's own submission channel.
    #[serde(rename_all = "camelCase")]
    ExternalSync {
        submitted_at: Option<DateTime<Utc>>,
    },
    /// Loaded back from a previously submitted closing.
    #[serde(rename_all = "camelCase")]
    Stored { session_id: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    #[default]
    Pending,
    Verified,
}

/// The six declared categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionCategory {
    Cash,
    InstantTransfer,
    DebitCard,
    CreditCard,
    CreditNote,
    Voucher,
}

impl SessionCategory {
    pub const ALL: [SessionCategory; 6] = [
        SessionCategory::Cash,
        SessionCategory::InstantTransfer,
        SessionCategory::DebitCard,
        SessionCategory::CreditCard,
        SessionCategory::CreditNote,
        SessionCategory::Voucher,
    ];
}

/// Any editable money cell on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionField {
    Declared(SessionCategory),
    Metered,
    Products,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendantSession {
    pub temp_id: String,
    pub origin: SessionOrigin,
    pub attendant_id: Option<i64>,
    #[serde(default)]
    pub cash: String,
    #[serde(default)]
    pub instant_transfer: String,
    #[serde(default)]
    pub debit_card: String,
    #[serde(default)]
    pub credit_card: String,
    #[serde(default)]
    pub credit_note: String,
    #[serde(default)]
    pub voucher: String,
    /// Amount reported by an external meter or register, if any.
    #[serde(default)]
    pub metered_amount: String,
    /// Shop products sold; reported apart from fuel money.
    #[serde(default)]
    pub products_amount: String,
    #[serde(default)]
    pub observations: String,
    #[serde(default)]
    pub status: SessionStatus,
}

impl AttendantSession {
    /// A blank session typed in locally, with a fresh correlation key.
    pub fn new_local() -> Self {
        Self::with_origin(
            format!("temp-{}", uuid::Uuid::new_v4()),
            SessionOrigin::LocalEntry,
        )
    }

    pub fn with_origin(temp_id: String, origin: SessionOrigin) -> Self {
        Self {
            temp_id,
            origin,
            attendant_id: None,
            cash: String::new(),
            instant_transfer: String::new(),
            debit_card: String::new(),
            credit_card: String::new(),
            credit_note: String::new(),
            voucher: String::new(),
            metered_amount: String::new(),
            products_amount: String::new(),
            observations: String::new(),
            status: SessionStatus::Pending,
        }
    }

    pub fn field(&self, field: SessionField) -> &str {
        match field {
            SessionField::Declared(category) => self.declared_text(category),
            SessionField::Metered => &self.metered_amount,
            SessionField::Products => &self.products_amount,
        }
    }

    pub fn field_mut(&mut self, field: SessionField) -> &mut String {
        match field {
            SessionField::Declared(SessionCategory::Cash) => &mut self.cash,
            SessionField::Declared(SessionCategory::InstantTransfer) => &mut self.instant_transfer,
            SessionField::Declared(SessionCategory::DebitCard) => &mut self.debit_card,
            SessionField::Declared(SessionCategory::CreditCard) => &mut self.credit_card,
            SessionField::Declared(SessionCategory::CreditNote) => &mut self.credit_note,
            SessionField::Declared(SessionCategory::Voucher) => &mut self.voucher,
            SessionField::Metered => &mut self.metered_amount,
            SessionField::Products => &mut self.products_amount,
        }
    }

    fn declared_text(&self, category: SessionCategory) -> &str {
        match category {
            SessionCategory::Cash => &self.cash,
            SessionCategory::InstantTransfer => &self.instant_transfer,
            SessionCategory::DebitCard => &self.debit_card,
            SessionCategory::CreditCard => &self.credit_card,
            SessionCategory::CreditNote => &self.credit_note,
            SessionCategory::Voucher => &self.voucher,
        }
    }

    pub fn declared(&self, category: SessionCategory) -> Decimal {
        quantity::parse_currency(self.declared_text(category))
    }

    pub fn metered(&self) -> Decimal {
        quantity::parse_currency(&self.metered_amount)
    }

    pub fn products(&self) -> Decimal {
        quantity::parse_currency(&self.products_amount)
    }

    /// True when any money cell is too large to be summed safely.
    pub fn exceeds_range(&self) -> bool {
        SessionCategory::ALL
            .iter()
            .map(|c| self.declared_text(*c))
            .chain([self.metered_amount.as_str(), self.products_amount.as_str()])
            .any(quantity::money_exceeds_range)
    }

    pub fn has_attendant(&self) -> bool {
        self.attendant_id.is_some()
    }

    /// Debit plus credit card, as stored on the session row.
    pub fn card_total(&self) -> Decimal {
        self.declared(SessionCategory::DebitCard)
            .saturating_add(self.declared(SessionCategory::CreditCard))
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Sum of the six declared categories.
pub fn total_declared(session: &AttendantSession) -> Decimal {
    SessionCategory::ALL
        .iter()
        .map(|c| session.declared(*c))
        .fold(Decimal::ZERO, Decimal::saturating_add)
}

/// The metered amount when one was supplied, otherwise what was declared.
pub fn verified_amount(session: &AttendantSession) -> Decimal {
    let metered = session.metered();
    if metered > Decimal::ZERO {
        metered
    } else {
        total_declared(session)
    }
}

/// Metered minus declared; zero without a metered amount.
pub fn difference(session: &AttendantSession) -> Decimal {
    let metered = session.metered();
    if metered > Decimal::ZERO {
        metered.saturating_sub(total_declared(session))
    } else {
        Decimal::ZERO
    }
}

/// Merge sessions received from the external channel into the working set.
/// An incoming session replaces the one with the same `temp_id`; unknown
/// ones are appended.
pub fn merge_external(working: &mut Vec<AttendantSession>, incoming: Vec<AttendantSession>) {
    for session in incoming {
        match working.iter_mut().find(|s| s.temp_id == session.temp_id) {
            Some(existing) => *existing = session,
            None => working.push(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn declared_session() -> AttendantSession {
        let mut s = AttendantSession::new_local();
        s.attendant_id = Some(7);
        s.cash = "R$ 150,00".into();
        s.instant_transfer = "100".into();
        s.debit_card = "47,25".into();
        s
    }

    #[test]
    fn test_declared_session_without_meter() {
        let s = declared_session();
        assert_eq!(total_declared(&s), dec("297.25"));
        assert_eq!(verified_amount(&s), dec("297.25"));
        assert_eq!(difference(&s), Decimal::ZERO);
    }

    #[test]
    fn test_metered_amount_drives_verification() {
        let mut s = declared_session();
        s.metered_amount = "310".into();
        assert_eq!(verified_amount(&s), dec("310"));
        assert_eq!(difference(&s), dec("12.75"));

        s.metered_amount = "0,00".into();
        assert_eq!(verified_amount(&s), dec("297.25"));
        assert_eq!(difference(&s), Decimal::ZERO);
    }

    #[test]
    fn test_products_are_not_declared_money() {
        let mut s = declared_session();
        s.products_amount = "25".into();
        assert_eq!(total_declared(&s), dec("297.25"));
        assert_eq!(s.products(), dec("25"));
    }

    #[test]
    fn test_oversized_cells_are_out_of_range() {
        let mut s = declared_session();
        assert!(!s.exceeds_range());

        s.cash = "70000000000000000000000000000".into();
        s.instant_transfer = s.cash.clone();
        assert!(s.exceeds_range());
        assert_eq!(total_declared(&s), Decimal::MAX);

        let mut s = declared_session();
        s.products_amount = "R$ 1.000.000.000.000.000,00".into();
        assert!(s.exceeds_range());
    }

    #[test]
    fn test_card_total() {
        let mut s = declared_session();
        s.credit_card = "52,75".into();
        assert_eq!(s.card_total(), dec("100"));
    }

    #[test]
    fn test_field_accessors_cover_every_cell() {
        let mut s = AttendantSession::new_local();
        for (i, category) in SessionCategory::ALL.iter().enumerate() {
            *s.field_mut(SessionField::Declared(*category)) = format!("{}", i + 1);
        }
        *s.field_mut(SessionField::Metered) = "99".into();
        assert_eq!(s.field(SessionField::Declared(SessionCategory::Voucher)), "6");
        assert_eq!(total_declared(&s), dec("21"));
        assert_eq!(s.field(SessionField::Metered), "99");
    }

    #[test]
    fn test_merge_external_replaces_by_correlation_key() {
        let local = AttendantSession::new_local();
        let mut working = vec![local.clone()];

        let mut replacement = AttendantSession::with_origin(
            local.temp_id.clone(),
            SessionOrigin::ExternalSync { submitted_at: None },
        );
        replacement.cash = "80".into();
        let fresh = AttendantSession::with_origin(
            "ext-42".into(),
            SessionOrigin::ExternalSync {
                submitted_at: Some(Utc::now()),
            },
        );

        merge_external(&mut working, vec![replacement, fresh]);
        assert_eq!(working.len(), 2);
        assert_eq!(working[0].cash, "80");
        assert!(matches!(working[0].origin, SessionOrigin::ExternalSync { .. }));
        assert_eq!(working[1].temp_id, "ext-42");
    }

    #[test]
    fn test_origin_serializes_as_tagged_variant() {
        let json = serde_json::to_value(SessionOrigin::Stored { session_id: 3 }).unwrap();
        assert_eq!(json["kind"], "stored");
        assert_eq!(json["sessionId"], 3);
    }
}
