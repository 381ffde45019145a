//! Register-level payment-method tallies.
//!
//! One entry per active payment method, created empty at load time from the
//! location's catalog. Card and wallet methods carry a processing fee, so
//! the net amount is what actually reaches the account.

use std::collections::BTreeMap;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::quantity;
use crate::store::{PaymentMethod, ReceiptRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodEntry {
    pub payment_method_id: i64,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    pub fee_percent: Decimal,
    /// Money text as typed; empty until the operator fills it in.
    #[serde(default)]
    pub amount: String,
}

impl PaymentMethodEntry {
    pub fn from_method(method: &PaymentMethod) -> Self {
        Self {
            payment_method_id: method.id,
            name: method.name.clone(),
            kind: method.kind.clone(),
            fee_percent: method.fee_percent,
            amount: String::new(),
        }
    }

    pub fn amount_value(&self) -> Decimal {
        quantity::parse_currency(&self.amount)
    }
}

/// Gross, fee and net sums over the register entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTotals {
    pub gross: Decimal,
    pub fees: Decimal,
    pub net: Decimal,
}

pub fn fee_amount(entry: &PaymentMethodEntry) -> Decimal {
    entry.amount_value().saturating_mul(entry.fee_percent) / Decimal::ONE_HUNDRED
}

/// `amount × (1 − feePercent/100)`.
pub fn net_amount(entry: &PaymentMethodEntry) -> Decimal {
    entry
        .amount_value()
        .saturating_mul(Decimal::ONE.saturating_sub(entry.fee_percent / Decimal::ONE_HUNDRED))
}

pub fn totals(entries: &[PaymentMethodEntry]) -> PaymentTotals {
    entries.iter().fold(PaymentTotals::default(), |acc, entry| PaymentTotals {
        gross: acc.gross.saturating_add(entry.amount_value()),
        fees: acc.fees.saturating_add(fee_amount(entry)),
        net: acc.net.saturating_add(net_amount(entry)),
    })
}

/// Empty entries for every method in the catalog, in catalog order.
pub fn entries_from_catalog(methods: &[PaymentMethod]) -> Vec<PaymentMethodEntry> {
    methods.iter().map(PaymentMethodEntry::from_method).collect()
}

/// Fill entries with the receipts already saved for a closing being edited.
/// Several receipts for the same method are summed.
pub fn apply_saved_receipts(entries: &mut [PaymentMethodEntry], receipts: &[ReceiptRecord]) {
    let mut saved: BTreeMap<i64, Decimal> = BTreeMap::new();
    for receipt in receipts {
        let total = saved.entry(receipt.payment_method_id).or_default();
        *total = total.saturating_add(receipt.amount);
    }
    for entry in entries.iter_mut() {
        if let Some(amount) = saved.get(&entry.payment_method_id) {
            entry.amount = quantity::format_currency(*amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn entry(id: i64, fee: &str, amount: &str) -> PaymentMethodEntry {
        PaymentMethodEntry {
            payment_method_id: id,
            name: format!("method {id}"),
            kind: "card".into(),
            fee_percent: dec(fee),
            amount: amount.into(),
        }
    }

    #[test]
    fn test_net_amount_applies_fee() {
        assert_eq!(net_amount(&entry(1, "3", "100")), dec("97.00"));
        assert_eq!(fee_amount(&entry(1, "3", "100")), dec("3"));
        assert_eq!(net_amount(&entry(1, "0", "R$ 50,00")), dec("50"));
    }

    #[test]
    fn test_totals_ignore_empty_and_garbage_amounts() {
        let entries = vec![
            entry(1, "3", "100"),
            entry(2, "1.5", ""),
            entry(3, "2", "abc"),
            entry(4, "0", "R$ 1.000,00"),
        ];
        let t = totals(&entries);
        assert_eq!(t.gross, dec("1100"));
        assert_eq!(t.fees, dec("3"));
        assert_eq!(t.net, dec("1097"));
    }

    #[test]
    fn test_saved_receipts_fill_matching_entries() {
        let methods = vec![
            PaymentMethod {
                id: 1,
                name: "Dinheiro".into(),
                kind: "cash".into(),
                fee_percent: Decimal::ZERO,
                active: true,
            },
            PaymentMethod {
                id: 2,
                name: "Pix".into(),
                kind: "pix".into(),
                fee_percent: dec("0.99"),
                active: true,
            },
        ];
        let mut entries = entries_from_catalog(&methods);
        assert!(entries.iter().all(|e| e.amount.is_empty()));

        let receipts = vec![
            ReceiptRecord {
                id: 10,
                closing_id: 1,
                payment_method_id: 2,
                amount: dec("120.5"),
                observations: None,
            },
            ReceiptRecord {
                id: 11,
                closing_id: 1,
                payment_method_id: 2,
                amount: dec("30"),
                observations: None,
            },
        ];
        apply_saved_receipts(&mut entries, &receipts);
        assert_eq!(entries[0].amount, "");
        assert_eq!(entries[1].amount, "R$ 150,50");
    }
}
