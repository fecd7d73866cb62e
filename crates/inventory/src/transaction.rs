//! The append-only inventory ledger row and the arithmetic it implies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use reliefops_core::{DonationItemId, RequestId, ResourceId, TransactionId, UserId};

use crate::choices::string_choices;

/// Why a resource's quantities changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Stock received; grows total and available.
    Add,
    /// Stock taken out of circulation; shrinks available.
    Remove,
    /// Signed correction of available stock (counts, spoilage, found stock).
    Adjust,
    /// Stock handed out to satisfy a camp's resource request.
    Fulfillment,
    /// Stock received through an accepted donation.
    Donation,
}

string_choices!(TransactionType, "transaction_type", {
    Add => "add",
    Remove => "remove",
    Adjust => "adjust",
    Fulfillment => "fulfillment",
    Donation => "donation",
});

impl TransactionType {
    /// Whether rows of this type also move `total_quantity`.
    pub fn affects_total(self) -> bool {
        matches!(self, TransactionType::Add | TransactionType::Donation)
    }
}

/// One immutable ledger row.
///
/// `quantity_delta` is the signed change applied to `available_quantity`; for
/// `add`/`donation` rows the same amount was added to `total_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInventoryTransaction {
    pub id: TransactionId,
    pub resource_id: ResourceId,
    pub transaction_type: TransactionType,
    pub quantity_delta: Decimal,
    pub reason: String,
    pub related_request: Option<RequestId>,
    pub related_donation_item: Option<DonationItemId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl ResourceInventoryTransaction {
    pub fn available_delta(&self) -> Decimal {
        self.quantity_delta
    }

    pub fn total_delta(&self) -> Decimal {
        if self.transaction_type.affects_total() {
            self.quantity_delta
        } else {
            Decimal::ZERO
        }
    }
}

/// Originating document of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionLink {
    #[default]
    None,
    Request(RequestId),
    DonationItem(DonationItemId),
}

impl TransactionLink {
    pub fn request(self) -> Option<RequestId> {
        match self {
            TransactionLink::Request(id) => Some(id),
            _ => None,
        }
    }

    pub fn donation_item(self) -> Option<DonationItemId> {
        match self {
            TransactionLink::DonationItem(id) => Some(id),
            _ => None,
        }
    }
}

/// Quantities implied by replaying a resource's ledger from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub total_quantity: Decimal,
    pub available_quantity: Decimal,
    pub transaction_count: usize,
}

impl LedgerTotals {
    pub fn replay<'a>(transactions: impl IntoIterator<Item = &'a ResourceInventoryTransaction>) -> Self {
        transactions
            .into_iter()
            .fold(Self::default(), |mut acc, tx| {
                acc.total_quantity += tx.total_delta();
                acc.available_quantity += tx.available_delta();
                acc.transaction_count += 1;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(transaction_type: TransactionType, delta: i64) -> ResourceInventoryTransaction {
        ResourceInventoryTransaction {
            id: TransactionId::new(),
            resource_id: ResourceId::new(),
            transaction_type,
            quantity_delta: Decimal::from(delta),
            reason: String::new(),
            related_request: None,
            related_donation_item: None,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn replay_separates_total_and_available_moves() {
        let rows = vec![
            row(TransactionType::Add, 100),
            row(TransactionType::Donation, 20),
            row(TransactionType::Remove, -30),
            row(TransactionType::Fulfillment, -10),
            row(TransactionType::Adjust, 5),
        ];

        let totals = LedgerTotals::replay(&rows);
        assert_eq!(totals.total_quantity, Decimal::from(120));
        assert_eq!(totals.available_quantity, Decimal::from(85));
        assert_eq!(totals.transaction_count, 5);
    }

    #[test]
    fn transaction_type_parses_wire_names() {
        assert_eq!("fulfillment".parse::<TransactionType>().unwrap(), TransactionType::Fulfillment);
        assert!("restock".parse::<TransactionType>().is_err());
        assert_eq!(
            serde_json::to_string(&TransactionType::Donation).unwrap(),
            "\"donation\""
        );
    }
}
