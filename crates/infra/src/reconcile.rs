//! Rebuild resource quantities from the transaction log and compare them with
//! the stored row.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use reliefops_core::ResourceId;
use reliefops_inventory::{LedgerTotals, ResourceInventoryTransaction, ResourceSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub resource_id: ResourceId,
    pub name: String,
    pub stored_total: Decimal,
    pub stored_available: Decimal,
    pub ledger_total: Decimal,
    pub ledger_available: Decimal,
    pub transaction_count: usize,
    pub consistent: bool,
}

impl ReconcileReport {
    pub fn build(resource: &ResourceSnapshot, ledger: &[ResourceInventoryTransaction]) -> Self {
        let totals = LedgerTotals::replay(ledger);
        let consistent = totals.total_quantity == resource.total_quantity
            && totals.available_quantity == resource.available_quantity;

        Self {
            resource_id: resource.id,
            name: resource.name.clone(),
            stored_total: resource.total_quantity,
            stored_available: resource.available_quantity,
            ledger_total: totals.total_quantity,
            ledger_available: totals.available_quantity,
            transaction_count: totals.transaction_count,
            consistent,
        }
    }

    /// Stored minus replayed, as `(total, available)`.
    pub fn drift(&self) -> (Decimal, Decimal) {
        (
            self.stored_total - self.ledger_total,
            self.stored_available - self.ledger_available,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reliefops_core::TransactionId;
    use reliefops_inventory::{ResourceCategory, ResourceUnit, TransactionType};

    fn resource(total: i64, available: i64) -> ResourceSnapshot {
        ResourceSnapshot {
            id: ResourceId::new(),
            name: "Blankets".to_string(),
            category: ResourceCategory::Shelter,
            description: String::new(),
            unit: ResourceUnit::Piece,
            total_quantity: Decimal::from(total),
            available_quantity: Decimal::from(available),
            is_active: true,
            created_at: Utc::now(),
            version: 3,
        }
    }

    fn row(resource_id: ResourceId, transaction_type: TransactionType, delta: i64) -> ResourceInventoryTransaction {
        ResourceInventoryTransaction {
            id: TransactionId::new(),
            resource_id,
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
    fn matching_ledger_is_consistent() {
        let r = resource(100, 70);
        let ledger = vec![
            row(r.id, TransactionType::Add, 100),
            row(r.id, TransactionType::Fulfillment, -30),
        ];
        let report = ReconcileReport::build(&r, &ledger);
        assert!(report.consistent);
        assert_eq!(report.drift(), (Decimal::ZERO, Decimal::ZERO));
    }

    #[test]
    fn missing_row_shows_as_drift() {
        let r = resource(100, 70);
        let ledger = vec![row(r.id, TransactionType::Add, 100)];
        let report = ReconcileReport::build(&r, &ledger);
        assert!(!report.consistent);
        assert_eq!(report.drift(), (Decimal::ZERO, Decimal::from(-30)));
    }
}
