use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use rust_decimal::Decimal;

use reliefops_core::{DonationId, ExpectedVersion, RequestId, ResourceId};
use reliefops_inventory::{
    Donation, DonationAcknowledgment, ResourceInventoryTransaction, ResourceRequest,
    ResourceSnapshot, StatusHistoryEntry,
};

use super::query::{
    DonationFilter, Pagination, RequestFilter, RequestOrder, ResourceFilter, TransactionFilter,
    TransactionPage,
};
use super::r#trait::{ChangeSet, LedgerStore, StoreError, Versioned};

#[derive(Debug, Default)]
struct Tables {
    resources: HashMap<ResourceId, ResourceSnapshot>,
    /// Commit order.
    transactions: Vec<ResourceInventoryTransaction>,
    transaction_ids: HashSet<reliefops_core::TransactionId>,
    requests: HashMap<RequestId, ResourceRequest>,
    /// Commit order.
    history: Vec<StatusHistoryEntry>,
    donations: HashMap<DonationId, Donation>,
    acknowledgments: HashMap<DonationId, DonationAcknowledgment>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev. A single write lock makes every commit atomic and
/// serializes it against all others.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

fn check_expected(
    kind: &str,
    id: impl core::fmt::Display,
    expected: ExpectedVersion,
    current: Option<u64>,
) -> Result<(), StoreError> {
    let current = current.unwrap_or(0);
    if !expected.matches(current) {
        return Err(StoreError::Concurrency(format!(
            "{kind} {id}: expected {expected:?}, found {current}"
        )));
    }
    Ok(())
}

fn check_resource_row(row: &ResourceSnapshot) -> Result<(), StoreError> {
    if row.available_quantity < Decimal::ZERO || row.available_quantity > row.total_quantity {
        return Err(StoreError::Integrity(format!(
            "resource {}: available {} outside 0..={}",
            row.id, row.available_quantity, row.total_quantity
        )));
    }
    Ok(())
}

fn check_request_row(row: &ResourceRequest) -> Result<(), StoreError> {
    if row.quantity_fulfilled < Decimal::ZERO || row.quantity_fulfilled > row.quantity_requested {
        return Err(StoreError::Integrity(format!(
            "request {}: quantity_fulfilled {} outside 0..={}",
            row.id, row.quantity_fulfilled, row.quantity_requested
        )));
    }
    Ok(())
}

impl Tables {
    fn validate(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        for Versioned { row, expected } in &changes.resources {
            check_expected(
                "resource",
                row.id,
                *expected,
                self.resources.get(&row.id).map(|r| r.version),
            )?;
            check_resource_row(row)?;
        }
        for Versioned { row, expected } in &changes.requests {
            check_expected(
                "request",
                row.id,
                *expected,
                self.requests.get(&row.id).map(|r| r.version),
            )?;
            check_request_row(row)?;
        }
        for Versioned { row, expected } in &changes.donations {
            check_expected(
                "donation",
                row.id,
                *expected,
                self.donations.get(&row.id).map(|d| d.version),
            )?;
        }

        let mut batch_ids = HashSet::new();
        for tx in &changes.transactions {
            if self.transaction_ids.contains(&tx.id) || !batch_ids.insert(tx.id) {
                return Err(StoreError::Integrity(format!("duplicate transaction {}", tx.id)));
            }
            let known = self.resources.contains_key(&tx.resource_id)
                || changes.resources.iter().any(|w| w.row.id == tx.resource_id);
            if !known {
                return Err(StoreError::Integrity(format!(
                    "transaction {} references unknown resource {}",
                    tx.id, tx.resource_id
                )));
            }
        }

        for entry in &changes.history {
            let known = self.requests.contains_key(&entry.request_id)
                || changes.requests.iter().any(|w| w.row.id == entry.request_id);
            if !known {
                return Err(StoreError::Integrity(format!(
                    "history {} references unknown request {}",
                    entry.id, entry.request_id
                )));
            }
        }

        for ack in &changes.acknowledgments {
            let known = self.donations.contains_key(&ack.donation_id)
                || changes.donations.iter().any(|w| w.row.id == ack.donation_id);
            if !known {
                return Err(StoreError::Integrity(format!(
                    "acknowledgment references unknown donation {}",
                    ack.donation_id
                )));
            }
        }

        Ok(())
    }

    fn apply(&mut self, changes: ChangeSet) {
        for w in changes.resources {
            self.resources.insert(w.row.id, w.row);
        }
        for w in changes.requests {
            self.requests.insert(w.row.id, w.row);
        }
        for w in changes.donations {
            self.donations.insert(w.row.id, w.row);
        }
        for tx in changes.transactions {
            self.transaction_ids.insert(tx.id);
            self.transactions.push(tx);
        }
        self.history.extend(changes.history);
        for mut ack in changes.acknowledgments {
            if let Some(existing) = self.acknowledgments.get(&ack.donation_id) {
                ack.acknowledged_at = existing.acknowledged_at;
            }
            self.acknowledgments.insert(ack.donation_id, ack);
        }
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load_resource(&self, id: ResourceId) -> Result<Option<ResourceSnapshot>, StoreError> {
        Ok(self.read()?.resources.get(&id).cloned())
    }

    async fn list_resources(
        &self,
        filter: &ResourceFilter,
    ) -> Result<Vec<ResourceSnapshot>, StoreError> {
        let tables = self.read()?;
        let mut rows: Vec<ResourceSnapshot> = tables
            .resources
            .values()
            .filter(|r| filter.category.is_none_or(|c| r.category == c))
            .filter(|r| filter.is_active.is_none_or(|a| r.is_active == a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.category.as_str(), &a.name, a.id).cmp(&(b.category.as_str(), &b.name, b.id))
        });
        Ok(rows)
    }

    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<TransactionPage, StoreError> {
        let tables = self.read()?;
        let mut matching: Vec<&ResourceInventoryTransaction> = tables
            .transactions
            .iter()
            .rev()
            .filter(|tx| filter.matches(tx))
            .collect();
        // Stable: equal timestamps keep newest-commit-first.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();

        Ok(TransactionPage::new(page, total, pagination))
    }

    async fn resource_ledger(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<ResourceInventoryTransaction>, StoreError> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .filter(|tx| tx.resource_id == resource_id)
            .cloned()
            .collect())
    }

    async fn load_request(&self, id: RequestId) -> Result<Option<ResourceRequest>, StoreError> {
        Ok(self.read()?.requests.get(&id).cloned())
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ResourceRequest>, StoreError> {
        let tables = self.read()?;
        let mut rows: Vec<ResourceRequest> = tables
            .requests
            .values()
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| filter.priority.is_none_or(|p| r.priority == p))
            .filter(|r| filter.camp_id.is_none_or(|c| r.camp_id == c))
            .filter(|r| filter.resource_id.is_none_or(|id| r.resource_id == id))
            .cloned()
            .collect();

        match filter.order {
            RequestOrder::Newest => {
                rows.sort_by(|a, b| (b.request_date, b.id).cmp(&(a.request_date, a.id)))
            }
            RequestOrder::Triage => rows.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.needed_by.cmp(&b.needed_by))
                    .then(a.id.cmp(&b.id))
            }),
            RequestOrder::NeededBy => rows.sort_by(|a, b| (a.needed_by, a.id).cmp(&(b.needed_by, b.id))),
        }

        Ok(rows)
    }

    async fn request_history(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        Ok(self
            .read()?
            .history
            .iter()
            .filter(|h| h.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn load_donation(&self, id: DonationId) -> Result<Option<Donation>, StoreError> {
        Ok(self.read()?.donations.get(&id).cloned())
    }

    async fn list_donations(&self, filter: &DonationFilter) -> Result<Vec<Donation>, StoreError> {
        let tables = self.read()?;
        let mut rows: Vec<Donation> = tables
            .donations
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.donation_date, b.id).cmp(&(a.donation_date, a.id)));
        Ok(rows)
    }

    async fn load_acknowledgment(
        &self,
        donation_id: DonationId,
    ) -> Result<Option<DonationAcknowledgment>, StoreError> {
        Ok(self.read()?.acknowledgments.get(&donation_id).cloned())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        tables.validate(&changes)?;
        tables.apply(changes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reliefops_core::TransactionId;
    use reliefops_inventory::{ResourceCategory, ResourceUnit, TransactionType};

    fn snapshot(version: u64, total: i64, available: i64) -> ResourceSnapshot {
        ResourceSnapshot {
            id: ResourceId::new(),
            name: "Water".to_string(),
            category: ResourceCategory::Water,
            description: String::new(),
            unit: ResourceUnit::L,
            total_quantity: Decimal::from(total),
            available_quantity: Decimal::from(available),
            is_active: true,
            created_at: Utc::now(),
            version,
        }
    }

    fn row(resource_id: ResourceId, delta: i64) -> ResourceInventoryTransaction {
        ResourceInventoryTransaction {
            id: TransactionId::new(),
            resource_id,
            transaction_type: TransactionType::Add,
            quantity_delta: Decimal::from(delta),
            reason: String::new(),
            related_request: None,
            related_donation_item: None,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stale_update_is_a_concurrency_error_and_writes_nothing() {
        let store = InMemoryLedgerStore::new();
        let created = snapshot(1, 10, 10);
        let id = created.id;
        store
            .commit(ChangeSet {
                resources: vec![Versioned::insert(created.clone())],
                ..Default::default()
            })
            .await
            .unwrap();

        let mut stale = created.clone();
        stale.version = 2;
        stale.total_quantity = Decimal::from(20);
        stale.available_quantity = Decimal::from(20);
        let err = store
            .commit(ChangeSet {
                resources: vec![Versioned::update(stale, 0)],
                transactions: vec![row(id, 10)],
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Concurrency(_)));
        assert_eq!(store.load_resource(id).await.unwrap(), Some(created));
        assert!(store.resource_ledger(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rows_breaking_quantity_bounds_are_rejected() {
        let store = InMemoryLedgerStore::new();
        let err = store
            .commit(ChangeSet {
                resources: vec![Versioned::insert(snapshot(1, 5, 6))],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn orphan_transaction_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let err = store
            .commit(ChangeSet {
                transactions: vec![row(ResourceId::new(), 1)],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn acknowledgment_of_unknown_donation_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let err = store
            .commit(ChangeSet {
                acknowledgments: vec![DonationAcknowledgment {
                    donation_id: DonationId::new(),
                    text: "Thanks".to_string(),
                    acknowledged_by: None,
                    acknowledged_at: Utc::now(),
                }],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn transactions_list_newest_first_with_pagination() {
        let store = InMemoryLedgerStore::new();
        let resource = snapshot(1, 3, 3);
        let id = resource.id;
        let rows: Vec<_> = (1..=3).map(|n| row(id, n)).collect();
        store
            .commit(ChangeSet {
                resources: vec![Versioned::insert(resource)],
                transactions: rows.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        let page = store
            .query_transactions(
                &TransactionFilter {
                    resource_id: Some(id),
                    ..Default::default()
                },
                Pagination::new(Some(2), None),
            )
            .await
            .unwrap();

        assert_eq!(page.total, 3);
        assert!(page.has_more);
        assert_eq!(page.transactions[0].id, rows[2].id);
        assert_eq!(page.transactions[1].id, rows[1].id);
    }
}
