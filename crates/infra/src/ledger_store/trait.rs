use std::sync::Arc;

use thiserror::Error;

use reliefops_core::{DonationId, ExpectedVersion, RequestId, ResourceId};
use reliefops_inventory::{
    Donation, DonationAcknowledgment, ResourceInventoryTransaction, ResourceRequest, ResourceSnapshot, StatusHistoryEntry,
};

use super::query::{
    DonationFilter, Pagination, RequestFilter, ResourceFilter, TransactionFilter, TransactionPage,
};

/// Ledger store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors
/// (validation, invariants).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A version expectation did not hold; the caller may reload and retry.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// A row would break a storage-level constraint (quantity bounds, references).
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Backend failure (connection, pool, lock poisoning).
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored row could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A row write guarded by an optimistic concurrency expectation.
///
/// `Exact(0)` inserts a new row, `Exact(n)` updates a row currently at version
/// `n`, `Any` upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub row: T,
    pub expected: ExpectedVersion,
}

impl<T> Versioned<T> {
    pub fn insert(row: T) -> Self {
        Self {
            row,
            expected: ExpectedVersion::Exact(0),
        }
    }

    pub fn update(row: T, loaded_version: u64) -> Self {
        Self {
            row,
            expected: ExpectedVersion::Exact(loaded_version),
        }
    }
}

/// Everything one ledger operation writes. Committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub resources: Vec<Versioned<ResourceSnapshot>>,
    pub transactions: Vec<ResourceInventoryTransaction>,
    pub requests: Vec<Versioned<ResourceRequest>>,
    pub history: Vec<StatusHistoryEntry>,
    /// Items are written with the donation on insert and never change afterwards.
    pub donations: Vec<Versioned<Donation>>,
    /// Upserted per donation; an existing row keeps its `acknowledged_at`.
    pub acknowledgments: Vec<DonationAcknowledgment>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
            && self.transactions.is_empty()
            && self.requests.is_empty()
            && self.history.is_empty()
            && self.donations.is_empty()
            && self.acknowledgments.is_empty()
    }
}

/// Persistence boundary of the inventory ledger.
///
/// Implementations must:
/// - check every `Versioned` expectation of a `ChangeSet` and apply all of its
///   rows in one atomic unit, or none of them
/// - treat transaction and history rows as insert-only
/// - reject rows breaking `0 <= available <= total` or
///   `quantity_fulfilled <= quantity_requested` with `StoreError::Integrity`
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_resource(&self, id: ResourceId) -> Result<Option<ResourceSnapshot>, StoreError>;

    /// Resources matching `filter`, ordered by category then name.
    async fn list_resources(
        &self,
        filter: &ResourceFilter,
    ) -> Result<Vec<ResourceSnapshot>, StoreError>;

    /// Transactions matching `filter`, newest first.
    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<TransactionPage, StoreError>;

    /// Full ledger of one resource in commit order.
    async fn resource_ledger(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<ResourceInventoryTransaction>, StoreError>;

    async fn load_request(&self, id: RequestId) -> Result<Option<ResourceRequest>, StoreError>;

    async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ResourceRequest>, StoreError>;

    /// Status history of a request in chronological order.
    async fn request_history(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError>;

    async fn load_donation(&self, id: DonationId) -> Result<Option<Donation>, StoreError>;

    /// Donations matching `filter`, newest `donation_date` first.
    async fn list_donations(&self, filter: &DonationFilter) -> Result<Vec<Donation>, StoreError>;

    async fn load_acknowledgment(
        &self,
        donation_id: DonationId,
    ) -> Result<Option<DonationAcknowledgment>, StoreError>;

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn load_resource(&self, id: ResourceId) -> Result<Option<ResourceSnapshot>, StoreError> {
        (**self).load_resource(id).await
    }

    async fn list_resources(
        &self,
        filter: &ResourceFilter,
    ) -> Result<Vec<ResourceSnapshot>, StoreError> {
        (**self).list_resources(filter).await
    }

    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<TransactionPage, StoreError> {
        (**self).query_transactions(filter, pagination).await
    }

    async fn resource_ledger(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<ResourceInventoryTransaction>, StoreError> {
        (**self).resource_ledger(resource_id).await
    }

    async fn load_request(&self, id: RequestId) -> Result<Option<ResourceRequest>, StoreError> {
        (**self).load_request(id).await
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ResourceRequest>, StoreError> {
        (**self).list_requests(filter).await
    }

    async fn request_history(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        (**self).request_history(request_id).await
    }

    async fn load_donation(&self, id: DonationId) -> Result<Option<Donation>, StoreError> {
        (**self).load_donation(id).await
    }

    async fn list_donations(&self, filter: &DonationFilter) -> Result<Vec<Donation>, StoreError> {
        (**self).list_donations(filter).await
    }

    async fn load_acknowledgment(
        &self,
        donation_id: DonationId,
    ) -> Result<Option<DonationAcknowledgment>, StoreError> {
        (**self).load_acknowledgment(donation_id).await
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        (**self).commit(changes).await
    }
}
