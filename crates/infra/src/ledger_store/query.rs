//! Read-side query types for the ledger store.
//!
//! Listings are filtered with optional criteria and transaction listings are
//! paginated by default.

use serde::{Deserialize, Serialize};

use reliefops_core::{CampId, RequestId, ResourceId, UserId};
use reliefops_inventory::{
    Donation, DonationStatus, RequestPriority, RequestStatus, ResourceCategory, ResourceInventoryTransaction, TransactionType,
};

/// Pagination parameters for transaction listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Pagination {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Filter criteria for inventory transaction listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub resource_id: Option<ResourceId>,
    pub transaction_type: Option<TransactionType>,
    pub related_request: Option<RequestId>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &ResourceInventoryTransaction) -> bool {
        self.resource_id.is_none_or(|id| tx.resource_id == id)
            && self.transaction_type.is_none_or(|t| tx.transaction_type == t)
            && self
                .related_request
                .is_none_or(|id| tx.related_request == Some(id))
    }
}

/// One page of transactions, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPage {
    pub transactions: Vec<ResourceInventoryTransaction>,
    /// Rows matching the filter across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl TransactionPage {
    pub fn new(
        transactions: Vec<ResourceInventoryTransaction>,
        total: u64,
        pagination: Pagination,
    ) -> Self {
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);
        Self {
            transactions,
            total,
            pagination,
            has_more,
        }
    }
}

/// Resource listing filter. Results are ordered by category, then name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub category: Option<ResourceCategory>,
    pub is_active: Option<bool>,
}

/// Ordering of request listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrder {
    /// `request_date` descending.
    #[default]
    Newest,
    /// Priority descending, then `needed_by` ascending.
    Triage,
    /// `needed_by` ascending.
    NeededBy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub priority: Option<RequestPriority>,
    pub camp_id: Option<CampId>,
    pub resource_id: Option<ResourceId>,
    pub order: RequestOrder,
}

/// Donation listing filter. Results are ordered by `donation_date` descending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationFilter {
    pub camp_id: Option<CampId>,
    pub created_by: Option<UserId>,
    pub status: Option<DonationStatus>,
}

impl DonationFilter {
    pub fn matches(&self, donation: &Donation) -> bool {
        self.camp_id.is_none_or(|id| donation.camp_id == Some(id))
            && self
                .created_by
                .is_none_or(|id| donation.created_by == Some(id))
            && self.status.is_none_or(|s| donation.status == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_caps() {
        assert_eq!(Pagination::default().limit, 50);
        assert_eq!(Pagination::new(Some(5000), Some(3)).limit, 1000);
        assert_eq!(Pagination::new(Some(5000), Some(3)).offset, 3);
    }

    #[test]
    fn page_reports_more_rows() {
        let page = TransactionPage::new(vec![], 120, Pagination::new(Some(50), Some(50)));
        assert!(page.has_more);
        let last = TransactionPage::new(vec![], 100, Pagination::new(Some(50), Some(50)));
        assert!(!last.has_more);
    }
}
