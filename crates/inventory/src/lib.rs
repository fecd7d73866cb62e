//! Inventory ledger domain module.
//!
//! Business rules for relief resources, their append-only transaction log,
//! camp requests and donation intake, implemented as deterministic domain
//! logic (no IO, no HTTP, no storage).

mod choices;

pub mod donation;
pub mod quantity;
pub mod request;
pub mod resource;
pub mod transaction;

pub use donation::{
    DEFAULT_ACKNOWLEDGMENT_TEXT, Donation, DonationAcknowledgment, DonationCredit, DonationDecision, DonationEvent, DonationItem, DonationRegistered,
    DonationStatus, DonationStatusChanged, DonorType, NewDonation,
};
pub use request::{
    NewResourceRequest, RequestCreated, RequestEvent, RequestPriority, RequestStatus,
    RequestStatusChanged, ResourceRequest, StatusChange, StatusHistoryEntry, TransitionMode,
    REQUEST_CREATED_NOTE,
};
pub use resource::{
    AdjustInventory, CreateResource, DEFAULT_ADJUSTMENT_REASON, INITIAL_CREATION_REASON,
    InventoryAdjusted, Resource, ResourceCategory, ResourceCommand, ResourceCreated,
    ResourceDetailsPatch, ResourceDetailsUpdated, ResourceEvent, ResourceSnapshot, ResourceUnit,
    ShortfallPolicy, UpdateResourceDetails,
};
pub use transaction::{LedgerTotals, ResourceInventoryTransaction, TransactionLink, TransactionType};
