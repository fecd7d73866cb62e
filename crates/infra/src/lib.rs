//! Infrastructure layer: ledger service, stores, configuration.

pub mod config;
pub mod ledger;
pub mod ledger_store;
pub mod reconcile;


pub use config::{ConfigError, LedgerConfig};
pub use ledger::{
    AdjustInventoryInput, AdjustmentOutcome, CreateRequestInput, CreateResourceInput,
    DonationItemInput, DonationUpdate, InventoryLedger, LedgerError, RegisterDonationInput,
    RequestUpdate, ResourceDetail,
};
pub use ledger_store::{
    ChangeSet, DonationFilter, InMemoryLedgerStore, LedgerStore, Pagination, PostgresLedgerStore, RequestFilter,
    RequestOrder, ResourceFilter, StoreError, TransactionFilter, TransactionPage, Versioned,
};
pub use reconcile::ReconcileReport;
