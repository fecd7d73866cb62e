//! Persistence boundary of the inventory ledger.
//!
//! Resources, requests and donations are versioned rows; ledger transactions and
//! request status history are insert-only. One ledger operation commits one
//! `ChangeSet`, atomically.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use query::{
    DonationFilter, Pagination, RequestFilter, RequestOrder, ResourceFilter, TransactionFilter, TransactionPage,
};
pub use r#trait::{ChangeSet, LedgerStore, StoreError, Versioned};
