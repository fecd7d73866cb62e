use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use sqlx::PgPool;
use tracing::info;

use reliefops_core::{RequestId, ResourceId};
use reliefops_events::{EventEnvelope, InMemoryEventBus};
use reliefops_infra::{
    InventoryLedger, LedgerConfig, Pagination, PostgresLedgerStore, TransactionFilter,
};
use reliefops_inventory::TransactionType;

const SCHEMA: &str = include_str!("../../infra/migrations/0001_inventory_ledger.sql");

/// Events raised by the CLI have no subscribers; the bus only satisfies the ledger.
pub type CliLedger =
    InventoryLedger<PostgresLedgerStore, Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>>;

#[derive(Debug, Args)]
pub struct TransactionsArgs {
    #[arg(long)]
    pub resource_id: Option<ResourceId>,

    /// add, remove, adjust, fulfillment or donation.
    #[arg(long = "type")]
    pub transaction_type: Option<TransactionType>,

    /// Rows linked to this request.
    #[arg(long)]
    pub request_id: Option<RequestId>,

    /// Page size (default 50, max 1000).
    #[arg(long)]
    pub limit: Option<u32>,

    #[arg(long)]
    pub offset: Option<u32>,
}

pub fn ledger(pool: PgPool, config: LedgerConfig) -> CliLedger {
    InventoryLedger::new(
        PostgresLedgerStore::new(pool),
        Arc::new(InMemoryEventBus::new()),
        config,
    )
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("applying ledger schema")?;
    info!("ledger schema applied");
    Ok(())
}

pub async fn transactions(ledger: &CliLedger, args: TransactionsArgs) -> anyhow::Result<()> {
    let filter = TransactionFilter {
        resource_id: args.resource_id,
        transaction_type: args.transaction_type,
        related_request: args.request_id,
    };
    let page = ledger
        .list_transactions(&filter, Pagination::new(args.limit, args.offset))
        .await
        .context("listing transactions")?;

    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

/// Prints one report per resource; returns whether all were consistent.
pub async fn reconcile(ledger: &CliLedger, resource_id: Option<ResourceId>) -> anyhow::Result<bool> {
    let reports = match resource_id {
        Some(id) => vec![ledger.reconcile(id).await.context("reconciling resource")?],
        None => ledger.reconcile_all().await.context("reconciling resources")?,
    };

    let drifted = reports.iter().filter(|r| !r.consistent).count();
    info!(resources = reports.len(), drifted, "reconciliation finished");
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(drifted == 0)
}
