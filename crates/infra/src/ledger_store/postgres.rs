//! Postgres-backed ledger store.
//!
//! Schema: `migrations/0001_inventory_ledger.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent insert of the same row |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Concurrency` | Lost a race against another commit |
//! | Database (other integrity class) | `23xxx` | `Integrity` | CHECK / foreign key / insert-only trigger |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | ColumnDecode / Decode | N/A | `Serialization` | Row could not be decoded |
//! | Other | N/A | `Storage` | Pool closed, network errors, etc. |
//!
//! A guarded `UPDATE ... WHERE version = $expected` touching zero rows is a
//! `Concurrency` error as well.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use reliefops_core::{
    CampId, DomainError, DonationId, DonationItemId, ExpectedVersion, HistoryId, RequestId,
    ResourceId, TransactionId, UserId,
};
use reliefops_inventory::{
    Donation, DonationAcknowledgment, DonationItem, ResourceInventoryTransaction, ResourceRequest, ResourceSnapshot,
    StatusHistoryEntry,
};

use super::query::{
    DonationFilter, Pagination, RequestFilter, RequestOrder, ResourceFilter, TransactionFilter, TransactionPage,
};
use super::r#trait::{ChangeSet, LedgerStore, StoreError, Versioned};

const RESOURCE_COLUMNS: &str = "id, name, category, description, unit, total_quantity, \
     available_quantity, is_active, created_at, version";

const TRANSACTION_COLUMNS: &str = "id, resource_id, transaction_type, quantity_delta, reason, \
     related_request, related_donation_item, created_by, created_at";

const REQUEST_COLUMNS: &str = "id, camp_id, resource_id, quantity_requested, quantity_fulfilled, \
     priority, status, requested_by, request_date, needed_by, reason, version";

const DONATION_COLUMNS: &str = "id, donor_name, donor_type, contact_email, contact_phone, \
     camp_id, status, created_by, donation_date, version";

const HISTORY_COLUMNS: &str =
    "id, request_id, previous_status, new_status, changed_by, note, changed_at";

/// Postgres-backed ledger store.
///
/// Every `commit` runs in one SQL transaction; rows are written in foreign-key
/// order (resources, requests, donations, then ledger, history and
/// acknowledgment rows).
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(
        skip(self, changes),
        fields(
            resources = changes.resources.len(),
            transactions = changes.transactions.len(),
            requests = changes.requests.len(),
            donations = changes.donations.len(),
            acknowledgments = changes.acknowledgments.len(),
            committed = tracing::field::Empty
        ),
        err
    )]
    async fn commit_changes(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let result = self.write_changes(&changes).await;
        Span::current().record("committed", result.is_ok());
        result
    }

    async fn write_changes(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for w in &changes.resources {
            write_resource(&mut tx, w).await?;
        }
        for w in &changes.requests {
            write_request(&mut tx, w).await?;
        }
        for w in &changes.donations {
            write_donation(&mut tx, w).await?;
        }
        for row in &changes.transactions {
            insert_transaction(&mut tx, row).await?;
        }
        for entry in &changes.history {
            insert_history(&mut tx, entry).await?;
        }
        for ack in &changes.acknowledgments {
            upsert_acknowledgment(&mut tx, ack).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn load_donation_items(&self, donation_id: DonationId) -> Result<Vec<DonationItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_id, quantity
            FROM donation_items
            WHERE donation_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(donation_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_donation_items", e))?;

        rows.iter()
            .map(|row| -> Result<DonationItem, StoreError> {
                Ok(DonationItem {
                    id: DonationItemId::from_uuid(get(row, "id")?),
                    resource_id: get::<Option<Uuid>>(row, "resource_id")?.map(ResourceId::from_uuid),
                    quantity: get(row, "quantity")?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(resource_id = %id), err)]
    async fn load_resource(&self, id: ResourceId) -> Result<Option<ResourceSnapshot>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_resource", e))?;

        row.as_ref().map(resource_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_resources(
        &self,
        filter: &ResourceFilter,
    ) -> Result<Vec<ResourceSnapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESOURCE_COLUMNS}
            FROM resources
            WHERE ($1::text IS NULL OR category = $1)
                AND ($2::boolean IS NULL OR is_active = $2)
            ORDER BY category ASC, name ASC, id ASC
            "#
        ))
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.is_active)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_resources", e))?;

        rows.iter().map(resource_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<TransactionPage, StoreError> {
        let resource_param: Option<Uuid> = filter.resource_id.map(|id| *id.as_uuid());
        let type_param: Option<&str> = filter.transaction_type.map(|t| t.as_str());
        let request_param: Option<Uuid> = filter.related_request.map(|id| *id.as_uuid());

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM resource_inventory_transactions
            WHERE ($1::uuid IS NULL OR resource_id = $1)
                AND ($2::text IS NULL OR transaction_type = $2)
                AND ($3::uuid IS NULL OR related_request = $3)
            "#,
        )
        .bind(resource_param)
        .bind(type_param)
        .bind(request_param)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_transactions", e))?;
        let total: i64 = get(&count_row, "total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM resource_inventory_transactions
            WHERE ($1::uuid IS NULL OR resource_id = $1)
                AND ($2::text IS NULL OR transaction_type = $2)
                AND ($3::uuid IS NULL OR related_request = $3)
            ORDER BY created_at DESC, seq DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(resource_param)
        .bind(type_param)
        .bind(request_param)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_transactions", e))?;

        let transactions = rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransactionPage::new(transactions, total as u64, pagination))
    }

    #[instrument(skip(self), fields(resource_id = %resource_id), err)]
    async fn resource_ledger(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<ResourceInventoryTransaction>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM resource_inventory_transactions
            WHERE resource_id = $1
            ORDER BY seq ASC
            "#
        ))
        .bind(resource_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resource_ledger", e))?;

        rows.iter().map(transaction_from_row).collect()
    }

    #[instrument(skip(self), fields(request_id = %id), err)]
    async fn load_request(&self, id: RequestId) -> Result<Option<ResourceRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM resource_requests WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_request", e))?;

        row.as_ref().map(request_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ResourceRequest>, StoreError> {
        let order_by = match filter.order {
            RequestOrder::Newest => "request_date DESC, id DESC",
            RequestOrder::Triage => {
                "CASE priority WHEN 'urgent' THEN 4 WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC, \
                 needed_by ASC, id ASC"
            }
            RequestOrder::NeededBy => "needed_by ASC, id ASC",
        };

        let rows = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM resource_requests
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR priority = $2)
                AND ($3::uuid IS NULL OR camp_id = $3)
                AND ($4::uuid IS NULL OR resource_id = $4)
            ORDER BY {order_by}
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.priority.map(|p| p.as_str()))
        .bind(filter.camp_id.map(|id| *id.as_uuid()))
        .bind(filter.resource_id.map(|id| *id.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_requests", e))?;

        rows.iter().map(request_from_row).collect()
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn request_history(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM resource_request_status_history
            WHERE request_id = $1
            ORDER BY seq ASC
            "#
        ))
        .bind(request_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("request_history", e))?;

        rows.iter().map(history_from_row).collect()
    }

    #[instrument(skip(self), fields(donation_id = %id), err)]
    async fn load_donation(&self, id: DonationId) -> Result<Option<Donation>, StoreError> {
        let row = sqlx::query(&format!("SELECT {DONATION_COLUMNS} FROM donations WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_donation", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items = self.load_donation_items(id).await?;
        donation_from_row(&row, items).map(Some)
    }

    #[instrument(skip(self), err)]
    async fn list_donations(&self, filter: &DonationFilter) -> Result<Vec<Donation>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DONATION_COLUMNS}
            FROM donations
            WHERE ($1::uuid IS NULL OR camp_id = $1)
                AND ($2::uuid IS NULL OR created_by = $2)
                AND ($3::text IS NULL OR status = $3)
            ORDER BY donation_date DESC, id DESC
            "#
        ))
        .bind(filter.camp_id.map(|id| *id.as_uuid()))
        .bind(filter.created_by.map(|id| *id.as_uuid()))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_donations", e))?;

        let mut donations = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = DonationId::from_uuid(get(row, "id")?);
            let items = self.load_donation_items(id).await?;
            donations.push(donation_from_row(row, items)?);
        }
        Ok(donations)
    }

    #[instrument(skip(self), fields(donation_id = %donation_id), err)]
    async fn load_acknowledgment(
        &self,
        donation_id: DonationId,
    ) -> Result<Option<DonationAcknowledgment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT donation_id, acknowledgment_text, acknowledged_by, acknowledged_at
            FROM donation_acknowledgments
            WHERE donation_id = $1
            "#,
        )
        .bind(donation_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_acknowledgment", e))?;

        row.as_ref()
            .map(|row| -> Result<DonationAcknowledgment, StoreError> {
                Ok(DonationAcknowledgment {
                    donation_id: DonationId::from_uuid(get(row, "donation_id")?),
                    text: get(row, "acknowledgment_text")?,
                    acknowledged_by: get::<Option<Uuid>>(row, "acknowledged_by")?
                        .map(UserId::from_uuid),
                    acknowledged_at: get(row, "acknowledged_at")?,
                })
            })
            .transpose()
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.commit_changes(changes).await
    }
}

fn concurrency_error(kind: &str, id: impl core::fmt::Display, expected: ExpectedVersion) -> StoreError {
    StoreError::Concurrency(format!("{kind} {id}: version is no longer {expected:?}"))
}

/// Fail with `Concurrency` when a guarded write touched no row.
fn ensure_written(
    rows_affected: u64,
    kind: &str,
    id: impl core::fmt::Display,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(concurrency_error(kind, id, expected));
    }
    Ok(())
}

async fn write_resource(
    tx: &mut Transaction<'_, Postgres>,
    w: &Versioned<ResourceSnapshot>,
) -> Result<(), StoreError> {
    let r = &w.row;
    let sql = match w.expected {
        ExpectedVersion::Exact(0) => {
            r#"
            INSERT INTO resources (id, name, category, description, unit, total_quantity,
                                   available_quantity, is_active, created_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#
        }
        ExpectedVersion::Exact(_) => {
            r#"
            UPDATE resources
            SET name = $2, category = $3, description = $4, unit = $5,
                total_quantity = $6, available_quantity = $7, is_active = $8,
                created_at = $9, version = $10
            WHERE id = $1 AND version = $11
            "#
        }
        ExpectedVersion::Any => {
            r#"
            INSERT INTO resources (id, name, category, description, unit, total_quantity,
                                   available_quantity, is_active, created_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name, category = EXCLUDED.category,
                description = EXCLUDED.description, unit = EXCLUDED.unit,
                total_quantity = EXCLUDED.total_quantity,
                available_quantity = EXCLUDED.available_quantity,
                is_active = EXCLUDED.is_active, version = EXCLUDED.version
            "#
        }
    };

    let mut query = sqlx::query(sql)
        .bind(r.id.as_uuid())
        .bind(&r.name)
        .bind(r.category.as_str())
        .bind(&r.description)
        .bind(r.unit.as_str())
        .bind(r.total_quantity)
        .bind(r.available_quantity)
        .bind(r.is_active)
        .bind(r.created_at)
        .bind(r.version as i64);
    if let ExpectedVersion::Exact(loaded @ 1..) = w.expected {
        query = query.bind(loaded as i64);
    }

    let result = query
        .execute(&mut **tx)
        .await
        .map_err(|e| map_write_error("write_resource", "resource", r.id, w.expected, e))?;
    ensure_written(result.rows_affected(), "resource", r.id, w.expected)
}

async fn write_request(
    tx: &mut Transaction<'_, Postgres>,
    w: &Versioned<ResourceRequest>,
) -> Result<(), StoreError> {
    let r = &w.row;
    let sql = match w.expected {
        ExpectedVersion::Exact(0) => {
            r#"
            INSERT INTO resource_requests (id, camp_id, resource_id, quantity_requested,
                quantity_fulfilled, priority, status, requested_by, request_date, needed_by,
                reason, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#
        }
        ExpectedVersion::Exact(_) => {
            r#"
            UPDATE resource_requests
            SET camp_id = $2, resource_id = $3, quantity_requested = $4,
                quantity_fulfilled = $5, priority = $6, status = $7, requested_by = $8,
                request_date = $9, needed_by = $10, reason = $11, version = $12
            WHERE id = $1 AND version = $13
            "#
        }
        ExpectedVersion::Any => {
            r#"
            INSERT INTO resource_requests (id, camp_id, resource_id, quantity_requested,
                quantity_fulfilled, priority, status, requested_by, request_date, needed_by,
                reason, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                quantity_fulfilled = EXCLUDED.quantity_fulfilled,
                priority = EXCLUDED.priority, status = EXCLUDED.status,
                needed_by = EXCLUDED.needed_by, reason = EXCLUDED.reason,
                version = EXCLUDED.version
            "#
        }
    };

    let mut query = sqlx::query(sql)
        .bind(r.id.as_uuid())
        .bind(r.camp_id.as_uuid())
        .bind(r.resource_id.as_uuid())
        .bind(r.quantity_requested)
        .bind(r.quantity_fulfilled)
        .bind(r.priority.as_str())
        .bind(r.status.as_str())
        .bind(r.requested_by.as_uuid())
        .bind(r.request_date)
        .bind(r.needed_by)
        .bind(&r.reason)
        .bind(r.version as i64);
    if let ExpectedVersion::Exact(loaded @ 1..) = w.expected {
        query = query.bind(loaded as i64);
    }

    let result = query
        .execute(&mut **tx)
        .await
        .map_err(|e| map_write_error("write_request", "request", r.id, w.expected, e))?;
    ensure_written(result.rows_affected(), "request", r.id, w.expected)
}

async fn write_donation(
    tx: &mut Transaction<'_, Postgres>,
    w: &Versioned<Donation>,
) -> Result<(), StoreError> {
    let d = &w.row;

    let inserting = w.expected == ExpectedVersion::Exact(0);
    let result = if let ExpectedVersion::Exact(loaded @ 1..) = w.expected {
        sqlx::query(
            r#"
            UPDATE donations
            SET status = $2, camp_id = $3, version = $4
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(d.id.as_uuid())
        .bind(d.status.as_str())
        .bind(d.camp_id.map(|id| *id.as_uuid()))
        .bind(d.version as i64)
        .bind(loaded as i64)
        .execute(&mut **tx)
        .await
    } else {
        let on_conflict = if inserting {
            ""
        } else {
            "ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, camp_id = EXCLUDED.camp_id, version = EXCLUDED.version"
        };
        sqlx::query(&format!(
            r#"
            INSERT INTO donations (id, donor_name, donor_type, contact_email, contact_phone,
                                   camp_id, status, created_by, donation_date, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            {on_conflict}
            "#
        ))
        .bind(d.id.as_uuid())
        .bind(&d.donor_name)
        .bind(d.donor_type.as_str())
        .bind(&d.contact_email)
        .bind(&d.contact_phone)
        .bind(d.camp_id.map(|id| *id.as_uuid()))
        .bind(d.status.as_str())
        .bind(d.created_by.map(|id| *id.as_uuid()))
        .bind(d.donation_date)
        .bind(d.version as i64)
        .execute(&mut **tx)
        .await
    }
    .map_err(|e| map_write_error("write_donation", "donation", d.id, w.expected, e))?;
    ensure_written(result.rows_affected(), "donation", d.id, w.expected)?;

    if inserting {
        for (position, item) in d.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO donation_items (id, donation_id, position, resource_id, quantity)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(d.id.as_uuid())
            .bind(position as i32)
            .bind(item.resource_id.map(|id| *id.as_uuid()))
            .bind(item.quantity)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_donation_item", e))?;
        }
    }

    Ok(())
}

async fn insert_transaction(
    tx: &mut Transaction<'_, Postgres>,
    row: &ResourceInventoryTransaction,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO resource_inventory_transactions (id, resource_id, transaction_type,
            quantity_delta, reason, related_request, related_donation_item, created_by,
            created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(row.id.as_uuid())
    .bind(row.resource_id.as_uuid())
    .bind(row.transaction_type.as_str())
    .bind(row.quantity_delta)
    .bind(&row.reason)
    .bind(row.related_request.map(|id| *id.as_uuid()))
    .bind(row.related_donation_item.map(|id| *id.as_uuid()))
    .bind(row.created_by.map(|id| *id.as_uuid()))
    .bind(row.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        // A repeated id on an insert-only table is a data error, not a race.
        if is_unique_violation(&e) {
            StoreError::Integrity(format!("duplicate transaction {}", row.id))
        } else {
            map_sqlx_error("insert_transaction", e)
        }
    })?;
    Ok(())
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    entry: &StatusHistoryEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO resource_request_status_history (id, request_id, previous_status,
            new_status, changed_by, note, changed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.request_id.as_uuid())
    .bind(entry.previous_status.as_str())
    .bind(entry.new_status.as_str())
    .bind(entry.changed_by.map(|id| *id.as_uuid()))
    .bind(&entry.note)
    .bind(entry.changed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_history", e))?;
    Ok(())
}

/// The first acknowledgment time is kept on update.
async fn upsert_acknowledgment(
    tx: &mut Transaction<'_, Postgres>,
    ack: &DonationAcknowledgment,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO donation_acknowledgments (donation_id, acknowledgment_text,
            acknowledged_by, acknowledged_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (donation_id) DO UPDATE
        SET acknowledgment_text = EXCLUDED.acknowledgment_text,
            acknowledged_by = EXCLUDED.acknowledged_by
        "#,
    )
    .bind(ack.donation_id.as_uuid())
    .bind(&ack.text)
    .bind(ack.acknowledged_by.map(|id| *id.as_uuid()))
    .bind(ack.acknowledged_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_acknowledgment", e))?;
    Ok(())
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Serialization(format!("failed to read {column}: {e}")))
}

fn parse<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr<Err = DomainError>,
{
    let raw: String = get(row, column)?;
    raw.parse()
        .map_err(|e: DomainError| StoreError::Serialization(format!("{column}: {e}")))
}

fn resource_from_row(row: &PgRow) -> Result<ResourceSnapshot, StoreError> {
    Ok(ResourceSnapshot {
        id: ResourceId::from_uuid(get(row, "id")?),
        name: get(row, "name")?,
        category: parse(row, "category")?,
        description: get(row, "description")?,
        unit: parse(row, "unit")?,
        total_quantity: get::<Decimal>(row, "total_quantity")?,
        available_quantity: get::<Decimal>(row, "available_quantity")?,
        is_active: get(row, "is_active")?,
        created_at: get::<DateTime<Utc>>(row, "created_at")?,
        version: get::<i64>(row, "version")? as u64,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<ResourceInventoryTransaction, StoreError> {
    Ok(ResourceInventoryTransaction {
        id: TransactionId::from_uuid(get(row, "id")?),
        resource_id: ResourceId::from_uuid(get(row, "resource_id")?),
        transaction_type: parse(row, "transaction_type")?,
        quantity_delta: get(row, "quantity_delta")?,
        reason: get(row, "reason")?,
        related_request: get::<Option<Uuid>>(row, "related_request")?.map(RequestId::from_uuid),
        related_donation_item: get::<Option<Uuid>>(row, "related_donation_item")?
            .map(DonationItemId::from_uuid),
        created_by: get::<Option<Uuid>>(row, "created_by")?.map(UserId::from_uuid),
        created_at: get(row, "created_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<ResourceRequest, StoreError> {
    Ok(ResourceRequest {
        id: RequestId::from_uuid(get(row, "id")?),
        camp_id: CampId::from_uuid(get(row, "camp_id")?),
        resource_id: ResourceId::from_uuid(get(row, "resource_id")?),
        quantity_requested: get(row, "quantity_requested")?,
        quantity_fulfilled: get(row, "quantity_fulfilled")?,
        priority: parse(row, "priority")?,
        status: parse(row, "status")?,
        requested_by: UserId::from_uuid(get(row, "requested_by")?),
        request_date: get(row, "request_date")?,
        needed_by: get(row, "needed_by")?,
        reason: get(row, "reason")?,
        version: get::<i64>(row, "version")? as u64,
    })
}

fn donation_from_row(row: &PgRow, items: Vec<DonationItem>) -> Result<Donation, StoreError> {
    Ok(Donation {
        id: DonationId::from_uuid(get(row, "id")?),
        donor_name: get(row, "donor_name")?,
        donor_type: parse(row, "donor_type")?,
        contact_email: get(row, "contact_email")?,
        contact_phone: get(row, "contact_phone")?,
        camp_id: get::<Option<Uuid>>(row, "camp_id")?.map(CampId::from_uuid),
        status: parse(row, "status")?,
        items,
        created_by: get::<Option<Uuid>>(row, "created_by")?.map(UserId::from_uuid),
        donation_date: get(row, "donation_date")?,
        version: get::<i64>(row, "version")? as u64,
    })
}

fn history_from_row(row: &PgRow) -> Result<StatusHistoryEntry, StoreError> {
    Ok(StatusHistoryEntry {
        id: HistoryId::from_uuid(get(row, "id")?),
        request_id: RequestId::from_uuid(get(row, "request_id")?),
        previous_status: parse(row, "previous_status")?,
        new_status: parse(row, "new_status")?,
        changed_by: get::<Option<Uuid>>(row, "changed_by")?.map(UserId::from_uuid),
        note: get(row, "note")?,
        changed_at: get(row, "changed_at")?,
    })
}

/// Map a guarded write error; a unique violation on insert means another
/// writer created the row first.
fn map_write_error(
    operation: &str,
    kind: &str,
    id: impl core::fmt::Display,
    expected: ExpectedVersion,
    err: sqlx::Error,
) -> StoreError {
    if is_unique_violation(&err) {
        concurrency_error(kind, id, expected)
    } else {
        map_sqlx_error(operation, err)
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            classify_sqlstate(db_err.code().as_deref(), msg)
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Pick the `StoreError` variant for a Postgres SQLSTATE.
fn classify_sqlstate(code: Option<&str>, msg: String) -> StoreError {
    match code {
        Some("23505") | Some("40001") | Some("40P01") => StoreError::Concurrency(msg),
        Some(code) if code.starts_with("23") => StoreError::Integrity(msg),
        _ => StoreError::Storage(msg),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use sqlx::postgres::PgPoolOptions;
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{Layer, registry::LookupSpan};

    use super::*;

    #[test]
    fn retryable_sqlstates_map_to_concurrency() {
        for code in ["23505", "40001", "40P01"] {
            assert!(matches!(
                classify_sqlstate(Some(code), String::new()),
                StoreError::Concurrency(_)
            ));
        }
        assert!(matches!(
            classify_sqlstate(Some("23514"), String::new()),
            StoreError::Integrity(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("42P01"), String::new()),
            StoreError::Storage(_)
        ));
        assert!(matches!(classify_sqlstate(None, String::new()), StoreError::Storage(_)));
    }

    /// Collects `committed` values recorded on `commit_changes` spans.
    #[derive(Clone, Default)]
    struct CommittedField(Arc<Mutex<Vec<String>>>);

    impl Visit for CommittedField {
        fn record_bool(&mut self, field: &Field, value: bool) {
            if field.name() == "committed" {
                self.0.lock().unwrap().push(value.to_string());
            }
        }

        fn record_debug(&mut self, _field: &Field, _value: &dyn core::fmt::Debug) {}
    }

    impl<S> Layer<S> for CommittedField
    where
        S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
            let metadata = attrs.metadata();
            if metadata.name() == "commit_changes" && metadata.fields().field("committed").is_some() {
                self.0.lock().unwrap().push("declared".to_string());
            }
        }

        fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut self.clone());
        }
    }

    #[tokio::test]
    async fn failed_commit_records_committed_false() {
        let seen = CommittedField::default();
        let subscriber = tracing_subscriber::registry().with(seen.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://reliefops@127.0.0.1:1/reliefops")
            .unwrap();
        let store = PostgresLedgerStore::new(pool);

        let ack = DonationAcknowledgment {
            donation_id: DonationId::new(),
            text: "Thanks".to_string(),
            acknowledged_by: None,
            acknowledged_at: Utc::now(),
        };
        let err = store
            .commit(ChangeSet {
                acknowledgments: vec![ack],
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Storage(_)));
        assert_eq!(*seen.0.lock().unwrap(), vec!["declared", "false"]);
    }
}
