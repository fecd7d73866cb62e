//! Inventory ledger service (application-level orchestration).
//!
//! Every mutating operation runs the same pipeline:
//!
//! ```text
//! 1. Load the rows it touches (with their versions)
//!   ↓
//! 2. Decide in the domain layer (pure, produces new state + events)
//!   ↓
//! 3. Commit one ChangeSet (all-or-nothing, version-checked)
//!   ↓
//! 4. Publish one envelope per domain event
//! ```
//!
//! A version conflict in step 3 restarts from step 1, up to
//! `LedgerConfig::max_conflict_retries` times. Domain failures are never retried.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use reliefops_core::{
    Aggregate, AggregateRoot, CampId, DomainError, DonationId, DonationItemId, HistoryId,
    RequestId, ResourceId, TransactionId, UserId,
};
use reliefops_events::{Event, EventBus, EventEnvelope};
use reliefops_inventory::{
    AdjustInventory, CreateResource, Donation, DonationAcknowledgment, DonationDecision, DonationEvent, DonationItem,
    DonationRegistered, DonationStatus, DonationStatusChanged, DonorType, NewDonation,
    NewResourceRequest, RequestCreated, RequestEvent, RequestPriority,
    RequestStatus, RequestStatusChanged, Resource, ResourceCategory, ResourceCommand,
    ResourceDetailsPatch, ResourceEvent, ResourceInventoryTransaction, ResourceRequest,
    ResourceSnapshot, ResourceUnit, ShortfallPolicy, StatusChange, StatusHistoryEntry,
    TransactionLink, TransactionType, UpdateResourceDetails,
};

use crate::config::LedgerConfig;
use crate::ledger_store::{
    ChangeSet, DonationFilter, LedgerStore, Pagination, RequestFilter, RequestOrder, ResourceFilter, StoreError,
    TransactionFilter, TransactionPage, Versioned,
};
use crate::reconcile::ReconcileReport;

pub const RESOURCE_AGGREGATE: &str = "inventory.resource";
pub const REQUEST_AGGREGATE: &str = "relief.request";
pub const DONATION_AGGREGATE: &str = "operations.donation";

/// Caller-facing ledger error.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient inventory for resource {resource_id}: requested {requested}, available {available}")]
    InsufficientInventory {
        resource_id: ResourceId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Optimistic concurrency conflict that outlived the retry budget.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Store(StoreError),

    /// Publication failed after a successful commit (at-least-once; the rows stay).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Concurrency(msg) => LedgerError::Concurrency(msg),
            other => LedgerError::Store(other),
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => LedgerError::InvariantViolation(msg),
            DomainError::Conflict(msg) => LedgerError::Concurrency(msg),
            DomainError::Unauthorized => LedgerError::Unauthorized,
            DomainError::NotFound => LedgerError::NotFound("entity not found".to_string()),
            DomainError::InsufficientInventory {
                resource_id,
                requested,
                available,
            } => LedgerError::InsufficientInventory {
                resource_id,
                requested,
                available,
            },
        }
    }
}

fn not_found(kind: &str, id: impl core::fmt::Display) -> LedgerError {
    LedgerError::NotFound(format!("{kind} {id}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResourceInput {
    pub name: String,
    pub category: ResourceCategory,
    pub unit: ResourceUnit,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub initial_total: Decimal,
    #[serde(default)]
    pub actor: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustInventoryInput {
    pub resource_id: ResourceId,
    pub transaction_type: TransactionType,
    pub quantity_delta: Decimal,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub actor: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequestInput {
    pub camp_id: CampId,
    pub resource_id: ResourceId,
    pub quantity_requested: Decimal,
    pub priority: RequestPriority,
    pub needed_by: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    pub requested_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationItemInput {
    pub resource_id: Option<ResourceId>,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDonationInput {
    pub donor_name: String,
    pub donor_type: DonorType,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default)]
    pub contact_phone: String,
    #[serde(default)]
    pub camp_id: Option<CampId>,
    pub items: Vec<DonationItemInput>,
    #[serde(default)]
    pub actor: Option<UserId>,
}

/// A resource and the ledger row that explains its latest change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdjustmentOutcome {
    pub resource: ResourceSnapshot,
    pub transaction: ResourceInventoryTransaction,
}

/// Resource with its newest transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDetail {
    pub resource: ResourceSnapshot,
    pub recent_transactions: Vec<ResourceInventoryTransaction>,
}

/// Result of a request status change. Fulfillments also carry the inventory
/// decrement and the resource after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestUpdate {
    pub request: ResourceRequest,
    pub history: StatusHistoryEntry,
    pub transaction: Option<ResourceInventoryTransaction>,
    pub resource: Option<ResourceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonationUpdate {
    pub donation: Donation,
    /// `false` when the donation already had the requested status.
    pub changed: bool,
    /// Inventory credits written by this call.
    pub transactions: Vec<ResourceInventoryTransaction>,
    /// Written with every status change; `None` when nothing changed.
    pub acknowledgment: Option<DonationAcknowledgment>,
}

/// The inventory ledger: atomic, auditable changes to resource quantities and
/// the request/donation workflows that drive them.
#[derive(Debug)]
pub struct InventoryLedger<S, B> {
    store: S,
    bus: B,
    config: LedgerConfig,
}

impl<S, B> InventoryLedger<S, B> {
    pub fn new(store: S, bus: B, config: LedgerConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }

    /// Whether `err` is a conflict worth another attempt; counts the attempt.
    fn retry_conflict(&self, operation: &str, attempt: &mut u32, err: &LedgerError) -> bool {
        if !matches!(err, LedgerError::Concurrency(_)) || *attempt >= self.config.max_conflict_retries {
            return false;
        }
        *attempt += 1;
        warn!(operation, attempt = *attempt, error = %err, "retrying after concurrency conflict");
        true
    }
}

fn envelopes<E>(
    aggregate_id: Uuid,
    aggregate_type: &str,
    final_version: u64,
    events: Vec<E>,
) -> Result<Vec<EventEnvelope<JsonValue>>, LedgerError>
where
    E: Event + Serialize,
{
    let first = final_version + 1 - events.len() as u64;
    events
        .into_iter()
        .enumerate()
        .map(|(idx, event)| {
            let payload = serde_json::to_value(&event)
                .map_err(|e| LedgerError::Publish(format!("payload serialization failed: {e}")))?;
            Ok(EventEnvelope::for_event(aggregate_id, aggregate_type, first + idx as u64, event)
                .map(|_| payload))
        })
        .collect()
}

impl<S, B> InventoryLedger<S, B>
where
    S: LedgerStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn publish(&self, envelopes: Vec<EventEnvelope<JsonValue>>) -> Result<(), LedgerError> {
        for envelope in envelopes {
            debug!(event_type = envelope.event_type(), aggregate_id = %envelope.aggregate_id(), "publishing");
            self.bus
                .publish(envelope)
                .map_err(|err| LedgerError::Publish(format!("{err:?}")))?;
        }
        Ok(())
    }

    async fn load_resource_aggregate(&self, id: ResourceId) -> Result<Resource, LedgerError> {
        self.store
            .load_resource(id)
            .await?
            .map(Resource::from_snapshot)
            .ok_or_else(|| not_found("resource", id))
    }

    async fn load_request_row(&self, id: RequestId) -> Result<ResourceRequest, LedgerError> {
        self.store
            .load_request(id)
            .await?
            .ok_or_else(|| not_found("request", id))
    }

    async fn load_donation_row(&self, id: DonationId) -> Result<Donation, LedgerError> {
        self.store
            .load_donation(id)
            .await?
            .ok_or_else(|| not_found("donation", id))
    }

    // ---- resources -------------------------------------------------------

    /// Create a resource; a positive `initial_total` is recorded as an `add`
    /// row in the same commit.
    #[instrument(skip(self, input), fields(name = %input.name, category = %input.category), err)]
    pub async fn create_resource(
        &self,
        input: CreateResourceInput,
    ) -> Result<ResourceSnapshot, LedgerError> {
        let resource_id = ResourceId::new();
        let mut resource = Resource::empty(resource_id);
        let events = resource.execute(&ResourceCommand::Create(CreateResource {
            resource_id,
            name: input.name,
            category: input.category,
            unit: input.unit,
            description: input.description,
            initial_total: input.initial_total,
            initial_transaction_id: TransactionId::new(),
            actor: input.actor,
            occurred_at: Utc::now(),
        }))?;

        let snapshot = resource
            .snapshot()
            .ok_or_else(|| LedgerError::InvariantViolation("created resource has no state".to_string()))?;
        let changes = ChangeSet {
            resources: vec![Versioned::insert(snapshot.clone())],
            transactions: events.iter().filter_map(|e| e.transaction().cloned()).collect(),
            ..Default::default()
        };
        let outgoing = envelopes(*resource_id.as_uuid(), RESOURCE_AGGREGATE, resource.version(), events)?;

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(snapshot)
    }

    /// Apply one quantity change and record it.
    #[instrument(
        skip(self, input),
        fields(resource_id = %input.resource_id, transaction_type = %input.transaction_type),
        err
    )]
    pub async fn adjust_inventory(
        &self,
        input: AdjustInventoryInput,
    ) -> Result<AdjustmentOutcome, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.try_adjust(&input).await {
                Err(err) if self.retry_conflict("adjust_inventory", &mut attempt, &err) => continue,
                result => return result,
            }
        }
    }

    async fn try_adjust(&self, input: &AdjustInventoryInput) -> Result<AdjustmentOutcome, LedgerError> {
        let mut resource = self.load_resource_aggregate(input.resource_id).await?;
        let loaded_version = resource.version();

        let events = resource.execute(&ResourceCommand::Adjust(AdjustInventory {
            resource_id: input.resource_id,
            transaction_id: TransactionId::new(),
            transaction_type: input.transaction_type,
            quantity_delta: input.quantity_delta,
            reason: input.reason.clone(),
            link: TransactionLink::None,
            shortfall: ShortfallPolicy::Reject,
            actor: input.actor,
            occurred_at: Utc::now(),
        }))?;

        let transaction = events
            .iter()
            .find_map(|e| e.transaction().cloned())
            .ok_or_else(|| LedgerError::InvariantViolation("adjustment produced no transaction".to_string()))?;
        let snapshot = resource
            .snapshot()
            .ok_or_else(|| not_found("resource", input.resource_id))?;

        let changes = ChangeSet {
            resources: vec![Versioned::update(snapshot.clone(), loaded_version)],
            transactions: vec![transaction.clone()],
            ..Default::default()
        };
        let outgoing = envelopes(*input.resource_id.as_uuid(), RESOURCE_AGGREGATE, resource.version(), events)?;

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(AdjustmentOutcome {
            resource: snapshot,
            transaction,
        })
    }

    /// Edit metadata or (de)activate. Quantities are untouched.
    #[instrument(skip(self, patch), fields(resource_id = %resource_id), err)]
    pub async fn update_resource(
        &self,
        resource_id: ResourceId,
        patch: ResourceDetailsPatch,
    ) -> Result<ResourceSnapshot, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.try_update_resource(resource_id, &patch).await {
                Err(err) if self.retry_conflict("update_resource", &mut attempt, &err) => continue,
                result => return result,
            }
        }
    }

    async fn try_update_resource(
        &self,
        resource_id: ResourceId,
        patch: &ResourceDetailsPatch,
    ) -> Result<ResourceSnapshot, LedgerError> {
        let mut resource = self.load_resource_aggregate(resource_id).await?;
        let loaded_version = resource.version();
        let events = resource.execute(&ResourceCommand::UpdateDetails(UpdateResourceDetails {
            resource_id,
            patch: patch.clone(),
            occurred_at: Utc::now(),
        }))?;
        let snapshot = resource
            .snapshot()
            .ok_or_else(|| not_found("resource", resource_id))?;

        if events.is_empty() {
            return Ok(snapshot);
        }

        let changes = ChangeSet {
            resources: vec![Versioned::update(snapshot.clone(), loaded_version)],
            ..Default::default()
        };
        let outgoing = envelopes(*resource_id.as_uuid(), RESOURCE_AGGREGATE, resource.version(), events)?;

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(snapshot)
    }

    // ---- requests --------------------------------------------------------

    /// Open a request against an active resource.
    #[instrument(
        skip(self, input),
        fields(resource_id = %input.resource_id, camp_id = %input.camp_id),
        err
    )]
    pub async fn create_request(
        &self,
        input: CreateRequestInput,
    ) -> Result<RequestUpdate, LedgerError> {
        let resource = self.load_resource_aggregate(input.resource_id).await?;
        if !resource.is_active() {
            return Err(LedgerError::Validation(format!(
                "resource {} is not active",
                input.resource_id
            )));
        }

        let (request, history) = ResourceRequest::open(NewResourceRequest {
            request_id: RequestId::new(),
            history_id: HistoryId::new(),
            camp_id: input.camp_id,
            resource_id: input.resource_id,
            quantity_requested: input.quantity_requested,
            priority: input.priority,
            needed_by: input.needed_by,
            reason: input.reason,
            requested_by: input.requested_by,
            requested_at: Utc::now(),
        })?;

        let changes = ChangeSet {
            requests: vec![Versioned::insert(request.clone())],
            history: vec![history.clone()],
            ..Default::default()
        };
        let outgoing = envelopes(
            *request.id.as_uuid(),
            REQUEST_AGGREGATE,
            request.version,
            vec![RequestEvent::Created(RequestCreated {
                request: request.clone(),
                history: history.clone(),
            })],
        )?;

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(RequestUpdate {
            request,
            history,
            transaction: None,
            resource: None,
        })
    }

    /// Mark a request fulfilled and take the stock out of inventory.
    ///
    /// Stock shortfalls follow `LedgerConfig::fulfillment_shortfall`.
    #[instrument(skip(self, note), fields(request_id = %request_id, quantity = %quantity_fulfilled), err)]
    pub async fn fulfill_request(
        &self,
        request_id: RequestId,
        quantity_fulfilled: Decimal,
        actor: Option<UserId>,
        note: &str,
    ) -> Result<RequestUpdate, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.try_fulfill(request_id, quantity_fulfilled, actor, note).await {
                Err(err) if self.retry_conflict("fulfill_request", &mut attempt, &err) => continue,
                result => return result,
            }
        }
    }

    async fn try_fulfill(
        &self,
        request_id: RequestId,
        quantity: Decimal,
        actor: Option<UserId>,
        note: &str,
    ) -> Result<RequestUpdate, LedgerError> {
        let request = self.load_request_row(request_id).await?;
        let now = Utc::now();

        let (next, history) = request.fulfill(
            quantity,
            StatusChange {
                history_id: HistoryId::new(),
                new_status: RequestStatus::Fulfilled,
                changed_by: actor,
                note: note.to_string(),
                changed_at: now,
            },
            self.config.transition_mode(),
        )?;

        let mut resource = self.load_resource_aggregate(request.resource_id).await?;
        let loaded_version = resource.version();
        let resource_events = resource.execute(&ResourceCommand::Adjust(AdjustInventory {
            resource_id: request.resource_id,
            transaction_id: TransactionId::new(),
            transaction_type: TransactionType::Fulfillment,
            quantity_delta: -quantity,
            reason: format!("Fulfilled request {request_id}"),
            link: TransactionLink::Request(request_id),
            shortfall: self.config.fulfillment_shortfall,
            actor,
            occurred_at: now,
        }))?;

        let transaction = resource_events
            .iter()
            .find_map(|e| e.transaction().cloned())
            .ok_or_else(|| LedgerError::InvariantViolation("fulfillment produced no transaction".to_string()))?;
        if transaction.quantity_delta != -quantity {
            warn!(
                %request_id,
                resource_id = %request.resource_id,
                requested = %quantity,
                decremented = %(-transaction.quantity_delta),
                "fulfillment clamped to available stock"
            );
        }
        let snapshot = resource
            .snapshot()
            .ok_or_else(|| not_found("resource", request.resource_id))?;

        let changes = ChangeSet {
            resources: vec![Versioned::update(snapshot.clone(), loaded_version)],
            transactions: vec![transaction.clone()],
            requests: vec![Versioned::update(next.clone(), request.version)],
            history: vec![history.clone()],
            ..Default::default()
        };
        let mut outgoing = envelopes(
            *request.resource_id.as_uuid(),
            RESOURCE_AGGREGATE,
            resource.version(),
            resource_events,
        )?;
        outgoing.extend(envelopes(
            *request_id.as_uuid(),
            REQUEST_AGGREGATE,
            next.version,
            vec![RequestEvent::StatusChanged(RequestStatusChanged {
                request: next.clone(),
                history: history.clone(),
            })],
        )?);

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(RequestUpdate {
            request: next,
            history,
            transaction: Some(transaction),
            resource: Some(snapshot),
        })
    }

    /// Change a request's status. `fulfilled` with a quantity goes through
    /// `fulfill_request`; every other change only records the transition.
    #[instrument(skip(self, note), fields(request_id = %request_id, new_status = %new_status), err)]
    pub async fn update_request_status(
        &self,
        request_id: RequestId,
        new_status: RequestStatus,
        quantity_fulfilled: Option<Decimal>,
        actor: Option<UserId>,
        note: &str,
    ) -> Result<RequestUpdate, LedgerError> {
        if let (RequestStatus::Fulfilled, Some(quantity)) = (new_status, quantity_fulfilled) {
            return self.fulfill_request(request_id, quantity, actor, note).await;
        }

        let mut attempt = 0;
        loop {
            match self.try_transition(request_id, new_status, actor, note).await {
                Err(err) if self.retry_conflict("update_request_status", &mut attempt, &err) => continue,
                result => return result,
            }
        }
    }

    async fn try_transition(
        &self,
        request_id: RequestId,
        new_status: RequestStatus,
        actor: Option<UserId>,
        note: &str,
    ) -> Result<RequestUpdate, LedgerError> {
        let request = self.load_request_row(request_id).await?;
        let (next, history) = request.transition(
            StatusChange {
                history_id: HistoryId::new(),
                new_status,
                changed_by: actor,
                note: note.to_string(),
                changed_at: Utc::now(),
            },
            self.config.transition_mode(),
        )?;

        let changes = ChangeSet {
            requests: vec![Versioned::update(next.clone(), request.version)],
            history: vec![history.clone()],
            ..Default::default()
        };
        let outgoing = envelopes(
            *request_id.as_uuid(),
            REQUEST_AGGREGATE,
            next.version,
            vec![RequestEvent::StatusChanged(RequestStatusChanged {
                request: next.clone(),
                history: history.clone(),
            })],
        )?;

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(RequestUpdate {
            request: next,
            history,
            transaction: None,
            resource: None,
        })
    }

    // ---- donations -------------------------------------------------------

    /// Record a pledge. Inventory is untouched until acceptance.
    #[instrument(skip(self, input), fields(donor = %input.donor_name, items = input.items.len()), err)]
    pub async fn register_donation(
        &self,
        input: RegisterDonationInput,
    ) -> Result<Donation, LedgerError> {
        for item in &input.items {
            if let Some(resource_id) = item.resource_id {
                if self.store.load_resource(resource_id).await?.is_none() {
                    return Err(not_found("resource", resource_id));
                }
            }
        }

        let donation = Donation::register(NewDonation {
            donation_id: DonationId::new(),
            donor_name: input.donor_name,
            donor_type: input.donor_type,
            contact_email: input.contact_email,
            contact_phone: input.contact_phone,
            camp_id: input.camp_id,
            items: input
                .items
                .into_iter()
                .map(|item| DonationItem {
                    id: DonationItemId::new(),
                    resource_id: item.resource_id,
                    quantity: item.quantity,
                })
                .collect(),
            created_by: input.actor,
            donated_at: Utc::now(),
        })?;

        let changes = ChangeSet {
            donations: vec![Versioned::insert(donation.clone())],
            ..Default::default()
        };
        let outgoing = envelopes(
            *donation.id.as_uuid(),
            DONATION_AGGREGATE,
            donation.version,
            vec![DonationEvent::Registered(DonationRegistered {
                donation: donation.clone(),
            })],
        )?;

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(donation)
    }

    /// Accept a donation, crediting each linked item once.
    ///
    /// Accepting an already accepted donation changes nothing.
    pub async fn record_donation_acceptance(
        &self,
        donation_id: DonationId,
        approver: Option<UserId>,
    ) -> Result<DonationUpdate, LedgerError> {
        self.update_donation_status(donation_id, DonationStatus::Accepted, None, approver)
            .await
    }

    /// Change a donation's status and record its acknowledgment in the same
    /// commit. Blank `acknowledgment_text` uses the default thank-you note.
    #[instrument(
        skip(self, acknowledgment_text),
        fields(donation_id = %donation_id, new_status = %new_status),
        err
    )]
    pub async fn update_donation_status(
        &self,
        donation_id: DonationId,
        new_status: DonationStatus,
        acknowledgment_text: Option<String>,
        actor: Option<UserId>,
    ) -> Result<DonationUpdate, LedgerError> {
        let mut attempt = 0;
        loop {
            match self
                .try_donation_status(donation_id, new_status, acknowledgment_text.as_deref(), actor)
                .await
            {
                Err(err) if self.retry_conflict("update_donation_status", &mut attempt, &err) => continue,
                result => return result,
            }
        }
    }

    async fn try_donation_status(
        &self,
        donation_id: DonationId,
        new_status: DonationStatus,
        acknowledgment_text: Option<&str>,
        actor: Option<UserId>,
    ) -> Result<DonationUpdate, LedgerError> {
        let donation = self.load_donation_row(donation_id).await?;

        let (next, previous_status, credits) = match donation.change_status(new_status)? {
            DonationDecision::Unchanged => {
                debug!(%donation_id, status = %new_status, "donation already in requested status");
                return Ok(DonationUpdate {
                    donation,
                    changed: false,
                    transactions: Vec::new(),
                    acknowledgment: None,
                });
            }
            DonationDecision::Changed {
                donation: next,
                previous_status,
                credits,
            } => (next, previous_status, credits),
        };

        let now = Utc::now();
        // Several items may credit the same resource; each gets its own row.
        let mut touched: HashMap<ResourceId, (Resource, u64)> = HashMap::new();
        let mut order: Vec<ResourceId> = Vec::new();
        let mut resource_events: Vec<(ResourceId, ResourceEvent)> = Vec::new();
        let mut transactions = Vec::with_capacity(credits.len());

        for credit in credits {
            if !touched.contains_key(&credit.resource_id) {
                match self.store.load_resource(credit.resource_id).await? {
                    Some(snapshot) => {
                        let version = snapshot.version;
                        touched.insert(credit.resource_id, (Resource::from_snapshot(snapshot), version));
                        order.push(credit.resource_id);
                    }
                    None => {
                        warn!(%donation_id, resource_id = %credit.resource_id, "skipping credit for missing resource");
                        continue;
                    }
                }
            }
            let Some((resource, _)) = touched.get_mut(&credit.resource_id) else {
                continue;
            };

            let events = resource.execute(&ResourceCommand::Adjust(AdjustInventory {
                resource_id: credit.resource_id,
                transaction_id: TransactionId::new(),
                transaction_type: TransactionType::Donation,
                quantity_delta: credit.quantity,
                reason: credit.reason,
                link: TransactionLink::DonationItem(credit.donation_item_id),
                shortfall: ShortfallPolicy::Reject,
                actor,
                occurred_at: now,
            }))?;
            transactions.extend(events.iter().filter_map(|e| e.transaction().cloned()));
            resource_events.extend(events.into_iter().map(|e| (credit.resource_id, e)));
        }

        let acknowledgment = match self.store.load_acknowledgment(donation_id).await? {
            Some(existing) => existing.revise(acknowledgment_text, actor),
            None => next.acknowledge(acknowledgment_text, actor, now),
        };

        // Lock resource rows in id order so concurrent acceptances cannot deadlock.
        order.sort();
        let mut changes = ChangeSet {
            transactions: transactions.clone(),
            donations: vec![Versioned::update(next.clone(), donation.version)],
            acknowledgments: vec![acknowledgment.clone()],
            ..Default::default()
        };
        let mut outgoing = Vec::new();
        for resource_id in &order {
            let Some((resource, loaded_version)) = touched.remove(resource_id) else {
                continue;
            };
            let snapshot = resource
                .snapshot()
                .ok_or_else(|| not_found("resource", resource_id))?;
            changes.resources.push(Versioned::update(snapshot, loaded_version));

            let events: Vec<ResourceEvent> = resource_events
                .iter()
                .filter(|(id, _)| id == resource_id)
                .map(|(_, e)| e.clone())
                .collect();
            outgoing.extend(envelopes(*resource_id.as_uuid(), RESOURCE_AGGREGATE, resource.version(), events)?);
        }
        outgoing.extend(envelopes(
            *donation_id.as_uuid(),
            DONATION_AGGREGATE,
            next.version,
            vec![DonationEvent::StatusChanged(DonationStatusChanged {
                donation_id,
                previous_status,
                new_status,
                changed_by: actor,
                credited_items: transactions.len(),
                occurred_at: now,
            })],
        )?);

        self.store.commit(changes).await?;
        self.publish(outgoing)?;
        Ok(DonationUpdate {
            donation: next,
            changed: true,
            transactions,
            acknowledgment: Some(acknowledgment),
        })
    }

    /// Create or update a donation's acknowledgment without touching its
    /// status. The first `acknowledged_at` is kept.
    #[instrument(skip(self, text), fields(donation_id = %donation_id), err)]
    pub async fn acknowledge_donation(
        &self,
        donation_id: DonationId,
        text: Option<String>,
        actor: Option<UserId>,
    ) -> Result<DonationAcknowledgment, LedgerError> {
        let donation = self.load_donation_row(donation_id).await?;
        let acknowledgment = match self.store.load_acknowledgment(donation_id).await? {
            Some(existing) => existing.revise(text.as_deref(), actor),
            None => donation.acknowledge(text.as_deref(), actor, Utc::now()),
        };

        self.store
            .commit(ChangeSet {
                acknowledgments: vec![acknowledgment.clone()],
                ..Default::default()
            })
            .await?;
        Ok(acknowledgment)
    }

    // ---- queries ---------------------------------------------------------

    pub async fn get_resource(&self, id: ResourceId) -> Result<ResourceSnapshot, LedgerError> {
        self.store
            .load_resource(id)
            .await?
            .ok_or_else(|| not_found("resource", id))
    }

    /// Resource with its `recent_transactions_limit` newest transactions.
    pub async fn resource_detail(&self, id: ResourceId) -> Result<ResourceDetail, LedgerError> {
        let resource = self.get_resource(id).await?;
        let page = self
            .store
            .query_transactions(
                &TransactionFilter {
                    resource_id: Some(id),
                    ..Default::default()
                },
                Pagination::new(Some(self.config.recent_transactions_limit), None),
            )
            .await?;

        Ok(ResourceDetail {
            resource,
            recent_transactions: page.transactions,
        })
    }

    pub async fn list_resources(
        &self,
        filter: &ResourceFilter,
    ) -> Result<Vec<ResourceSnapshot>, LedgerError> {
        Ok(self.store.list_resources(filter).await?)
    }

    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<TransactionPage, LedgerError> {
        Ok(self.store.query_transactions(filter, pagination).await?)
    }

    pub async fn get_request(&self, id: RequestId) -> Result<ResourceRequest, LedgerError> {
        self.load_request_row(id).await
    }

    pub async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ResourceRequest>, LedgerError> {
        Ok(self.store.list_requests(filter).await?)
    }

    /// Pending requests, most urgent first, then by `needed_by`.
    pub async fn pending_requests(&self) -> Result<Vec<ResourceRequest>, LedgerError> {
        self.list_requests(&RequestFilter {
            status: Some(RequestStatus::Pending),
            order: RequestOrder::Triage,
            ..Default::default()
        })
        .await
    }

    /// Pending urgent requests by `needed_by`.
    pub async fn urgent_requests(&self) -> Result<Vec<ResourceRequest>, LedgerError> {
        self.list_requests(&RequestFilter {
            status: Some(RequestStatus::Pending),
            priority: Some(RequestPriority::Urgent),
            order: RequestOrder::NeededBy,
            ..Default::default()
        })
        .await
    }

    pub async fn request_history(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<StatusHistoryEntry>, LedgerError> {
        self.load_request_row(request_id).await?;
        Ok(self.store.request_history(request_id).await?)
    }

    pub async fn get_donation(&self, id: DonationId) -> Result<Donation, LedgerError> {
        self.load_donation_row(id).await
    }

    /// Donations newest first; filter by camp, creator or status.
    pub async fn list_donations(
        &self,
        filter: &DonationFilter,
    ) -> Result<Vec<Donation>, LedgerError> {
        Ok(self.store.list_donations(filter).await?)
    }

    /// `None` while the donation has not been acknowledged.
    pub async fn donation_acknowledgment(
        &self,
        donation_id: DonationId,
    ) -> Result<Option<DonationAcknowledgment>, LedgerError> {
        self.load_donation_row(donation_id).await?;
        Ok(self.store.load_acknowledgment(donation_id).await?)
    }

    // ---- reconciliation --------------------------------------------------

    #[instrument(skip(self), fields(resource_id = %resource_id), err)]
    pub async fn reconcile(&self, resource_id: ResourceId) -> Result<ReconcileReport, LedgerError> {
        let resource = self.get_resource(resource_id).await?;
        let ledger = self.store.resource_ledger(resource_id).await?;
        let report = ReconcileReport::build(&resource, &ledger);
        if !report.consistent {
            warn!(%resource_id, drift = ?report.drift(), "resource quantities drifted from ledger");
        }
        Ok(report)
    }

    #[instrument(skip(self), err)]
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>, LedgerError> {
        let resources = self.store.list_resources(&ResourceFilter::default()).await?;
        let mut reports = Vec::with_capacity(resources.len());
        for resource in resources {
            let ledger = self.store.resource_ledger(resource.id).await?;
            let report = ReconcileReport::build(&resource, &ledger);
            if !report.consistent {
                warn!(resource_id = %resource.id, drift = ?report.drift(), "resource quantities drifted from ledger");
            }
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_ledger_errors() {
        assert!(matches!(
            LedgerError::from(DomainError::validation("bad")),
            LedgerError::Validation(_)
        ));
        assert!(matches!(
            LedgerError::from(DomainError::invalid_id("nope")),
            LedgerError::Validation(_)
        ));
        assert!(matches!(
            LedgerError::from(DomainError::conflict("stale")),
            LedgerError::Concurrency(_)
        ));

        let id = ResourceId::new();
        match LedgerError::from(DomainError::insufficient(id, Decimal::from(150), Decimal::from(100))) {
            LedgerError::InsufficientInventory {
                resource_id,
                requested,
                available,
            } => {
                assert_eq!(resource_id, id);
                assert_eq!(requested, Decimal::from(150));
                assert_eq!(available, Decimal::from(100));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_store_conflicts_become_concurrency() {
        assert!(matches!(
            LedgerError::from(StoreError::Concurrency("v".to_string())),
            LedgerError::Concurrency(_)
        ));
        assert!(matches!(
            LedgerError::from(StoreError::Integrity("check".to_string())),
            LedgerError::Store(StoreError::Integrity(_))
        ));
    }

    #[test]
    fn envelopes_number_events_up_to_final_version() {
        let id = ResourceId::new();
        let mut resource = Resource::empty(id);
        let events = resource
            .execute(&ResourceCommand::Create(CreateResource {
                resource_id: id,
                name: "Water".to_string(),
                category: ResourceCategory::Water,
                unit: ResourceUnit::L,
                description: String::new(),
                initial_total: Decimal::from(40),
                initial_transaction_id: TransactionId::new(),
                actor: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();

        let out = envelopes(*id.as_uuid(), RESOURCE_AGGREGATE, resource.version(), events).unwrap();
        let sequence: Vec<u64> = out.iter().map(|e| e.sequence_number()).collect();
        assert_eq!(sequence, vec![1, 2]);
        assert_eq!(out[0].aggregate_type(), RESOURCE_AGGREGATE);
        assert_eq!(out[0].schema_version(), 1);
        assert_eq!(out[1].payload()["InventoryAdjusted"]["transaction"]["quantity_delta"], 40.0);
    }
}
