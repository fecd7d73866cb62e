use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use reliefops_core::{Aggregate, AggregateRoot, DomainError, ResourceId, TransactionId, UserId};
use reliefops_events::Event;

use crate::choices::string_choices;
use crate::quantity::{ensure_positive, ensure_representable, quantity_limit};
use crate::transaction::{ResourceInventoryTransaction, TransactionLink, TransactionType};

/// Reason recorded on the ledger row written when a resource starts with stock.
pub const INITIAL_CREATION_REASON: &str = "Initial resource creation";

/// Reason recorded when an adjustment arrives without one.
pub const DEFAULT_ADJUSTMENT_REASON: &str = "Manual adjustment";

const NAME_MIN_CHARS: usize = 2;
const NAME_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Food,
    Water,
    Medical,
    Clothing,
    Shelter,
    Hygiene,
    Equipment,
    Other,
}

string_choices!(ResourceCategory, "category", {
    Food => "food",
    Water => "water",
    Medical => "medical",
    Clothing => "clothing",
    Shelter => "shelter",
    Hygiene => "hygiene",
    Equipment => "equipment",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceUnit {
    Kg,
    G,
    L,
    Ml,
    Piece,
    Box,
    Pack,
    Unit,
}

string_choices!(ResourceUnit, "unit", {
    Kg => "kg",
    G => "g",
    L => "l",
    Ml => "ml",
    Piece => "piece",
    Box => "box",
    Pack => "pack",
    Unit => "unit",
});

/// What a decrement does when it would drive available stock below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortfallPolicy {
    /// Fail with `InsufficientInventory`.
    #[default]
    Reject,
    /// Decrement down to zero and record the effective delta (fulfillment only).
    Clamp,
}

string_choices!(ShortfallPolicy, "shortfall policy", {
    Reject => "reject",
    Clamp => "clamp",
});

/// Persisted/wire shape of a resource row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub name: String,
    pub category: ResourceCategory,
    pub description: String,
    pub unit: ResourceUnit,
    pub total_quantity: Decimal,
    pub available_quantity: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

/// Aggregate root: Resource.
///
/// Quantities only change through `InventoryAdjusted` events, each carrying the
/// ledger row that explains the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    id: ResourceId,
    name: String,
    category: ResourceCategory,
    description: String,
    unit: ResourceUnit,
    total_quantity: Decimal,
    available_quantity: Decimal,
    is_active: bool,
    created_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

impl Resource {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: ResourceId) -> Self {
        Self {
            id,
            name: String::new(),
            category: ResourceCategory::Other,
            description: String::new(),
            unit: ResourceUnit::Unit,
            total_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            is_active: false,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            version: 0,
            created: false,
        }
    }

    /// Rehydrate from a stored row.
    pub fn from_snapshot(snapshot: ResourceSnapshot) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name,
            category: snapshot.category,
            description: snapshot.description,
            unit: snapshot.unit,
            total_quantity: snapshot.total_quantity,
            available_quantity: snapshot.available_quantity,
            is_active: snapshot.is_active,
            created_at: snapshot.created_at,
            version: snapshot.version,
            created: true,
        }
    }

    /// Current row, or `None` while the resource has not been created.
    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        if !self.created {
            return None;
        }
        Some(ResourceSnapshot {
            id: self.id,
            name: self.name.clone(),
            category: self.category,
            description: self.description.clone(),
            unit: self.unit,
            total_quantity: self.total_quantity,
            available_quantity: self.available_quantity,
            is_active: self.is_active,
            created_at: self.created_at,
            version: self.version,
        })
    }

    pub fn id_typed(&self) -> ResourceId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_quantity(&self) -> Decimal {
        self.total_quantity
    }

    pub fn available_quantity(&self) -> Decimal {
        self.available_quantity
    }
}

impl AggregateRoot for Resource {
    type Id = ResourceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateResource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResource {
    pub resource_id: ResourceId,
    pub name: String,
    pub category: ResourceCategory,
    pub unit: ResourceUnit,
    pub description: String,
    pub initial_total: Decimal,
    /// Id of the `add` row written when `initial_total > 0`.
    pub initial_transaction_id: TransactionId,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustInventory.
///
/// Sign conventions for `quantity_delta` by type: `add`/`donation`/`remove` take
/// a positive amount, `fulfillment` a negative one, `adjust` any non-zero value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustInventory {
    pub resource_id: ResourceId,
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
    pub quantity_delta: Decimal,
    pub reason: String,
    pub link: TransactionLink,
    pub shortfall: ShortfallPolicy,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateResourceDetails (metadata and soft deactivation).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceDetailsPatch {
    pub name: Option<String>,
    pub category: Option<ResourceCategory>,
    pub unit: Option<ResourceUnit>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

impl ResourceDetailsPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.unit.is_none()
            && self.description.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResourceDetails {
    pub resource_id: ResourceId,
    pub patch: ResourceDetailsPatch,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceCommand {
    Create(CreateResource),
    Adjust(AdjustInventory),
    UpdateDetails(UpdateResourceDetails),
}

/// Event: ResourceCreated (quantities start at zero).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCreated {
    pub resource_id: ResourceId,
    pub name: String,
    pub category: ResourceCategory,
    pub unit: ResourceUnit,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InventoryAdjusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjusted {
    pub transaction: ResourceInventoryTransaction,
}

/// Event: ResourceDetailsUpdated (full new metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDetailsUpdated {
    pub resource_id: ResourceId,
    pub name: String,
    pub category: ResourceCategory,
    pub unit: ResourceUnit,
    pub description: String,
    pub is_active: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceEvent {
    Created(ResourceCreated),
    InventoryAdjusted(InventoryAdjusted),
    DetailsUpdated(ResourceDetailsUpdated),
}

impl ResourceEvent {
    /// The ledger row carried by this event, if it moved quantities.
    pub fn transaction(&self) -> Option<&ResourceInventoryTransaction> {
        match self {
            ResourceEvent::InventoryAdjusted(e) => Some(&e.transaction),
            _ => None,
        }
    }
}

impl Event for ResourceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ResourceEvent::Created(_) => "inventory.resource.created",
            ResourceEvent::InventoryAdjusted(_) => "inventory.resource.adjusted",
            ResourceEvent::DetailsUpdated(_) => "inventory.resource.updated",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ResourceEvent::Created(e) => e.occurred_at,
            ResourceEvent::InventoryAdjusted(e) => e.transaction.created_at,
            ResourceEvent::DetailsUpdated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Resource {
    type Command = ResourceCommand;
    type Event = ResourceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ResourceEvent::Created(e) => {
                self.id = e.resource_id;
                self.name = e.name.clone();
                self.category = e.category;
                self.unit = e.unit;
                self.description = e.description.clone();
                self.total_quantity = Decimal::ZERO;
                self.available_quantity = Decimal::ZERO;
                self.is_active = true;
                self.created_at = e.occurred_at;
                self.created = true;
            }
            ResourceEvent::InventoryAdjusted(e) => {
                self.total_quantity += e.transaction.total_delta();
                self.available_quantity += e.transaction.available_delta();
            }
            ResourceEvent::DetailsUpdated(e) => {
                self.name = e.name.clone();
                self.category = e.category;
                self.unit = e.unit;
                self.description = e.description.clone();
                self.is_active = e.is_active;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ResourceCommand::Create(cmd) => self.handle_create(cmd),
            ResourceCommand::Adjust(cmd) => self.handle_adjust(cmd),
            ResourceCommand::UpdateDetails(cmd) => self.handle_update(cmd),
        }
    }
}

fn validate_name(name: &str) -> Result<String, DomainError> {
    let trimmed = name.trim();
    let chars = trimmed.chars().count();
    if chars < NAME_MIN_CHARS || chars > NAME_MAX_CHARS {
        return Err(DomainError::validation(format!(
            "name must be between {NAME_MIN_CHARS} and {NAME_MAX_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

impl Resource {
    fn ensure_resource_id(&self, resource_id: ResourceId) -> Result<(), DomainError> {
        if self.id != resource_id {
            return Err(DomainError::invariant("resource_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateResource) -> Result<Vec<ResourceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("resource already exists"));
        }
        let name = validate_name(&cmd.name)?;
        ensure_representable("total_quantity", cmd.initial_total)?;
        if cmd.initial_total < Decimal::ZERO {
            return Err(DomainError::validation("total_quantity cannot be negative"));
        }

        let mut events = vec![ResourceEvent::Created(ResourceCreated {
            resource_id: cmd.resource_id,
            name,
            category: cmd.category,
            unit: cmd.unit,
            description: cmd.description.clone(),
            occurred_at: cmd.occurred_at,
        })];

        if cmd.initial_total > Decimal::ZERO {
            events.push(ResourceEvent::InventoryAdjusted(InventoryAdjusted {
                transaction: ResourceInventoryTransaction {
                    id: cmd.initial_transaction_id,
                    resource_id: cmd.resource_id,
                    transaction_type: TransactionType::Add,
                    quantity_delta: cmd.initial_total,
                    reason: INITIAL_CREATION_REASON.to_string(),
                    related_request: None,
                    related_donation_item: None,
                    created_by: cmd.actor,
                    created_at: cmd.occurred_at,
                },
            }));
        }

        Ok(events)
    }

    /// Signed change to `available_quantity` the command asks for, before any
    /// shortfall handling.
    fn requested_effect(cmd: &AdjustInventory) -> Result<Decimal, DomainError> {
        let delta = cmd.quantity_delta;
        ensure_representable("quantity_delta", delta)?;
        if delta == Decimal::ZERO {
            return Err(DomainError::validation("quantity_delta cannot be zero"));
        }

        match cmd.transaction_type {
            TransactionType::Add | TransactionType::Donation => {
                ensure_positive("quantity_delta", delta)?;
                Ok(delta)
            }
            TransactionType::Remove => {
                ensure_positive("quantity_delta", delta)?;
                Ok(-delta)
            }
            TransactionType::Adjust => Ok(delta),
            TransactionType::Fulfillment => {
                if delta > Decimal::ZERO {
                    return Err(DomainError::validation(
                        "fulfillment quantity_delta must be negative",
                    ));
                }
                Ok(delta)
            }
        }
    }

    fn handle_adjust(&self, cmd: &AdjustInventory) -> Result<Vec<ResourceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_resource_id(cmd.resource_id)?;

        let mut effect = Self::requested_effect(cmd)?;

        if self.available_quantity + effect < Decimal::ZERO {
            let clamps = cmd.transaction_type == TransactionType::Fulfillment
                && cmd.shortfall == ShortfallPolicy::Clamp;
            if !clamps {
                return Err(DomainError::insufficient(
                    self.id,
                    -effect,
                    self.available_quantity,
                ));
            }
            effect = -self.available_quantity;
        }

        let total_effect = if cmd.transaction_type.affects_total() {
            effect
        } else {
            Decimal::ZERO
        };
        let new_total = self.total_quantity + total_effect;
        let new_available = self.available_quantity + effect;

        if new_available > new_total {
            return Err(DomainError::validation(
                "available_quantity cannot exceed total_quantity",
            ));
        }
        if new_total >= quantity_limit() {
            return Err(DomainError::validation("total_quantity is out of range"));
        }

        let reason = if cmd.reason.trim().is_empty() {
            DEFAULT_ADJUSTMENT_REASON.to_string()
        } else {
            cmd.reason.clone()
        };

        Ok(vec![ResourceEvent::InventoryAdjusted(InventoryAdjusted {
            transaction: ResourceInventoryTransaction {
                id: cmd.transaction_id,
                resource_id: cmd.resource_id,
                transaction_type: cmd.transaction_type,
                quantity_delta: effect,
                reason,
                related_request: cmd.link.request(),
                related_donation_item: cmd.link.donation_item(),
                created_by: cmd.actor,
                created_at: cmd.occurred_at,
            },
        })])
    }

    fn handle_update(&self, cmd: &UpdateResourceDetails) -> Result<Vec<ResourceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_resource_id(cmd.resource_id)?;

        if cmd.patch.is_empty() {
            return Ok(vec![]);
        }

        let name = match &cmd.patch.name {
            Some(name) => validate_name(name)?,
            None => self.name.clone(),
        };

        Ok(vec![ResourceEvent::DetailsUpdated(ResourceDetailsUpdated {
            resource_id: self.id,
            name,
            category: cmd.patch.category.unwrap_or(self.category),
            unit: cmd.patch.unit.unwrap_or(self.unit),
            description: cmd
                .patch
                .description
                .clone()
                .unwrap_or_else(|| self.description.clone()),
            is_active: cmd.patch.is_active.unwrap_or(self.is_active),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::LedgerTotals;
    use proptest::prelude::*;

    fn qty(n: i64) -> Decimal {
        Decimal::from(n)
    }

    fn create_cmd(id: ResourceId, initial: i64) -> CreateResource {
        CreateResource {
            resource_id: id,
            name: "Rice".to_string(),
            category: ResourceCategory::Food,
            unit: ResourceUnit::Kg,
            description: String::new(),
            initial_total: qty(initial),
            initial_transaction_id: TransactionId::new(),
            actor: None,
            occurred_at: Utc::now(),
        }
    }

    fn adjust_cmd(id: ResourceId, transaction_type: TransactionType, delta: i64) -> AdjustInventory {
        AdjustInventory {
            resource_id: id,
            transaction_id: TransactionId::new(),
            transaction_type,
            quantity_delta: qty(delta),
            reason: String::new(),
            link: TransactionLink::None,
            shortfall: ShortfallPolicy::Reject,
            actor: None,
            occurred_at: Utc::now(),
        }
    }

    fn created(initial: i64) -> (Resource, Vec<ResourceEvent>) {
        let id = ResourceId::new();
        let mut resource = Resource::empty(id);
        let events = resource
            .execute(&ResourceCommand::Create(create_cmd(id, initial)))
            .unwrap();
        (resource, events)
    }

    #[test]
    fn create_with_zero_total_writes_no_ledger_row() {
        let (resource, events) = created(0);
        assert_eq!(events.len(), 1);
        assert!(events[0].transaction().is_none());
        assert_eq!(resource.available_quantity(), Decimal::ZERO);
        assert_eq!(resource.version(), 1);
    }

    #[test]
    fn create_with_stock_records_initial_add() {
        let (resource, events) = created(250);
        let tx = events[1].transaction().unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Add);
        assert_eq!(tx.quantity_delta, qty(250));
        assert_eq!(tx.reason, INITIAL_CREATION_REASON);
        assert_eq!(resource.total_quantity(), qty(250));
        assert_eq!(resource.available_quantity(), qty(250));
    }

    #[test]
    fn create_rejects_short_name() {
        let id = ResourceId::new();
        let mut cmd = create_cmd(id, 0);
        cmd.name = " R ".to_string();
        let err = Resource::empty(id).handle(&ResourceCommand::Create(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn unknown_category_or_unit_lists_accepted_values() {
        let DomainError::Validation(msg) = "gravel".parse::<ResourceCategory>().unwrap_err()
        else {
            panic!("expected a validation error");
        };
        assert!(msg.contains("invalid category"));
        assert!(msg.contains("Must be one of: food, water, medical"));

        let DomainError::Validation(msg) = "ton".parse::<ResourceUnit>().unwrap_err() else {
            panic!("expected a validation error");
        };
        assert!(msg.contains("invalid unit"));
        assert!(msg.contains("kg, g, l, ml, piece, box, pack, unit"));

        assert_eq!("kg".parse::<ResourceUnit>().unwrap(), ResourceUnit::Kg);
    }

    #[test]
    fn rice_add_scenario() {
        let (mut resource, _) = created(0);
        let id = resource.id_typed();
        let events = resource
            .execute(&ResourceCommand::Adjust(adjust_cmd(id, TransactionType::Add, 5000)))
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transaction().unwrap().quantity_delta, qty(5000));
        assert_eq!(resource.total_quantity(), qty(5000));
        assert_eq!(resource.available_quantity(), qty(5000));
    }

    #[test]
    fn remove_beyond_available_is_rejected() {
        let (resource, _) = created(100);
        let id = resource.id_typed();
        let err = resource
            .handle(&ResourceCommand::Adjust(adjust_cmd(id, TransactionType::Remove, 150)))
            .unwrap_err();

        assert_eq!(err, DomainError::insufficient(id, qty(150), qty(100)));
        assert_eq!(resource.available_quantity(), qty(100));
    }

    #[test]
    fn remove_records_negative_delta() {
        let (mut resource, _) = created(100);
        let id = resource.id_typed();
        let events = resource
            .execute(&ResourceCommand::Adjust(adjust_cmd(id, TransactionType::Remove, 40)))
            .unwrap();

        let tx = events[0].transaction().unwrap();
        assert_eq!(tx.quantity_delta, qty(-40));
        assert_eq!(tx.reason, DEFAULT_ADJUSTMENT_REASON);
        assert_eq!(resource.total_quantity(), qty(100));
        assert_eq!(resource.available_quantity(), qty(60));
    }

    #[test]
    fn adjust_cannot_exceed_total() {
        let (mut resource, _) = created(100);
        let id = resource.id_typed();
        resource
            .execute(&ResourceCommand::Adjust(adjust_cmd(id, TransactionType::Adjust, -30)))
            .unwrap();

        let err = resource
            .handle(&ResourceCommand::Adjust(adjust_cmd(id, TransactionType::Adjust, 31)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        resource
            .execute(&ResourceCommand::Adjust(adjust_cmd(id, TransactionType::Adjust, 30)))
            .unwrap();
        assert_eq!(resource.available_quantity(), qty(100));
    }

    #[test]
    fn fulfillment_clamps_only_when_asked() {
        let (mut resource, _) = created(100);
        let id = resource.id_typed();

        let reject = adjust_cmd(id, TransactionType::Fulfillment, -500);
        assert!(matches!(
            resource.handle(&ResourceCommand::Adjust(reject.clone())),
            Err(DomainError::InsufficientInventory { .. })
        ));

        let clamp = AdjustInventory {
            shortfall: ShortfallPolicy::Clamp,
            ..reject
        };
        let events = resource.execute(&ResourceCommand::Adjust(clamp)).unwrap();
        assert_eq!(events[0].transaction().unwrap().quantity_delta, qty(-100));
        assert_eq!(resource.available_quantity(), Decimal::ZERO);
        assert_eq!(resource.total_quantity(), qty(100));
    }

    #[test]
    fn clamp_is_ignored_for_remove() {
        let (resource, _) = created(10);
        let id = resource.id_typed();
        let cmd = AdjustInventory {
            shortfall: ShortfallPolicy::Clamp,
            ..adjust_cmd(id, TransactionType::Remove, 11)
        };
        assert!(matches!(
            resource.handle(&ResourceCommand::Adjust(cmd)),
            Err(DomainError::InsufficientInventory { .. })
        ));
    }

    #[test]
    fn sign_rules_per_type() {
        let (resource, _) = created(10);
        let id = resource.id_typed();
        for (ty, delta) in [
            (TransactionType::Add, -1),
            (TransactionType::Donation, -1),
            (TransactionType::Remove, -1),
            (TransactionType::Fulfillment, 1),
            (TransactionType::Adjust, 0),
        ] {
            let err = resource
                .handle(&ResourceCommand::Adjust(adjust_cmd(id, ty, delta)))
                .unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{ty} {delta}");
        }
    }

    #[test]
    fn adjust_unknown_resource_is_not_found() {
        let id = ResourceId::new();
        let err = Resource::empty(id)
            .handle(&ResourceCommand::Adjust(adjust_cmd(id, TransactionType::Add, 1)))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn details_update_keeps_quantities() {
        let (mut resource, _) = created(75);
        let id = resource.id_typed();
        let events = resource
            .execute(&ResourceCommand::UpdateDetails(UpdateResourceDetails {
                resource_id: id,
                patch: ResourceDetailsPatch {
                    is_active: Some(false),
                    unit: Some(ResourceUnit::Box),
                    ..Default::default()
                },
                occurred_at: Utc::now(),
            }))
            .unwrap();

        assert_eq!(events.len(), 1);
        assert!(!resource.is_active());
        let snapshot = resource.snapshot().unwrap();
        assert_eq!(snapshot.unit, ResourceUnit::Box);
        assert_eq!(snapshot.available_quantity, qty(75));
    }

    #[test]
    fn snapshot_round_trips_through_rehydration() {
        let (resource, _) = created(12);
        let snapshot = resource.snapshot().unwrap();
        assert_eq!(Resource::from_snapshot(snapshot.clone()).snapshot(), Some(snapshot));
        assert!(Resource::empty(ResourceId::new()).snapshot().is_none());
    }

    fn arb_adjustment() -> impl Strategy<Value = (TransactionType, i64)> {
        prop_oneof![
            (Just(TransactionType::Add), 1i64..500),
            (Just(TransactionType::Donation), 1i64..500),
            (Just(TransactionType::Remove), 1i64..500),
            (Just(TransactionType::Adjust), -500i64..500),
            (Just(TransactionType::Fulfillment), -500i64..0),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of adjustments is attempted, accepted ones keep
        /// `0 <= available <= total`, rejected ones change nothing, and replaying the
        /// emitted ledger rows reproduces the aggregate's quantities.
        #[test]
        fn invariants_hold_and_ledger_replays(
            initial in 0i64..1_000,
            ops in prop::collection::vec((arb_adjustment(), any::<bool>()), 1..40)
        ) {
            let (mut resource, creation) = created(initial);
            let id = resource.id_typed();
            let mut rows: Vec<ResourceInventoryTransaction> =
                creation.iter().filter_map(|e| e.transaction().cloned()).collect();

            for ((ty, delta), clamp) in ops {
                let before = resource.clone();
                let cmd = AdjustInventory {
                    shortfall: if clamp { ShortfallPolicy::Clamp } else { ShortfallPolicy::Reject },
                    ..adjust_cmd(id, ty, delta)
                };
                match resource.execute(&ResourceCommand::Adjust(cmd)) {
                    Ok(events) => rows.extend(events.iter().filter_map(|e| e.transaction().cloned())),
                    Err(_) => prop_assert_eq!(&resource, &before),
                }

                prop_assert!(resource.available_quantity() >= Decimal::ZERO);
                prop_assert!(resource.available_quantity() <= resource.total_quantity());
            }

            let totals = LedgerTotals::replay(&rows);
            prop_assert_eq!(totals.total_quantity, resource.total_quantity());
            prop_assert_eq!(totals.available_quantity, resource.available_quantity());
        }
    }
}
