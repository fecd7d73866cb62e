//! Camp resource requests and their status workflow.
//!
//! Status changes are explicit: every step returns the next request state
//! together with the history row describing it. Nothing writes history
//! behind the caller's back.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use reliefops_core::{
    AggregateRoot, CampId, DomainError, DomainResult, HistoryId, RequestId, ResourceId, UserId,
};
use reliefops_events::Event;

use crate::choices::string_choices;
use crate::quantity::ensure_positive;

/// Note recorded on the `pending -> pending` marker row written at creation.
pub const REQUEST_CREATED_NOTE: &str = "Resource request created";

/// Ordered: `Low < Medium < High < Urgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Low,
    Medium,
    High,
    Urgent,
}

string_choices!(RequestPriority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Fulfilled,
    Cancelled,
}

string_choices!(RequestStatus, "status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Fulfilled => "fulfilled",
    Cancelled => "cancelled",
});

/// How strictly status changes are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionMode {
    /// Only edges of the transition table are allowed.
    #[default]
    Strict,
    /// Any status may follow any other.
    Permissive,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Fulfilled | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    }

    /// Transition table:
    ///
    /// ```text
    /// pending  -> approved | rejected | cancelled | fulfilled
    /// approved -> fulfilled | cancelled
    /// fulfilled, rejected, cancelled: terminal
    /// ```
    pub fn can_transition_to(self, next: RequestStatus, mode: TransitionMode) -> bool {
        if mode == TransitionMode::Permissive {
            return true;
        }

        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved | Rejected | Cancelled | Fulfilled)
                | (Approved, Fulfilled | Cancelled)
        )
    }
}

/// Append-only audit row for one status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: HistoryId,
    pub request_id: RequestId,
    pub previous_status: RequestStatus,
    pub new_status: RequestStatus,
    pub changed_by: Option<UserId>,
    pub note: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: RequestId,
    pub camp_id: CampId,
    pub resource_id: ResourceId,
    pub quantity_requested: Decimal,
    pub quantity_fulfilled: Decimal,
    pub priority: RequestPriority,
    pub status: RequestStatus,
    pub requested_by: UserId,
    pub request_date: DateTime<Utc>,
    pub needed_by: DateTime<Utc>,
    pub reason: String,
    pub version: u64,
}

impl AggregateRoot for ResourceRequest {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Input for opening a request. Whether the resource exists and is active is
/// checked by the caller, which holds the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewResourceRequest {
    pub request_id: RequestId,
    pub history_id: HistoryId,
    pub camp_id: CampId,
    pub resource_id: ResourceId,
    pub quantity_requested: Decimal,
    pub priority: RequestPriority,
    pub needed_by: DateTime<Utc>,
    pub reason: String,
    pub requested_by: UserId,
    pub requested_at: DateTime<Utc>,
}

/// Who moves a request where, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub history_id: HistoryId,
    pub new_status: RequestStatus,
    pub changed_by: Option<UserId>,
    pub note: String,
    pub changed_at: DateTime<Utc>,
}

impl ResourceRequest {
    /// Open a request in `pending`, paired with its creation marker row.
    pub fn open(new: NewResourceRequest) -> DomainResult<(ResourceRequest, StatusHistoryEntry)> {
        ensure_positive("quantity_requested", new.quantity_requested)?;
        if new.needed_by <= new.requested_at {
            return Err(DomainError::validation("needed_by must be after request_date"));
        }

        let request = ResourceRequest {
            id: new.request_id,
            camp_id: new.camp_id,
            resource_id: new.resource_id,
            quantity_requested: new.quantity_requested,
            quantity_fulfilled: Decimal::ZERO,
            priority: new.priority,
            status: RequestStatus::Pending,
            requested_by: new.requested_by,
            request_date: new.requested_at,
            needed_by: new.needed_by,
            reason: new.reason,
            version: 1,
        };
        let marker = StatusHistoryEntry {
            id: new.history_id,
            request_id: request.id,
            previous_status: RequestStatus::Pending,
            new_status: RequestStatus::Pending,
            changed_by: Some(new.requested_by),
            note: REQUEST_CREATED_NOTE.to_string(),
            changed_at: new.requested_at,
        };

        Ok((request, marker))
    }

    /// Move to `change.new_status` without touching quantities.
    pub fn transition(
        &self,
        change: StatusChange,
        mode: TransitionMode,
    ) -> DomainResult<(ResourceRequest, StatusHistoryEntry)> {
        if !self.status.can_transition_to(change.new_status, mode) {
            return Err(DomainError::validation(format!(
                "cannot change request status from {} to {}",
                self.status, change.new_status
            )));
        }

        let mut next = self.clone();
        next.status = change.new_status;
        next.version += 1;

        let entry = StatusHistoryEntry {
            id: change.history_id,
            request_id: self.id,
            previous_status: self.status,
            new_status: change.new_status,
            changed_by: change.changed_by,
            note: change.note,
            changed_at: change.changed_at,
        };

        Ok((next, entry))
    }

    /// Move to `fulfilled` recording `quantity` as handed out.
    ///
    /// The matching inventory decrement is the caller's to commit alongside.
    pub fn fulfill(
        &self,
        quantity: Decimal,
        change: StatusChange,
        mode: TransitionMode,
    ) -> DomainResult<(ResourceRequest, StatusHistoryEntry)> {
        if change.new_status != RequestStatus::Fulfilled {
            return Err(DomainError::invariant("fulfill must target the fulfilled status"));
        }
        ensure_positive("quantity_fulfilled", quantity)?;
        if quantity > self.quantity_requested {
            return Err(DomainError::validation(format!(
                "quantity_fulfilled ({quantity}) cannot exceed quantity_requested ({})",
                self.quantity_requested
            )));
        }

        let (mut next, entry) = self.transition(change, mode)?;
        next.quantity_fulfilled = quantity;
        Ok((next, entry))
    }
}

/// Event: RequestCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCreated {
    pub request: ResourceRequest,
    pub history: StatusHistoryEntry,
}

/// Event: RequestStatusChanged (request as it is after the change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatusChanged {
    pub request: ResourceRequest,
    pub history: StatusHistoryEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEvent {
    Created(RequestCreated),
    StatusChanged(RequestStatusChanged),
}

impl RequestEvent {
    pub fn request(&self) -> &ResourceRequest {
        match self {
            RequestEvent::Created(e) => &e.request,
            RequestEvent::StatusChanged(e) => &e.request,
        }
    }

    pub fn history(&self) -> &StatusHistoryEntry {
        match self {
            RequestEvent::Created(e) => &e.history,
            RequestEvent::StatusChanged(e) => &e.history,
        }
    }
}

impl Event for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RequestEvent::Created(_) => "relief.request.created",
            RequestEvent::StatusChanged(_) => "relief.request.status_changed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.history().changed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_request(quantity: i64) -> ResourceRequest {
        let now = Utc::now();
        ResourceRequest::open(NewResourceRequest {
            request_id: RequestId::new(),
            history_id: HistoryId::new(),
            camp_id: CampId::new(),
            resource_id: ResourceId::new(),
            quantity_requested: Decimal::from(quantity),
            priority: RequestPriority::High,
            needed_by: now + Duration::days(2),
            reason: "Flood shelter".to_string(),
            requested_by: UserId::new(),
            requested_at: now,
        })
        .unwrap()
        .0
    }

    fn change(new_status: RequestStatus) -> StatusChange {
        StatusChange {
            history_id: HistoryId::new(),
            new_status,
            changed_by: None,
            note: String::new(),
            changed_at: Utc::now(),
        }
    }

    #[test]
    fn open_writes_creation_marker() {
        let now = Utc::now();
        let (request, marker) = ResourceRequest::open(NewResourceRequest {
            request_id: RequestId::new(),
            history_id: HistoryId::new(),
            camp_id: CampId::new(),
            resource_id: ResourceId::new(),
            quantity_requested: Decimal::from(10),
            priority: RequestPriority::Low,
            needed_by: now + Duration::hours(1),
            reason: String::new(),
            requested_by: UserId::new(),
            requested_at: now,
        })
        .unwrap();

        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.quantity_fulfilled, Decimal::ZERO);
        assert_eq!(marker.previous_status, RequestStatus::Pending);
        assert_eq!(marker.new_status, RequestStatus::Pending);
        assert_eq!(marker.note, REQUEST_CREATED_NOTE);
        assert_eq!(marker.request_id, request.id);
    }

    #[test]
    fn open_rejects_needed_by_in_the_past() {
        let now = Utc::now();
        let err = ResourceRequest::open(NewResourceRequest {
            request_id: RequestId::new(),
            history_id: HistoryId::new(),
            camp_id: CampId::new(),
            resource_id: ResourceId::new(),
            quantity_requested: Decimal::from(10),
            priority: RequestPriority::Low,
            needed_by: now,
            reason: String::new(),
            requested_by: UserId::new(),
            requested_at: now,
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn fulfill_records_quantity_and_history() {
        let request = open_request(500);
        let (next, entry) = request
            .fulfill(Decimal::from(500), change(RequestStatus::Fulfilled), TransitionMode::Strict)
            .unwrap();

        assert_eq!(next.status, RequestStatus::Fulfilled);
        assert_eq!(next.quantity_fulfilled, Decimal::from(500));
        assert_eq!(next.version, request.version + 1);
        assert_eq!(entry.previous_status, RequestStatus::Pending);
        assert_eq!(entry.new_status, RequestStatus::Fulfilled);
    }

    #[test]
    fn over_fulfillment_is_rejected() {
        let request = open_request(500);
        let err = request
            .fulfill(Decimal::from(501), change(RequestStatus::Fulfilled), TransitionMode::Strict)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn strict_mode_blocks_leaving_terminal_states() {
        let request = open_request(5);
        let (cancelled, _) = request
            .transition(change(RequestStatus::Cancelled), TransitionMode::Strict)
            .unwrap();

        assert!(
            cancelled
                .transition(change(RequestStatus::Fulfilled), TransitionMode::Strict)
                .is_err()
        );
        assert!(
            cancelled
                .transition(change(RequestStatus::Fulfilled), TransitionMode::Permissive)
                .is_ok()
        );
    }

    #[test]
    fn transition_table() {
        use RequestStatus::*;
        let strict = TransitionMode::Strict;
        assert!(Pending.can_transition_to(Approved, strict));
        assert!(Pending.can_transition_to(Fulfilled, strict));
        assert!(Approved.can_transition_to(Fulfilled, strict));
        assert!(!Pending.can_transition_to(Pending, strict));
        assert!(!Approved.can_transition_to(Pending, strict));
        for terminal in [Fulfilled, Rejected, Cancelled] {
            assert!(terminal.is_terminal());
            for next in RequestStatus::ALL {
                assert!(!terminal.can_transition_to(*next, strict));
            }
        }
    }

    #[test]
    fn approved_request_cannot_be_rejected_in_strict_mode() {
        let request = open_request(5);
        let (approved, _) = request
            .transition(change(RequestStatus::Approved), TransitionMode::Strict)
            .unwrap();

        let err = approved
            .transition(change(RequestStatus::Rejected), TransitionMode::Strict)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(!RequestStatus::Approved.can_transition_to(RequestStatus::Rejected, TransitionMode::Strict));
        assert!(
            approved
                .transition(change(RequestStatus::Rejected), TransitionMode::Permissive)
                .is_ok()
        );
    }

    #[test]
    fn priority_orders_by_urgency() {
        assert!(RequestPriority::Urgent > RequestPriority::High);
        assert!(RequestPriority::Medium > RequestPriority::Low);
        assert!("critical".parse::<RequestPriority>().is_err());
    }
}
