//! Donation intake.
//!
//! A donation only touches inventory on its first move into `accepted`; the
//! decision below yields one credit per item still linked to a resource.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use reliefops_core::{
    AggregateRoot, CampId, DomainError, DomainResult, DonationId, DonationItemId, ResourceId,
    UserId,
};
use reliefops_events::Event;

use crate::choices::string_choices;
use crate::quantity::ensure_positive;

const DONOR_NAME_MAX_CHARS: usize = 200;

/// Used when a status change or acknowledgment carries no text.
pub const DEFAULT_ACKNOWLEDGMENT_TEXT: &str = "Thank you for your donation!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DonorType {
    Individual,
    Organization,
}

string_choices!(DonorType, "donor_type", {
    Individual => "individual",
    Organization => "organization",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DonationStatus {
    Pending,
    Accepted,
    Rejected,
}

string_choices!(DonationStatus, "status", {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationItem {
    pub id: DonationItemId,
    /// `None` once the resource was removed; such items are skipped on acceptance.
    pub resource_id: Option<ResourceId>,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub id: DonationId,
    pub donor_name: String,
    pub donor_type: DonorType,
    pub contact_email: String,
    pub contact_phone: String,
    pub camp_id: Option<CampId>,
    pub status: DonationStatus,
    pub items: Vec<DonationItem>,
    pub created_by: Option<UserId>,
    pub donation_date: DateTime<Utc>,
    pub version: u64,
}

impl AggregateRoot for Donation {
    type Id = DonationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDonation {
    pub donation_id: DonationId,
    pub donor_name: String,
    pub donor_type: DonorType,
    pub contact_email: String,
    pub contact_phone: String,
    pub camp_id: Option<CampId>,
    pub items: Vec<DonationItem>,
    pub created_by: Option<UserId>,
    pub donated_at: DateTime<Utc>,
}

/// Thank-you note recorded against a donation; at most one per donation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationAcknowledgment {
    pub donation_id: DonationId,
    pub text: String,
    pub acknowledged_by: Option<UserId>,
    pub acknowledged_at: DateTime<Utc>,
}

impl DonationAcknowledgment {
    /// Replace text and author of an existing note. `acknowledged_at` is kept
    /// from the first acknowledgment.
    pub fn revise(&self, text: Option<&str>, by: Option<UserId>) -> DonationAcknowledgment {
        DonationAcknowledgment {
            donation_id: self.donation_id,
            text: acknowledgment_text(text),
            acknowledged_by: by,
            acknowledged_at: self.acknowledged_at,
        }
    }
}

fn acknowledgment_text(text: Option<&str>) -> String {
    match text.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => DEFAULT_ACKNOWLEDGMENT_TEXT.to_string(),
    }
}

/// Inventory credit owed for one donated item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationCredit {
    pub donation_item_id: DonationItemId,
    pub resource_id: ResourceId,
    pub quantity: Decimal,
    pub reason: String,
}

/// Outcome of a status change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DonationDecision {
    /// Already in the requested status; nothing to write.
    Unchanged,
    Changed {
        donation: Donation,
        previous_status: DonationStatus,
        credits: Vec<DonationCredit>,
    },
}

impl Donation {
    /// Record a pledge in `pending`.
    pub fn register(new: NewDonation) -> DomainResult<Donation> {
        let donor_name = new.donor_name.trim();
        if donor_name.is_empty() {
            return Err(DomainError::validation("donor_name is required"));
        }
        if donor_name.chars().count() > DONOR_NAME_MAX_CHARS {
            return Err(DomainError::validation(format!(
                "donor_name must be at most {DONOR_NAME_MAX_CHARS} characters"
            )));
        }
        if new.items.is_empty() {
            return Err(DomainError::validation("items are required"));
        }
        for item in &new.items {
            ensure_positive("quantity", item.quantity)?;
        }

        Ok(Donation {
            id: new.donation_id,
            donor_name: donor_name.to_string(),
            donor_type: new.donor_type,
            contact_email: new.contact_email,
            contact_phone: new.contact_phone,
            camp_id: new.camp_id,
            status: DonationStatus::Pending,
            items: new.items,
            created_by: new.created_by,
            donation_date: new.donated_at,
            version: 1,
        })
    }

    /// Decide a status change.
    ///
    /// Entering `accepted` yields the credits; re-entering the current status
    /// is `Unchanged`; leaving `accepted` is refused so stock is never
    /// credited twice for the same donation.
    pub fn change_status(&self, new_status: DonationStatus) -> DomainResult<DonationDecision> {
        if new_status == self.status {
            return Ok(DonationDecision::Unchanged);
        }
        if self.status == DonationStatus::Accepted {
            return Err(DomainError::validation(format!(
                "accepted donation cannot move to {new_status}"
            )));
        }

        let credits = if new_status == DonationStatus::Accepted {
            self.credits()
        } else {
            Vec::new()
        };

        let mut donation = self.clone();
        donation.status = new_status;
        donation.version += 1;

        Ok(DonationDecision::Changed {
            donation,
            previous_status: self.status,
            credits,
        })
    }

    /// First acknowledgment of this donation. Blank text falls back to
    /// [`DEFAULT_ACKNOWLEDGMENT_TEXT`].
    pub fn acknowledge(
        &self,
        text: Option<&str>,
        by: Option<UserId>,
        at: DateTime<Utc>,
    ) -> DonationAcknowledgment {
        DonationAcknowledgment {
            donation_id: self.id,
            text: acknowledgment_text(text),
            acknowledged_by: by,
            acknowledged_at: at,
        }
    }

    fn credits(&self) -> Vec<DonationCredit> {
        let reason = format!("Donation {} accepted from {}", self.id, self.donor_name);
        self.items
            .iter()
            .filter_map(|item| {
                item.resource_id.map(|resource_id| DonationCredit {
                    donation_item_id: item.id,
                    resource_id,
                    quantity: item.quantity,
                    reason: reason.clone(),
                })
            })
            .collect()
    }
}

/// Event: DonationRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationRegistered {
    pub donation: Donation,
}

/// Event: DonationStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationStatusChanged {
    pub donation_id: DonationId,
    pub previous_status: DonationStatus,
    pub new_status: DonationStatus,
    pub changed_by: Option<UserId>,
    /// Number of inventory credits written alongside.
    pub credited_items: usize,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonationEvent {
    Registered(DonationRegistered),
    StatusChanged(DonationStatusChanged),
}

impl Event for DonationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DonationEvent::Registered(_) => "operations.donation.registered",
            DonationEvent::StatusChanged(_) => "operations.donation.status_changed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DonationEvent::Registered(e) => e.donation.donation_date,
            DonationEvent::StatusChanged(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donation(items: Vec<DonationItem>) -> Donation {
        Donation::register(NewDonation {
            donation_id: DonationId::new(),
            donor_name: "  Red Crescent ".to_string(),
            donor_type: DonorType::Organization,
            contact_email: String::new(),
            contact_phone: String::new(),
            camp_id: None,
            items,
            created_by: None,
            donated_at: Utc::now(),
        })
        .unwrap()
    }

    fn item(resource_id: Option<ResourceId>, quantity: i64) -> DonationItem {
        DonationItem {
            id: DonationItemId::new(),
            resource_id,
            quantity: Decimal::from(quantity),
        }
    }

    #[test]
    fn register_trims_donor_and_starts_pending() {
        let d = donation(vec![item(Some(ResourceId::new()), 3)]);
        assert_eq!(d.donor_name, "Red Crescent");
        assert_eq!(d.status, DonationStatus::Pending);
    }

    #[test]
    fn register_rejects_non_positive_items() {
        let err = Donation::register(NewDonation {
            donation_id: DonationId::new(),
            donor_name: "Ana".to_string(),
            donor_type: DonorType::Individual,
            contact_email: String::new(),
            contact_phone: String::new(),
            camp_id: None,
            items: vec![item(None, 0)],
            created_by: None,
            donated_at: Utc::now(),
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn register_rejects_empty_items() {
        let err = Donation::register(NewDonation {
            donation_id: DonationId::new(),
            donor_name: "Ana".to_string(),
            donor_type: DonorType::Individual,
            contact_email: String::new(),
            contact_phone: String::new(),
            camp_id: None,
            items: vec![],
            created_by: None,
            donated_at: Utc::now(),
        })
        .unwrap_err();
        assert_eq!(err, DomainError::validation("items are required"));
    }

    #[test]
    fn acknowledgment_defaults_text_and_keeps_first_time() {
        let d = donation(vec![item(Some(ResourceId::new()), 1)]);
        let first_at = Utc::now();
        let ack = d.acknowledge(Some("   "), None, first_at);
        assert_eq!(ack.donation_id, d.id);
        assert_eq!(ack.text, DEFAULT_ACKNOWLEDGMENT_TEXT);

        let officer = UserId::new();
        let revised = ack.revise(Some(" Received with thanks "), Some(officer));
        assert_eq!(revised.text, "Received with thanks");
        assert_eq!(revised.acknowledged_by, Some(officer));
        assert_eq!(revised.acknowledged_at, first_at);
    }

    #[test]
    fn acceptance_credits_linked_items_only() {
        let resource = ResourceId::new();
        let d = donation(vec![item(Some(resource), 40), item(None, 7)]);

        let DonationDecision::Changed { donation, credits, previous_status } =
            d.change_status(DonationStatus::Accepted).unwrap()
        else {
            panic!("expected a change");
        };

        assert_eq!(previous_status, DonationStatus::Pending);
        assert_eq!(donation.status, DonationStatus::Accepted);
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].resource_id, resource);
        assert_eq!(credits[0].quantity, Decimal::from(40));
        assert_eq!(
            credits[0].reason,
            format!("Donation {} accepted from Red Crescent", d.id)
        );
    }

    #[test]
    fn reaccepting_is_unchanged_and_leaving_accepted_fails() {
        let d = donation(vec![item(Some(ResourceId::new()), 1)]);
        let DonationDecision::Changed { donation: accepted, .. } =
            d.change_status(DonationStatus::Accepted).unwrap()
        else {
            panic!("expected a change");
        };

        assert_eq!(
            accepted.change_status(DonationStatus::Accepted).unwrap(),
            DonationDecision::Unchanged
        );
        assert!(accepted.change_status(DonationStatus::Rejected).is_err());
    }

    #[test]
    fn rejected_donation_can_still_be_accepted_once() {
        let d = donation(vec![item(Some(ResourceId::new()), 2)]);
        let DonationDecision::Changed { donation: rejected, credits, .. } =
            d.change_status(DonationStatus::Rejected).unwrap()
        else {
            panic!("expected a change");
        };
        assert!(credits.is_empty());

        let DonationDecision::Changed { credits, .. } =
            rejected.change_status(DonationStatus::Accepted).unwrap()
        else {
            panic!("expected a change");
        };
        assert_eq!(credits.len(), 1);
    }
}
