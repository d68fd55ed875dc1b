use serde::{Deserialize, Serialize};

use crate::{
    Contract, ContractDraft, Customer, CustomerDraft, Event, EventDraft, EventId, Principal,
    PrincipalId, Role,
};

/// Why the state transition guard refused a write.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, thiserror::Error, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    #[error("locked state cannot be reopened")]
    IrreversibleStateChange,
    #[error("contract is signed")]
    ContractLocked,
    #[error("event is finished")]
    EventLocked,
    #[error("contract is not signed")]
    ContractNotSigned,
    #[error("customer is still a prospect")]
    CustomerNotConverted,
    #[error("contract already has an event")]
    DuplicateEvent,
}

impl TransitionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IrreversibleStateChange => "irreversible_state_change",
            Self::ContractLocked => "contract_locked",
            Self::EventLocked => "event_locked",
            Self::ContractNotSigned => "contract_not_signed",
            Self::CustomerNotConverted => "customer_not_converted",
            Self::DuplicateEvent => "duplicate_event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "irreversible_state_change" => Some(Self::IrreversibleStateChange),
            "contract_locked" => Some(Self::ContractLocked),
            "event_locked" => Some(Self::EventLocked),
            "contract_not_signed" => Some(Self::ContractNotSigned),
            "customer_not_converted" => Some(Self::CustomerNotConverted),
            "duplicate_event" => Some(Self::DuplicateEvent),
            _ => None,
        }
    }
}

/// Shared two-state lifecycle of `Contract.is_signed` and `Event.is_finished`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Open,
    Locked,
}

impl LockState {
    #[must_use]
    pub fn from_flag(locked: bool) -> Self {
        if locked {
            Self::Locked
        } else {
            Self::Open
        }
    }

    #[must_use]
    pub fn is_locked(self) -> bool {
        self == Self::Locked
    }

    /// # Errors
    /// Returns [`TransitionReason::IrreversibleStateChange`] for `Locked -> Open`.
    pub fn transition(self, to: Self) -> Result<Self, TransitionReason> {
        match (self, to) {
            (Self::Locked, Self::Open) => Err(TransitionReason::IrreversibleStateChange),
            (_, next) => Ok(next),
        }
    }
}

/// Server-controlled customer fields decided by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomerWrite {
    pub sales_contact: Option<PrincipalId>,
}

/// A sales principal creating a converted customer becomes its sales contact;
/// management leaves ownership for the administrative path.
#[must_use]
pub fn validate_customer_create(principal: &Principal, draft: &CustomerDraft) -> CustomerWrite {
    CustomerWrite { sales_contact: converting_owner(principal, draft.is_customer) }
}

/// # Errors
/// Returns [`TransitionReason::IrreversibleStateChange`] when a converted customer
/// would become a prospect again.
pub fn validate_customer_update(
    principal: &Principal,
    existing: &Customer,
    draft: &CustomerDraft,
) -> Result<CustomerWrite, TransitionReason> {
    if existing.is_customer && !draft.is_customer {
        return Err(TransitionReason::IrreversibleStateChange);
    }
    if existing.is_customer {
        return Ok(CustomerWrite { sales_contact: existing.sales_contact });
    }
    Ok(CustomerWrite { sales_contact: converting_owner(principal, draft.is_customer) })
}

fn converting_owner(principal: &Principal, is_customer: bool) -> Option<PrincipalId> {
    (is_customer && principal.role == Role::Sales).then_some(principal.id)
}

/// # Errors
/// Returns [`TransitionReason::CustomerNotConverted`] for a prospect.
pub fn validate_contract_create(customer: &Customer) -> Result<(), TransitionReason> {
    if customer.is_prospect() {
        return Err(TransitionReason::CustomerNotConverted);
    }
    Ok(())
}

/// # Errors
/// Returns [`TransitionReason::ContractLocked`] when a non-management principal edits a
/// signed contract, and [`TransitionReason::IrreversibleStateChange`] when anyone
/// unsigns one.
pub fn validate_contract_update(
    principal: &Principal,
    existing: &Contract,
    draft: &ContractDraft,
) -> Result<(), TransitionReason> {
    let current = existing.lock_state();
    if current.is_locked() && !principal.is_management() {
        return Err(TransitionReason::ContractLocked);
    }
    current.transition(LockState::from_flag(draft.is_signed)).map(|_| ())
}

/// # Errors
/// Returns [`TransitionReason::ContractLocked`] for a signed contract.
pub fn validate_contract_delete(existing: &Contract) -> Result<(), TransitionReason> {
    if existing.lock_state().is_locked() {
        return Err(TransitionReason::ContractLocked);
    }
    Ok(())
}

/// `existing_event` is the event already attached to `contract`, if any.
///
/// # Errors
/// Returns [`TransitionReason::ContractNotSigned`] or
/// [`TransitionReason::DuplicateEvent`].
pub fn validate_event_create(
    contract: &Contract,
    existing_event: Option<EventId>,
) -> Result<(), TransitionReason> {
    if !contract.lock_state().is_locked() {
        return Err(TransitionReason::ContractNotSigned);
    }
    if existing_event.is_some() {
        return Err(TransitionReason::DuplicateEvent);
    }
    Ok(())
}

/// # Errors
/// Returns [`TransitionReason::EventLocked`] when a non-management principal edits a
/// finished event, and [`TransitionReason::IrreversibleStateChange`] when anyone
/// reopens one.
pub fn validate_event_update(
    principal: &Principal,
    existing: &Event,
    draft: &EventDraft,
) -> Result<(), TransitionReason> {
    let current = existing.lock_state();
    if current.is_locked() && !principal.is_management() {
        return Err(TransitionReason::EventLocked);
    }
    current.transition(LockState::from_flag(draft.is_finished)).map(|_| ())
}

/// # Errors
/// Returns [`TransitionReason::EventLocked`] for a finished event.
pub fn validate_event_delete(existing: &Event) -> Result<(), TransitionReason> {
    if existing.lock_state().is_locked() {
        return Err(TransitionReason::EventLocked);
    }
    Ok(())
}
