//! Per-entity permission rules.
//!
//! Every check on an existing resource runs in the same order: visibility first, then
//! lock state, then role capability and ownership. Creates check capability first and
//! then whether the parent record is visible. Field-level transitions are left to the
//! guard, which the write path runs after an `Allow`.

use crate::{scope_query, Principal, ResourceKind, TransitionReason, VisibilityFacts};

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum Denial {
    /// The resource exists but falls outside the principal's scope.
    #[error("resource is not visible to principal")]
    NotVisible,
    #[error("principal is not allowed to perform this operation")]
    Forbidden,
    #[error("resource is locked: {0}")]
    Locked(TransitionReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }

    /// # Errors
    /// Returns the [`Denial`] carried by a `Deny` decision.
    pub fn into_result(self) -> Result<(), Denial> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(denial) => Err(denial),
        }
    }

    fn and_then(self, next: impl FnOnce() -> Self) -> Self {
        match self {
            Self::Allow => next(),
            deny @ Self::Deny(_) => deny,
        }
    }

    fn deny_when(condition: bool, denial: Denial) -> Self {
        if condition {
            Self::Deny(denial)
        } else {
            Self::Allow
        }
    }
}

fn visible(principal: &Principal, kind: ResourceKind, facts: &VisibilityFacts) -> Decision {
    Decision::deny_when(!scope_query(principal, kind).matches(facts), Denial::NotVisible)
}

pub mod customer_rules {
    use super::{visible, Decision, Denial};
    use crate::{Principal, ResourceKind, Role, VisibilityFacts};

    /// Every role may list; results are narrowed by [`crate::scope_query`].
    #[must_use]
    pub fn can_list(_principal: &Principal) -> Decision {
        Decision::Allow
    }

    #[must_use]
    pub fn can_create(principal: &Principal) -> Decision {
        Decision::deny_when(principal.role == Role::Support, Denial::Forbidden)
    }

    #[must_use]
    pub fn can_read(principal: &Principal, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Customer, facts)
    }

    /// Sales reaching this point either owns the customer or is claiming a prospect.
    #[must_use]
    pub fn can_update(principal: &Principal, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Customer, facts)
            .and_then(|| Decision::deny_when(principal.role == Role::Support, Denial::Forbidden))
    }

    /// Only management, and only prospects.
    #[must_use]
    pub fn can_delete(principal: &Principal, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Customer, facts).and_then(|| {
            Decision::deny_when(
                !(principal.is_management() && facts.is_prospect),
                Denial::Forbidden,
            )
        })
    }
}

pub mod contract_rules {
    use super::{visible, Decision, Denial};
    use crate::{Contract, Principal, ResourceKind, Role, TransitionReason, VisibilityFacts};

    #[must_use]
    pub fn can_list(_principal: &Principal) -> Decision {
        Decision::Allow
    }

    /// `customer_facts` describe the customer the contract would belong to.
    #[must_use]
    pub fn can_create(principal: &Principal, customer_facts: &VisibilityFacts) -> Decision {
        Decision::deny_when(principal.role == Role::Support, Denial::Forbidden)
            .and_then(|| visible(principal, ResourceKind::Customer, customer_facts))
    }

    #[must_use]
    pub fn can_read(principal: &Principal, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Contract, facts)
    }

    #[must_use]
    pub fn can_update(principal: &Principal, contract: &Contract, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Contract, facts)
            .and_then(|| {
                Decision::deny_when(
                    contract.lock_state().is_locked() && !principal.is_management(),
                    Denial::Locked(TransitionReason::ContractLocked),
                )
            })
            .and_then(|| Decision::deny_when(principal.role == Role::Support, Denial::Forbidden))
    }

    #[must_use]
    pub fn can_delete(principal: &Principal, contract: &Contract, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Contract, facts)
            .and_then(|| {
                Decision::deny_when(
                    contract.lock_state().is_locked(),
                    Denial::Locked(TransitionReason::ContractLocked),
                )
            })
            .and_then(|| Decision::deny_when(!principal.is_management(), Denial::Forbidden))
    }
}

pub mod event_rules {
    use super::{visible, Decision, Denial};
    use crate::{Event, Principal, ResourceKind, TransitionReason, VisibilityFacts};

    #[must_use]
    pub fn can_list(_principal: &Principal) -> Decision {
        Decision::Allow
    }

    /// Any role may create an event on a contract it can see, which for support means
    /// a contract it is the support contact of.
    #[must_use]
    pub fn can_create(principal: &Principal, contract_facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Contract, contract_facts)
    }

    #[must_use]
    pub fn can_read(principal: &Principal, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Event, facts)
    }

    #[must_use]
    pub fn can_update(principal: &Principal, event: &Event, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Event, facts).and_then(|| {
            Decision::deny_when(
                event.lock_state().is_locked() && !principal.is_management(),
                Denial::Locked(TransitionReason::EventLocked),
            )
        })
    }

    #[must_use]
    pub fn can_delete(principal: &Principal, event: &Event, facts: &VisibilityFacts) -> Decision {
        visible(principal, ResourceKind::Event, facts).and_then(|| {
            Decision::deny_when(
                event.lock_state().is_locked(),
                Denial::Locked(TransitionReason::EventLocked),
            )
        })
    }
}
