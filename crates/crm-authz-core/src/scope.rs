use serde::{Deserialize, Serialize};

use crate::{Principal, PrincipalId, ResourceKind, Role, VisibilityFacts};

/// One disjunct of a visibility filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "condition", content = "principal_id", rename_all = "snake_case")]
pub enum ScopeCondition {
    SalesOwner(PrincipalId),
    /// Contract/event support contact, or for a customer the support contact of any
    /// of its contracts.
    SupportOwner(PrincipalId),
    Prospect,
}

impl ScopeCondition {
    #[must_use]
    pub fn matches(&self, facts: &VisibilityFacts) -> bool {
        match self {
            Self::SalesOwner(principal) => facts.is_sales_owner(*principal),
            Self::SupportOwner(principal) => facts.is_support_contact(*principal),
            Self::Prospect => facts.is_prospect,
        }
    }
}

/// Visibility filter for a list query. Stores translate it into their own query
/// language; the rule engine evaluates it against [`VisibilityFacts`] for reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "conditions", rename_all = "snake_case")]
pub enum ScopePredicate {
    Unrestricted,
    AnyOf(Vec<ScopeCondition>),
}

impl ScopePredicate {
    #[must_use]
    pub fn matches(&self, facts: &VisibilityFacts) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::AnyOf(conditions) => conditions.iter().any(|condition| condition.matches(facts)),
        }
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }
}

#[must_use]
pub fn scope_query(principal: &Principal, kind: ResourceKind) -> ScopePredicate {
    match principal.role {
        Role::Management => ScopePredicate::Unrestricted,
        Role::Sales => {
            let mut conditions = vec![ScopeCondition::SalesOwner(principal.id)];
            if kind == ResourceKind::Customer {
                conditions.push(ScopeCondition::Prospect);
            }
            ScopePredicate::AnyOf(conditions)
        }
        Role::Support => ScopePredicate::AnyOf(vec![ScopeCondition::SupportOwner(principal.id)]),
    }
}
