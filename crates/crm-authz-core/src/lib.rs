use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod guard;
mod ownership;
mod rules;
mod scope;

pub use guard::{
    validate_contract_create, validate_contract_delete, validate_contract_update,
    validate_customer_create, validate_customer_update, validate_event_create,
    validate_event_delete, validate_event_update, CustomerWrite, LockState, TransitionReason,
};
pub use ownership::{
    customer_support_contacts, resolve_owners, visibility_facts, EntityIndex, EntityLookup, Owners,
    VisibilityFacts,
};
pub use rules::{contract_rules, customer_rules, event_rules, Decision, Denial};
pub use scope::{scope_query, ScopeCondition, ScopePredicate};

pub const RULESET_VERSION: &str = "crm-rules.v1";

const MAX_NAME_LEN: usize = 25;
const MAX_COMPANY_LEN: usize = 100;
const MAX_PHONE_LEN: usize = 20;
const MAX_EMAIL_LEN: usize = 254;
const MAX_AMOUNT_CENTS: i64 = 9_999_999_999;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("lookup error: {0}")]
    Lookup(String),
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Identity of an authenticated actor.
    PrincipalId
);
ulid_id!(CustomerId);
ulid_id!(ContractId);
ulid_id!(EventId);

/// The only place roles exist as a type. Free-form role strings are parsed once at
/// the store/transport boundary and never compared anywhere else.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sales,
    Support,
    Management,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sales => "sales",
            Self::Support => "support",
            Self::Management => "management",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sales" => Some(Self::Sales),
            "support" => Some(Self::Support),
            "management" => Some(Self::Management),
            _ => None,
        }
    }
}

/// Authenticated actor for one request. Trusted verbatim by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Principal {
    pub id: PrincipalId,
    pub role: Role,
}

impl Principal {
    #[must_use]
    pub fn new(id: PrincipalId, role: Role) -> Self {
        Self { id, role }
    }

    #[must_use]
    pub fn is_management(&self) -> bool {
        self.role == Role::Management
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrincipalAccount {
    pub id: PrincipalId,
    pub username: String,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PrincipalAccount {
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal::new(self.id, self.role)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Customer,
    Contract,
    Event,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Contract => "contract",
            Self::Event => "event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "customer" => Some(Self::Customer),
            "contract" => Some(Self::Contract),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub id: CustomerId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone_number: String,
    pub mobile: String,
    pub company_name: String,
    pub is_customer: bool,
    pub sales_contact: Option<PrincipalId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Customer {
    #[must_use]
    pub fn is_prospect(&self) -> bool {
        !self.is_customer
    }
}

impl Display for Customer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} (is customer: {})", self.first_name, self.last_name, self.is_customer)
    }
}

/// Proposed customer fields for create or full-replacement update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerDraft {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub mobile: String,
    pub company_name: String,
    #[serde(default)]
    pub is_customer: bool,
}

impl CustomerDraft {
    /// Check field-level completeness before any policy evaluation.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when a required field is blank or a field
    /// exceeds its maximum length, or the email address is malformed.
    pub fn validate(&self) -> Result<(), KernelError> {
        require_text("first_name", &self.first_name, MAX_NAME_LEN)?;
        require_text("last_name", &self.last_name, MAX_NAME_LEN)?;
        require_text("company_name", &self.company_name, MAX_COMPANY_LEN)?;
        require_text("email", &self.email, MAX_EMAIL_LEN)?;

        let Some((local, domain)) = self.email.split_once('@') else {
            return Err(KernelError::Validation("email MUST contain '@'".to_string()));
        };
        if local.trim().is_empty() || domain.trim().is_empty() {
            return Err(KernelError::Validation("email MUST be formatted as user@domain".to_string()));
        }

        for (field, value) in [("phone_number", &self.phone_number), ("mobile", &self.mobile)] {
            if value.chars().count() > MAX_PHONE_LEN {
                return Err(KernelError::Validation(format!(
                    "{field} MUST be at most {MAX_PHONE_LEN} characters"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contract {
    pub id: ContractId,
    pub customer_id: CustomerId,
    pub amount_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub payment_due_date: OffsetDateTime,
    pub is_signed: bool,
    pub support_contact: Option<PrincipalId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Contract {
    #[must_use]
    pub fn lock_state(&self) -> LockState {
        LockState::from_flag(self.is_signed)
    }
}

impl Display for Contract {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "contract {} (is signed: {})", self.id, self.is_signed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractDraft {
    pub customer_id: CustomerId,
    pub amount_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub payment_due_date: OffsetDateTime,
    #[serde(default)]
    pub is_signed: bool,
}

impl ContractDraft {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the amount is negative or does not fit
    /// ten digits with two decimal places.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.amount_cents < 0 {
            return Err(KernelError::Validation("amount_cents MUST be >= 0".to_string()));
        }
        if self.amount_cents > MAX_AMOUNT_CENTS {
            return Err(KernelError::Validation(format!(
                "amount_cents MUST be <= {MAX_AMOUNT_CENTS}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub contract_id: ContractId,
    pub event_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_date: OffsetDateTime,
    pub attendees: u32,
    pub notes: String,
    pub is_finished: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Event {
    #[must_use]
    pub fn lock_state(&self) -> LockState {
        LockState::from_flag(self.is_finished)
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status: {})", self.event_name, self.is_finished)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventDraft {
    pub contract_id: ContractId,
    pub event_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_date: OffsetDateTime,
    #[serde(default)]
    pub attendees: u32,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub is_finished: bool,
}

impl EventDraft {
    /// # Errors
    /// Returns [`KernelError::Validation`] when `event_name` is blank or too long.
    pub fn validate(&self) -> Result<(), KernelError> {
        require_text("event_name", &self.event_name, MAX_COMPANY_LEN)
    }
}

/// Borrowed view over one stored resource, used wherever the engine needs to treat
/// the three kinds uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRef<'a> {
    Customer(&'a Customer),
    Contract(&'a Contract),
    Event(&'a Event),
}

impl ResourceRef<'_> {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Customer(_) => ResourceKind::Customer,
            Self::Contract(_) => ResourceKind::Contract,
            Self::Event(_) => ResourceKind::Event,
        }
    }

    #[must_use]
    pub fn id(&self) -> Ulid {
        match self {
            Self::Customer(customer) => customer.id.0,
            Self::Contract(contract) => contract.id.0,
            Self::Event(event) => event.id.0,
        }
    }
}

fn require_text(field: &str, value: &str, max_len: usize) -> Result<(), KernelError> {
    if value.trim().is_empty() {
        return Err(KernelError::Validation(format!("{field} MUST be provided")));
    }
    if value.chars().count() > max_len {
        return Err(KernelError::Validation(format!(
            "{field} MUST be at most {max_len} characters"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn assert_validation_error_contains(result: Result<(), KernelError>, expected_substring: &str) {
        let err = match result {
            Ok(()) => panic!("expected validation error containing: {expected_substring}"),
            Err(err) => err,
        };

        assert!(
            err.to_string().contains(expected_substring),
            "validation error `{err}` did not contain `{expected_substring}`"
        );
    }

    #[test]
    fn role_round_trips_through_its_wire_name() {
        for role in [Role::Sales, Role::Support, Role::Management] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("Management"), None);
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn role_serializes_as_snake_case() {
        let json = match serde_json::to_string(&Role::Management) {
            Ok(json) => json,
            Err(err) => panic!("role should serialize: {err}"),
        };
        assert_eq!(json, "\"management\"");
    }

    #[test]
    fn ids_parse_from_their_display_form() {
        let id = CustomerId::new();
        let parsed = match id.to_string().parse::<CustomerId>() {
            Ok(parsed) => parsed,
            Err(err) => panic!("id should parse: {err}"),
        };
        assert_eq!(parsed, id);
        assert!("not-a-ulid".parse::<PrincipalId>().is_err());
    }

    #[test]
    fn customer_draft_rejects_incomplete_payloads() {
        let mut draft = customer_draft(false);
        draft.first_name = "  ".to_string();
        assert_validation_error_contains(draft.validate(), "first_name MUST be provided");

        let mut draft = customer_draft(false);
        draft.company_name = String::new();
        assert_validation_error_contains(draft.validate(), "company_name MUST be provided");

        let mut draft = customer_draft(false);
        draft.email = "john.example.com".to_string();
        assert_validation_error_contains(draft.validate(), "email MUST contain '@'");

        let mut draft = customer_draft(false);
        draft.email = "@example.com".to_string();
        assert_validation_error_contains(draft.validate(), "user@domain");
    }

    #[test]
    fn customer_draft_enforces_field_lengths() {
        let mut draft = customer_draft(true);
        draft.last_name = "x".repeat(26);
        assert_validation_error_contains(draft.validate(), "last_name MUST be at most 25");

        let mut draft = customer_draft(true);
        draft.mobile = "0".repeat(21);
        assert_validation_error_contains(draft.validate(), "mobile MUST be at most 20");

        assert_eq!(customer_draft(true).validate(), Ok(()));
    }

    #[test]
    fn contract_draft_rejects_out_of_range_amounts() {
        let customer_id = CustomerId::new();
        let mut draft = contract_draft(customer_id, false);
        draft.amount_cents = -1;
        assert_validation_error_contains(draft.validate(), "amount_cents MUST be >= 0");

        draft.amount_cents = MAX_AMOUNT_CENTS + 1;
        assert_validation_error_contains(draft.validate(), "amount_cents MUST be <=");

        draft.amount_cents = 0;
        assert_eq!(draft.validate(), Ok(()));
    }

    #[test]
    fn event_draft_requires_a_name() {
        let mut draft = event_draft(ContractId::new(), false);
        draft.event_name = " ".to_string();
        assert_validation_error_contains(draft.validate(), "event_name MUST be provided");
    }

    #[test]
    fn display_forms_show_lifecycle_flags() {
        assert_eq!(customer(true, None).to_string(), "John Doe (is customer: true)");
        assert_eq!(customer(false, None).to_string(), "John Doe (is customer: false)");
        assert_eq!(event(ContractId::new(), false).to_string(), "Launch party (status: false)");
    }

    #[test]
    fn customer_draft_defaults_optional_fields_when_deserializing() {
        let json = serde_json::json!({
            "first_name": "Adrien",
            "last_name": "Nougaret",
            "email": "adrien@example.com",
            "company_name": "Nougaret SA"
        });
        let draft: CustomerDraft = match serde_json::from_value(json) {
            Ok(draft) => draft,
            Err(err) => panic!("draft should deserialize: {err}"),
        };
        assert!(!draft.is_customer);
        assert!(draft.phone_number.is_empty());
        assert_eq!(draft.validate(), Ok(()));
    }

    #[test]
    fn resource_ref_reports_kind_and_id() {
        let customer = customer(true, None);
        let resource = ResourceRef::Customer(&customer);
        assert_eq!(resource.kind(), ResourceKind::Customer);
        assert_eq!(resource.id(), customer.id.0);
        assert_eq!(ResourceKind::parse(resource.kind().as_str()), Some(ResourceKind::Customer));
    }
}
