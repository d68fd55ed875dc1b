use std::path::PathBuf;

use crm_authz_core::{
    contract_rules, customer_rules, event_rules, scope_query, validate_contract_create,
    validate_contract_delete, validate_contract_update, validate_customer_create,
    validate_customer_update, validate_event_create, validate_event_delete,
    validate_event_update, visibility_facts, Contract, ContractDraft, ContractId, Customer,
    CustomerDraft, CustomerId, Decision, Denial, Event, EventDraft, EventId, KernelError,
    Operation, Principal, PrincipalAccount, PrincipalId, ResourceKind, ResourceRef, Role,
    TransitionReason, VisibilityFacts,
};
use crm_authz_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info};

pub const API_CONTRACT_VERSION: &str = "crm-api.v1";

const MAX_USERNAME_LEN: usize = 150;

/// Outward error taxonomy of the request path.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden")]
    Forbidden,
    /// Also returned for records outside the caller's scope.
    #[error("{0} not found")]
    NotFound(ResourceKind),
    #[error("transition rejected: {0}")]
    TransitionRejected(TransitionReason),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::TransitionRejected(reason) => reason.as_str(),
            Self::Integrity(_) => "integrity_error",
            Self::Validation(_) => "validation_error",
            Self::Store(_) => "store_error",
        }
    }

    fn from_denial(denial: Denial, kind: ResourceKind) -> Self {
        match denial {
            Denial::NotVisible => Self::NotFound(kind),
            Denial::Forbidden => Self::Forbidden,
            Denial::Locked(reason) => Self::TransitionRejected(reason),
        }
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(message) => Self::Validation(message),
            KernelError::Integrity(message) => Self::Integrity(message),
            KernelError::Lookup(message) => Self::Store(anyhow::anyhow!(message)),
        }
    }
}

/// Store errors carrying a typed cause keep their outward meaning.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<KernelError>() {
            Ok(kernel) => return kernel.into(),
            Err(err) => err,
        };
        match err.downcast::<TransitionReason>() {
            Ok(reason) => Self::TransitionRejected(reason),
            Err(err) => Self::Store(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPrincipalRequest {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub kind: ResourceKind,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct CrmApi {
    db_path: PathBuf,
}

impl CrmApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ApiError> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, ApiError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Resolve a request's principal id into an authenticated [`Principal`].
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthenticated`] for unknown ids.
    pub fn authenticate(&self, id: PrincipalId) -> Result<Principal, ApiError> {
        let store = self.open_store()?;
        match store.get_principal(id)? {
            Some(account) => Ok(account.principal()),
            None => {
                info!(principal = %id, "unknown principal");
                Err(ApiError::Unauthenticated(format!("unknown principal {id}")))
            }
        }
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for a blank or overlong username, and a store
    /// error when the username is taken.
    pub fn register_principal(
        &self,
        input: RegisterPrincipalRequest,
    ) -> Result<PrincipalAccount, ApiError> {
        let username = input.username.trim();
        if username.is_empty() {
            return Err(ApiError::Validation("username MUST be provided".to_string()));
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(ApiError::Validation(format!(
                "username MUST be at most {MAX_USERNAME_LEN} characters"
            )));
        }

        let mut store = self.open_store()?;
        let account = PrincipalAccount {
            id: PrincipalId::new(),
            username: username.to_string(),
            role: input.role,
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_principal(&account)?;
        info!(principal = %account.id, role = account.role.as_str(), "registered principal");
        Ok(account)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_principals(&self) -> Result<Vec<PrincipalAccount>, ApiError> {
        Ok(self.open_store()?.list_principals()?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_customers(&self, principal: &Principal) -> Result<Vec<Customer>, ApiError> {
        authorize(
            principal,
            Operation::List,
            ResourceKind::Customer,
            customer_rules::can_list(principal),
        )?;
        let store = self.open_store()?;
        let customers = store.list_customers(&scope_query(principal, ResourceKind::Customer))?;
        debug!(principal = %principal.id, count = customers.len(), "listed customers");
        Ok(customers)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for absent or invisible customers.
    pub fn get_customer(
        &self,
        principal: &Principal,
        id: CustomerId,
    ) -> Result<Customer, ApiError> {
        let store = self.open_store()?;
        let customer =
            store.get_customer(id)?.ok_or(ApiError::NotFound(ResourceKind::Customer))?;
        let facts = resolve_facts(&store, ResourceRef::Customer(&customer))?;
        authorize(
            principal,
            Operation::Read,
            ResourceKind::Customer,
            customer_rules::can_read(principal, &facts),
        )?;
        Ok(customer)
    }

    /// # Errors
    /// Returns [`ApiError::Forbidden`] for support principals and
    /// [`ApiError::Validation`] for incomplete drafts.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str())
    )]
    pub fn create_customer(
        &self,
        principal: &Principal,
        draft: CustomerDraft,
    ) -> Result<Customer, ApiError> {
        authorize(
            principal,
            Operation::Create,
            ResourceKind::Customer,
            customer_rules::can_create(principal),
        )?;
        draft.validate()?;
        let write = validate_customer_create(principal, &draft);

        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let customer = Customer {
            id: CustomerId::new(),
            first_name: draft.first_name,
            last_name: draft.last_name,
            email: draft.email,
            phone_number: draft.phone_number,
            mobile: draft.mobile,
            company_name: draft.company_name,
            is_customer: draft.is_customer,
            sales_contact: write.sales_contact,
            created_at: now,
            updated_at: now,
        };
        store.insert_customer(&customer)?;
        info!(customer = %customer.id, "created customer");
        Ok(customer)
    }

    /// Full replacement of a customer's contact fields and conversion flag.
    ///
    /// # Errors
    /// Returns [`ApiError::TransitionRejected`] when a converted customer would revert
    /// to a prospect.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), customer = %id)
    )]
    pub fn update_customer(
        &self,
        principal: &Principal,
        id: CustomerId,
        draft: CustomerDraft,
    ) -> Result<Customer, ApiError> {
        let mut store = self.open_store()?;
        let existing =
            store.get_customer(id)?.ok_or(ApiError::NotFound(ResourceKind::Customer))?;
        let facts = resolve_facts(&store, ResourceRef::Customer(&existing))?;
        authorize(
            principal,
            Operation::Update,
            ResourceKind::Customer,
            customer_rules::can_update(principal, &facts),
        )?;
        draft.validate()?;
        let write = guarded(validate_customer_update(principal, &existing, &draft))?;

        let customer = Customer {
            id: existing.id,
            first_name: draft.first_name,
            last_name: draft.last_name,
            email: draft.email,
            phone_number: draft.phone_number,
            mobile: draft.mobile,
            company_name: draft.company_name,
            is_customer: draft.is_customer,
            sales_contact: write.sales_contact,
            created_at: existing.created_at,
            updated_at: OffsetDateTime::now_utc(),
        };
        store.update_customer(&customer)?;
        info!(converted = existing.is_prospect() && customer.is_customer, "updated customer");
        Ok(customer)
    }

    /// # Errors
    /// Returns [`ApiError::Forbidden`] unless a management principal deletes a prospect.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), customer = %id)
    )]
    pub fn delete_customer(
        &self,
        principal: &Principal,
        id: CustomerId,
    ) -> Result<DeleteResult, ApiError> {
        let mut store = self.open_store()?;
        let existing =
            store.get_customer(id)?.ok_or(ApiError::NotFound(ResourceKind::Customer))?;
        let facts = resolve_facts(&store, ResourceRef::Customer(&existing))?;
        authorize(
            principal,
            Operation::Delete,
            ResourceKind::Customer,
            customer_rules::can_delete(principal, &facts),
        )?;
        store.delete_customer(id)?;
        info!("deleted customer");
        Ok(DeleteResult { kind: ResourceKind::Customer, id: id.to_string() })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_contracts(&self, principal: &Principal) -> Result<Vec<Contract>, ApiError> {
        authorize(
            principal,
            Operation::List,
            ResourceKind::Contract,
            contract_rules::can_list(principal),
        )?;
        let store = self.open_store()?;
        let contracts = store.list_contracts(&scope_query(principal, ResourceKind::Contract))?;
        debug!(principal = %principal.id, count = contracts.len(), "listed contracts");
        Ok(contracts)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for absent or invisible contracts.
    pub fn get_contract(
        &self,
        principal: &Principal,
        id: ContractId,
    ) -> Result<Contract, ApiError> {
        let store = self.open_store()?;
        let contract =
            store.get_contract(id)?.ok_or(ApiError::NotFound(ResourceKind::Contract))?;
        let facts = resolve_facts(&store, ResourceRef::Contract(&contract))?;
        authorize(
            principal,
            Operation::Read,
            ResourceKind::Contract,
            contract_rules::can_read(principal, &facts),
        )?;
        Ok(contract)
    }

    /// # Errors
    /// Returns [`ApiError::TransitionRejected`] with `customer_not_converted` for a
    /// prospect, and [`ApiError::NotFound`] when the customer is absent or invisible.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), customer = %draft.customer_id)
    )]
    pub fn create_contract(
        &self,
        principal: &Principal,
        draft: ContractDraft,
    ) -> Result<Contract, ApiError> {
        let mut store = self.open_store()?;
        let customer = store.get_customer(draft.customer_id)?;
        let facts = parent_facts(&store, customer.as_ref().map(ResourceRef::Customer))?;
        authorize(
            principal,
            Operation::Create,
            ResourceKind::Contract,
            contract_rules::can_create(principal, &facts),
        )?;
        let customer = customer.ok_or(ApiError::NotFound(ResourceKind::Customer))?;
        draft.validate()?;
        guarded(validate_contract_create(&customer))?;

        let now = OffsetDateTime::now_utc();
        let contract = Contract {
            id: ContractId::new(),
            customer_id: customer.id,
            amount_cents: draft.amount_cents,
            payment_due_date: draft.payment_due_date,
            is_signed: draft.is_signed,
            support_contact: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_contract(&contract)?;
        info!(contract = %contract.id, "created contract");
        Ok(contract)
    }

    /// Full replacement of a contract's terms. The support contact is kept as is.
    ///
    /// # Errors
    /// Returns [`ApiError::TransitionRejected`] for signed contracts edited by
    /// non-management principals or unsigned by anyone, and [`ApiError::Validation`]
    /// when the draft names a different customer.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), contract = %id)
    )]
    pub fn update_contract(
        &self,
        principal: &Principal,
        id: ContractId,
        draft: ContractDraft,
    ) -> Result<Contract, ApiError> {
        let mut store = self.open_store()?;
        let existing =
            store.get_contract(id)?.ok_or(ApiError::NotFound(ResourceKind::Contract))?;
        let facts = resolve_facts(&store, ResourceRef::Contract(&existing))?;
        authorize(
            principal,
            Operation::Update,
            ResourceKind::Contract,
            contract_rules::can_update(principal, &existing, &facts),
        )?;
        draft.validate()?;
        if draft.customer_id != existing.customer_id {
            return Err(ApiError::Validation("customer_id MUST NOT change".to_string()));
        }
        guarded(validate_contract_update(principal, &existing, &draft))?;

        let contract = Contract {
            amount_cents: draft.amount_cents,
            payment_due_date: draft.payment_due_date,
            is_signed: draft.is_signed,
            updated_at: OffsetDateTime::now_utc(),
            ..existing
        };
        store.update_contract(&contract)?;
        info!(signed = contract.is_signed, "updated contract");
        Ok(contract)
    }

    /// # Errors
    /// Returns [`ApiError::TransitionRejected`] for signed contracts and
    /// [`ApiError::Forbidden`] for non-management principals.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), contract = %id)
    )]
    pub fn delete_contract(
        &self,
        principal: &Principal,
        id: ContractId,
    ) -> Result<DeleteResult, ApiError> {
        let mut store = self.open_store()?;
        let existing =
            store.get_contract(id)?.ok_or(ApiError::NotFound(ResourceKind::Contract))?;
        let facts = resolve_facts(&store, ResourceRef::Contract(&existing))?;
        authorize(
            principal,
            Operation::Delete,
            ResourceKind::Contract,
            contract_rules::can_delete(principal, &existing, &facts),
        )?;
        guarded(validate_contract_delete(&existing))?;
        store.delete_contract(id)?;
        info!("deleted contract");
        Ok(DeleteResult { kind: ResourceKind::Contract, id: id.to_string() })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_events(&self, principal: &Principal) -> Result<Vec<Event>, ApiError> {
        authorize(
            principal,
            Operation::List,
            ResourceKind::Event,
            event_rules::can_list(principal),
        )?;
        let store = self.open_store()?;
        let events = store.list_events(&scope_query(principal, ResourceKind::Event))?;
        debug!(principal = %principal.id, count = events.len(), "listed events");
        Ok(events)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for absent or invisible events.
    pub fn get_event(&self, principal: &Principal, id: EventId) -> Result<Event, ApiError> {
        let store = self.open_store()?;
        let event = store.get_event(id)?.ok_or(ApiError::NotFound(ResourceKind::Event))?;
        let facts = resolve_facts(&store, ResourceRef::Event(&event))?;
        authorize(
            principal,
            Operation::Read,
            ResourceKind::Event,
            event_rules::can_read(principal, &facts),
        )?;
        Ok(event)
    }

    /// # Errors
    /// Returns [`ApiError::TransitionRejected`] with `contract_not_signed` or
    /// `duplicate_event`, and [`ApiError::NotFound`] when the contract is absent or
    /// invisible.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), contract = %draft.contract_id)
    )]
    pub fn create_event(
        &self,
        principal: &Principal,
        draft: EventDraft,
    ) -> Result<Event, ApiError> {
        let mut store = self.open_store()?;
        let contract = store.get_contract(draft.contract_id)?;
        let facts = parent_facts(&store, contract.as_ref().map(ResourceRef::Contract))?;
        authorize(
            principal,
            Operation::Create,
            ResourceKind::Event,
            event_rules::can_create(principal, &facts),
        )?;
        let contract = contract.ok_or(ApiError::NotFound(ResourceKind::Contract))?;
        draft.validate()?;
        guarded(validate_event_create(&contract, store.event_for_contract(contract.id)?))?;

        let now = OffsetDateTime::now_utc();
        let event = Event {
            id: EventId::new(),
            contract_id: contract.id,
            event_name: draft.event_name,
            event_date: draft.event_date,
            attendees: draft.attendees,
            notes: draft.notes,
            is_finished: draft.is_finished,
            created_at: now,
            updated_at: now,
        };
        store.insert_event(&event)?;
        info!(event = %event.id, "created event");
        Ok(event)
    }

    /// # Errors
    /// Returns [`ApiError::TransitionRejected`] for finished events edited by
    /// non-management principals or reopened by anyone, and [`ApiError::Validation`]
    /// when the draft names a different contract.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), event = %id)
    )]
    pub fn update_event(
        &self,
        principal: &Principal,
        id: EventId,
        draft: EventDraft,
    ) -> Result<Event, ApiError> {
        let mut store = self.open_store()?;
        let existing = store.get_event(id)?.ok_or(ApiError::NotFound(ResourceKind::Event))?;
        let facts = resolve_facts(&store, ResourceRef::Event(&existing))?;
        authorize(
            principal,
            Operation::Update,
            ResourceKind::Event,
            event_rules::can_update(principal, &existing, &facts),
        )?;
        draft.validate()?;
        if draft.contract_id != existing.contract_id {
            return Err(ApiError::Validation("contract_id MUST NOT change".to_string()));
        }
        guarded(validate_event_update(principal, &existing, &draft))?;

        let event = Event {
            event_name: draft.event_name,
            event_date: draft.event_date,
            attendees: draft.attendees,
            notes: draft.notes,
            is_finished: draft.is_finished,
            updated_at: OffsetDateTime::now_utc(),
            ..existing
        };
        store.update_event(&event)?;
        info!(finished = event.is_finished, "updated event");
        Ok(event)
    }

    /// # Errors
    /// Returns [`ApiError::TransitionRejected`] with `event_locked` for finished events.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, role = principal.role.as_str(), event = %id)
    )]
    pub fn delete_event(
        &self,
        principal: &Principal,
        id: EventId,
    ) -> Result<DeleteResult, ApiError> {
        let mut store = self.open_store()?;
        let existing = store.get_event(id)?.ok_or(ApiError::NotFound(ResourceKind::Event))?;
        let facts = resolve_facts(&store, ResourceRef::Event(&existing))?;
        authorize(
            principal,
            Operation::Delete,
            ResourceKind::Event,
            event_rules::can_delete(principal, &existing, &facts),
        )?;
        guarded(validate_event_delete(&existing))?;
        store.delete_event(id)?;
        info!("deleted event");
        Ok(DeleteResult { kind: ResourceKind::Event, id: id.to_string() })
    }

    /// Administrative assignment of a contract's support contact.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for non-management callers and
    /// [`ApiError::Validation`] when the assignee is not a support principal.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, contract = %contract_id, assignee = %support_id)
    )]
    pub fn assign_support_contact(
        &self,
        principal: &Principal,
        contract_id: ContractId,
        support_id: PrincipalId,
    ) -> Result<Contract, ApiError> {
        require_management(principal)?;
        let mut store = self.open_store()?;
        let existing =
            store.get_contract(contract_id)?.ok_or(ApiError::NotFound(ResourceKind::Contract))?;
        require_assignee(&store, support_id, Role::Support)?;

        let contract = Contract {
            support_contact: Some(support_id),
            updated_at: OffsetDateTime::now_utc(),
            ..existing
        };
        store.update_contract(&contract)?;
        info!("assigned support contact");
        Ok(contract)
    }

    /// Administrative assignment of a converted customer's sales contact.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for non-management callers,
    /// [`ApiError::TransitionRejected`] for prospects, and [`ApiError::Validation`]
    /// when the assignee is not a sales principal.
    #[tracing::instrument(
        skip_all,
        fields(principal = %principal.id, customer = %customer_id, assignee = %sales_id)
    )]
    pub fn assign_sales_contact(
        &self,
        principal: &Principal,
        customer_id: CustomerId,
        sales_id: PrincipalId,
    ) -> Result<Customer, ApiError> {
        require_management(principal)?;
        let mut store = self.open_store()?;
        let existing =
            store.get_customer(customer_id)?.ok_or(ApiError::NotFound(ResourceKind::Customer))?;
        if existing.is_prospect() {
            return Err(ApiError::TransitionRejected(TransitionReason::CustomerNotConverted));
        }
        require_assignee(&store, sales_id, Role::Sales)?;

        let customer = Customer {
            sales_contact: Some(sales_id),
            updated_at: OffsetDateTime::now_utc(),
            ..existing
        };
        store.update_customer(&customer)?;
        info!("assigned sales contact");
        Ok(customer)
    }
}

fn authorize(
    principal: &Principal,
    operation: Operation,
    kind: ResourceKind,
    decision: Decision,
) -> Result<(), ApiError> {
    debug!(
        principal = %principal.id,
        role = principal.role.as_str(),
        operation = operation.as_str(),
        kind = kind.as_str(),
        allowed = decision.is_allowed(),
        "authorization decision"
    );
    decision.into_result().map_err(|denial| {
        info!(
            principal = %principal.id,
            role = principal.role.as_str(),
            operation = operation.as_str(),
            kind = kind.as_str(),
            %denial,
            "request denied"
        );
        ApiError::from_denial(denial, kind)
    })
}

fn guarded<T>(result: Result<T, TransitionReason>) -> Result<T, ApiError> {
    result.map_err(|reason| {
        info!(reason = reason.as_str(), "transition rejected");
        ApiError::TransitionRejected(reason)
    })
}

fn resolve_facts(
    store: &SqliteStore,
    resource: ResourceRef<'_>,
) -> Result<VisibilityFacts, ApiError> {
    visibility_facts(store, resource).map_err(|err| {
        if matches!(err, KernelError::Integrity(_)) {
            error!(
                kind = resource.kind().as_str(),
                id = %resource.id(),
                error = %err,
                "broken ownership chain"
            );
        }
        ApiError::from(err)
    })
}

/// Facts of a parent record that may not exist. An absent parent yields empty facts,
/// which only management can see past; the caller then reports it as not found.
fn parent_facts(
    store: &SqliteStore,
    parent: Option<ResourceRef<'_>>,
) -> Result<VisibilityFacts, ApiError> {
    match parent {
        Some(resource) => resolve_facts(store, resource),
        None => Ok(VisibilityFacts::default()),
    }
}

fn require_management(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_management() {
        return Ok(());
    }
    info!(principal = %principal.id, role = principal.role.as_str(), "administrative path denied");
    Err(ApiError::Forbidden)
}

fn require_assignee(store: &SqliteStore, id: PrincipalId, role: Role) -> Result<(), ApiError> {
    match store.get_principal(id)? {
        Some(account) if account.role == role => Ok(()),
        Some(account) => Err(ApiError::Validation(format!(
            "assignee {id} has role {} but MUST have role {}",
            account.role.as_str(),
            role.as_str()
        ))),
        None => Err(ApiError::Validation(format!("assignee {id} is not a registered principal"))),
    }
}
