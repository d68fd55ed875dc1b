use std::collections::{BTreeMap, BTreeSet};

use crate::{
    Contract, ContractId, Customer, CustomerId, Event, EventId, KernelError, PrincipalId,
    ResourceRef,
};

/// Read-only access to the records an ownership walk needs.
///
/// The store implements this over SQL; [`EntityIndex`] implements it in memory.
pub trait EntityLookup {
    /// # Errors
    /// Returns [`KernelError::Lookup`] when the backing store cannot be read.
    fn customer(&self, id: CustomerId) -> Result<Option<Customer>, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Lookup`] when the backing store cannot be read.
    fn contract(&self, id: ContractId) -> Result<Option<Contract>, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Lookup`] when the backing store cannot be read.
    fn contracts_for_customer(&self, id: CustomerId) -> Result<Vec<Contract>, KernelError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owners {
    pub sales: Option<PrincipalId>,
    /// Always `None` for customers.
    pub support: Option<PrincipalId>,
}

/// Everything the rule engine needs to know about a resource's relationships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityFacts {
    pub owners: Owners,
    pub support_contacts: BTreeSet<PrincipalId>,
    pub is_prospect: bool,
}

impl VisibilityFacts {
    #[must_use]
    pub fn is_sales_owner(&self, principal: PrincipalId) -> bool {
        self.owners.sales == Some(principal)
    }

    #[must_use]
    pub fn is_support_contact(&self, principal: PrincipalId) -> bool {
        self.support_contacts.contains(&principal)
    }
}

/// Walk the foreign-key chain from `resource` up to its customer.
///
/// # Errors
/// Returns [`KernelError::Integrity`] when a link in the chain points at a record that
/// does not exist, and propagates lookup failures.
pub fn resolve_owners<L>(lookup: &L, resource: ResourceRef<'_>) -> Result<Owners, KernelError>
where
    L: EntityLookup + ?Sized,
{
    match resource {
        ResourceRef::Customer(customer) => {
            Ok(Owners { sales: customer.sales_contact, support: None })
        }
        ResourceRef::Contract(contract) => {
            let customer = parent_customer(lookup, contract)?;
            Ok(Owners { sales: customer.sales_contact, support: contract.support_contact })
        }
        ResourceRef::Event(event) => {
            let contract = parent_contract(lookup, event)?;
            let customer = parent_customer(lookup, &contract)?;
            Ok(Owners { sales: customer.sales_contact, support: contract.support_contact })
        }
    }
}

/// Support contacts of every contract signed with `customer`.
///
/// # Errors
/// Propagates lookup failures.
pub fn customer_support_contacts<L>(
    lookup: &L,
    customer: &Customer,
) -> Result<BTreeSet<PrincipalId>, KernelError>
where
    L: EntityLookup + ?Sized,
{
    Ok(lookup
        .contracts_for_customer(customer.id)?
        .into_iter()
        .filter_map(|contract| contract.support_contact)
        .collect())
}

/// # Errors
/// Same failure modes as [`resolve_owners`].
pub fn visibility_facts<L>(
    lookup: &L,
    resource: ResourceRef<'_>,
) -> Result<VisibilityFacts, KernelError>
where
    L: EntityLookup + ?Sized,
{
    let owners = resolve_owners(lookup, resource)?;
    let (support_contacts, is_prospect) = match resource {
        ResourceRef::Customer(customer) => {
            (customer_support_contacts(lookup, customer)?, customer.is_prospect())
        }
        ResourceRef::Contract(_) | ResourceRef::Event(_) => {
            (owners.support.into_iter().collect(), false)
        }
    };
    Ok(VisibilityFacts { owners, support_contacts, is_prospect })
}

fn parent_customer<L>(lookup: &L, contract: &Contract) -> Result<Customer, KernelError>
where
    L: EntityLookup + ?Sized,
{
    lookup.customer(contract.customer_id)?.ok_or_else(|| {
        KernelError::Integrity(format!(
            "contract {} references missing customer {}",
            contract.id, contract.customer_id
        ))
    })
}

fn parent_contract<L>(lookup: &L, event: &Event) -> Result<Contract, KernelError>
where
    L: EntityLookup + ?Sized,
{
    lookup.contract(event.contract_id)?.ok_or_else(|| {
        KernelError::Integrity(format!(
            "event {} references missing contract {}",
            event.id, event.contract_id
        ))
    })
}

/// ID-indexed arena of records. Used where no store is involved.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    customers: BTreeMap<CustomerId, Customer>,
    contracts: BTreeMap<ContractId, Contract>,
    events: BTreeMap<EventId, Event>,
}

impl EntityIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_customer(&mut self, customer: Customer) {
        self.customers.insert(customer.id, customer);
    }

    pub fn insert_contract(&mut self, contract: Contract) {
        self.contracts.insert(contract.id, contract);
    }

    pub fn insert_event(&mut self, event: Event) {
        self.events.insert(event.id, event);
    }

    #[must_use]
    pub fn event_for_contract(&self, contract_id: ContractId) -> Option<EventId> {
        self.events.values().find(|event| event.contract_id == contract_id).map(|event| event.id)
    }
}

impl EntityLookup for EntityIndex {
    fn customer(&self, id: CustomerId) -> Result<Option<Customer>, KernelError> {
        Ok(self.customers.get(&id).cloned())
    }

    fn contract(&self, id: ContractId) -> Result<Option<Contract>, KernelError> {
        Ok(self.contracts.get(&id).cloned())
    }

    fn contracts_for_customer(&self, id: CustomerId) -> Result<Vec<Contract>, KernelError> {
        Ok(self.contracts.values().filter(|contract| contract.customer_id == id).cloned().collect())
    }
}
