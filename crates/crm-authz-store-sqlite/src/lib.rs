use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use crm_authz_core::{
    Contract, ContractId, Customer, CustomerId, EntityLookup, Event, EventId, KernelError,
    PrincipalAccount, PrincipalId, ResourceKind, Role, ScopeCondition, ScopePredicate,
    TransitionReason,
};
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS principals (
  principal_id TEXT PRIMARY KEY,
  username TEXT NOT NULL UNIQUE,
  role TEXT NOT NULL CHECK (role IN ('sales', 'support', 'management')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS customers (
  customer_id TEXT PRIMARY KEY,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  email TEXT NOT NULL,
  phone_number TEXT NOT NULL,
  mobile TEXT NOT NULL,
  company_name TEXT NOT NULL,
  is_customer INTEGER NOT NULL CHECK (is_customer IN (0, 1)),
  sales_contact_id TEXT REFERENCES principals(principal_id) ON DELETE RESTRICT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (is_customer = 1 OR sales_contact_id IS NULL)
);

CREATE TABLE IF NOT EXISTS contracts (
  contract_id TEXT PRIMARY KEY,
  customer_id TEXT NOT NULL REFERENCES customers(customer_id) ON DELETE RESTRICT,
  amount_cents INTEGER NOT NULL CHECK (amount_cents >= 0),
  payment_due_date TEXT NOT NULL,
  is_signed INTEGER NOT NULL CHECK (is_signed IN (0, 1)),
  support_contact_id TEXT REFERENCES principals(principal_id) ON DELETE RESTRICT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  contract_id TEXT NOT NULL UNIQUE REFERENCES contracts(contract_id) ON DELETE RESTRICT,
  event_name TEXT NOT NULL,
  event_date TEXT NOT NULL,
  attendees INTEGER NOT NULL CHECK (attendees >= 0),
  notes TEXT NOT NULL,
  is_finished INTEGER NOT NULL CHECK (is_finished IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_customers_sales_contact ON customers(sales_contact_id);
CREATE INDEX IF NOT EXISTS idx_contracts_customer ON contracts(customer_id);
CREATE INDEX IF NOT EXISTS idx_contracts_support_contact ON contracts(support_contact_id);
";

const CUSTOMER_COLUMNS: &str = "c.customer_id, c.first_name, c.last_name, c.email, \
     c.phone_number, c.mobile, c.company_name, c.is_customer, c.sales_contact_id, \
     c.created_at, c.updated_at";

const CONTRACT_COLUMNS: &str = "k.contract_id, k.customer_id, k.amount_cents, \
     k.payment_due_date, k.is_signed, k.support_contact_id, k.created_at, k.updated_at";

const EVENT_COLUMNS: &str = "e.event_id, e.contract_id, e.event_name, e.event_date, \
     e.attendees, e.notes, e.is_finished, e.created_at, e.updated_at";

/// Every list query joins up to the customer so ownership predicates can be applied
/// to any kind with the same aliases. The joins are outer so a row with a missing
/// parent is returned and reported instead of dropped.
const CONTRACT_FROM: &str =
    "FROM contracts k LEFT JOIN customers c ON c.customer_id = k.customer_id";
const EVENT_FROM: &str = "FROM events e \
     LEFT JOIN contracts k ON k.contract_id = e.contract_id \
     LEFT JOIN customers c ON c.customer_id = k.customer_id";

/// Parent keys as seen through the joins, appended after the entity columns.
const CONTRACT_PARENT_COLUMNS: &str = "c.customer_id";
const EVENT_PARENT_COLUMNS: &str = "k.contract_id, k.customer_id, c.customer_id";

/// A broken chain matches every scope so it cannot be hidden by the filter.
const BROKEN_CHAIN: &str = "c.customer_id IS NULL";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed CRM store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error when the id or username already exists or the insert fails.
    pub fn insert_principal(&mut self, account: &PrincipalAccount) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO principals(principal_id, username, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    account.id.to_string(),
                    account.username,
                    account.role.as_str(),
                    rfc3339(account.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert principal {}", account.username))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn get_principal(&self, id: PrincipalId) -> Result<Option<PrincipalAccount>> {
        let row = self
            .conn
            .query_row(
                "SELECT principal_id, username, role, created_at FROM principals
                 WHERE principal_id = ?1",
                params![id.to_string()],
                PrincipalRow::read,
            )
            .optional()
            .with_context(|| format!("failed to load principal {id}"))?;
        row.map(PrincipalRow::into_account).transpose()
    }

    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn list_principals(&self) -> Result<Vec<PrincipalAccount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT principal_id, username, role, created_at FROM principals
                 ORDER BY username ASC",
            )
            .context("failed to prepare principal listing")?;
        let rows = stmt.query_map([], PrincipalRow::read)?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?.into_account()?);
        }
        Ok(accounts)
    }

    /// # Errors
    /// Returns an error when a constraint rejects the row or the insert fails.
    pub fn insert_customer(&mut self, customer: &Customer) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO customers(
                    customer_id, first_name, last_name, email, phone_number, mobile,
                    company_name, is_customer, sales_contact_id, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    customer.id.to_string(),
                    customer.first_name,
                    customer.last_name,
                    customer.email,
                    customer.phone_number,
                    customer.mobile,
                    customer.company_name,
                    customer.is_customer,
                    customer.sales_contact.map(|id| id.to_string()),
                    rfc3339(customer.created_at)?,
                    rfc3339(customer.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to insert customer {}", customer.id))?;
        Ok(())
    }

    /// Replace every mutable column of an existing customer.
    ///
    /// # Errors
    /// Returns an error when the customer does not exist or the update fails.
    pub fn update_customer(&mut self, customer: &Customer) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE customers SET
                    first_name = ?2, last_name = ?3, email = ?4, phone_number = ?5,
                    mobile = ?6, company_name = ?7, is_customer = ?8, sales_contact_id = ?9,
                    updated_at = ?10
                 WHERE customer_id = ?1",
                params![
                    customer.id.to_string(),
                    customer.first_name,
                    customer.last_name,
                    customer.email,
                    customer.phone_number,
                    customer.mobile,
                    customer.company_name,
                    customer.is_customer,
                    customer.sales_contact.map(|id| id.to_string()),
                    rfc3339(customer.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to update customer {}", customer.id))?;
        expect_one_row(changed, "customer", &customer.id.to_string())
    }

    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn get_customer(&self, id: CustomerId) -> Result<Option<Customer>> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers c WHERE c.customer_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], CustomerRow::read)
            .optional()
            .with_context(|| format!("failed to load customer {id}"))?;
        row.map(CustomerRow::into_customer).transpose()
    }

    /// Customers matching `scope`, ordered by id.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn list_customers(&self, scope: &ScopePredicate) -> Result<Vec<Customer>> {
        let (clause, bindings) = scope_clause(ResourceKind::Customer, scope);
        let sql = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers c WHERE {clause} ORDER BY c.customer_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare customer listing")?;
        let rows = stmt.query_map(params_from_iter(bindings.iter()), CustomerRow::read)?;

        let mut customers = Vec::new();
        for row in rows {
            customers.push(row?.into_customer()?);
        }
        Ok(customers)
    }

    /// # Errors
    /// Returns an error when the customer still has contracts or the delete fails.
    pub fn delete_customer(&mut self, id: CustomerId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM customers WHERE customer_id = ?1", params![id.to_string()])
            .with_context(|| format!("failed to delete customer {id}"))?;
        expect_one_row(changed, "customer", &id.to_string())
    }

    /// # Errors
    /// Returns an error when a constraint rejects the row or the insert fails.
    pub fn insert_contract(&mut self, contract: &Contract) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO contracts(
                    contract_id, customer_id, amount_cents, payment_due_date, is_signed,
                    support_contact_id, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    contract.id.to_string(),
                    contract.customer_id.to_string(),
                    contract.amount_cents,
                    rfc3339(contract.payment_due_date)?,
                    contract.is_signed,
                    contract.support_contact.map(|id| id.to_string()),
                    rfc3339(contract.created_at)?,
                    rfc3339(contract.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to insert contract {}", contract.id))?;
        Ok(())
    }

    /// Replace every mutable column of an existing contract. `customer_id` is never
    /// rewritten.
    ///
    /// # Errors
    /// Returns an error when the contract does not exist or the update fails.
    pub fn update_contract(&mut self, contract: &Contract) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE contracts SET
                    amount_cents = ?2, payment_due_date = ?3, is_signed = ?4,
                    support_contact_id = ?5, updated_at = ?6
                 WHERE contract_id = ?1",
                params![
                    contract.id.to_string(),
                    contract.amount_cents,
                    rfc3339(contract.payment_due_date)?,
                    contract.is_signed,
                    contract.support_contact.map(|id| id.to_string()),
                    rfc3339(contract.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to update contract {}", contract.id))?;
        expect_one_row(changed, "contract", &contract.id.to_string())
    }

    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn get_contract(&self, id: ContractId) -> Result<Option<Contract>> {
        let sql = format!("SELECT {CONTRACT_COLUMNS} FROM contracts k WHERE k.contract_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], ContractRow::read)
            .optional()
            .with_context(|| format!("failed to load contract {id}"))?;
        row.map(ContractRow::into_contract).transpose()
    }

    /// Contracts matching `scope`, ordered by id.
    ///
    /// # Errors
    /// Returns [`KernelError::Integrity`] (wrapped) when a contract references a missing
    /// customer, or an error when the query fails or a stored row is malformed.
    pub fn list_contracts(&self, scope: &ScopePredicate) -> Result<Vec<Contract>> {
        let (clause, bindings) = scope_clause(ResourceKind::Contract, scope);
        let sql = format!(
            "SELECT {CONTRACT_COLUMNS}, {CONTRACT_PARENT_COLUMNS} {CONTRACT_FROM}
             WHERE {clause} OR {BROKEN_CHAIN} ORDER BY k.contract_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare contract listing")?;
        let rows = stmt.query_map(params_from_iter(bindings.iter()), |row| {
            Ok((ContractRow::read(row)?, row.get::<_, Option<String>>(8)?))
        })?;

        let mut contracts = Vec::new();
        for row in rows {
            let (contract, customer) = row?;
            if customer.is_none() {
                return Err(KernelError::Integrity(format!(
                    "contract {} references missing customer {}",
                    contract.contract_id, contract.customer_id
                ))
                .into());
            }
            contracts.push(contract.into_contract()?);
        }
        Ok(contracts)
    }

    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn contracts_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Contract>> {
        let sql = format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts k WHERE k.customer_id = ?1
             ORDER BY k.contract_id ASC"
        );
        self.query_contracts(&sql, &[customer_id.to_string()])
    }

    fn query_contracts(&self, sql: &str, bindings: &[String]) -> Result<Vec<Contract>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare contract listing")?;
        let rows = stmt.query_map(params_from_iter(bindings.iter()), ContractRow::read)?;

        let mut contracts = Vec::new();
        for row in rows {
            contracts.push(row?.into_contract()?);
        }
        Ok(contracts)
    }

    /// # Errors
    /// Returns an error when the contract still has an event or the delete fails.
    pub fn delete_contract(&mut self, id: ContractId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM contracts WHERE contract_id = ?1", params![id.to_string()])
            .with_context(|| format!("failed to delete contract {id}"))?;
        expect_one_row(changed, "contract", &id.to_string())
    }

    /// # Errors
    /// Returns [`TransitionReason::DuplicateEvent`] (wrapped) when the contract already
    /// has an event, or an error when another constraint rejects the row.
    pub fn insert_event(&mut self, event: &Event) -> Result<()> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO events(
                    event_id, contract_id, event_name, event_date, attendees, notes,
                    is_finished, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.id.to_string(),
                    event.contract_id.to_string(),
                    event.event_name,
                    rfc3339(event.event_date)?,
                    event.attendees,
                    event.notes,
                    event.is_finished,
                    rfc3339(event.created_at)?,
                    rfc3339(event.updated_at)?,
                ],
            );
        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err, "events.contract_id") => {
                Err(anyhow::Error::new(TransitionReason::DuplicateEvent)
                    .context(format!("contract {} already has an event", event.contract_id)))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to insert event {}", event.id))),
        }
    }

    /// Replace every mutable column of an existing event. `contract_id` is never
    /// rewritten.
    ///
    /// # Errors
    /// Returns an error when the event does not exist or the update fails.
    pub fn update_event(&mut self, event: &Event) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE events SET
                    event_name = ?2, event_date = ?3, attendees = ?4, notes = ?5,
                    is_finished = ?6, updated_at = ?7
                 WHERE event_id = ?1",
                params![
                    event.id.to_string(),
                    event.event_name,
                    rfc3339(event.event_date)?,
                    event.attendees,
                    event.notes,
                    event.is_finished,
                    rfc3339(event.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to update event {}", event.id))?;
        expect_one_row(changed, "event", &event.id.to_string())
    }

    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events e WHERE e.event_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], EventRow::read)
            .optional()
            .with_context(|| format!("failed to load event {id}"))?;
        row.map(EventRow::into_event).transpose()
    }

    /// # Errors
    /// Returns an error when the query fails or the stored id is malformed.
    pub fn event_for_contract(&self, contract_id: ContractId) -> Result<Option<EventId>> {
        let raw = self
            .conn
            .query_row(
                "SELECT event_id FROM events WHERE contract_id = ?1",
                params![contract_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up event for contract {contract_id}"))?;
        raw.as_deref().map(parse_id::<EventId>).transpose()
    }

    /// Events matching `scope`, ordered by id.
    ///
    /// # Errors
    /// Returns [`KernelError::Integrity`] (wrapped) when an event's contract or customer
    /// is missing, or an error when the query fails or a stored row is malformed.
    pub fn list_events(&self, scope: &ScopePredicate) -> Result<Vec<Event>> {
        let (clause, bindings) = scope_clause(ResourceKind::Event, scope);
        let sql = format!(
            "SELECT {EVENT_COLUMNS}, {EVENT_PARENT_COLUMNS} {EVENT_FROM}
             WHERE {clause} OR {BROKEN_CHAIN} ORDER BY e.event_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare event listing")?;
        let rows = stmt.query_map(params_from_iter(bindings.iter()), |row| {
            Ok((
                EventRow::read(row)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (event, contract, contract_customer, customer) = row?;
            let Some(contract) = contract else {
                return Err(KernelError::Integrity(format!(
                    "event {} references missing contract {}",
                    event.event_id, event.contract_id
                ))
                .into());
            };
            if customer.is_none() {
                return Err(KernelError::Integrity(format!(
                    "contract {contract} references missing customer {}",
                    contract_customer.unwrap_or_default()
                ))
                .into());
            }
            events.push(event.into_event()?);
        }
        Ok(events)
    }

    /// # Errors
    /// Returns an error when the event does not exist or the delete fails.
    pub fn delete_event(&mut self, id: EventId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM events WHERE event_id = ?1", params![id.to_string()])
            .with_context(|| format!("failed to delete event {id}"))?;
        expect_one_row(changed, "event", &id.to_string())
    }

    /// Export principals and entities as NDJSON files plus a SHA-256 manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let everything = ScopePredicate::Unrestricted;
        let files = vec![
            write_ndjson_file(out_dir, "principals.ndjson", &self.list_principals()?)?,
            write_ndjson_file(out_dir, "customers.ndjson", &self.list_customers(&everything)?)?,
            write_ndjson_file(out_dir, "contracts.ndjson", &self.list_contracts(&everything)?)?,
            write_ndjson_file(out_dir, "events.ndjson", &self.list_events(&everything)?)?,
        ];

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: rfc3339(OffsetDateTime::now_utc())?,
            files,
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl EntityLookup for SqliteStore {
    fn customer(&self, id: CustomerId) -> Result<Option<Customer>, KernelError> {
        self.get_customer(id).map_err(lookup_error)
    }

    fn contract(&self, id: ContractId) -> Result<Option<Contract>, KernelError> {
        self.get_contract(id).map_err(lookup_error)
    }

    fn contracts_for_customer(&self, id: CustomerId) -> Result<Vec<Contract>, KernelError> {
        SqliteStore::contracts_for_customer(self, id).map_err(lookup_error)
    }
}

fn lookup_error(err: anyhow::Error) -> KernelError {
    KernelError::Lookup(format!("{err:#}"))
}

/// Translate a scope predicate into a SQL boolean over the `c`/`k` aliases used by the
/// list queries, with positional bindings.
fn scope_clause(kind: ResourceKind, scope: &ScopePredicate) -> (String, Vec<String>) {
    let conditions = match scope {
        ScopePredicate::Unrestricted => return ("1 = 1".to_string(), Vec::new()),
        ScopePredicate::AnyOf(conditions) => conditions,
    };
    if conditions.is_empty() {
        return ("1 = 0".to_string(), Vec::new());
    }

    let mut parts = Vec::with_capacity(conditions.len());
    let mut bindings = Vec::new();
    for condition in conditions {
        match (condition, kind) {
            (ScopeCondition::SalesOwner(principal), _) => {
                parts.push("c.sales_contact_id = ?".to_string());
                bindings.push(principal.to_string());
            }
            (ScopeCondition::SupportOwner(principal), ResourceKind::Customer) => {
                parts.push(
                    "EXISTS (SELECT 1 FROM contracts sk
                     WHERE sk.customer_id = c.customer_id AND sk.support_contact_id = ?)"
                        .to_string(),
                );
                bindings.push(principal.to_string());
            }
            (ScopeCondition::SupportOwner(principal), _) => {
                parts.push("k.support_contact_id = ?".to_string());
                bindings.push(principal.to_string());
            }
            (ScopeCondition::Prospect, ResourceKind::Customer) => {
                parts.push("c.is_customer = 0".to_string());
            }
            (ScopeCondition::Prospect, _) => parts.push("1 = 0".to_string()),
        }
    }

    (format!("({})", parts.join(" OR ")), bindings)
}

fn is_unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, Some(message)) => {
            failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.contains(column)
        }
        _ => false,
    }
}

fn expect_one_row(changed: usize, kind: &str, id: &str) -> Result<()> {
    if changed == 0 {
        return Err(anyhow!("{kind} {id} does not exist"));
    }
    Ok(())
}

struct PrincipalRow {
    principal_id: String,
    username: String,
    role: String,
    created_at: String,
}

impl PrincipalRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            principal_id: row.get(0)?,
            username: row.get(1)?,
            role: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn into_account(self) -> Result<PrincipalAccount> {
        Ok(PrincipalAccount {
            id: parse_id(&self.principal_id)?,
            role: Role::parse(&self.role)
                .ok_or_else(|| anyhow!("invalid role in principals row: {}", self.role))?,
            username: self.username,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

struct CustomerRow {
    customer_id: String,
    first_name: String,
    last_name: String,
    email: String,
    phone_number: String,
    mobile: String,
    company_name: String,
    is_customer: bool,
    sales_contact_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CustomerRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            customer_id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            email: row.get(3)?,
            phone_number: row.get(4)?,
            mobile: row.get(5)?,
            company_name: row.get(6)?,
            is_customer: row.get(7)?,
            sales_contact_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_customer(self) -> Result<Customer> {
        Ok(Customer {
            id: parse_id(&self.customer_id)?,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone_number: self.phone_number,
            mobile: self.mobile,
            company_name: self.company_name,
            is_customer: self.is_customer,
            sales_contact: self.sales_contact_id.as_deref().map(parse_id).transpose()?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

struct ContractRow {
    contract_id: String,
    customer_id: String,
    amount_cents: i64,
    payment_due_date: String,
    is_signed: bool,
    support_contact_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ContractRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            contract_id: row.get(0)?,
            customer_id: row.get(1)?,
            amount_cents: row.get(2)?,
            payment_due_date: row.get(3)?,
            is_signed: row.get(4)?,
            support_contact_id: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_contract(self) -> Result<Contract> {
        Ok(Contract {
            id: parse_id(&self.contract_id)?,
            customer_id: parse_id(&self.customer_id)?,
            amount_cents: self.amount_cents,
            payment_due_date: parse_rfc3339(&self.payment_due_date)?,
            is_signed: self.is_signed,
            support_contact: self.support_contact_id.as_deref().map(parse_id).transpose()?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

struct EventRow {
    event_id: String,
    contract_id: String,
    event_name: String,
    event_date: String,
    attendees: u32,
    notes: String,
    is_finished: bool,
    created_at: String,
    updated_at: String,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            contract_id: row.get(1)?,
            event_name: row.get(2)?,
            event_date: row.get(3)?,
            attendees: row.get(4)?,
            notes: row.get(5)?,
            is_finished: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: parse_id(&self.event_id)?,
            contract_id: parse_id(&self.contract_id)?,
            event_name: self.event_name,
            event_date: parse_rfc3339(&self.event_date)?,
            attendees: self.attendees,
            notes: self.notes,
            is_finished: self.is_finished,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = ulid::DecodeError>,
{
    T::from_str(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn write_ndjson_file<T: Serialize>(
    out_dir: &Path,
    name: &str,
    values: &[T],
) -> Result<ExportFileDigest> {
    let path = out_dir.join(name);
    let file = File::create(&path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok(ExportFileDigest {
        path: name.to_string(),
        sha256: format!("{:x}", hasher.finalize()),
        records: values.len(),
    })
}
