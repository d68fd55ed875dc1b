use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crm_authz_api::{ApiError, CrmApi, RegisterPrincipalRequest, API_CONTRACT_VERSION};
use crm_authz_core::{
    ContractDraft, ContractId, CustomerDraft, CustomerId, EventDraft, EventId, Principal,
    PrincipalId, ResourceKind, Role,
};
use crm_authz_store_sqlite::SqliteStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "crm-cli.v1";
const DEFAULT_LOG_FILTER: &str = "crm_authz=warn";

#[derive(Debug, Parser)]
#[command(name = "crm")]
#[command(about = "CRM authorization CLI")]
struct Cli {
    #[arg(long, env = "CRM_DB", default_value = "./crm.sqlite3")]
    db: PathBuf,

    /// Principal id the command runs as.
    #[arg(long = "as", env = "CRM_PRINCIPAL", global = true)]
    principal: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Principal {
        #[command(subcommand)]
        command: PrincipalCommand,
    },
    Customer {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Contract {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Event {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Assign {
        #[command(subcommand)]
        command: AssignCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbOutArgs),
    Backup(DbOutArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbOutArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PrincipalCommand {
    Add(PrincipalAddArgs),
    List,
}

#[derive(Debug, Args)]
struct PrincipalAddArgs {
    #[arg(long)]
    username: String,
    #[arg(long, value_enum)]
    role: RoleArg,
}

#[derive(Debug, Subcommand)]
enum EntityCommand {
    List,
    Show(IdArgs),
    Create(PayloadArgs),
    Update(UpdateArgs),
    Delete(IdArgs),
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct PayloadArgs {
    /// JSON draft of the record.
    #[arg(long)]
    json: String,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    json: String,
}

#[derive(Debug, Subcommand)]
enum AssignCommand {
    Support(AssignSupportArgs),
    Sales(AssignSalesArgs),
}

#[derive(Debug, Args)]
struct AssignSupportArgs {
    #[arg(long)]
    contract: String,
    #[arg(long = "to")]
    assignee: String,
}

#[derive(Debug, Args)]
struct AssignSalesArgs {
    #[arg(long)]
    customer: String,
    #[arg(long = "to")]
    assignee: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Management,
    Sales,
    Support,
}

impl RoleArg {
    fn into_role(self) -> Role {
        match self {
            Self::Management => Role::Management,
            Self::Sales => Role::Sales,
            Self::Support => Role::Support,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T>(value: &T) -> Result<()>
where
    T: Serialize,
{
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

/// Prefix the error with its stable code so scripts can match on it.
fn api_failure(err: ApiError) -> anyhow::Error {
    anyhow!("{}: {err:#}", err.code())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    debug!(db = %cli.db.display(), "crm cli starting");
    let api = CrmApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Principal { command } => run_principal(command, &api),
        Command::Customer { command } => {
            let principal = authenticate(&api, cli.principal.as_deref())?;
            run_customer(command, &api, &principal)
        }
        Command::Contract { command } => {
            let principal = authenticate(&api, cli.principal.as_deref())?;
            run_contract(command, &api, &principal)
        }
        Command::Event { command } => {
            let principal = authenticate(&api, cli.principal.as_deref())?;
            run_event(command, &api, &principal)
        }
        Command::Assign { command } => {
            let principal = authenticate(&api, cli.principal.as_deref())?;
            run_assign(command, &api, &principal)
        }
    }
}

fn authenticate(api: &CrmApi, raw: Option<&str>) -> Result<Principal> {
    let raw = raw.ok_or_else(|| {
        anyhow!("unauthenticated: --as <PRINCIPAL_ID> or CRM_PRINCIPAL is required")
    })?;
    let id = raw
        .trim()
        .parse::<PrincipalId>()
        .map_err(|err| anyhow!("unauthenticated: invalid principal id {raw}: {err}"))?;
    api.authenticate(id).map_err(api_failure)
}

fn parse_id<T>(value: &str, label: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse::<T>().map_err(|err| anyhow!("invalid {label} id {value}: {err}"))
}

fn parse_draft<T>(json: &str, kind: ResourceKind) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_str(json).with_context(|| format!("validation_error: invalid {kind} payload"))
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit(&report)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_principal(command: PrincipalCommand, api: &CrmApi) -> Result<()> {
    match command {
        PrincipalCommand::Add(args) => {
            let account = api
                .register_principal(RegisterPrincipalRequest {
                    username: args.username,
                    role: args.role.into_role(),
                })
                .map_err(api_failure)?;
            emit(&account)
        }
        PrincipalCommand::List => {
            let principals = api.list_principals().map_err(api_failure)?;
            emit_json(serde_json::json!({ "principals": principals }))
        }
    }
}

fn run_customer(command: EntityCommand, api: &CrmApi, principal: &Principal) -> Result<()> {
    let kind = ResourceKind::Customer;
    match command {
        EntityCommand::List => {
            let customers = api.list_customers(principal).map_err(api_failure)?;
            emit_json(serde_json::json!({
                "api_contract_version": API_CONTRACT_VERSION,
                "customers": customers
            }))
        }
        EntityCommand::Show(args) => {
            let id: CustomerId = parse_id(&args.id, kind.as_str())?;
            emit(&api.get_customer(principal, id).map_err(api_failure)?)
        }
        EntityCommand::Create(args) => {
            let draft: CustomerDraft = parse_draft(&args.json, kind)?;
            emit(&api.create_customer(principal, draft).map_err(api_failure)?)
        }
        EntityCommand::Update(args) => {
            let id: CustomerId = parse_id(&args.id, kind.as_str())?;
            let draft: CustomerDraft = parse_draft(&args.json, kind)?;
            emit(&api.update_customer(principal, id, draft).map_err(api_failure)?)
        }
        EntityCommand::Delete(args) => {
            let id: CustomerId = parse_id(&args.id, kind.as_str())?;
            emit(&api.delete_customer(principal, id).map_err(api_failure)?)
        }
    }
}

fn run_contract(command: EntityCommand, api: &CrmApi, principal: &Principal) -> Result<()> {
    let kind = ResourceKind::Contract;
    match command {
        EntityCommand::List => {
            let contracts = api.list_contracts(principal).map_err(api_failure)?;
            emit_json(serde_json::json!({
                "api_contract_version": API_CONTRACT_VERSION,
                "contracts": contracts
            }))
        }
        EntityCommand::Show(args) => {
            let id: ContractId = parse_id(&args.id, kind.as_str())?;
            emit(&api.get_contract(principal, id).map_err(api_failure)?)
        }
        EntityCommand::Create(args) => {
            let draft: ContractDraft = parse_draft(&args.json, kind)?;
            emit(&api.create_contract(principal, draft).map_err(api_failure)?)
        }
        EntityCommand::Update(args) => {
            let id: ContractId = parse_id(&args.id, kind.as_str())?;
            let draft: ContractDraft = parse_draft(&args.json, kind)?;
            emit(&api.update_contract(principal, id, draft).map_err(api_failure)?)
        }
        EntityCommand::Delete(args) => {
            let id: ContractId = parse_id(&args.id, kind.as_str())?;
            emit(&api.delete_contract(principal, id).map_err(api_failure)?)
        }
    }
}

fn run_event(command: EntityCommand, api: &CrmApi, principal: &Principal) -> Result<()> {
    let kind = ResourceKind::Event;
    match command {
        EntityCommand::List => {
            let events = api.list_events(principal).map_err(api_failure)?;
            emit_json(serde_json::json!({
                "api_contract_version": API_CONTRACT_VERSION,
                "events": events
            }))
        }
        EntityCommand::Show(args) => {
            let id: EventId = parse_id(&args.id, kind.as_str())?;
            emit(&api.get_event(principal, id).map_err(api_failure)?)
        }
        EntityCommand::Create(args) => {
            let draft: EventDraft = parse_draft(&args.json, kind)?;
            emit(&api.create_event(principal, draft).map_err(api_failure)?)
        }
        EntityCommand::Update(args) => {
            let id: EventId = parse_id(&args.id, kind.as_str())?;
            let draft: EventDraft = parse_draft(&args.json, kind)?;
            emit(&api.update_event(principal, id, draft).map_err(api_failure)?)
        }
        EntityCommand::Delete(args) => {
            let id: EventId = parse_id(&args.id, kind.as_str())?;
            emit(&api.delete_event(principal, id).map_err(api_failure)?)
        }
    }
}

fn run_assign(command: AssignCommand, api: &CrmApi, principal: &Principal) -> Result<()> {
    match command {
        AssignCommand::Support(args) => {
            let contract_id: ContractId = parse_id(&args.contract, "contract")?;
            let assignee: PrincipalId = parse_id(&args.assignee, "principal")?;
            emit(&api.assign_support_contact(principal, contract_id, assignee).map_err(api_failure)?)
        }
        AssignCommand::Sales(args) => {
            let customer_id: CustomerId = parse_id(&args.customer, "customer")?;
            let assignee: PrincipalId = parse_id(&args.assignee, "principal")?;
            emit(&api.assign_sales_contact(principal, customer_id, assignee).map_err(api_failure)?)
        }
    }
}
