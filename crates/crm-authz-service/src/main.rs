use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use clap::Parser;
use crm_authz_api::{ApiError, CrmApi, DeleteResult, API_CONTRACT_VERSION};
use crm_authz_core::{
    Contract, ContractDraft, ContractId, Customer, CustomerDraft, CustomerId, Event, EventDraft,
    EventId, Principal, PrincipalId, ResourceKind, RULESET_VERSION,
};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "crm-service.v1";
const PRINCIPAL_HEADER: &str = "x-principal-id";
const DEFAULT_LOG_FILTER: &str = "crm_authz=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: CrmApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    service_contract_version: &'static str,
    error: String,
    code: &'static str,
}

#[derive(Debug)]
struct ServiceError {
    status: StatusCode,
    body: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    ruleset_version: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct AssignContactRequest {
    principal_id: PrincipalId,
}

#[derive(Debug, Parser)]
#[command(name = "crm-authz-service")]
#[command(about = "HTTP service enforcing CRM role-based access control")]
struct Args {
    #[arg(long, env = "CRM_DB", default_value = "./crm.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CRM_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                service_contract_version: SERVICE_CONTRACT_VERSION,
                error: message.into(),
                code,
            },
        }
    }

    fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let code = err.code();
        match err {
            ApiError::Unauthenticated(_) => Self::unauthenticated(err.to_string()),
            ApiError::Forbidden | ApiError::TransitionRejected(_) => {
                Self::new(StatusCode::FORBIDDEN, code, err.to_string())
            }
            ApiError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, code, err.to_string()),
            ApiError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, code, err.to_string()),
            ApiError::Integrity(_) | ApiError::Store(_) => {
                error!(error = %format!("{err:#}"), code, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, "internal error")
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Authenticate the caller from the principal header.
fn extract_principal(state: &ServiceState, headers: &HeaderMap) -> Result<Principal, ServiceError> {
    let raw = headers
        .get(PRINCIPAL_HEADER)
        .ok_or_else(|| ServiceError::unauthenticated(format!("missing {PRINCIPAL_HEADER} header")))?
        .to_str()
        .map_err(|_| ServiceError::unauthenticated(format!("{PRINCIPAL_HEADER} is not ASCII")))?;
    let id = raw
        .trim()
        .parse::<PrincipalId>()
        .map_err(|_| ServiceError::unauthenticated(format!("{PRINCIPAL_HEADER} is not a ULID")))?;
    Ok(state.api.authenticate(id)?)
}

fn json_payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        ServiceError::new(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
    })
}

/// A malformed id can never name a stored record.
fn path_id<T>(raw: &str, kind: ResourceKind) -> Result<T, ServiceError>
where
    T: FromStr,
{
    raw.parse::<T>().map_err(|_| ServiceError::from(ApiError::NotFound(kind)))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/customers", get(customer_list).post(customer_create))
        .route(
            "/v1/customers/:customer_id",
            get(customer_show).put(customer_update).delete(customer_delete),
        )
        .route("/v1/customers/:customer_id/sales-contact", put(customer_assign_sales))
        .route("/v1/contracts", get(contract_list).post(contract_create))
        .route(
            "/v1/contracts/:contract_id",
            get(contract_show).put(contract_update).delete(contract_delete),
        )
        .route("/v1/contracts/:contract_id/support-contact", put(contract_assign_support))
        .route("/v1/events", get(event_list).post(event_create))
        .route("/v1/events/:event_id", get(event_show).put(event_update).delete(event_delete))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let state = ServiceState { api: CrmApi::new(args.db.clone()) };
    state.api.migrate(false)?;
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "crm authz service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok", ruleset_version: RULESET_VERSION }))
}

async fn customer_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Customer>>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    Ok(Json(envelope(state.api.list_customers(&principal)?)))
}

async fn customer_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CustomerDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Customer>>), ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let draft = json_payload(payload)?;
    let customer = state.api.create_customer(&principal, draft)?;
    Ok((StatusCode::CREATED, Json(envelope(customer))))
}

async fn customer_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(customer_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Customer>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: CustomerId = path_id(&customer_id, ResourceKind::Customer)?;
    Ok(Json(envelope(state.api.get_customer(&principal, id)?)))
}

async fn customer_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(customer_id): Path<String>,
    payload: Result<Json<CustomerDraft>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Customer>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: CustomerId = path_id(&customer_id, ResourceKind::Customer)?;
    let draft = json_payload(payload)?;
    Ok(Json(envelope(state.api.update_customer(&principal, id, draft)?)))
}

async fn customer_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(customer_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResult>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: CustomerId = path_id(&customer_id, ResourceKind::Customer)?;
    Ok(Json(envelope(state.api.delete_customer(&principal, id)?)))
}

async fn customer_assign_sales(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(customer_id): Path<String>,
    payload: Result<Json<AssignContactRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Customer>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: CustomerId = path_id(&customer_id, ResourceKind::Customer)?;
    let request = json_payload(payload)?;
    Ok(Json(envelope(state.api.assign_sales_contact(&principal, id, request.principal_id)?)))
}

async fn contract_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Contract>>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    Ok(Json(envelope(state.api.list_contracts(&principal)?)))
}

async fn contract_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<ContractDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Contract>>), ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let draft = json_payload(payload)?;
    let contract = state.api.create_contract(&principal, draft)?;
    Ok((StatusCode::CREATED, Json(envelope(contract))))
}

async fn contract_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(contract_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Contract>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: ContractId = path_id(&contract_id, ResourceKind::Contract)?;
    Ok(Json(envelope(state.api.get_contract(&principal, id)?)))
}

async fn contract_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(contract_id): Path<String>,
    payload: Result<Json<ContractDraft>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Contract>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: ContractId = path_id(&contract_id, ResourceKind::Contract)?;
    let draft = json_payload(payload)?;
    Ok(Json(envelope(state.api.update_contract(&principal, id, draft)?)))
}

async fn contract_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(contract_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResult>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: ContractId = path_id(&contract_id, ResourceKind::Contract)?;
    Ok(Json(envelope(state.api.delete_contract(&principal, id)?)))
}

async fn contract_assign_support(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(contract_id): Path<String>,
    payload: Result<Json<AssignContactRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Contract>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: ContractId = path_id(&contract_id, ResourceKind::Contract)?;
    let request = json_payload(payload)?;
    Ok(Json(envelope(state.api.assign_support_contact(&principal, id, request.principal_id)?)))
}

async fn event_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Event>>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    Ok(Json(envelope(state.api.list_events(&principal)?)))
}

async fn event_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<EventDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Event>>), ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let draft = json_payload(payload)?;
    let event = state.api.create_event(&principal, draft)?;
    Ok((StatusCode::CREATED, Json(envelope(event))))
}

async fn event_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Event>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: EventId = path_id(&event_id, ResourceKind::Event)?;
    Ok(Json(envelope(state.api.get_event(&principal, id)?)))
}

async fn event_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    payload: Result<Json<EventDraft>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Event>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: EventId = path_id(&event_id, ResourceKind::Event)?;
    let draft = json_payload(payload)?;
    Ok(Json(envelope(state.api.update_event(&principal, id, draft)?)))
}

async fn event_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResult>>, ServiceError> {
    let principal = extract_principal(&state, &headers)?;
    let id: EventId = path_id(&event_id, ResourceKind::Event)?;
    Ok(Json(envelope(state.api.delete_event(&principal, id)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use crm_authz_api::RegisterPrincipalRequest;
    use crm_authz_core::Role;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("crm-authz-service-{}.sqlite3", ulid::Ulid::new()))
    }

    struct Fixture {
        router: Router,
        db_path: PathBuf,
        manager: PrincipalId,
        seller: PrincipalId,
        other_seller: PrincipalId,
        support: PrincipalId,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    fn fixture() -> Fixture {
        let db_path = unique_temp_db_path();
        let api = CrmApi::new(db_path.clone());
        let register = |username: &str, role: Role| -> PrincipalId {
            match api.register_principal(RegisterPrincipalRequest {
                username: username.to_string(),
                role,
            }) {
                Ok(account) => account.id,
                Err(err) => panic!("failed to register {username}: {err}"),
            }
        };
        let manager = register("max", Role::Management);
        let seller = register("sam", Role::Sales);
        let other_seller = register("tess", Role::Sales);
        let support = register("sue", Role::Support);
        let router = app(ServiceState { api: CrmApi::new(db_path.clone()) });
        Fixture { router, db_path, manager, seller, other_seller, support }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        principal: Option<PrincipalId>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(principal) = principal {
            builder = builder.header(PRINCIPAL_HEADER, principal.to_string());
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                axum::body::Body::from(value.to_string())
            }
            None => axum::body::Body::empty(),
        };
        let request =
            builder.body(body).unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    fn data_id(value: &serde_json::Value) -> String {
        match value["data"]["id"].as_str() {
            Some(id) => id.to_string(),
            None => panic!("response has no data.id: {value}"),
        }
    }

    fn customer_payload(is_customer: bool) -> serde_json::Value {
        serde_json::json!({
            "first_name": "Kevin",
            "last_name": "Casey",
            "email": "kevin@startup.example",
            "phone_number": "+33 1 23 45 67 89",
            "company_name": "Cool Startup LLC",
            "is_customer": is_customer
        })
    }

    fn contract_payload(customer_id: &str, is_signed: bool) -> serde_json::Value {
        serde_json::json!({
            "customer_id": customer_id,
            "amount_cents": 499_900,
            "payment_due_date": "2027-01-31T00:00:00Z",
            "is_signed": is_signed
        })
    }

    fn event_payload(contract_id: &str, is_finished: bool) -> serde_json::Value {
        serde_json::json!({
            "contract_id": contract_id,
            "event_name": "John Quick Wedding",
            "event_date": "2027-06-04T13:00:00Z",
            "attendees": 75,
            "notes": "Wedding starts at 3PM, by the river.",
            "is_finished": is_finished
        })
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let fx = fixture();
        let (status, value) = send(&fx.router, "GET", "/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["ruleset_version"].as_str(), Some(RULESET_VERSION));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn missing_malformed_or_unknown_principals_are_unauthorized() {
        let fx = fixture();
        let (status, value) = send(&fx.router, "GET", "/v1/customers", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(value["code"].as_str(), Some("unauthenticated"));

        let request = Request::builder()
            .uri("/v1/customers")
            .method("GET")
            .header(PRINCIPAL_HEADER, "not-a-ulid")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match fx.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(&fx.router, "GET", "/v1/customers", Some(PrincipalId::new()), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &fx.router,
            "POST",
            "/v1/customers",
            None,
            Some(serde_json::json!({"first_name": "only"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn customer_lifecycle_maps_decisions_to_status_codes() {
        let fx = fixture();

        let (status, created) =
            send(&fx.router, "POST", "/v1/customers", Some(fx.seller), Some(customer_payload(true)))
                .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["sales_contact"].as_str(), Some(fx.seller.to_string().as_str()));
        let customer_id = data_id(&created);
        let customer_uri = format!("/v1/customers/{customer_id}");

        let (status, value) =
            send(&fx.router, "POST", "/v1/customers", Some(fx.support), Some(customer_payload(true)))
                .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(value["code"].as_str(), Some("forbidden"));

        let (status, value) = send(&fx.router, "GET", &customer_uri, Some(fx.other_seller), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["code"].as_str(), Some("not_found"));

        let (status, value) = send(
            &fx.router,
            "PUT",
            &customer_uri,
            Some(fx.manager),
            Some(customer_payload(false)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(value["code"].as_str(), Some("irreversible_state_change"));

        let (status, _) = send(&fx.router, "DELETE", &customer_uri, Some(fx.manager), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) =
            send(&fx.router, "GET", "/v1/customers/not-an-id", Some(fx.manager), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn incomplete_payloads_are_bad_requests() {
        let fx = fixture();
        let (status, value) = send(
            &fx.router,
            "POST",
            "/v1/customers",
            Some(fx.seller),
            Some(serde_json::json!({"first_name": "Kevin"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["code"].as_str(), Some("validation_error"));

        let mut blank = customer_payload(true);
        blank["last_name"] = serde_json::json!("");
        let (status, _) =
            send(&fx.router, "POST", "/v1/customers", Some(fx.seller), Some(blank)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn support_event_flow_and_locks() {
        let fx = fixture();
        let (_, customer) =
            send(&fx.router, "POST", "/v1/customers", Some(fx.seller), Some(customer_payload(true)))
                .await;
        let customer_id = data_id(&customer);

        let (status, value) = send(
            &fx.router,
            "POST",
            "/v1/contracts",
            Some(fx.seller),
            Some(contract_payload(&customer_id, true)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let contract_id = data_id(&value);

        let (status, _) = send(
            &fx.router,
            "PUT",
            &format!("/v1/contracts/{contract_id}/support-contact"),
            Some(fx.seller),
            Some(serde_json::json!({"principal_id": fx.support.to_string()})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, value) = send(
            &fx.router,
            "PUT",
            &format!("/v1/contracts/{contract_id}/support-contact"),
            Some(fx.manager),
            Some(serde_json::json!({"principal_id": fx.support.to_string()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["support_contact"].as_str(), Some(fx.support.to_string().as_str()));

        let (status, value) = send(
            &fx.router,
            "PUT",
            &format!("/v1/contracts/{contract_id}"),
            Some(fx.seller),
            Some(contract_payload(&customer_id, true)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(value["code"].as_str(), Some("contract_locked"));

        let (status, value) = send(
            &fx.router,
            "POST",
            "/v1/events",
            Some(fx.support),
            Some(event_payload(&contract_id, false)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let event_uri = format!("/v1/events/{}", data_id(&value));

        let (status, value) = send(
            &fx.router,
            "POST",
            "/v1/events",
            Some(fx.manager),
            Some(event_payload(&contract_id, false)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(value["code"].as_str(), Some("duplicate_event"));

        let (status, _) = send(
            &fx.router,
            "PUT",
            &event_uri,
            Some(fx.support),
            Some(event_payload(&contract_id, true)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, value) = send(&fx.router, "DELETE", &event_uri, Some(fx.manager), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(value["code"].as_str(), Some("event_locked"));

        let (status, value) = send(&fx.router, "GET", "/v1/events", Some(fx.other_seller), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"].as_array().map(Vec::len), Some(0));
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn dangling_event_chain_is_an_internal_error() {
        let fx = fixture();
        let (_, customer) =
            send(&fx.router, "POST", "/v1/customers", Some(fx.seller), Some(customer_payload(true)))
                .await;
        let customer_id = data_id(&customer);
        let (_, contract) = send(
            &fx.router,
            "POST",
            "/v1/contracts",
            Some(fx.seller),
            Some(contract_payload(&customer_id, true)),
        )
        .await;
        let contract_id = data_id(&contract);
        let (status, event) = send(
            &fx.router,
            "POST",
            "/v1/events",
            Some(fx.manager),
            Some(event_payload(&contract_id, false)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let event_uri = format!("/v1/events/{}", data_id(&event));

        let conn = rusqlite::Connection::open(&fx.db_path)
            .unwrap_or_else(|err| panic!("failed to open {}: {err}", fx.db_path.display()));
        conn.execute_batch("PRAGMA foreign_keys = OFF;")
            .unwrap_or_else(|err| panic!("failed to disable foreign keys: {err}"));
        conn.execute("DELETE FROM contracts WHERE contract_id = ?1", [contract_id.as_str()])
            .unwrap_or_else(|err| panic!("failed to delete contract: {err}"));

        let (status, value) = send(&fx.router, "GET", &event_uri, Some(fx.manager), None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value["code"].as_str(), Some("integrity_error"));
        assert_eq!(value["error"].as_str(), Some("internal error"));

        let (status, value) = send(&fx.router, "GET", "/v1/events", Some(fx.seller), None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value["code"].as_str(), Some("integrity_error"));
    }
}
