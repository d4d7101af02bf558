use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use incident_sync_api::{
    IncidentSyncApi, IntegrityReport, MigrateResult, ReportFilter, SchemaStatus, SyncError,
    SyncRequest, UpsertOutcome, API_CONTRACT_VERSION,
};
use incident_sync_core::{
    CorrectionRequestDraft, DescriptionAddendumDraft, NewReport, PrisonerInvolvementDraft, Report,
    ReportBasic, ReportId, ReportStatus, ReportType, StaffInvolvementDraft,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    api: IncidentSyncApi,
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
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    category: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// A mutating request body: who is acting plus the operation's own fields.
#[derive(Debug, Clone, Deserialize)]
struct Edit<T> {
    actor: String,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Clone, Deserialize)]
struct ActorQuery {
    actor: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusChange {
    status: ReportStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct TypeChange {
    #[serde(rename = "type")]
    report_type: ReportType,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "incident-sync-service")]
#[command(about = "HTTP service for syncing incident reports between legacy and primary systems")]
struct Args {
    #[arg(long, env = "INCIDENT_SYNC_DB", default_value = "./incident_sync.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "INCIDENT_SYNC_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long = "log-level", env = "INCIDENT_SYNC_LOG", default_value = "info")]
    log_level: String,
    #[arg(
        long = "log-format",
        env = "INCIDENT_SYNC_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Compact
    )]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, category: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            category,
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_request", rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(rejection.status(), "invalid_request", rejection.body_text())
    }
}

impl From<PathRejection> for ServiceError {
    fn from(rejection: PathRejection) -> Self {
        Self::new(rejection.status(), "invalid_request", rejection.body_text())
    }
}

impl From<SyncError> for ServiceError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::AlreadyExists { .. } | SyncError::ProvenanceConflict(_) => {
                StatusCode::CONFLICT
            }
            SyncError::InvalidRequest(_) | SyncError::IndexOutOfRange(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::Unexpected(cause) => {
                tracing::error!(error = ?cause, "request failed unexpectedly");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.category(), err.to_string())
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

type Reply<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

/// Run a blocking API call off the async workers.
async fn run<T, F>(state: &ServiceState, op: F) -> Reply<T>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&IncidentSyncApi) -> Result<T, SyncError> + Send + 'static,
{
    let api = state.api.clone();
    match tokio::task::spawn_blocking(move || op(&api)).await {
        Ok(result) => Ok(envelope(result?)),
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unexpected",
            format!("worker task failed: {err}"),
        )),
    }
}

fn parse_report_id(raw: &str) -> Result<ReportId, ServiceError> {
    Ulid::from_string(raw)
        .map(ReportId)
        .map_err(|err| ServiceError::invalid(format!("invalid report id {raw}: {err}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .route("/v1/sync/upsert", post(sync_upsert))
        .route("/v1/reports", post(report_create).get(report_list))
        .route("/v1/reports/reference/:reference", get(report_by_reference))
        .route("/v1/reports/:id", get(report_get).delete(report_delete))
        .route("/v1/reports/:id/status", patch(report_status))
        .route("/v1/reports/:id/type", patch(report_type))
        .route("/v1/reports/:id/staff-involved", post(staff_add))
        .route("/v1/reports/:id/staff-involved/:index", patch(staff_update).delete(staff_remove))
        .route("/v1/reports/:id/prisoners-involved", post(prisoner_add))
        .route(
            "/v1/reports/:id/prisoners-involved/:index",
            patch(prisoner_update).delete(prisoner_remove),
        )
        .route("/v1/reports/:id/correction-requests", post(correction_add))
        .route(
            "/v1/reports/:id/correction-requests/:index",
            patch(correction_update).delete(correction_remove),
        )
        .route("/v1/reports/:id/description-addenda", post(addendum_add))
        .with_state(state)
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = match args.log_format {
        LogFormat::Json => fmt().with_env_filter(filter).json().with_target(false).try_init(),
        LogFormat::Compact => {
            fmt().with_env_filter(filter).with_target(false).compact().try_init()
        }
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let api = IncidentSyncApi::new(args.db.clone());
    let migrated = api.migrate(false)?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = ?migrated.after_version,
        "database ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok" })
}

async fn db_schema_version(State(state): State<ServiceState>) -> Reply<SchemaStatus> {
    run(&state, IncidentSyncApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    request: Result<Json<MigrateRequest>, JsonRejection>,
) -> Reply<MigrateResult> {
    let Json(request) = request?;
    run(&state, move |api| api.migrate(request.dry_run)).await
}

async fn db_integrity(State(state): State<ServiceState>) -> Reply<IntegrityReport> {
    run(&state, IncidentSyncApi::integrity_check).await
}

async fn sync_upsert(
    State(state): State<ServiceState>,
    request: Result<Json<SyncRequest>, JsonRejection>,
) -> Reply<UpsertOutcome> {
    let Json(request) = request?;
    run(&state, move |api| api.upsert(request)).await
}

async fn report_create(
    State(state): State<ServiceState>,
    request: Result<Json<Edit<NewReport>>, JsonRejection>,
) -> Reply<Report> {
    let Json(request) = request?;
    run(&state, move |api| api.create_report(request.body, &request.actor)).await
}

async fn report_list(
    State(state): State<ServiceState>,
    filter: Result<Query<ReportFilter>, QueryRejection>,
) -> Reply<Vec<ReportBasic>> {
    let Query(filter) = filter?;
    run(&state, move |api| api.list_reports(&filter)).await
}

async fn report_get(State(state): State<ServiceState>, Path(id): Path<String>) -> Reply<Report> {
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.get_report(id)).await
}

async fn report_by_reference(
    State(state): State<ServiceState>,
    Path(reference): Path<String>,
) -> Reply<Report> {
    run(&state, move |api| api.get_report_by_reference(&reference)).await
}

async fn report_delete(State(state): State<ServiceState>, Path(id): Path<String>) -> Reply<Report> {
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.delete_report(id)).await
}

async fn report_status(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    request: Result<Json<Edit<StatusChange>>, JsonRejection>,
) -> Reply<Report> {
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.change_status(id, request.body.status, &request.actor)).await
}

async fn report_type(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    request: Result<Json<Edit<TypeChange>>, JsonRejection>,
) -> Reply<Report> {
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.change_type(id, request.body.report_type, &request.actor)).await
}

async fn staff_add(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    request: Result<Json<Edit<StaffInvolvementDraft>>, JsonRejection>,
) -> Reply<Report> {
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.add_staff_involvement(id, request.body, &request.actor)).await
}

async fn staff_update(
    State(state): State<ServiceState>,
    path: Result<Path<(String, usize)>, PathRejection>,
    request: Result<Json<Edit<StaffInvolvementDraft>>, JsonRejection>,
) -> Reply<Report> {
    let Path((id, index)) = path?;
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.update_staff_involvement(id, index, request.body, &request.actor))
        .await
}

async fn staff_remove(
    State(state): State<ServiceState>,
    path: Result<Path<(String, usize)>, PathRejection>,
    query: Result<Query<ActorQuery>, QueryRejection>,
) -> Reply<Report> {
    let Path((id, index)) = path?;
    let Query(query) = query?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.remove_staff_involvement(id, index, &query.actor)).await
}

async fn prisoner_add(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    request: Result<Json<Edit<PrisonerInvolvementDraft>>, JsonRejection>,
) -> Reply<Report> {
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.add_prisoner_involvement(id, request.body, &request.actor)).await
}

async fn prisoner_update(
    State(state): State<ServiceState>,
    path: Result<Path<(String, usize)>, PathRejection>,
    request: Result<Json<Edit<PrisonerInvolvementDraft>>, JsonRejection>,
) -> Reply<Report> {
    let Path((id, index)) = path?;
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| {
        api.update_prisoner_involvement(id, index, request.body, &request.actor)
    })
    .await
}

async fn prisoner_remove(
    State(state): State<ServiceState>,
    path: Result<Path<(String, usize)>, PathRejection>,
    query: Result<Query<ActorQuery>, QueryRejection>,
) -> Reply<Report> {
    let Path((id, index)) = path?;
    let Query(query) = query?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.remove_prisoner_involvement(id, index, &query.actor)).await
}

async fn correction_add(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    request: Result<Json<Edit<CorrectionRequestDraft>>, JsonRejection>,
) -> Reply<Report> {
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.add_correction_request(id, request.body, &request.actor)).await
}

async fn correction_update(
    State(state): State<ServiceState>,
    path: Result<Path<(String, usize)>, PathRejection>,
    request: Result<Json<Edit<CorrectionRequestDraft>>, JsonRejection>,
) -> Reply<Report> {
    let Path((id, index)) = path?;
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| {
        api.update_correction_request(id, index, request.body, &request.actor)
    })
    .await
}

async fn correction_remove(
    State(state): State<ServiceState>,
    path: Result<Path<(String, usize)>, PathRejection>,
    query: Result<Query<ActorQuery>, QueryRejection>,
) -> Reply<Report> {
    let Path((id, index)) = path?;
    let Query(query) = query?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.remove_correction_request(id, index, &query.actor)).await
}

async fn addendum_add(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    request: Result<Json<Edit<DescriptionAddendumDraft>>, JsonRejection>,
) -> Reply<Report> {
    let Json(request) = request?;
    let id = parse_report_id(&id)?;
    run(&state, move |api| api.add_description_addendum(id, request.body, &request.actor)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("incident-sync-service-{}.sqlite3", Ulid::new()))
    }

    fn router() -> Router {
        app(ServiceState { api: IncidentSyncApi::new(unique_temp_db_path()) })
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), Box<dyn std::error::Error>> {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))?,
            None => builder.body(Body::empty())?,
        };
        let response = router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await?;
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes)? };
        Ok((status, value))
    }

    fn legacy_report(incident_id: i64, title: &str) -> Value {
        let staff = json!({"username": "FSTAFF", "firstName": "FRED", "lastName": "STAFF"});
        json!({
            "incidentId": incident_id,
            "title": title,
            "description": "Window smashed",
            "prison": {"code": "MDI"},
            "status": {"code": "AWAN"},
            "type": "DAMAGE",
            "reportingStaff": staff,
            "reportedDateTime": "2024-06-01T10:05:00Z",
            "incidentDateTime": "2024-06-01T09:30:00Z",
            "createDateTime": "2024-06-01T10:05:00Z",
            "createdBy": "FSTAFF",
            "staffParties": [
                {"staff": staff, "sequence": 0, "role": {"code": "WIT"}}
            ]
        })
    }

    fn text<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
        value.pointer(pointer).and_then(Value::as_str)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() -> TestResult {
        let (status, value) = call(&router(), "GET", "/v1/health", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text(&value, "/service_contract_version"), Some(SERVICE_CONTRACT_VERSION));
        assert_eq!(text(&value, "/api_contract_version"), Some(API_CONTRACT_VERSION));
        assert_eq!(text(&value, "/data/status"), Some("ok"));
        Ok(())
    }

    #[tokio::test]
    async fn migrate_then_integrity_is_clean() -> TestResult {
        let router = router();
        let (status, value) =
            call(&router, "POST", "/v1/db/migrate", Some(json!({"dry_run": false}))).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value.pointer("/data/up_to_date"), Some(&json!(true)));

        let (status, value) = call(&router, "GET", "/v1/db/integrity", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value.pointer("/data/quick_check_ok"), Some(&json!(true)));
        Ok(())
    }

    #[tokio::test]
    async fn legacy_upsert_then_primary_edit_then_conflict() -> TestResult {
        let router = router();
        let (status, created) = call(
            &router,
            "POST",
            "/v1/sync/upsert",
            Some(json!({"initialMigration": true, "report": legacy_report(4001, "Cell damage")})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created.pointer("/data/created"), Some(&json!(true)));
        let Some(id) = text(&created, "/data/report/id").map(str::to_string) else {
            return Err("upsert response has no report id".into());
        };

        let (status, fetched) = call(&router, "GET", "/v1/reports/reference/4001", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text(&fetched, "/data/id"), Some(id.as_str()));

        let (status, edited) = call(
            &router,
            "PATCH",
            &format!("/v1/reports/{id}/status"),
            Some(json!({"actor": "EDITOR", "status": "CLOSED"})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text(&edited, "/data/modified_in"), Some("PRIMARY"));

        let (status, conflict) = call(
            &router,
            "POST",
            "/v1/sync/upsert",
            Some(json!({"id": id, "report": legacy_report(4001, "Overwritten")})),
        )
        .await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(text(&conflict, "/category"), Some("provenance_conflict"));
        Ok(())
    }

    #[tokio::test]
    async fn id_with_initial_migration_is_a_bad_request() -> TestResult {
        let (status, value) = call(
            &router(),
            "POST",
            "/v1/sync/upsert",
            Some(json!({
                "id": Ulid::new().to_string(),
                "initialMigration": true,
                "report": legacy_report(4002, "Cell damage")
            })),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&value, "/category"), Some("invalid_request"));
        Ok(())
    }

    #[tokio::test]
    async fn primary_report_related_objects_round_trip() -> TestResult {
        let router = router();
        let (status, created) = call(
            &router,
            "POST",
            "/v1/reports",
            Some(json!({
                "actor": "EDITOR",
                "type": "FIND",
                "location": "LEI",
                "title": "Phone found",
                "description": "Found during cell search",
                "incident_date_and_time": "2024-07-01T08:00:00Z"
            })),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text(&created, "/data/status"), Some("DRAFT"));
        let Some(id) = text(&created, "/data/id").map(str::to_string) else {
            return Err("create response has no report id".into());
        };

        let staff = json!({
            "actor": "EDITOR",
            "staff_username": "ALICE",
            "first_name": "ALICE",
            "last_name": "OFFICER",
            "staff_role": "PRESENT_AT_SCENE"
        });
        let uri = format!("/v1/reports/{id}/staff-involved");
        call(&router, "POST", &uri, Some(staff.clone())).await?;
        let (status, added) = call(&router, "POST", &uri, Some(staff.clone())).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(added.pointer("/data/staff_involved/1/sequence"), Some(&json!(1)));

        let (status, out_of_range) =
            call(&router, "PATCH", &format!("{uri}/9"), Some(staff)).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&out_of_range, "/category"), Some("index_out_of_range"));

        let (status, removed) =
            call(&router, "DELETE", &format!("{uri}/1?actor=EDITOR"), None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed.pointer("/data/staff_involved/0/sequence"), Some(&json!(1)));

        let (status, listed) = call(&router, "GET", "/v1/reports?status=DRAFT", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.pointer("/data").and_then(Value::as_array).map(Vec::len), Some(1));

        let (status, _) = call(&router, "DELETE", &format!("/v1/reports/{id}"), None).await?;
        assert_eq!(status, StatusCode::OK);
        let (status, missing) = call(&router, "GET", &format!("/v1/reports/{id}"), None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(text(&missing, "/category"), Some("not_found"));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_report_id_is_a_bad_request() -> TestResult {
        let (status, value) = call(&router(), "GET", "/v1/reports/not-a-ulid", None).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&value, "/category"), Some("invalid_request"));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_bodies_queries_and_paths_carry_a_category() -> TestResult {
        let router = router();
        let id = Ulid::new();

        let (status, value) =
            call(&router, "POST", "/v1/sync/upsert", Some(json!({"report": 5}))).await?;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(text(&value, "/category"), Some("invalid_request"));
        assert_eq!(text(&value, "/service_contract_version"), Some(SERVICE_CONTRACT_VERSION));

        let (status, value) = call(&router, "POST", "/v1/db/migrate", None).await?;
        assert!(status.is_client_error());
        assert_eq!(text(&value, "/category"), Some("invalid_request"));

        let uri = format!("/v1/reports/{id}/staff-involved/1");
        let (status, value) = call(&router, "DELETE", &uri, None).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&value, "/category"), Some("invalid_request"));

        let uri = format!("/v1/reports/{id}/staff-involved/first?actor=EDITOR");
        let (status, value) = call(&router, "DELETE", &uri, None).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&value, "/category"), Some("invalid_request"));
        Ok(())
    }
}
