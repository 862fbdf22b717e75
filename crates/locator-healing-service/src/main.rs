use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use locator_healing_api::{
    FeedbackRequest, HealingResultsRequest, HttpMetricsGateway, LocatorHealingApi,
    MetricsDispatcher, MigrateResult, RegisterSelectorRequest, RequestContext, SaveHealingRequest,
    API_CONTRACT_VERSION, DEFAULT_WORKER_QUEUE_CAPACITY,
};
use locator_healing_core::{
    resolve_session_key, FeedbackTransition, HealingConfig, HealingError, HealingQuery,
    HealingResult, RankedSelectorView, ResultRetention, SavedHealing, Selector, DEFAULT_PROJECT,
};
use locator_healing_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const SESSION_KEY_HEADER: &str = "x-session-key";
const LEGACY_SESSION_KEY_HEADER: &str = "sessionkey";
const PROJECT_HEADER: &str = "x-host-project";

#[derive(Debug, Clone)]
struct ServiceState {
    api: LocatorHealingApi,
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
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "locator-healing-service")]
#[command(about = "Local HTTP service recording and ranking locator healings")]
struct Args {
    #[arg(long, env = "LOCATOR_HEALING_DB", default_value = "./locator_healing.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "LOCATOR_HEALING_BIND", default_value = "127.0.0.1:7878")]
    bind: SocketAddr,
    /// Include the page URL in selector identifiers.
    #[arg(long, env = "LOCATOR_HEALING_URL_FOR_KEY")]
    url_for_key: bool,
    #[arg(long, env = "LOCATOR_HEALING_COLLECT_METRICS")]
    collect_metrics: bool,
    #[arg(long, env = "LOCATOR_HEALING_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
    #[arg(long, env = "LOCATOR_HEALING_METRICS_TIMEOUT_MS", default_value_t = 5_000)]
    metrics_timeout_ms: u64,
    /// Pending metrics tasks held while the gateway is slow; overflow is dropped.
    #[arg(
        long,
        env = "LOCATOR_HEALING_METRICS_QUEUE_CAPACITY",
        default_value_t = DEFAULT_WORKER_QUEUE_CAPACITY
    )]
    metrics_queue_capacity: usize,
    #[arg(long, env = "LOCATOR_HEALING_DEFAULT_PROJECT", default_value = DEFAULT_PROJECT)]
    default_project: String,
    #[arg(
        long,
        env = "LOCATOR_HEALING_RESULT_RETENTION",
        default_value = "append",
        value_parser = parse_retention
    )]
    result_retention: ResultRetention,
}

fn parse_retention(value: &str) -> Result<ResultRetention, String> {
    ResultRetention::parse(value)
        .ok_or_else(|| format!("unknown result retention `{value}`; expected append|supersede"))
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<HealingError>() {
            Some(HealingError::MissingSelector(_)) => StatusCode::NOT_FOUND,
            Some(HealingError::Validation(_) | HealingError::DuplicateIdentity(_)) => {
                StatusCode::BAD_REQUEST
            }
            // Anything outside the domain error is an open/begin/commit failure in the store.
            Some(HealingError::InternalConsistency(_) | HealingError::Storage(_)) | None => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = format!("{err:#}");
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %message, "request failed");
        } else {
            tracing::debug!(%status, error = %message, "request rejected");
        }
        Self::new(status, message)
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

fn request_context(headers: &HeaderMap) -> RequestContext {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    RequestContext {
        session_key: resolve_session_key(
            header(SESSION_KEY_HEADER),
            header(LEGACY_SESSION_KEY_HEADER),
        ),
        project_id: header(PROJECT_HEADER).map(str::to_string),
    }
}

/// Run a blocking api call off the async executor.
async fn with_api<T, F>(
    state: ServiceState,
    call: F,
) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&LocatorHealingApi) -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || call(&state.api)).await {
        Ok(result) => Ok(Json(envelope(result?))),
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("api task failed: {err}"),
        )),
    }
}

fn build_api(args: &Args) -> Result<LocatorHealingApi> {
    let config = HealingConfig {
        url_for_key: args.url_for_key,
        collect_metrics: args.collect_metrics,
        default_project: args.default_project.clone(),
        result_retention: args.result_retention,
    };

    let metrics = if args.collect_metrics {
        let Some(endpoint) = args.metrics_endpoint.as_deref() else {
            return Err(anyhow!("--metrics-endpoint is required when --collect-metrics is set"));
        };
        let gateway =
            HttpMetricsGateway::new(endpoint, Duration::from_millis(args.metrics_timeout_ms));
        MetricsDispatcher::worker(Arc::new(gateway), None, args.metrics_queue_capacity)?
    } else {
        MetricsDispatcher::disabled()
    };

    Ok(LocatorHealingApi::new(args.db.clone()).with_config(config).with_metrics(metrics))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/selector", post(selector_register))
        .route("/v1/healing", post(healing_save))
        .route("/v1/healing/query", post(healing_query))
        .route("/v1/healing/results", post(healing_results))
        .route("/v1/healing/feedback", post(healing_feedback))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = build_api(&args)?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        url_for_key = api.config().url_for_key,
        collect_metrics = api.config().collect_metrics,
        result_retention = api.config().result_retention.as_str(),
        "starting locator healing service"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    with_api(state, LocatorHealingApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    with_api(state, move |api| api.migrate(request.dry_run)).await
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    with_api(state, LocatorHealingApi::integrity_check).await
}

async fn selector_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterSelectorRequest>,
) -> Result<Json<ServiceEnvelope<Selector>>, ServiceError> {
    with_api(state, move |api| api.register_selector(request)).await
}

async fn healing_save(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<SaveHealingRequest>,
) -> Result<Json<ServiceEnvelope<SavedHealing>>, ServiceError> {
    let context = request_context(&headers);
    with_api(state, move |api| api.save_healing(request, &context)).await
}

async fn healing_query(
    State(state): State<ServiceState>,
    Json(query): Json<HealingQuery>,
) -> Result<Json<ServiceEnvelope<Vec<RankedSelectorView>>>, ServiceError> {
    with_api(state, move |api| api.get_healings(&query)).await
}

async fn healing_results(
    State(state): State<ServiceState>,
    Json(request): Json<HealingResultsRequest>,
) -> Result<Json<ServiceEnvelope<Vec<HealingResult>>>, ServiceError> {
    with_api(state, move |api| api.get_healing_results(&request)).await
}

async fn healing_feedback(
    State(state): State<ServiceState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<ServiceEnvelope<Option<FeedbackTransition>>>, ServiceError> {
    with_api(state, move |api| api.apply_feedback(request)).await
}
