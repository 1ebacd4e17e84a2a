mod catalog;
mod config;
mod enrich;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod runs;
mod scheduler;
mod security;
mod source;
mod store;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use catalog::{HistoryEntry, Listing, Reconciler, ScanLog, Seller};
use config::{AppConfig, LlmProvider};
use enrich::{Enricher, LlmEnricher, NoopEnricher};
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CurrentRunResponse, StartRunRequest, StartRunResponse, StopRunResponse};
use pipeline::Pipeline;
use runs::{RunCoordinator, RunError, RunEventKind, RunRecord, RunTrigger};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use source::{CommandSource, JsonFileSource, ListingSource, SellerScope};
use std::{net::SocketAddr, sync::Arc};
use store::{CatalogStore, MemoryCatalogStore, PgCatalogStore, StoreError};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "catalog.api", "server crashed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env().wrap_err("invalid configuration")?;
    let sellers = match &config.sellers_file {
        Some(path) => config::load_sellers(path)
            .await
            .wrap_err("cannot load seller seed list")?,
        None => Vec::new(),
    };
    info!(target = "catalog.api", sellers = sellers.len(), "seller seed list loaded");

    let store: Arc<dyn CatalogStore> = match &config.database {
        Some(db) => Arc::new(
            PgCatalogStore::connect(&db.url, db.store.clone())
                .await
                .wrap_err("cannot open catalog database")?,
        ),
        None => {
            warn!(target = "catalog.api", "DATABASE_URL unset; using the in-memory store");
            Arc::new(MemoryCatalogStore::new())
        }
    };

    let source: Arc<dyn ListingSource> = match &config.scraper.command {
        Some(command) => Arc::new(CommandSource::new(
            command.clone(),
            config.scraper.workdir.clone(),
            config.scraper.output.clone(),
        )),
        None => {
            let source = JsonFileSource::new(config.scraper.output.clone());
            info!(target = "catalog.api", path = %source.path().display(), "SCRAPER_COMMAND unset; reading the export file only");
            Arc::new(source)
        }
    };

    let enricher: Arc<dyn Enricher> = match &config.llm {
        LlmProvider::TensorZero(llm) => Arc::new(LlmEnricher::new(
            llm::LlmClient::new(llm.clone()).wrap_err("cannot build TensorZero client")?,
            config.llm_batch_size,
        )),
        LlmProvider::None => Arc::new(NoopEnricher),
    };

    let pipeline = Pipeline::new(
        source,
        enricher,
        Reconciler::new(store.clone(), config.reconcile.clone()),
        sellers,
    );
    let coordinator = RunCoordinator::new(pipeline, config.run_history_limit);
    spawn_event_logger(&coordinator);

    let shutdown = CancellationToken::new();
    let scheduler = config
        .schedule_interval
        .map(|every| scheduler::spawn(coordinator.clone(), every, shutdown.clone()));

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("cannot install prometheus recorder: {err}"))?;

    let state = AppState {
        coordinator: coordinator.clone(),
        store,
        prometheus_handle,
        metrics_key: config.metrics_key.clone().map(Arc::from),
    };
    let app = app(state, AuthState::from_keys(&config.api_keys));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "catalog.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }
    if coordinator.stop().await {
        info!(target = "catalog.api", "waiting for the active run to stop");
        coordinator.wait_idle().await;
    }
    Ok(())
}

#[derive(Clone)]
struct AppState {
    coordinator: RunCoordinator,
    store: Arc<dyn CatalogStore>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<Arc<str>>,
}

fn app(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/current", get(current_run).delete(stop_run))
        .route("/runs/{id}", get(get_run))
        .route("/sellers/{phone}", get(get_seller))
        .route("/sellers/{phone}/scans", get(seller_scans))
        .route("/listings/{id}", get(get_listing))
        .route("/listings/{id}/history", get(listing_history))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Run events go to the log; the broadcast channel has no HTTP surface.
fn spawn_event_logger(coordinator: &RunCoordinator) {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.kind {
                    RunEventKind::Log => {
                        debug!(target = "catalog.runs", run_id = %event.run_id, "{}", event.message)
                    }
                    RunEventKind::Status | RunEventKind::Complete => {
                        info!(target = "catalog.runs", run_id = %event.run_id, "{}", event.message)
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(target = "catalog.runs", missed, "run_events_lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "catalog.api", "cannot listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!(target = "catalog.api", "shutdown requested");
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "catalog-reconciler",
        "run_active": state.coordinator.is_running(),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret.as_ref() {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Start a manual run.
///
/// - Method: `POST`
/// - Path: `/runs`
/// - Body (optional): `{"sellers": ["<phone>", ...]}`
/// - Response: `202 {run_id}`, or `409` while another run is active
async fn start_run(
    State(state): State<AppState>,
    caller: Option<Extension<AuthContext>>,
    body: Bytes,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    crate::metrics::inc_requests("/runs");
    let request: StartRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::BadRequest("invalid_request", err.to_string()))?
    };
    let scope = match request.sellers {
        Some(phones) if !phones.is_empty() => SellerScope::Phones(phones),
        _ => SellerScope::All,
    };

    let run_id = state.coordinator.start(RunTrigger::Manual, scope).await?;
    if let Some(Extension(caller)) = caller {
        info!(
            target = "catalog.api",
            run_id = %run_id,
            client_id = %caller.client_id,
            api_key = %caller.api_key_id,
            "manual run requested",
        );
    }
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

async fn stop_run(State(state): State<AppState>) -> Json<StopRunResponse> {
    crate::metrics::inc_requests("/runs/current");
    Json(StopRunResponse {
        stopped: state.coordinator.stop().await,
    })
}

async fn current_run(State(state): State<AppState>) -> Json<CurrentRunResponse> {
    let current_run_id = state.coordinator.current();
    Json(CurrentRunResponse {
        is_running: current_run_id.is_some(),
        current_run_id,
    })
}

async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunRecord>> {
    Json(state.coordinator.runs().await)
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, AppError> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid_run_id", id));
    };
    state
        .coordinator
        .run(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("run", id.to_string()))
}

#[derive(Debug, Serialize)]
struct SellerResponse {
    seller: Seller,
    listings: Vec<Listing>,
}

async fn get_seller(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> Result<Json<SellerResponse>, AppError> {
    let seller = state
        .store
        .seller(&phone)
        .await?
        .ok_or_else(|| AppError::NotFound("seller", phone.clone()))?;
    let listings = state.store.seller_listings(&phone).await?;
    Ok(Json(SellerResponse { seller, listings }))
}

async fn seller_scans(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> Result<Json<Vec<ScanLog>>, AppError> {
    Ok(Json(state.store.scan_logs(&phone).await?))
}

async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Listing>, AppError> {
    state
        .store
        .listing(&id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound("listing", id))
}

async fn listing_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    Ok(Json(state.store.listing_history(&id).await?))
}

#[derive(Debug)]
enum AppError {
    Run(RunError),
    Store(StoreError),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
}

impl From<RunError> for AppError {
    fn from(value: RunError) -> Self {
        Self::Run(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Run(err @ RunError::AlreadyRunning(_)) => (
                StatusCode::CONFLICT,
                ApiError::new("run_in_progress", Some(err.to_string())),
            ),
            AppError::Store(err) => {
                error!(target = "catalog.api", error = %err, "store_query_failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::new("store_error", Some(err.to_string())),
                )
            }
            AppError::BadRequest(code, detail) => {
                (StatusCode::BAD_REQUEST, ApiError::new(code, Some(detail)))
            }
            AppError::NotFound(what, key) => (
                StatusCode::NOT_FOUND,
                ApiError::new("not_found", Some(format!("{what} {key} not found"))),
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use catalog::{RawListing, ReconcileSettings};
    use source::{MockListingSource, SourceBatch, SourceError};
    use testresult::TestResult;
    use tower::ServiceExt;

    /// Holds the run open until it is cancelled.
    struct HeldSource;

    #[async_trait]
    impl ListingSource for HeldSource {
        async fn fetch(
            &self,
            _scope: &SellerScope,
            cancel: &CancellationToken,
        ) -> Result<SourceBatch, SourceError> {
            cancel.cancelled().await;
            Err(SourceError::Cancelled)
        }
    }

    fn listing(id: &str, phone: &str) -> RawListing {
        RawListing {
            id: id.into(),
            seller_phone: phone.into(),
            name: Some(format!("Phone {id}")),
            ..RawListing::default()
        }
    }

    fn state_with(source: Arc<dyn ListingSource>, metrics_key: Option<&str>) -> AppState {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalogStore::new());
        let pipeline = Pipeline::new(
            source,
            Arc::new(NoopEnricher),
            Reconciler::new(store.clone(), ReconcileSettings::default()),
            Vec::new(),
        );
        AppState {
            coordinator: RunCoordinator::new(pipeline, 10),
            store,
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            metrics_key: metrics_key.map(Arc::from),
        }
    }

    fn scraped_state() -> AppState {
        let mut source = MockListingSource::new();
        source.expect_fetch().returning(|_, _| {
            Ok(SourceBatch {
                listings: vec![listing("p-1", "91990"), listing("p-2", "91990")],
                ..SourceBatch::default()
            })
        });
        state_with(Arc::new(source), None)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        key: Option<&str>,
    ) -> Result<(StatusCode, serde_json::Value), Box<dyn std::error::Error>> {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            request = request.header(security::API_KEY_HEADER, key);
        }
        let response = app.clone().oneshot(request.body(Body::empty())?).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        Ok((status, value))
    }

    #[tokio::test]
    async fn health_is_public() -> TestResult {
        let app = app(scraped_state(), AuthState::from_keys("ops:secret"));
        let (status, body) = send(&app, "GET", "/health", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["run_active"], false);
        Ok(())
    }

    #[tokio::test]
    async fn run_routes_require_a_known_key() -> TestResult {
        let app = app(scraped_state(), AuthState::from_keys("ops:secret"));

        let (status, body) = send(&app, "GET", "/runs", None).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_api_key");

        let (status, body) = send(&app, "GET", "/runs", Some("wrong")).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_api_key");

        let (status, _) = send(&app, "GET", "/runs", Some("secret")).await?;
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn manual_run_reconciles_and_exposes_results() -> TestResult {
        let state = scraped_state();
        let coordinator = state.coordinator.clone();
        let app = app(state, AuthState::default());

        let (status, body) = send(&app, "POST", "/runs", None).await?;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = body["run_id"].as_str().ok_or("run_id missing")?.to_string();
        coordinator.wait_idle().await;

        let (status, run) = send(&app, "GET", &format!("/runs/{run_id}"), None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "completed");
        assert_eq!(run["trigger"], "manual");
        assert_eq!(run["listings_scraped"], 2);
        assert_eq!(run["scans"][0]["productsNew"], 2);
        assert_eq!(run["scans"][0]["batches"], 1);
        assert_eq!(run["stages"][0]["name"], "fetch_listings");
        assert_eq!(run["skipped"].as_array().map(Vec::len), Some(0));

        let (status, seller) = send(&app, "GET", "/sellers/91990", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seller["listings"].as_array().map(Vec::len), Some(2));

        let (_, scans) = send(&app, "GET", "/sellers/91990/scans", None).await?;
        assert_eq!(scans.as_array().map(Vec::len), Some(1));

        let (status, history) = send(&app, "GET", "/listings/p-1/history", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history[0]["changeType"], "CREATED");

        let (status, listing) = send(&app, "GET", "/listings/p-2", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["isActive"], true);
        Ok(())
    }

    #[tokio::test]
    async fn second_start_conflicts_and_stop_cancels() -> TestResult {
        let state = state_with(Arc::new(HeldSource), None);
        let coordinator = state.coordinator.clone();
        let app = app(state, AuthState::default());

        let (status, body) = send(&app, "POST", "/runs", None).await?;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = body["run_id"].clone();

        let (status, body) = send(&app, "POST", "/runs", None).await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "run_in_progress");

        let (_, current) = send(&app, "GET", "/runs/current", None).await?;
        assert_eq!(current["is_running"], true);
        assert_eq!(current["current_run_id"], run_id);

        let (status, body) = send(&app, "DELETE", "/runs/current", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], true);
        coordinator.wait_idle().await;

        let (_, current) = send(&app, "GET", "/runs/current", None).await?;
        assert_eq!(current["is_running"], false);
        let (_, runs) = send(&app, "GET", "/runs", None).await?;
        assert_eq!(runs[0]["status"], "cancelled");

        let (_, body) = send(&app, "DELETE", "/runs/current", None).await?;
        assert_eq!(body["stopped"], false);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_lookups_are_not_found() -> TestResult {
        let app = app(scraped_state(), AuthState::default());

        let (status, _) = send(&app, "GET", "/runs/not-a-uuid", None).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "GET", &format!("/runs/{}", Uuid::new_v4()), None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = send(&app, "GET", "/sellers/000", None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/listings/missing", None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn scoped_run_body_is_validated() -> TestResult {
        let app = app(scraped_state(), AuthState::default());
        let request = Request::builder()
            .method("POST")
            .uri("/runs")
            .header("Content-Type", "application/json")
            .body(Body::from("{\"sellers\": 42}"))?;
        let response = app.oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn metrics_honours_optional_key() -> TestResult {
        let app = app(
            state_with(Arc::new(HeldSource), Some("m-key")),
            AuthState::default(),
        );
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .header("X-Metrics-Key", "m-key")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }
}
