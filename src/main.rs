use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use osservatorio_api::analytics_db::AnalyticsDb;
use osservatorio_api::config::AppConfig;
use osservatorio_api::export::Exporter;
use osservatorio_api::istat_client::IstatSdmxClient;
use osservatorio_api::metadata_db::MetadataDb;
use osservatorio_api::pipeline::IngestionPipeline;
use osservatorio_api::powerbi::bridge::MetadataBridge;
use osservatorio_api::powerbi::incremental::IncrementalRefreshManager;
use osservatorio_api::powerbi::optimizer::PowerBiOptimizer;
use osservatorio_api::powerbi::templates::TemplateGenerator;
use osservatorio_api::repository::UnifiedRepository;
use osservatorio_api::{AppState, auth, handlers, maintenance};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("osservatorio_api=debug,tower_http=debug")
        }))
        .init();

    let config_path = std::env::var("OSSERVATORIO_CONFIG")
        .unwrap_or_else(|_| "osservatorio.toml".to_string());
    let config = AppConfig::load(&config_path)?;

    let metadata = MetadataDb::open(&config.storage.sqlite_path)?;
    let analytics = AnalyticsDb::open(&config.storage.duckdb_path)?;
    tracing::info!(
        "stores opened: sqlite={} duckdb={}",
        config.storage.sqlite_path,
        config.storage.duckdb_path
    );
    let repo = Arc::new(UnifiedRepository::new(metadata, analytics));

    let istat_client = Arc::new(IstatSdmxClient::new(
        &config.istat.base_url,
        config.istat.timeout_secs,
    )?);
    let pipeline = Arc::new(IngestionPipeline::new(
        istat_client,
        repo.clone(),
        config.ingestion.clone(),
        config.istat_min_request_interval(),
    ));
    let exporter = Arc::new(Exporter::new(
        config.export.chunk_size,
        config.export.streaming_threshold,
    ));
    let optimizer = Arc::new(PowerBiOptimizer::new(repo.clone()));
    let refresh_manager = Arc::new(IncrementalRefreshManager::new(repo.clone(), None));
    let template_generator = Arc::new(TemplateGenerator::new(
        repo.clone(),
        optimizer.clone(),
        &config.powerbi.templates_dir,
    ));
    let bridge = Arc::new(MetadataBridge::new(repo.clone(), None));

    // Background engines
    maintenance::spawn_audit_retention(repo.clone(), config.maintenance.clone());
    maintenance::spawn_refresh_scheduler(
        refresh_manager.clone(),
        repo.clone(),
        config.maintenance.interval_secs,
    );

    let state = AppState {
        repo,
        pipeline,
        exporter,
        optimizer,
        refresh_manager,
        template_generator,
        bridge,
        rate_limiter: Arc::new(auth::RateLimiter::new()),
    };

    // Mutating routes sit behind the bearer-credential guard.
    let protected = Router::new()
        .route(
            "/api/datasets/register",
            post(handlers::datasets::register_dataset),
        )
        .route(
            "/api/datasets/{id}/deactivate",
            post(handlers::datasets::deactivate_dataset),
        )
        .route("/api/ingestion/run", post(handlers::ingestion::run_batch))
        .route(
            "/api/ingestion/run/{id}",
            post(handlers::ingestion::run_single),
        )
        .route("/api/ingestion/cancel", post(handlers::ingestion::cancel))
        .route(
            "/api/powerbi/{id}/refresh-policy",
            get(handlers::powerbi::get_refresh_policy)
                .post(handlers::powerbi::create_refresh_policy),
        )
        .route(
            "/api/powerbi/{id}/refresh",
            post(handlers::powerbi::execute_refresh),
        )
        .route(
            "/api/powerbi/{id}/template",
            post(handlers::powerbi::generate_template),
        )
        .route(
            "/api/powerbi/{id}/lineage",
            post(handlers::powerbi::create_lineage),
        )
        .route(
            "/api/powerbi/{id}/quality",
            post(handlers::powerbi::propagate_quality),
        )
        .route(
            "/api/powerbi/{id}/usage-sync",
            post(handlers::powerbi::sync_usage),
        )
        .route(
            "/api/credentials",
            get(handlers::credentials::list_credentials)
                .post(handlers::credentials::create_credential),
        )
        .route(
            "/api/credentials/{service}",
            delete(handlers::credentials::revoke_credential),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let app = Router::new()
        // Dataset registry
        .route("/api/datasets", get(handlers::datasets::list_datasets))
        .route(
            "/api/datasets/stats/summary",
            get(handlers::datasets::dataset_summary),
        )
        .route("/api/datasets/{id}", get(handlers::datasets::get_dataset))
        // Export API
        .route(
            "/api/datasets/{id}/export",
            get(handlers::export::export_dataset),
        )
        .route(
            "/api/datasets/{id}/export/info",
            get(handlers::export::export_info),
        )
        .route(
            "/api/datasets/export/formats",
            get(handlers::export::export_formats),
        )
        // Ingestion status
        .route("/api/ingestion/status", get(handlers::ingestion::status))
        // PowerBI read surface
        .route(
            "/api/powerbi/{id}/star-schema",
            get(handlers::powerbi::star_schema),
        )
        .route("/api/powerbi/{id}/measures", get(handlers::powerbi::measures))
        .route(
            "/api/powerbi/{id}/performance",
            get(handlers::powerbi::performance),
        )
        .route(
            "/api/powerbi/{id}/refresh-status",
            get(handlers::powerbi::refresh_status),
        )
        .route(
            "/api/powerbi/governance",
            get(handlers::powerbi::governance_report),
        )
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("osservatorio-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
