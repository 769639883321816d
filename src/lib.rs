pub mod analytics_db;
pub mod auth;
pub mod categorization;
pub mod config;
pub mod export;
pub mod handlers;
pub mod istat_client;
pub mod maintenance;
pub mod metadata_db;
pub mod models;
pub mod pipeline;
pub mod powerbi;
pub mod repository;
pub mod sdmx;

use std::sync::Arc;

use auth::RateLimiter;
use export::Exporter;
use pipeline::IngestionPipeline;
use powerbi::bridge::MetadataBridge;
use powerbi::incremental::IncrementalRefreshManager;
use powerbi::optimizer::PowerBiOptimizer;
use powerbi::templates::TemplateGenerator;
use repository::UnifiedRepository;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<UnifiedRepository>,
    pub pipeline: Arc<IngestionPipeline>,
    pub exporter: Arc<Exporter>,
    pub optimizer: Arc<PowerBiOptimizer>,
    pub refresh_manager: Arc<IncrementalRefreshManager>,
    pub template_generator: Arc<TemplateGenerator>,
    pub bridge: Arc<MetadataBridge>,
    pub rate_limiter: Arc<RateLimiter>,
}
