use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use lunaclass::{
    auth::jwt::JwtService,
    config::AppConfig,
    db,
    processor::{
        ContentGenerator, DocumentProcessor, HttpContentGenerator, HttpDocumentProcessor,
        UnconfiguredCollaborator,
    },
    realtime::ChangeFeed,
    routes::create_router,
    s3::build_s3_client,
    state::AppState,
    storage::S3Storage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        bucket_prefix = %config.bucket_prefix,
        processor_configured = config.processor_endpoint.is_some(),
        generator_configured = config.generator_endpoint.is_some(),
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let s3_client = build_s3_client(&config).await?;
    let storage = Arc::new(S3Storage::new(s3_client));
    let jwt = JwtService::from_config(&config)?;

    let http = reqwest::Client::new();
    let processor: Arc<dyn DocumentProcessor> = match config.processor_endpoint.as_ref() {
        Some(endpoint) => Arc::new(HttpDocumentProcessor::new(http.clone(), endpoint.clone())),
        None => Arc::new(UnconfiguredCollaborator::new("processor")),
    };
    let generator: Arc<dyn ContentGenerator> = match config.generator_endpoint.as_ref() {
        Some(endpoint) => Arc::new(HttpContentGenerator::new(http, endpoint.clone())),
        None => Arc::new(UnconfiguredCollaborator::new("generator")),
    };

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(
        pool,
        config,
        storage,
        processor,
        generator,
        ChangeFeed::default(),
        jwt,
    );
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("received shutdown signal");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
