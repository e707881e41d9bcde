use anyhow::{Context, Result};
use keel_client::WorkerClient;
use keel_core::domain::template::PipelineTemplate;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod guard;
pub mod handler;
pub mod repository;
pub mod scheduler;
pub mod selector;
pub mod service;

use config::{Config, StoreKind};
use context::SchedulerContext;
use guard::{GuardConfig, Guards, MarkerStore, MemoryMarkerStore, PgMarkerStore};
use handler::{
    DockerHandler, EcsHandler, HandlerRegistry, K8sHandler, StandardHandler, docker::DockerConfig,
    ecs::{AwsCliEcs, EcsConfig},
    k8s::HttpKubeApi,
};
use repository::{MemoryStore, PgStore, Store};
use scheduler::Dispatcher;

/// Timeout for calls to the ECS and Kubernetes control planes
const BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keel master...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let (store, markers) = open_store(&config).await?;
    let guards = Guards::new(
        markers,
        GuardConfig {
            ttl: config.marker_ttl,
            ..GuardConfig::default()
        },
    );

    let handlers = build_handlers(&config, store.clone())?;

    let ctx = Arc::new(
        SchedulerContext::new(config, store, guards, handlers)
            .await
            .context("Failed to load status catalog")?,
    );

    // Start the dispatch loop
    let dispatcher = Dispatcher::new(ctx.clone());
    tokio::spawn(async move {
        dispatcher.run().await;
    });

    // Build router with all API endpoints
    let addr = ctx.config.bind_addr.clone();
    let app = api::create_router(ctx);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}

async fn open_store(config: &Config) -> Result<(Arc<dyn Store>, Arc<dyn MarkerStore>)> {
    match config.store {
        StoreKind::Postgres => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(&config.database_url)
                .await
                .context("Failed to create database pool")?;

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            tracing::info!("Database ready");
            Ok((
                Arc::new(PgStore::new(pool.clone())),
                Arc::new(PgMarkerStore::new(pool)),
            ))
        }
        StoreKind::Memory => {
            let templates = match &config.templates_file {
                Some(path) => load_templates(path)?,
                None => vec![],
            };
            tracing::warn!(
                "Using in-memory store with {} template(s); state is lost on exit",
                templates.len()
            );
            Ok((
                Arc::new(MemoryStore::with_templates(templates)),
                Arc::new(MemoryMarkerStore::new()),
            ))
        }
    }
}

fn load_templates(path: &Path) -> Result<Vec<PipelineTemplate>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read templates from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse templates in {}", path.display()))
}

/// Registers the configured backends in routing order
fn build_handlers(config: &Config, store: Arc<dyn Store>) -> Result<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();

    if let Some(kube) = &config.kube {
        let token_file = kube.token_file.as_deref().filter(|p| p.exists());
        let api = HttpKubeApi::new(
            kube.api_url.clone(),
            kube.namespace.clone(),
            token_file,
            BACKEND_TIMEOUT,
        )
        .context("Failed to set up Kubernetes client")?;

        handlers = handlers.register(Arc::new(K8sHandler::new(
            store.clone(),
            Arc::new(api),
            kube.template_dir.clone(),
            config.master_url.clone(),
        )));
    }

    if let Some(path) = &config.ecs_config {
        let ecs = EcsConfig::load(path).context("Failed to load ECS configuration")?;
        handlers = handlers.register(Arc::new(EcsHandler::new(
            store.clone(),
            Arc::new(AwsCliEcs::new(BACKEND_TIMEOUT)),
            ecs,
            config.master_url.clone(),
        )));
    }

    if let Some(path) = &config.docker_config {
        let docker = DockerConfig::load(path).context("Failed to load Docker configuration")?;
        handlers = handlers.register(Arc::new(DockerHandler::new(
            store.clone(),
            docker,
            config.master_url.clone(),
        )));
    }

    let client =
        WorkerClient::new(config.worker_timeout).context("Failed to create worker client")?;
    handlers = handlers.register(Arc::new(StandardHandler::new(
        store,
        Arc::new(client),
        config.probe_concurrency,
    )));

    Ok(handlers)
}
