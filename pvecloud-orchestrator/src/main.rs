use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, response::Json, routing::get, Router};
use pvecloud_orchestrator::metadata::HttpMetadataService;
use pvecloud_orchestrator::store::PgRecordStore;
use pvecloud_orchestrator::{watch_dog_job, LifecycleOrchestrator, Settings};
use pvecloud_providers::proxmox::ProxmoxProvider;
use pvecloud_providers::Hypervisor;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    orchestrator: LifecycleOrchestrator,
    hypervisor: Arc<dyn Hypervisor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    info!("🚀 pvecloud orchestrator starting (proxmox {})", settings.proxmox_endpoint);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let proxmox = ProxmoxProvider::new(
        &settings.proxmox_endpoint,
        &settings.proxmox_token,
        settings.proxmox_timeout,
    )
    .context("Failed to build Proxmox client")?;

    // Fail fast: an unreachable cluster must not surface later as per-request errors.
    let nodes = proxmox
        .list_nodes()
        .await
        .context("Proxmox API unreachable at startup")?;
    info!("✅ Proxmox reachable, {} node(s) in cluster", nodes.len());

    let store = Arc::new(PgRecordStore::new(pool));
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(proxmox);
    let metadata = Arc::new(
        HttpMetadataService::new(&settings.metadata_server, settings.proxmox_timeout)
            .context("Failed to build metadata client")?,
    );
    let orchestrator =
        LifecycleOrchestrator::new(settings.lifecycle(), hypervisor.clone(), store, metadata);

    tokio::spawn(watch_dog_job::run(
        orchestrator.reconciler().clone(),
        settings.watch_dog_interval,
        orchestrator.cancellation(),
    ));

    let app = Router::new()
        .route("/", get(root))
        .route("/admin/status", get(status))
        .with_state(AppState {
            orchestrator: orchestrator.clone(),
            hypervisor,
        });

    info!("Admin endpoint listening on {}", settings.admin_addr);
    let listener = tokio::net::TcpListener::bind(settings.admin_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for ctrl-c: {}", e);
            }
            info!("🛑 shutting down");
            orchestrator.shutdown_background();
        })
        .await?;

    Ok(())
}

async fn root() -> &'static str {
    "pvecloud orchestrator running"
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (instances, nodes) = tokio::join!(
        state.orchestrator.instance_identifiers(),
        state.hypervisor.list_nodes()
    );
    Json(json!({
        "managed_instances": instances.as_ref().map(|ids| ids.len()).ok(),
        "nodes": nodes.as_ref().map(|n| n.len()).ok(),
        "hypervisor_reachable": nodes.is_ok(),
    }))
}
