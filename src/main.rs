//! Control-plane worker binary.
//!
//! Runs either as a long-lived worker that picks up pending tenants from the
//! store, or as a one-shot provisioner for a single tenant.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use aegis_control::config::Config;
use aegis_control::orchestrator::build_orchestrator;
use aegis_control::provision::{Pipeline, PortAllocator, ProvisioningService};
use aegis_control::secrets::SecretsManager;
use aegis_control::store::Store;
use aegis_control::store::memory::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "aegis-control", about = "Tenant runtime provisioning worker")]
struct Cli {
    /// Provision a single tenant and exit.
    #[arg(long)]
    provision: Option<Uuid>,

    /// Seconds between scans for pending tenants in worker mode.
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    poll_interval: u64,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = Config::resolve().context("failed to resolve configuration")?;
    info!(backend = config.backend.as_str(), "starting control plane");

    let secrets = Arc::new(SecretsManager::from_config(&config.secrets)?);
    let orchestrator = build_orchestrator(&config, Arc::clone(&secrets))
        .await
        .context("failed to initialize orchestrator backend")?;

    let (store, tenant_store) = build_store().await?;
    store.ensure_schema().await.context("schema setup failed")?;

    let allocator = PortAllocator::new(tenant_store, &config.ports);
    let pipeline = Pipeline::new(
        Arc::clone(&store),
        orchestrator,
        secrets,
        allocator,
        config.clone(),
    );
    let service = ProvisioningService::new(pipeline);

    if let Some(tenant_id) = cli.provision {
        service.run_blocking(tenant_id).await?;
        return Ok(());
    }

    worker_loop(store, service, Duration::from_secs(cli.poll_interval)).await
}

/// Scan for pending tenants and submit them until interrupted.
async fn worker_loop(
    store: Arc<dyn Store>,
    service: ProvisioningService,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store
                    .list_tenants_by_status(aegis_control::store::TenantStatus::Pending)
                    .await
                {
                    Ok(pending) => {
                        for tenant in pending {
                            service.submit(tenant.id);
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to scan for pending tenants"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}

/// Resolve the store backend. PostgreSQL when `DATABASE_URL` is set (and the
/// feature is compiled in), otherwise the in-memory store.
async fn build_store() -> anyhow::Result<(
    Arc<dyn Store>,
    Arc<dyn aegis_control::store::TenantStore>,
)> {
    #[cfg(feature = "postgres")]
    if let Ok(url) = std::env::var("DATABASE_URL")
        && !url.is_empty()
    {
        let store = Arc::new(
            aegis_control::store::postgres::PgStore::connect(&url)
                .context("failed to build postgres pool")?,
        );
        return Ok((store.clone(), store));
    }

    warn!("DATABASE_URL not set; using in-memory store");
    let store = Arc::new(MemoryStore::new());
    Ok((store.clone(), store))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aegis_control=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
