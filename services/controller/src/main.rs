//! Classification controller.
//!
//! Reconciles every stored declaration against the member fleet and serves
//! health endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleetclass_controller::{
    api,
    config::Config,
    controller::{ClassifierReconciler, ReconcileWorker},
    db::Database,
    fleet::{HttpMemberClient, MemberCatalog, MemberClient},
    state::AppState,
    store::DeclarationStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEETCLASS_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting classifier controller");
    info!(
        health_addr = %config.health_addr,
        resync_secs = config.resync_interval.as_secs(),
        agent_namespace = %config.agent_namespace,
        "Configuration loaded"
    );

    let db = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let store: Arc<dyn DeclarationStore> = Arc::new(db.declaration_store());
    let catalog: Arc<dyn MemberCatalog> = Arc::new(db.member_catalog());
    let client: Arc<dyn MemberClient> = Arc::new(HttpMemberClient::new(config.member_timeout)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(ClassifierReconciler::new(
        Arc::clone(&store),
        Arc::clone(&catalog),
        client,
        config.reconciler(),
    ));
    let worker = ReconcileWorker::new(reconciler, Arc::clone(&store), config.worker());
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(store, catalog));
    let listener = tokio::net::TcpListener::bind(&config.health_addr).await?;
    info!(addr = %config.health_addr, "Serving health endpoints");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("Health server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Health server exited"),
                Ok(Err(e)) => error!(error = %e, "Health server error"),
                Err(e) => error!(error = %e, "Health server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight reconciliations");
    let shutdown_timeout = config.attempt_deadline + Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    info!("Classifier controller shutdown complete");
    Ok(())
}
