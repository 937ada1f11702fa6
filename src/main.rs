//! PYRAX status - service monitoring and incident notification pipeline.
//!
//! Probes services on a schedule, keeps an incident lifecycle per service and
//! fans incident alerts out to email subscribers and a chat webhook, all
//! through a shared job queue.

mod config;
mod context;
mod db;
mod notify;
mod probe;
mod queue;
mod scheduler;
mod web;
mod workers;

use config::Config;
use context::AppContext;
use probe::HttpProbe;
use queue::Worker;
use scheduler::{default_schedules, Scheduler};
use web::Server;
use workers::{CleanupWorker, EmailWorker, IncidentWorker, MetricsWorker, StatusOptions, StatusWorker};

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pyrax_status=info".parse()?))
        .init();

    let cfg = Config::load();
    tracing::info!("Starting PYRAX status on port {}...", cfg.http_port);

    let ctx = AppContext::open(cfg).await?;
    let (stop_tx, _) = broadcast::channel::<()>(1);

    let scheduler = Scheduler::bootstrap(
        ctx.queue.clone(),
        &default_schedules(ctx.config.check_retention_days)?,
    )
    .await?;

    let probe = Arc::new(HttpProbe::new()?);
    let status = StatusWorker::new(
        ctx.store.clone(),
        ctx.queue.clone(),
        probe,
        StatusOptions {
            escalate_severity: ctx.config.escalate_severity,
            skip_overlapping: ctx.config.skip_overlapping,
        },
    );
    let incidents = IncidentWorker::new(
        ctx.store.clone(),
        ctx.queue.clone(),
        ctx.webhook_client(),
        ctx.config.site_url.clone(),
    );

    let mut handles = vec![
        scheduler.start(stop_tx.subscribe()),
        Worker::new(ctx.queue.clone(), Arc::new(status), ctx.config.status_concurrency)
            .spawn(stop_tx.subscribe()),
        Worker::new(ctx.queue.clone(), Arc::new(incidents), ctx.config.incident_concurrency)
            .spawn(stop_tx.subscribe()),
        Worker::new(
            ctx.queue.clone(),
            Arc::new(EmailWorker::new(ctx.email_client())),
            ctx.config.email_concurrency,
        )
        .spawn(stop_tx.subscribe()),
        Worker::new(ctx.queue.clone(), Arc::new(MetricsWorker::new(ctx.store.clone())), 1)
            .spawn(stop_tx.subscribe()),
        Worker::new(ctx.queue.clone(), Arc::new(CleanupWorker::new(ctx.store.clone())), 1)
            .spawn(stop_tx.subscribe()),
    ];
    tracing::info!("Workers started");

    let server = Server::new(ctx.config.http_port, ctx.store.clone(), ctx.queue.clone());
    let server_stop = stop_tx.subscribe();
    handles.push(tokio::spawn(async move {
        if let Err(e) = server.start(server_stop).await {
            tracing::error!("Operator API failed: {}", e);
        }
    }));

    shutdown_signal().await;
    tracing::info!("Shutdown requested, waiting for in-flight jobs...");
    let _ = stop_tx.send(());

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Task ended abnormally: {}", e);
        }
    }

    ctx.close().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
