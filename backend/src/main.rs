use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod channels;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};

#[cfg(test)]
mod tests;

use channels::{ChannelRouter, SmtpSender, TwilioSender};
use workflows::{
    ActionDispatcher, ActionScheduler, PgWorkflowStore, StoredRuleEvaluator, WorkflowEngine,
    WorkflowStore, WorkerPool,
};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub store: Arc<dyn WorkflowStore>,
    pub engine: Arc<WorkflowEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    // Channel collaborators: email over SMTP, WhatsApp/SMS over Twilio.
    let email = if config.smtp.is_configured() {
        match SmtpSender::new(&config.smtp) {
            Ok(sender) => Some(sender),
            Err(e) => {
                tracing::warn!("SMTP channel disabled: {}", e);
                None
            }
        }
    } else {
        tracing::warn!("SMTP not configured, email channel disabled");
        None
    };

    let twilio = config
        .twilio
        .as_ref()
        .filter(|t| t.is_configured())
        .map(|t| TwilioSender::new(t, &config.engine.default_phone_prefix));
    if twilio.is_none() {
        tracing::warn!("Twilio not configured, WhatsApp/SMS channels disabled");
    }

    let sender = Arc::new(ChannelRouter::new(email, twilio));

    // Workflow engine wiring: store, dispatcher, per-execution scheduler,
    // worker pool, then the engine facade on top.
    let store: Arc<dyn WorkflowStore> = Arc::new(PgWorkflowStore::new(db_pool.clone()));
    let evaluator = Arc::new(StoredRuleEvaluator::new(store.clone()));
    let dispatcher = ActionDispatcher::new(store.clone(), sender);
    let scheduler = Arc::new(ActionScheduler::new(store.clone(), dispatcher));
    let worker_pool = WorkerPool::start(
        scheduler,
        config.engine.worker_count,
        config.engine.queue_capacity,
    );

    let engine = Arc::new(WorkflowEngine::new(
        store.clone(),
        evaluator,
        worker_pool.handle(),
        config.engine.sweep_batch_size,
    ));

    let mut job_scheduler =
        jobs::JobScheduler::new(engine.clone(), config.engine.sweep_interval_minutes).await?;
    job_scheduler.start().await?;

    let app_state = Arc::new(AppState {
        db_pool,
        store,
        engine,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Nurture Lead Automation API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in-flight executions before exiting; interrupted ones are
    // recovered by the pending sweep on the next start.
    job_scheduler.shutdown().await?;
    worker_pool.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
