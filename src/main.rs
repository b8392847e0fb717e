use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;

use setter_ai::admin::admin_routes;
use setter_ai::config::ServiceConfig;
use setter_ai::dispatch::{GraphApiDispatcher, ReplyDispatcher};
use setter_ai::llm::GenerationBackend;
use setter_ai::queue::JobQueue;
use setter_ai::store::{Database, LibSqlBackend};
use setter_ai::webhook::{WebhookGateway, webhook_routes};
use setter_ai::worker::{ConversationWorker, QualificationSchedule, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    eprintln!("📨 Setter AI v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://{}/webhooks/meta", config.bind_addr);
    eprintln!("   Admin API: http://{}/api", config.bind_addr);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Queue + generation + dispatch ────────────────────────────────────
    let queue = JobQueue::new(Arc::clone(&db), config.retry.clone(), config.worker.lease);

    let generation = GenerationBackend::from_config(config.llm.as_ref())
        .context("failed to create generation backend")?;
    match &config.llm {
        Some(llm) => eprintln!("   Model: {}", llm.model),
        None => {
            tracing::warn!("ANTHROPIC_API_KEY not set, inbound messages will be skipped unanswered");
            eprintln!("   Model: (unconfigured)");
        }
    }

    let dispatcher: Arc<dyn ReplyDispatcher> = Arc::new(
        GraphApiDispatcher::new(config.dispatch.clone()).context("failed to create dispatcher")?,
    );

    // ── Workers ──────────────────────────────────────────────────────────
    let worker = Arc::new(ConversationWorker::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        generation,
        dispatcher,
        QualificationSchedule {
            threshold: config.worker.qualify_threshold,
            every: config.worker.requalify_every,
        },
    ));
    let pool = WorkerPool::spawn(
        worker,
        Arc::clone(&queue),
        config.worker.concurrency,
        config.worker.poll_interval,
    );
    eprintln!("   Workers: {}", config.worker.concurrency);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let gateway = Arc::new(WebhookGateway::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        config.webhook.verify_token.clone(),
        config.webhook.app_secret.clone(),
    ));
    let app = webhook_routes(gateway)
        .merge(admin_routes(Arc::clone(&db), Arc::clone(&queue)))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    pool.shutdown().await;
    Ok(())
}
