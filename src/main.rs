use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use speed_to_lead::config::Config;
use speed_to_lead::context::{ContextAssembler, DbResourceLibrary, StageTemplates};
use speed_to_lead::drafts::{DraftGenerator, HttpReviewSurface, LogReviewSurface, ReviewSurface};
use speed_to_lead::llm::create_provider;
use speed_to_lead::pipeline::PipelineCoordinator;
use speed_to_lead::server::{AppState, router};
use speed_to_lead::stage::StageClassifier;
use speed_to_lead::store::{Database, LibSqlBackend};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    // Stdout always; a daily rolling file when STL_LOG_DIR is set.
    let (file_layer, _log_guard) = match &config.server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "speed-to-lead.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "speed-to-lead starting");

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    info!(path = %config.db_path.display(), "Database ready");

    // ── LLM + pipeline ───────────────────────────────────────────────────
    let llm = create_provider(&config.llm).context("creating LLM provider")?;
    info!(model = %llm.model_name(), "LLM provider ready");

    let review: Arc<dyn ReviewSurface> = match &config.server.review_webhook_url {
        Some(url) => Arc::new(HttpReviewSurface::new(url.clone()).context("building review client")?),
        None => {
            warn!("STL_REVIEW_WEBHOOK_URL not set; drafts are only logged");
            Arc::new(LogReviewSurface)
        }
    };

    let pipeline = Arc::new(PipelineCoordinator::new(
        db.clone(),
        StageClassifier::new(llm.clone(), config.classifier.clone()),
        ContextAssembler::new(Arc::new(StageTemplates::builtin()), config.assembler.clone()),
        Arc::new(DbResourceLibrary::new(db.clone())),
        DraftGenerator::new(llm),
        review,
        config.pipeline.clone(),
    ));

    if config.server.admin_secret.is_none() {
        warn!("STL_ADMIN_SECRET not set; admin and review routes are disabled");
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    let state = AppState::new(pipeline, config.server.admin_secret.clone());
    let tasks = state.tasks.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("server error")?;

    // Webhook work accepted before shutdown still runs to completion.
    tasks.close();
    info!(in_flight = tasks.len(), "Draining webhook tasks");
    if tokio::time::timeout(SHUTDOWN_DRAIN, tasks.wait()).await.is_err() {
        warn!(abandoned = tasks.len(), "Drain timed out");
    }
    Ok(())
}
