//! Crypto news service entrypoint.
//! Boots the fetch scheduler, the translation worker and the Axum API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;

use cryptosignal_news::{
    api::{self, AppState},
    config::AppConfig,
    ingest::{
        feed::{ArticleOptions, FeedFetcher, HttpFeedRetriever},
        scheduler::Scheduler,
        FetchOrchestrator,
    },
    init_tracing,
    metrics::Metrics,
    ratelimit::{
        store::{spawn_sweeper, CounterStore, MemoryCounterStore},
        RateLimiter,
    },
    sources::SourceRegistry,
    storage::{MemoryStorage, Storage},
    translate::{
        groq::GroqTranslator,
        worker::{TranslationWorker, WorkerHandle},
    },
};

const SWEEP_EVERY: Duration = Duration::from_secs(60);

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_env().context("loading configuration")?;
    let registry = SourceRegistry::load_or_seed(&cfg.sources_path)?;
    tracing::info!(sources = registry.len(), "source registry loaded");

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::from_registry(&registry));
    let shutdown = CancellationToken::new();

    // --- Fetch pipeline ---
    let retriever = HttpFeedRetriever::new().context("building feed http client")?;
    let target_language = cfg
        .translation
        .enabled()
        .then(|| cfg.translation.target_language.clone());
    let fetcher = FeedFetcher::new(
        Arc::new(retriever),
        cfg.fetch.timeout,
        ArticleOptions {
            max_age: cfg.fetch.max_age,
            target_language,
        },
    );
    let orchestrator = Arc::new(FetchOrchestrator::new(
        Arc::clone(&storage),
        Arc::new(fetcher),
        cfg.fetch.workers,
        cfg.fetch.timeout,
    ));
    let scheduler = Arc::new(Scheduler::new(orchestrator, cfg.fetch.interval));
    {
        let scheduler = Arc::clone(&scheduler);
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.start(&token).await });
    }

    // --- Translation ---
    let mut translation_handle = None;
    let translator = match cfg.translation.api_key.as_deref() {
        Some(key) if cfg.translation.enabled() => {
            let groq = GroqTranslator::new(
                key,
                Some(cfg.translation.model.as_str()),
                &cfg.translation.target_language,
            )
            .context("building translation client")?;
            let worker = Arc::new(TranslationWorker::new(
                Arc::clone(&storage),
                Arc::new(groq),
                cfg.translation.interval,
                cfg.translation.batch_size,
            ));
            translation_handle = Some(Arc::clone(&worker).spawn(&shutdown));
            Some(worker)
        }
        _ => {
            tracing::info!("GROQ_API_KEY not set, translation disabled");
            None
        }
    };

    // --- Rate limiting ---
    let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    spawn_sweeper(Arc::clone(&counters), SWEEP_EVERY, shutdown.clone());
    let limiter = Arc::new(RateLimiter::new(counters, cfg.rate_limit.clone()));

    let metrics = Metrics::init()?;

    spawn_shutdown_watcher(shutdown, Arc::clone(&scheduler), translation_handle);

    let state = AppState {
        storage,
        limiter,
        scheduler: Some(scheduler),
        translator,
    };
    let router = api::router(state).merge(metrics.router());

    Ok(router.into())
}

/// On SIGINT or SIGTERM, cancel the background loops and wait for them.
fn spawn_shutdown_watcher(
    shutdown: CancellationToken,
    scheduler: Arc<Scheduler>,
    translation: Option<WorkerHandle>,
) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, stopping background tasks");
        shutdown.cancel();
        scheduler.stop().await;
        if let Some(handle) = translation {
            handle.stop().await;
        }
        tracing::info!("background tasks stopped");
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
