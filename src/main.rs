use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use repo_mirror::bus::{EventBus, InProcessBus, NatsBus};
use repo_mirror::config::{BusMode, Config};
use repo_mirror::github::{LinkedAccountCredentials, OctocrabClient, RateLimiter};
use repo_mirror::ingest::{WebhookIngestor, consume, consume_stream};
use repo_mirror::server::{AppState, build_router};
use repo_mirror::store::Store;
use repo_mirror::webhooks::SUBJECT_WEBHOOK_RECEIVED;
use repo_mirror::worker::{JobRunner, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "repo_mirror=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("reading configuration")?;
    if config.mode.serves_http() {
        if config.webhook_secret.is_none() {
            warn!("GITHUB_WEBHOOK_SECRET not set; /webhook will answer 503");
        }
        if config.api_token.is_none() {
            warn!("SYNC_API_TOKEN not set; the jobs API will answer 503");
        }
    }

    let store = Store::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let shutdown = CancellationToken::new();
    // Stopped only after detached publishes are drained.
    let consumer_shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));
    info!(mode = ?config.mode, bus = ?config.bus, "starting");

    let mut consumer = None;
    let mut nats = None;
    let bus: Option<Arc<dyn EventBus>> = match config.bus {
        BusMode::Inline => None,
        BusMode::InProcess => {
            let bus = Arc::new(InProcessBus::default());
            let rx = bus.subscribe(SUBJECT_WEBHOOK_RECEIVED);
            consumer = Some(tokio::spawn(consume(
                rx,
                WebhookIngestor::new(store.clone()),
                consumer_shutdown.clone(),
            )));
            Some(bus as Arc<dyn EventBus>)
        }
        BusMode::Nats => {
            let url = config.nats_url.as_deref().context("NATS_URL not set")?;
            let bus = Arc::new(NatsBus::connect(url).await?);
            if config.mode.runs_workers() {
                let messages = bus
                    .queue_subscribe(SUBJECT_WEBHOOK_RECEIVED, &config.nats_queue_group)
                    .await?;
                info!(group = %config.nats_queue_group, "consuming webhooks from NATS");
                consumer = Some(tokio::spawn(consume_stream(
                    messages,
                    WebhookIngestor::new(store.clone()),
                    consumer_shutdown.clone(),
                )));
            }
            nats = Some(bus.clone());
            Some(bus as Arc<dyn EventBus>)
        }
    };

    let pool = config.mode.runs_workers().then(|| {
        let runner = JobRunner::new(
            store.clone(),
            Arc::new(OctocrabClient::new(config.github_base_url.clone())),
            Arc::new(LinkedAccountCredentials::new(store.clone())),
            Arc::new(RateLimiter::new(
                config.rate_limit_interval,
                config.rate_limit_burst,
            )),
        );
        WorkerPool::spawn(
            &config.worker_id,
            config.worker_count,
            runner,
            config.poll.clone(),
            shutdown.clone(),
        )
    });

    if config.mode.serves_http() {
        let app_state = AppState::new(
            store,
            config.webhook_secret.clone(),
            config.api_token.clone(),
            bus,
        );
        let app = build_router(app_state.clone());

        let listener = tokio::net::TcpListener::bind(config.http_addr)
            .await
            .with_context(|| format!("binding {}", config.http_addr))?;
        info!("listening on {}", config.http_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .context("serving HTTP")?;

        info!("draining in-flight work");
        app_state.drain_detached().await;
    } else {
        shutdown.cancelled().await;
        info!("draining in-flight work");
    }

    if let Some(nats) = nats
        && let Err(e) = nats.flush().await
    {
        warn!(error = %e, "flushing NATS publishes failed");
    }
    consumer_shutdown.cancel();
    if let Some(pool) = pool {
        pool.join().await;
    }
    if let Some(consumer) = consumer
        && let Err(e) = consumer.await
    {
        warn!(error = %e, "webhook consumer panicked");
    }
    info!("shutdown complete");
    Ok(())
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
    shutdown.cancel();
}
