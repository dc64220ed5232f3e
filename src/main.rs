mod config;

use anyhow::Context;
use clap::Parser as _;
use config::Config;
use queuekeeper::{
    AppState,
    availability::AvailabilityTracker,
    build_metrics_layer_and_handle, build_metrics_router, build_router,
    client::create_hyper_client,
    clock::system_clock,
    failover::FailoverDecider,
    gateway::GatewayFile,
    model_queue::LanguageModelQueue,
    provider::HttpModelClient,
    queue_manager::QueueManager,
    queue_router::QueueRouter,
    store::{KeySpace, MemoryBackend, QueueBackend},
    traits::{MetricsSink, ModelClient, NoOpMetrics, PrometheusMetrics},
    worker::RetryQueueWorker,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Wait for background tasks, logging any that panicked or were aborted. Returns how many did.
async fn join_background(
    tasks: impl IntoIterator<Item = (&'static str, JoinHandle<()>)>,
) -> usize {
    let mut failed = 0;
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task failed");
            failed += 1;
        }
    }
    failed
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    info!("Received Ctrl+C, shutting down");
    shutdown.cancel();
}

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting queuekeeper with config: {:?}", config);

    let gateway = GatewayFile::from_file(&config.config).await?;

    let clock = system_clock();
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let keys = KeySpace::new(config.key_prefix.clone());

    let metrics_handle = config
        .metrics
        .then(|| build_metrics_layer_and_handle(config.metrics_prefix.clone()));
    let metrics: Arc<dyn MetricsSink> = if config.metrics {
        Arc::new(PrometheusMetrics::new(config.metrics_prefix.clone()))
    } else {
        Arc::new(NoOpMetrics)
    };

    let providers: Arc<dyn ModelClient> = Arc::new(HttpModelClient::new(
        create_hyper_client(config.pool()),
        gateway.providers.clone(),
    ));

    let mut router = QueueRouter::new(providers.clone());
    for settings in &gateway.queues {
        let queue = LanguageModelQueue::builder()
            .config(settings.queue_config())
            .client(providers.clone())
            .backend(backend.clone())
            .keys(keys.clone())
            .clock(clock.clone())
            .metrics(metrics.clone())
            .build();
        info!(model = %queue.model(), "Admission queue configured");
        router = router.with_queue(queue);
    }
    let router = Arc::new(router);

    let availability = Arc::new(AvailabilityTracker::with_floor(
        clock.clone(),
        gateway.retry.min_disable(),
    ));
    let queues = QueueManager::new(backend.clone(), keys)
        .with_max_generation(gateway.retry.max_generation);
    let decider = FailoverDecider::new(
        availability.clone(),
        queues.clone(),
        clock.clone(),
        gateway.retry.retry_delay(),
    );

    let shutdown = CancellationToken::new();
    let schedulers: Vec<_> = router.queues().map(LanguageModelQueue::start).collect();

    let worker = RetryQueueWorker::new(
        router.clone(),
        queues,
        availability,
        metrics.clone(),
        clock,
        gateway.worker_config(),
    );
    let worker_shutdown = shutdown.child_token();
    let worker_task = tokio::spawn(async move {
        if let Err(e) = worker.run(worker_shutdown).await {
            error!(error = %e, "Retry queue worker exited");
        }
    });

    let state = AppState::new(
        router.clone(),
        decider,
        Arc::new(gateway.classifier()),
        metrics,
        gateway.failover.clone(),
    );
    let mut app = build_router(state);

    if let Some((layer, handle)) = metrics_handle {
        app = app.layer(layer);
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics port {metrics_addr}"))?;
        info!("Metrics listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!("queuekeeper listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    for queue in router.queues() {
        match queue.dispose().await {
            Ok(dropped) => info!(model = %queue.model(), dropped, "Queue disposed"),
            Err(e) => error!(model = %queue.model(), error = %e, "Failed to dispose queue"),
        }
    }
    let tasks = schedulers
        .into_iter()
        .map(|handle| ("queue scheduler", handle))
        .chain([("retry queue worker", worker_task)]);
    join_background(tasks).await;

    Ok(())
}
