//! Reminder scheduler service.
//!
//! Runs the outbox publisher, the reminder request consumer, the job worker
//! and the health routes until SIGINT or SIGTERM.

use relay_core::event_bus::EventBus;
use relay_postgres::PostgresStore;
use relay_redpanda::RedpandaEventBus;
use relay_runtime::metrics::MetricsServer;
use relay_runtime::{EventConsumer, FixedBackoff, JobWorker, OutboxPublisher};
use relay_web::{Readiness, ReadinessCheck, health_routes};
use reminder_scheduler::{Config, ReminderJobHandler, ReminderRequestHandler};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reminder_scheduler=info,relay_runtime=info".into()),
        )
        .with(config.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    info!(
        kafka_brokers = config.kafka_brokers.as_deref().unwrap_or("<disabled>"),
        consume_topic = %config.kafka_consume_topic,
        "Starting reminder scheduler"
    );

    let _metrics = match config.metrics_addr {
        Some(addr) => {
            let mut server = MetricsServer::new(addr);
            server.start()?;
            info!(%addr, "Metrics exporter listening");
            Some(server)
        }
        None => None,
    };

    info!("Connecting to database...");
    let store =
        Arc::new(PostgresStore::connect(&config.database_url, config.database_max_connections).await?);
    store.run_migrations().await?;
    info!("Database ready");

    let redpanda = match &config.kafka_brokers {
        Some(brokers) => Some(Arc::new(
            RedpandaEventBus::builder()
                .brokers(brokers)
                .consumer_group(&config.kafka_group_id)
                .build()?,
        )),
        None => {
            warn!("KAFKA_BROKERS not set: outbox publishing and request consumption are disabled");
            None
        }
    };
    let event_bus = redpanda
        .clone()
        .map(|bus| -> Arc<dyn EventBus> { bus });

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks = Vec::new();

    let mut readiness = Readiness::new().with_check(ReadinessCheck::new("db", {
        let store = Arc::clone(&store);
        move || {
            let store = Arc::clone(&store);
            async move { store.ping().await }
        }
    }));
    if let Some(bus) = &redpanda {
        let bus = Arc::clone(bus);
        readiness = readiness.with_check(ReadinessCheck::new("kafka", move || {
            let bus = Arc::clone(&bus);
            async move { bus.ping().await }
        }));
    }
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "Health routes listening");
    let mut http_shutdown = shutdown_tx.subscribe();
    tasks.push(tokio::spawn(async move {
        let result = axum::serve(listener, health_routes(readiness))
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Health server failed");
        }
    }));

    tasks.push(
        OutboxPublisher::new(Arc::clone(&store), event_bus.clone())
            .with_config(config.publisher_config())
            .spawn(shutdown_tx.subscribe()),
    );

    tasks.push(
        JobWorker::new(
            Arc::clone(&store),
            Arc::new(ReminderJobHandler),
            Arc::new(FixedBackoff::new(config.scheduler_backoff)),
        )
        .with_config(config.worker_config())
        .spawn(shutdown_tx.subscribe()),
    );

    if let Some(bus) = &event_bus {
        let handler = ReminderRequestHandler::new(Arc::clone(&store), config.scheduler_max_attempts);
        tasks.push(
            EventConsumer::new(
                "reminder-requests",
                vec![config.kafka_consume_topic.clone()],
                Arc::clone(bus),
                Arc::clone(&store),
                Arc::new(handler),
                shutdown_tx.subscribe(),
            )
            .spawn(),
        );
    }

    shutdown_signal().await;
    // Receivers may already be gone if a loop exited on its own.
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(config.shutdown_timeout, futures::future::join_all(tasks)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!(error = %e, "Background loop panicked");
                }
            }
            info!("Reminder scheduler stopped");
        }
        Err(_) => warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Shutdown timeout elapsed with loops still running"
        ),
    }

    Ok(())
}

/// Graceful shutdown signal handler.
///
/// Waits for Ctrl+C (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
